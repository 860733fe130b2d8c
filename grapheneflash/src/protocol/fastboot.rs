//! fastboot commands and output parsing.
//!
//! fastboot prints variable reads on stderr as `name: value`, followed by a
//! `Finished. Total time: ...` line. Both streams are searched because
//! userspace fastbootd and some older host tools print on stdout instead.

use super::parse_device_list;

/// State column `fastboot devices` prints for bootloader and fastbootd.
pub const FASTBOOT_STATE: &str = "fastboot";

/// `fastboot devices`.
pub const DEVICES: &[&str] = &["devices"];

/// `fastboot reboot-bootloader`.
pub const REBOOT_BOOTLOADER: &[&str] = &["reboot-bootloader"];

/// `fastboot reboot fastboot` (bootloader to userspace fastbootd).
pub const REBOOT_FASTBOOTD: &[&str] = &["reboot", "fastboot"];

/// `fastboot reboot`.
pub const REBOOT: &[&str] = &["reboot"];

/// `fastboot flashing unlock`.
pub const FLASHING_UNLOCK: &[&str] = &["flashing", "unlock"];

/// `fastboot flashing lock`.
pub const FLASHING_LOCK: &[&str] = &["flashing", "lock"];

/// Variable naming the device codename.
pub const VAR_PRODUCT: &str = "product";

/// Variable that is `yes` once the bootloader is unlocked.
pub const VAR_UNLOCKED: &str = "unlocked";

/// Variable that is `yes` only in userspace fastbootd.
pub const VAR_IS_USERSPACE: &str = "is-userspace";

/// Arguments for `fastboot getvar <name>`.
pub fn getvar_args(name: &str) -> [&str; 2] {
    ["getvar", name]
}

/// Arguments for `fastboot flash <partition> <image>`.
pub fn flash_args<'a>(partition: &'a str, image: &'a str) -> [&'a str; 3] {
    ["flash", partition, image]
}

/// Extract the value of `name` from `getvar` output.
pub fn parse_getvar(output: &str, name: &str) -> Option<String> {
    output.lines().map(str::trim).find_map(|line| {
        let rest = line.strip_prefix(name)?.trim_start();
        let value = rest.strip_prefix(':')?.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Whether `getvar is-userspace` output literally reports `yes`.
pub fn reports_userspace(output: &str) -> bool {
    parse_getvar(&output.to_ascii_lowercase(), VAR_IS_USERSPACE).as_deref() == Some("yes")
}

/// Whether `getvar unlocked` output reports an unlocked bootloader.
pub fn reports_unlocked(output: &str) -> bool {
    parse_getvar(&output.to_ascii_lowercase(), VAR_UNLOCKED).as_deref() == Some("yes")
}

/// Whether a `flashing unlock` rejection means OEM unlocking is disabled.
pub fn rejects_oem_unlock(output: &str) -> bool {
    output.to_ascii_lowercase().contains("unlock is not allowed")
}

/// Whether a `fastboot devices` listing shows the target in fastboot mode.
///
/// With a pinned serial the serial must be listed in `fastboot` state;
/// without one, exactly one device must be listed.
pub fn lists_fastboot_device(output: &str, serial: Option<&str>) -> bool {
    let devices: Vec<_> = parse_device_list(output)
        .into_iter()
        .filter(|d| d.state == FASTBOOT_STATE)
        .collect();

    match serial {
        Some(serial) => devices.iter().any(|d| d.serial == serial),
        None => devices.len() == 1,
    }
}
