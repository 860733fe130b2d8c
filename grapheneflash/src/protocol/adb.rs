//! adb commands used before the device reaches the bootloader.

/// Property holding the bootloader lock state (`1` locked, `0` unlocked).
pub const FLASH_LOCKED_PROP: &str = "ro.boot.flash.locked";

/// Property holding the device codename.
pub const PRODUCT_DEVICE_PROP: &str = "ro.product.device";

/// Vendor-partition copy of the codename, set on newer builds.
pub const VENDOR_DEVICE_PROP: &str = "ro.product.vendor.device";

/// Property set to `1` when "OEM unlocking" is enabled in developer options.
pub const OEM_UNLOCK_ALLOWED_PROP: &str = "sys.oem_unlock_allowed";

/// `adb devices`.
pub const DEVICES: &[&str] = &["devices"];

/// `adb reboot bootloader`.
pub const REBOOT_BOOTLOADER: &[&str] = &["reboot", "bootloader"];

/// Arguments for `adb shell getprop <prop>`.
pub fn getprop_args(prop: &str) -> [&str; 3] {
    ["shell", "getprop", prop]
}

/// Interpret `getprop ro.boot.flash.locked` output.
///
/// Returns `None` when the property is empty or unrecognized so callers can
/// fall back to asking the bootloader.
pub fn parse_flash_locked(stdout: &str) -> Option<bool> {
    match stdout.trim() {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

/// Whether `getprop sys.oem_unlock_allowed` output permits unlocking.
pub fn parse_oem_unlock_allowed(stdout: &str) -> bool {
    stdout.trim() == "1"
}

/// Trimmed property value, `None` when unset.
pub fn parse_prop(stdout: &str) -> Option<String> {
    let value = stdout.trim();
    (!value.is_empty()).then(|| value.to_string())
}
