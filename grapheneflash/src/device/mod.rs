//! Device discovery and identification.
//!
//! Lists devices visible to adb and fastboot, names known Pixel models and
//! reads the codename a device reports about itself.

use std::fmt;
use std::time::Duration;

use log::{debug, trace};

use crate::port::Transport;
use crate::protocol::{adb, fastboot, parse_device_list};

/// Timeout for discovery commands.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Known codenames and their marketing names.
const KNOWN_MODELS: &[(&str, &str)] = &[
    ("husky", "Pixel 8 Pro"),
    ("shiba", "Pixel 8"),
    ("akita", "Pixel 8a"),
    ("felix", "Pixel Fold"),
    ("tangorpro", "Pixel Tablet"),
    ("lynx", "Pixel 7a"),
    ("cheetah", "Pixel 7 Pro"),
    ("panther", "Pixel 7"),
    ("bluejay", "Pixel 6a"),
    ("raven", "Pixel 6 Pro"),
    ("oriole", "Pixel 6"),
    ("barbet", "Pixel 5a"),
    ("redfin", "Pixel 5"),
];

/// Marketing name for a codename, if known.
pub fn model_name(codename: &str) -> Option<&'static str> {
    KNOWN_MODELS
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(codename))
        .map(|(_, name)| *name)
}

/// All codenames with a known model name.
pub fn known_codenames() -> impl Iterator<Item = &'static str> {
    KNOWN_MODELS.iter().map(|(c, _)| *c)
}

/// Protocol mode a device was seen in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum DeviceMode {
    /// Booted Android with adb authorized.
    Adb,
    /// adb connection not yet authorized on the device.
    Unauthorized,
    /// adb sees the device but it does not respond.
    Offline,
    /// Recovery with adb.
    Recovery,
    /// Recovery sideload.
    Sideload,
    /// Bootloader or fastbootd.
    Fastboot,
    /// Anything else adb printed.
    Unknown,
}

impl DeviceMode {
    /// Map an adb state column to a mode.
    pub fn from_adb_state(state: &str) -> Self {
        match state {
            "device" => Self::Adb,
            "unauthorized" => Self::Unauthorized,
            "offline" => Self::Offline,
            "recovery" => Self::Recovery,
            "sideload" => Self::Sideload,
            _ => Self::Unknown,
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Adb => "adb",
            Self::Unauthorized => "unauthorized",
            Self::Offline => "offline",
            Self::Recovery => "recovery",
            Self::Sideload => "sideload",
            Self::Fastboot => "fastboot",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a flash job can start from this mode.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Adb | Self::Fastboot)
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A device seen by adb or fastboot.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectedDevice {
    /// Serial number.
    pub serial: String,
    /// Mode it was seen in.
    pub mode: DeviceMode,
}

/// Parse `adb devices` and `fastboot devices` outputs into one list.
///
/// A serial already listed by adb is not repeated from the fastboot listing.
pub fn merge_device_listings(adb_output: &str, fastboot_output: &str) -> Vec<DetectedDevice> {
    let mut devices: Vec<DetectedDevice> = parse_device_list(adb_output)
        .into_iter()
        .map(|entry| DetectedDevice {
            mode: DeviceMode::from_adb_state(&entry.state),
            serial: entry.serial,
        })
        .collect();

    for entry in parse_device_list(fastboot_output) {
        if devices.iter().any(|d| d.serial == entry.serial) {
            continue;
        }
        devices.push(DetectedDevice {
            serial: entry.serial,
            mode: DeviceMode::Fastboot,
        });
    }

    devices
}

/// List devices visible to adb and fastboot through `transport`.
///
/// Failing tools contribute nothing; this never errors.
pub fn discover_devices<T: Transport + ?Sized>(transport: &mut T) -> Vec<DetectedDevice> {
    let adb_result = transport.adb_command(adb::DEVICES, DISCOVERY_TIMEOUT);
    let adb_output = if adb_result.success {
        adb_result.stdout
    } else {
        debug!("adb devices failed: {}", adb_result.failure_detail());
        String::new()
    };

    let fastboot_result = transport.fastboot_command(fastboot::DEVICES, DISCOVERY_TIMEOUT);
    let fastboot_output = if fastboot_result.success {
        fastboot_result.stdout
    } else {
        debug!("fastboot devices failed: {}", fastboot_result.failure_detail());
        String::new()
    };

    let devices = merge_device_listings(&adb_output, &fastboot_output);
    trace!("Discovered devices: {devices:?}");
    devices
}

/// Read the codename the device reports, trying fastboot first and then adb.
pub fn identify_codename<T: Transport + ?Sized>(transport: &mut T) -> Option<String> {
    let result = transport.fastboot_command(
        &fastboot::getvar_args(fastboot::VAR_PRODUCT),
        DISCOVERY_TIMEOUT,
    );
    if result.success {
        if let Some(product) = fastboot::parse_getvar(&result.output(), fastboot::VAR_PRODUCT) {
            return Some(product);
        }
    }

    [adb::PRODUCT_DEVICE_PROP, adb::VENDOR_DEVICE_PROP]
        .into_iter()
        .find_map(|prop| {
            let result = transport.adb_command(&adb::getprop_args(prop), DISCOVERY_TIMEOUT);
            if result.success {
                adb::parse_prop(&result.stdout)
            } else {
                None
            }
        })
}
