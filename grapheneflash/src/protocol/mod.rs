//! Protocol vocabulary for the two host tools.
//!
//! Neither module spawns anything: they build argument lists and interpret
//! the text adb/fastboot print, so the state machine and the transports agree
//! on what "ready" and "unlocked" look like.

pub mod adb;
pub mod fastboot;

/// One `serial<TAB>state` row of a `devices` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListEntry {
    /// Device serial number.
    pub serial: String,
    /// State column as printed (`device`, `fastboot`, `unauthorized`, ...).
    pub state: String,
}

/// Parse the output of `adb devices` or `fastboot devices`.
///
/// Banner lines (`List of devices attached`, `* daemon started ...`) and
/// blank lines are skipped. Extra columns after the state are ignored.
pub fn parse_device_list(output: &str) -> Vec<DeviceListEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .filter(|line| !line.starts_with("List of devices"))
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let serial = cols.next()?;
            let state = cols.next()?;
            Some(DeviceListEntry {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}
