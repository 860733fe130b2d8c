//! Device listing.

use anyhow::Result;
use console::style;
use grapheneflash::{
    CancelToken, DetectedDevice, DeviceMode, Transport, discover_devices, identify_codename,
    model_name,
};
use rust_i18n::t;
use serde::Serialize;

use crate::Cli;
use crate::config::Config;

/// One line of `grapheneflash devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct DeviceRow {
    serial: String,
    mode: DeviceMode,
    codename: Option<String>,
    model: Option<&'static str>,
}

/// Attach codename and model to every device `identify` can answer for.
fn device_rows(
    devices: Vec<DetectedDevice>,
    mut identify: impl FnMut(&DetectedDevice) -> Option<String>,
) -> Vec<DeviceRow> {
    devices
        .into_iter()
        .map(|device| {
            let codename = if device.mode.is_usable() {
                identify(&device)
            } else {
                None
            };
            DeviceRow {
                model: codename.as_deref().and_then(model_name),
                codename,
                serial: device.serial,
                mode: device.mode,
            }
        })
        .collect()
}

/// Devices command implementation.
pub(crate) fn cmd_devices(
    cli: &Cli,
    config: &Config,
    json: bool,
    cancel: &CancelToken,
) -> Result<()> {
    let mut transport = cli.transport(config, cancel);
    transport.check_tools()?;

    let rows = device_rows(discover_devices(&mut transport), |device| {
        let mut pinned = cli.transport(config, cancel).with_serial(device.serial.as_str());
        identify_codename(&mut pinned)
    });

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    eprintln!("{}", style(t!("devices.header")).bold().underlined());

    if rows.is_empty() {
        eprintln!("  {}", style(t!("devices.no_devices")).dim());
        return Ok(());
    }

    for row in &rows {
        let identity = match (&row.codename, row.model) {
            (Some(codename), Some(model)) => format!(" {codename} ({model})"),
            (Some(codename), None) => format!(" {codename}"),
            _ => String::new(),
        };
        let mode = if row.mode.is_usable() {
            style(row.mode.name()).green()
        } else {
            style(row.mode.name()).yellow()
        };
        eprintln!(
            "  {} {} [{}]{}",
            style("•").green(),
            style(&row.serial).cyan(),
            mode,
            identity
        );
        if row.mode == DeviceMode::Unauthorized {
            eprintln!("      {}", style(t!("devices.unauthorized_hint")).dim());
        }
    }

    Ok(())
}
