//! Device selection.
//!
//! Resolution order:
//! - serial given on the command line or through `GRAPHENEFLASH_SERIAL`
//! - serial remembered in the config file
//! - the only usable device adb/fastboot report
//! - an interactive pick when several are attached
//!
//! Non-interactive mode never prompts: anything other than exactly one
//! usable device is a usage error.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    grapheneflash::{DetectedDevice, DeviceMode, Transport, discover_devices},
    log::{error, info, warn},
    rust_i18n::t,
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for device selection.
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    /// Explicit serial specified via CLI.
    pub serial: Option<String>,
    /// Non-interactive mode (fail if several devices).
    pub non_interactive: bool,
}

/// Selected device and how it was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedDevice {
    /// Device serial.
    pub serial: String,
    /// Picked from a prompt rather than given or auto-detected.
    pub prompted: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Devices a flash job can start on.
fn usable_devices(devices: Vec<DetectedDevice>) -> Vec<DetectedDevice> {
    devices
        .into_iter()
        .filter(|device| {
            if device.mode == DeviceMode::Unauthorized {
                warn!(
                    "{}",
                    t!("select.unauthorized", serial = device.serial.as_str())
                );
            }
            device.mode.is_usable()
        })
        .collect()
}

fn select_non_interactive(candidates: Vec<DetectedDevice>) -> Result<SelectedDevice> {
    let count = candidates.len();
    match count.cmp(&1) {
        Ordering::Equal => candidates
            .into_iter()
            .next()
            .map(|device| SelectedDevice {
                serial: device.serial,
                prompted: false,
            })
            .ok_or_else(|| usage_err(t!("select.no_devices").as_ref())),
        Ordering::Greater => Err(usage_err(
            t!("select.multiple_devices", count = count).as_ref(),
        )),
        Ordering::Less => Err(usage_err(t!("select.no_devices").as_ref())),
    }
}

/// Pick the device to flash.
pub fn select_device<T: Transport + ?Sized>(
    options: &DeviceOptions,
    config: &Config,
    transport: &mut T,
) -> Result<SelectedDevice> {
    if let Some(serial) = &options.serial {
        return Ok(SelectedDevice {
            serial: serial.clone(),
            prompted: false,
        });
    }

    if let Some(serial) = &config.device.serial {
        info!("Using device from config: {serial}");
        return Ok(SelectedDevice {
            serial: serial.clone(),
            prompted: false,
        });
    }

    let candidates = usable_devices(discover_devices(transport));

    if options.non_interactive {
        return select_non_interactive(candidates);
    }

    match candidates.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_device_interactive(candidates)
        },
        Ordering::Equal => select_non_interactive(candidates).inspect(|selected| {
            info!("Auto-selected device: {}", selected.serial);
        }),
        Ordering::Less => Err(grapheneflash::Error::DeviceNotFound.into()),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(CliError::Usage(t!("select.interactive_requires_tty").to_string()).into())
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled(t!("select.selection_cancelled").to_string()).into()
            } else {
                CliError::Usage(t!("select.prompt_failed").to_string()).into()
            }
        },
    }
}

/// Menu label, truncated so the prompt never wraps.
fn device_label(device: &DetectedDevice, max_width: usize) -> String {
    let label = format!(
        "{} [{}]",
        style(&device.serial).bold(),
        style(device.mode.name()).yellow()
    );
    console::truncate_str(&label, max_width, "\u{2026}").into_owned()
}

fn select_device_interactive(devices: Vec<DetectedDevice>) -> Result<SelectedDevice> {
    eprintln!(
        "{} {}",
        style("ℹ").blue(),
        t!("select.detected_devices", count = devices.len())
    );

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = devices
        .iter()
        .map(|device| device_label(device, max_item_width))
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(t!("select.select_prompt").to_string())
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => devices
            .into_iter()
            .nth(index)
            .map(|device| SelectedDevice {
                serial: device.serial,
                prompted: true,
            })
            .ok_or_else(|| anyhow::anyhow!("Invalid device index: {index}")),
        None => Err(CliError::Cancelled(t!("select.selection_cancelled").to_string()).into()),
    }
}

/// Offer to store a prompted selection as the default device.
pub fn ask_remember_device(selected: &SelectedDevice, config: &mut Config) -> Result<()> {
    if !selected.prompted {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(t!("select.remember_prompt").to_string())
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_serial(&selected.serial) {
            error!("Failed to save device configuration: {e}");
        }
    }

    Ok(())
}
