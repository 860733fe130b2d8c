//! grapheneflash CLI - Command-line tool for installing GrapheneOS.
//!
//! ## Features
//!
//! - Flash a factory-image bundle through the full bootloader/fastbootd cycle
//! - Optional bootloader unlock and relock
//! - Device discovery over adb and fastboot with interactive selection
//! - Local bundle index and dry-run flash plans
//! - JSON output for scripting
//! - Shell completion generation
//! - Internationalization (i18n) support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use grapheneflash::{CancelToken, ProcessTransport, default_tool_path, host};
use log::debug;
use rust_i18n::t;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod help;
mod select;

use config::Config;

// Initialize i18n with locale files from the locales directory
rust_i18n::i18n!("locales", fallback = "en");

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// grapheneflash - Install GrapheneOS factory images over adb and fastboot.
///
/// Environment variables:
///   GRAPHENEFLASH_SERIAL           - Device serial to use
///   GRAPHENEFLASH_ADB              - Path to adb
///   GRAPHENEFLASH_FASTBOOT         - Path to fastboot
///   GRAPHENEFLASH_BUNDLES          - Directory holding downloaded bundles
///   GRAPHENEFLASH_LANG             - Language/locale (en, zh-CN)
///   GRAPHENEFLASH_NON_INTERACTIVE  - Non-interactive mode (disable prompts)
#[derive(Parser, Debug)]
#[command(name = "grapheneflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Bundles are read from <bundles-root>/<codename>/<version>/.")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Device serial (auto-detected if not specified).
    #[arg(short, long, global = true, env = "GRAPHENEFLASH_SERIAL")]
    serial: Option<String>,

    /// Path to the adb binary.
    #[arg(long, global = true, value_name = "PATH", env = "GRAPHENEFLASH_ADB")]
    adb_path: Option<PathBuf>,

    /// Path to the fastboot binary.
    #[arg(long, global = true, value_name = "PATH", env = "GRAPHENEFLASH_FASTBOOT")]
    fastboot_path: Option<PathBuf>,

    /// Directory holding downloaded bundles.
    #[arg(long, global = true, value_name = "DIR", env = "GRAPHENEFLASH_BUNDLES")]
    bundles_root: Option<PathBuf>,

    /// Language/locale for messages (e.g., en, zh-CN).
    #[arg(long, global = true, env = "GRAPHENEFLASH_LANG")]
    lang: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "GRAPHENEFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Install a GrapheneOS build on the attached device.
    Flash {
        /// Device codename the build targets (e.g. panther).
        codename: String,

        /// Bundle version (newest local version if omitted).
        #[arg(long, value_name = "VERSION")]
        build_version: Option<String>,

        /// Do not query or unlock the bootloader.
        #[arg(long)]
        skip_unlock: bool,

        /// Relock the bootloader after flashing.
        #[arg(long)]
        lock_bootloader: bool,

        /// Do not compare the device product with the codename.
        #[arg(long)]
        no_verify_codename: bool,

        /// Emit progress and the result as JSON lines on stdout.
        #[arg(long)]
        json: bool,
    },

    /// List devices visible to adb and fastboot.
    Devices {
        /// Output device list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List bundles in the local store.
    Bundles {
        /// Only list bundles for this codename.
        #[arg(long)]
        codename: Option<String>,

        /// Output bundle list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show what would be flashed, without touching a device.
    Plan {
        /// Device codename.
        codename: String,

        /// Bundle version (newest local version if omitted).
        #[arg(long, value_name = "VERSION")]
        build_version: Option<String>,

        /// Output the plan as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// CLI-level failures with dedicated exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or a prompt that cannot be shown.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration.
    #[error("{0}")]
    Config(String),
    /// Aborted by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Process exit codes.
pub(crate) mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const DEVICE: i32 = 4;
    pub const CANCELLED: i32 = 130;
}

/// Map an error chain to the process exit code.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => exit_code::USAGE,
            CliError::Config(_) => exit_code::CONFIG,
            CliError::Cancelled(_) => exit_code::CANCELLED,
        };
    }

    match err.downcast_ref::<grapheneflash::Error>() {
        Some(grapheneflash::Error::Cancelled) => exit_code::CANCELLED,
        Some(grapheneflash::Error::ToolUnavailable { .. } | grapheneflash::Error::Config(_)) => {
            exit_code::CONFIG
        },
        Some(e) if e.is_device_error() => exit_code::DEVICE,
        _ => exit_code::FAILURE,
    }
}

impl Cli {
    /// adb to run: flag/env, then config, then `PATH`.
    pub(crate) fn adb(&self, config: &Config) -> PathBuf {
        self.adb_path
            .clone()
            .or_else(|| config.tools.adb.clone())
            .unwrap_or_else(|| default_tool_path(host::ADB))
    }

    /// fastboot to run: flag/env, then config, then `PATH`.
    pub(crate) fn fastboot(&self, config: &Config) -> PathBuf {
        self.fastboot_path
            .clone()
            .or_else(|| config.tools.fastboot.clone())
            .unwrap_or_else(|| default_tool_path(host::FASTBOOT))
    }

    /// Bundle store: flag/env, then config, then the per-user data directory.
    pub(crate) fn bundles_root(&self, config: &Config) -> PathBuf {
        self.bundles_root
            .clone()
            .unwrap_or_else(|| config.bundles_root())
    }

    /// Transport not yet pinned to a device.
    pub(crate) fn transport(&self, config: &Config, cancel: &CancelToken) -> ProcessTransport {
        ProcessTransport::new(self.adb(config), self.fastboot(config))
            .with_poll_config(config.timeouts.poll_config())
            .with_cancel_token(cancel.clone())
    }
}

/// Locale from `--lang`/`--lang=` before clap runs, so help is translated.
fn early_lang(raw_args: &[String]) -> Option<String> {
    let mut lang = None;
    for (i, arg) in raw_args.iter().enumerate() {
        if let Some(val) = arg.strip_prefix("--lang=") {
            lang = Some(val.to_string());
        } else if arg == "--lang" {
            if let Some(val) = raw_args.get(i + 1) {
                lang = Some(val.clone());
            }
        }
    }
    lang.or_else(|| env::var("GRAPHENEFLASH_LANG").ok())
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

/// First Ctrl-C cancels the running job; a second one exits at once.
fn install_interrupt_handler(cancel: CancelToken) {
    let result = ctrlc::set_handler(move || {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(exit_code::CANCELLED);
        }
        eprintln!("\n{} {}", style("⚠").yellow(), t!("error.interrupt_requested"));
        cancel.cancel();
    });
    if let Err(e) = result {
        debug!("Could not install Ctrl-C handler: {e}");
    }
}

fn run(cli: &Cli, cancel: &CancelToken) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        if !path.exists() {
            return Err(CliError::Config(
                t!("error.config_not_found", path = path.display().to_string()).to_string(),
            )
            .into());
        }
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            codename,
            build_version,
            skip_unlock,
            lock_bootloader,
            no_verify_codename,
            json,
        } => {
            let args = commands::flash::FlashArgs {
                codename: codename.clone(),
                build_version: build_version.clone(),
                skip_unlock: *skip_unlock,
                lock_bootloader: *lock_bootloader,
                no_verify_codename: *no_verify_codename,
                json: *json,
            };
            commands::flash::cmd_flash(cli, &mut config, &args, cancel)
        },
        Commands::Devices { json } => commands::devices::cmd_devices(cli, &config, *json, cancel),
        Commands::Bundles { codename, json } => {
            commands::bundles::cmd_bundles(cli, &config, codename.as_deref(), *json)
        },
        Commands::Plan {
            codename,
            build_version,
            json,
        } => commands::plan::cmd_plan(cli, &config, codename, build_version.as_deref(), *json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(t!("completions.shell_required").to_string())
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

fn main() {
    let raw_args: Vec<String> = env::args().collect();

    let locale = early_lang(&raw_args).unwrap_or_else(help::detect_locale);
    rust_i18n::set_locale(&locale);

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Intercept before clap's auto-help so headings come out translated.
    let wants_help = raw_args.iter().any(|a| a == "-h" || a == "--help");
    let no_args = raw_args.len() <= 1;

    if wants_help || no_args {
        let mut app = help::build_localized_command();
        let subcmd_names: Vec<String> = app
            .get_subcommands()
            .map(|s| s.get_name().to_string())
            .collect();
        let found = raw_args
            .iter()
            .skip(1)
            .find(|token| subcmd_names.iter().any(|n| n == token.as_str()));

        let printed = match found.and_then(|name| app.find_subcommand_mut(name)) {
            Some(sub) => sub.print_help(),
            None => app.print_help(),
        };
        if printed.is_err() {
            std::process::exit(exit_code::FAILURE);
        }
        std::process::exit(exit_code::SUCCESS);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "grapheneflash v{} (locale: {}, verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.lang.as_deref().unwrap_or(&locale),
        cli.verbose
    );

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    if let Err(err) = run(&cli, &cancel) {
        eprintln!("{} {err:#}", style(t!("error.prefix")).red().bold());
        std::process::exit(exit_code_for(&err));
    }
}
