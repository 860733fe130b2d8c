//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use grapheneflash::{
    CancelToken, FlashObserver, FlashOptions, FlashOutcome, FlashProgress, FlashRequest, FlashState,
    FlashStateMachine, FlashTimeouts, LocalBuildManager, LogLevel, Transport, known_codenames,
    model_name,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use rust_i18n::t;
use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;

use crate::config::Config;
use crate::select::{DeviceOptions, ask_remember_device, select_device};
use crate::{Cli, CliError, use_fancy_output, was_interrupted};

/// Arguments of `grapheneflash flash`.
#[derive(Debug, Clone)]
pub(crate) struct FlashArgs {
    pub codename: String,
    pub build_version: Option<String>,
    pub skip_unlock: bool,
    pub lock_bootloader: bool,
    pub no_verify_codename: bool,
    pub json: bool,
}

impl FlashArgs {
    fn request(&self, config: &Config) -> FlashRequest {
        let request = FlashRequest::new(self.codename.as_str())
            .with_skip_unlock(self.skip_unlock || config.flash.skip_unlock)
            .with_lock_bootloader(self.lock_bootloader || config.flash.lock_bootloader);
        match &self.build_version {
            Some(version) => request.with_version(version.as_str()),
            None => request,
        }
    }

    fn options(&self, config: &Config) -> FlashOptions {
        let verify = !self.no_verify_codename && config.flash.verify_codename.unwrap_or(true);
        FlashOptions::default()
            .with_timeouts(config.timeouts.apply(FlashTimeouts::default()))
            .with_verify_codename(verify)
    }
}

/// One JSON line of `flash --json`.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JsonEvent<'a> {
    Progress(&'a FlashProgress),
    Log {
        message: &'a str,
        level: LogLevel,
    },
    Result {
        success: bool,
        final_state: FlashState,
        #[serde(skip_serializing_if = "Option::is_none")]
        bundle_path: Option<&'a Path>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Writes every event as one JSON object per line.
struct JsonLinesObserver<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesObserver<W> {
    fn new(out: W) -> Self {
        Self { out }
    }

    fn write_line(&mut self, event: &JsonEvent<'_>) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, event)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }

    fn emit(&mut self, event: &JsonEvent<'_>) {
        // A closed stdout must not abort the flash.
        if let Err(e) = self.write_line(event) {
            debug!("Dropping JSON event: {e}");
        }
    }

    fn result(&mut self, outcome: &FlashOutcome) {
        self.emit(&JsonEvent::Result {
            success: outcome.success,
            final_state: outcome.final_state,
            bundle_path: outcome.bundle_path.as_deref(),
            error: outcome.error_message(),
        });
    }
}

impl<W: Write> FlashObserver for JsonLinesObserver<W> {
    fn on_progress(&mut self, progress: &FlashProgress) {
        self.emit(&JsonEvent::Progress(progress));
    }

    fn on_log(&mut self, message: &str, level: LogLevel) {
        self.emit(&JsonEvent::Log { message, level });
    }
}

/// Drives an indicatif bar; warnings and errors are printed above it.
struct TerminalObserver {
    pb: ProgressBar,
}

impl TerminalObserver {
    fn new(quiet: bool) -> Self {
        let pb = if quiet || !use_fancy_output() {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new(100);
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            pb
        };
        Self { pb }
    }
}

impl FlashObserver for TerminalObserver {
    fn on_progress(&mut self, progress: &FlashProgress) {
        self.pb.set_position(u64::from(progress.progress_percent));
        self.pb.set_message(progress.message.clone());
    }

    fn on_log(&mut self, message: &str, level: LogLevel) {
        let marker = match level {
            LogLevel::Info => return,
            LogLevel::Warning => style("⚠").yellow(),
            LogLevel::Error => style("✗").red(),
        };
        self.pb.suspend(|| eprintln!("{marker} {message}"));
    }
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled(t!("error.interrupted").to_string()).into())
    } else {
        Ok(())
    }
}

/// Warning for a codename outside the known model table, `None` when known.
fn unknown_codename_warning(codename: &str) -> Option<String> {
    if model_name(codename).is_some() {
        return None;
    }
    let known = known_codenames().collect::<Vec<_>>().join(", ");
    Some(t!("flash.unknown_codename", codename = codename, known = known).to_string())
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    args: &FlashArgs,
    cancel: &CancelToken,
) -> Result<()> {
    let chatty = !cli.quiet && !args.json;
    let bundles_root = cli.bundles_root(config);

    // Fail before touching a device when there is nothing to flash.
    let builds = LocalBuildManager::new(&bundles_root);
    let bundle = builds
        .resolve(&args.codename, args.build_version.as_deref())?
        .ok_or_else(|| {
            grapheneflash::Error::BundleResolutionFailed(format!(
                "no {} bundle ({}) under {}",
                args.codename,
                args.build_version.as_deref().unwrap_or("latest"),
                bundles_root.display()
            ))
        })?;
    if chatty {
        eprintln!(
            "{} {}",
            style("📦").cyan(),
            t!("flash.using_bundle", path = bundle.display().to_string())
        );
    }
    if let Some(warning) = unknown_codename_warning(&args.codename) {
        warn!("{warning}");
        if chatty {
            eprintln!("{} {}", style("⚠").yellow(), warning);
        }
    }

    let mut discovery = cli.transport(config, cancel);
    discovery.check_tools()?;

    let options = DeviceOptions {
        serial: cli.serial.clone(),
        non_interactive: cli.non_interactive,
    };
    let selected = select_device(&options, config, &mut discovery)
        .context(t!("error.select_device").to_string())?;
    if !cli.non_interactive {
        ask_remember_device(&selected, config)?;
    }
    ensure_not_interrupted()?;

    if chatty {
        let model = model_name(&args.codename).unwrap_or("unknown model");
        eprintln!(
            "{} {}",
            style("🔌").cyan(),
            t!(
                "flash.using_device",
                serial = selected.serial.as_str(),
                codename = args.codename.as_str(),
                model = model
            )
        );
    }

    let transport = cli.transport(config, cancel).with_serial(selected.serial.as_str());
    let mut fsm = FlashStateMachine::new(transport, builds)
        .with_options(args.options(config))
        .with_cancel_token(cancel.clone());
    let request = args.request(config);

    let outcome = if args.json {
        let mut observer = JsonLinesObserver::new(io::stdout().lock());
        let outcome = fsm.execute_flash(&request, &mut observer);
        observer.result(&outcome);
        outcome
    } else {
        let mut observer = TerminalObserver::new(cli.quiet);
        let outcome = fsm.execute_flash(&request, &mut observer);
        if outcome.success {
            observer
                .pb
                .finish_with_message(t!("common.complete").to_string());
        } else {
            observer.pb.abandon();
        }
        outcome
    };

    debug!("Visited states: {:?}", fsm.history());
    outcome.into_result()?;

    if chatty {
        eprintln!("\n{} {}", style("🎉").green().bold(), t!("flash.completed"));
    }
    Ok(())
}
