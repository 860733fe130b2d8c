//! The flash state machine.
//!
//! Drives one device through the fixed phase sequence:
//!
//! ```text
//! Init -> [Adb] -> Fastboot -> FastbootFlash -> Fastbootd -> FastbootdFlash -> Final -> Done
//!    \________\________\____________\______________\______________\_____________\--> Error
//! ```
//!
//! The device re-enumerates after every reboot, so each reboot is followed by
//! a bounded wait for the next mode. Writes are never retried; only presence
//! polling tolerates transient failures.
//!
//! ## Example
//!
//! ```rust,no_run
//! use grapheneflash::{
//!     FlashRequest, FlashStateMachine, LocalBuildManager, NullObserver, ProcessTransport,
//! };
//!
//! let transport = ProcessTransport::new("adb", "fastboot").with_serial("28A1KXYZ");
//! let builds = LocalBuildManager::new("/var/lib/grapheneflash/bundles");
//! let mut fsm = FlashStateMachine::new(transport, builds);
//!
//! let outcome = fsm.execute_flash(&FlashRequest::new("panther"), &mut NullObserver);
//! if let Some(err) = outcome.error_message() {
//!     eprintln!("flash failed: {err}");
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::image::{BuildManager, PartitionPlan};
use crate::job::CancelToken;
use crate::port::poll::{PollOutcome, poll_until, sleep_unless_cancelled};
use crate::port::{CommandResult, Transport};
use crate::protocol::{adb, fastboot};

use super::observer::{FlashObserver, LogLevel};
use super::state::{FlashOutcome, FlashProgress, FlashState};

const OEM_UNLOCK_DISABLED: &str = "OEM unlocking is disabled on this device; enable it under \
     Settings > System > Developer options, reconnect and try again";

/// What to flash and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    /// Device codename the bundle targets.
    pub codename: String,
    /// Build version, newest when `None`.
    pub version: Option<String>,
    /// Skip the unlock phase (bootloader known to be unlocked).
    pub skip_unlock: bool,
    /// Relock the bootloader after flashing.
    pub lock_bootloader: bool,
}

impl FlashRequest {
    /// Flash the newest build for `codename`.
    pub fn new(codename: impl Into<String>) -> Self {
        Self {
            codename: codename.into(),
            version: None,
            skip_unlock: false,
            lock_bootloader: false,
        }
    }

    /// Pin the build version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set whether to skip the unlock phase.
    #[must_use]
    pub fn with_skip_unlock(mut self, skip_unlock: bool) -> Self {
        self.skip_unlock = skip_unlock;
        self
    }

    /// Set whether to relock afterwards.
    #[must_use]
    pub fn with_lock_bootloader(mut self, lock_bootloader: bool) -> Self {
        self.lock_bootloader = lock_bootloader;
        self
    }
}

/// Every bound the state machine waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashTimeouts {
    /// Waiting for the bootloader after `adb reboot bootloader`.
    pub fastboot_entry: Duration,
    /// Waiting for the bootloader after `reboot-bootloader`.
    pub reboot_reconnect: Duration,
    /// Waiting for fastbootd after `reboot fastboot`.
    pub fastbootd_entry: Duration,
    /// Waiting for the user to confirm the unlock.
    pub unlock_confirm: Duration,
    /// Interval between unlock status polls.
    pub unlock_poll_interval: Duration,
    /// Pause after `reboot-bootloader` before polling.
    pub reboot_settle: Duration,
    /// One bootloader-phase partition write.
    pub flash: Duration,
    /// One fastbootd-phase image write.
    pub super_flash: Duration,
    /// Reboot, lock and unlock commands.
    pub control: Duration,
    /// Status queries.
    pub query: Duration,
}

impl Default for FlashTimeouts {
    fn default() -> Self {
        Self {
            fastboot_entry: Duration::from_secs(90),
            reboot_reconnect: Duration::from_secs(60),
            fastbootd_entry: Duration::from_secs(90),
            unlock_confirm: Duration::from_secs(360),
            unlock_poll_interval: Duration::from_secs(5),
            reboot_settle: Duration::from_secs(5),
            flash: Duration::from_secs(120),
            super_flash: Duration::from_secs(300),
            control: Duration::from_secs(60),
            query: Duration::from_secs(5),
        }
    }
}

/// Behavior switches for the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlashOptions {
    /// Timing bounds.
    pub timeouts: FlashTimeouts,
    /// Refuse to flash unless the bootloader reports the requested codename.
    pub verify_codename: bool,
}

impl FlashOptions {
    /// Set the timing bounds.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: FlashTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Enable or disable the codename check.
    #[must_use]
    pub fn with_verify_codename(mut self, verify: bool) -> Self {
        self.verify_codename = verify;
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Tool {
    Adb,
    Fastboot,
    Fastbootd,
}

impl Tool {
    fn name(self) -> &'static str {
        match self {
            Self::Adb => "adb",
            Self::Fastboot | Self::Fastbootd => "fastboot",
        }
    }
}

/// `start + width * done / total`, as a percentage.
fn span(start: u8, width: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return start.saturating_add(width);
    }
    let offset = u64::from(width) * done as u64 / total as u64;
    u8::try_from(u64::from(start) + offset).unwrap_or(100)
}

/// Orchestrates one flash job against one device.
pub struct FlashStateMachine<T: Transport, B: BuildManager> {
    transport: T,
    builds: B,
    options: FlashOptions,
    cancel: CancelToken,
    state: FlashState,
    history: Vec<FlashState>,
    log_lines: Vec<String>,
    percent: u8,
    codename_verified: bool,
}

impl<T: Transport, B: BuildManager> FlashStateMachine<T, B> {
    /// Create a state machine over `transport` and `builds`.
    pub fn new(transport: T, builds: B) -> Self {
        Self {
            transport,
            builds,
            options: FlashOptions::default(),
            cancel: CancelToken::new(),
            state: FlashState::Init,
            history: Vec::new(),
            log_lines: Vec::new(),
            percent: 0,
            codename_verified: false,
        }
    }

    /// Set behavior switches.
    #[must_use]
    pub fn with_options(mut self, options: FlashOptions) -> Self {
        self.options = options;
        self
    }

    /// Stop at the next checkpoint once `cancel` fires.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current state.
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// States entered during the last run, in order.
    pub fn history(&self) -> &[FlashState] {
        &self.history
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run the whole sequence and report how it ended.
    ///
    /// Never panics on device or bundle problems; every failure ends in
    /// [`FlashState::Error`] with the cause in [`FlashOutcome::error`].
    pub fn execute_flash(
        &mut self,
        request: &FlashRequest,
        observer: &mut dyn FlashObserver,
    ) -> FlashOutcome {
        self.state = FlashState::Init;
        self.history = vec![FlashState::Init];
        self.log_lines.clear();
        self.percent = 0;
        self.codename_verified = false;

        let mut bundle_path = None;
        let result = self.run(request, observer, &mut bundle_path);

        match result {
            Ok(()) => FlashOutcome {
                success: true,
                error: None,
                final_state: self.state,
                bundle_path,
            },
            Err(e) => {
                let failed_in = self.state;
                let message = format!("Flash failed during {failed_in}: {e}");
                self.log(observer, LogLevel::Error, &message);
                self.transition(observer, FlashState::Error);
                self.progress(observer, "error", self.percent, message);
                FlashOutcome {
                    success: false,
                    error: Some(e),
                    final_state: self.state,
                    bundle_path,
                }
            },
        }
    }

    fn run(
        &mut self,
        request: &FlashRequest,
        obs: &mut dyn FlashObserver,
        bundle_path: &mut Option<PathBuf>,
    ) -> Result<()> {
        let codename = request.codename.as_str();

        self.progress(obs, "init", 0, format!("Preparing {codename} bundle"));
        self.transport.check_tools()?;
        let path = self
            .builds
            .ensure_bundle_available(codename, request.version.as_deref())?;
        *bundle_path = Some(path.clone());
        let plan = self.builds.find_partition_files(&path, codename)?;
        self.progress(
            obs,
            "init",
            2,
            format!("Bundle {} ready ({} images)", path.display(), plan.flash_count()),
        );
        self.checkpoint()?;

        if request.skip_unlock {
            debug!("Skipping unlock phase");
        } else {
            self.transition(obs, FlashState::Adb);
            self.unlock(obs, codename)?;
        }

        self.transition(obs, FlashState::Fastboot);
        self.enter_bootloader(obs, codename)?;

        self.transition(obs, FlashState::FastbootFlash);
        self.flash_bootloader_phase(obs, &plan)?;

        self.transition(obs, FlashState::Fastbootd);
        self.enter_fastbootd(obs)?;

        self.transition(obs, FlashState::FastbootdFlash);
        self.flash_fastbootd_phase(obs, &plan)?;

        self.transition(obs, FlashState::Final);
        self.finish(obs, request.lock_bootloader)?;

        self.transition(obs, FlashState::Done);
        self.progress(obs, "done", 100, "Flash complete");
        Ok(())
    }

    fn unlock(&mut self, obs: &mut dyn FlashObserver, codename: &str) -> Result<()> {
        let timeouts = self.options.timeouts;
        self.progress(obs, "unlock_check", 3, "Checking bootloader lock state");

        if self.is_unlocked(obs) {
            self.progress(obs, "unlock_check", 5, "Bootloader already unlocked");
            return Ok(());
        }

        // The unlock request is only accepted by the bootloader.
        if !self.in_bootloader(obs) {
            self.check_oem_unlock_allowed(obs)?;
            self.reboot_to_bootloader_from_adb(obs)?;
        }

        // Unlocking wipes the device, so the model check cannot wait.
        if self.options.verify_codename {
            self.verify_codename(obs, codename)?;
        }

        self.progress(
            obs,
            "unlock_request",
            4,
            "Requesting bootloader unlock, confirm on the device",
        );
        let result = self.command(obs, Tool::Fastboot, fastboot::FLASHING_UNLOCK, timeouts.control);
        if !result.success {
            if fastboot::rejects_oem_unlock(&result.output()) {
                return Err(Error::UnlockDenied(OEM_UNLOCK_DISABLED.to_string()));
            }
            return Err(Error::UnlockDenied(result.failure_detail()));
        }

        self.log(
            obs,
            LogLevel::Info,
            &format!(
                "Waiting up to {}s for the unlock to be confirmed",
                timeouts.unlock_confirm.as_secs()
            ),
        );
        let transport = &mut self.transport;
        let args = fastboot::getvar_args(fastboot::VAR_UNLOCKED);
        let outcome = poll_until(
            timeouts.unlock_confirm,
            timeouts.unlock_poll_interval,
            &self.cancel,
            || {
                let line = format!("$ fastboot {}", args.join(" "));
                debug!("{line}");
                obs.on_log(&line, LogLevel::Info);
                let result = transport.fastboot_command(&args, timeouts.query);
                fastboot::reports_unlocked(&result.output())
            },
        );

        match outcome {
            PollOutcome::Ready => {
                self.progress(obs, "unlock_confirmed", 5, "Bootloader unlocked");
                Ok(())
            },
            PollOutcome::Cancelled => Err(Error::Cancelled),
            PollOutcome::TimedOut => Err(Error::UnlockTimeout(timeouts.unlock_confirm)),
        }
    }

    /// Refuse early when Android reports OEM unlocking as disabled.
    ///
    /// An unanswered query is not fatal: the bootloader rejects the unlock
    /// itself in that case.
    fn check_oem_unlock_allowed(&mut self, obs: &mut dyn FlashObserver) -> Result<()> {
        let query = self.options.timeouts.query;
        let result = self.command(
            obs,
            Tool::Adb,
            &adb::getprop_args(adb::OEM_UNLOCK_ALLOWED_PROP),
            query,
        );
        if !result.success {
            self.log(
                obs,
                LogLevel::Warning,
                &format!(
                    "Could not read OEM unlocking setting ({}); continuing",
                    result.failure_detail()
                ),
            );
            return Ok(());
        }
        if !adb::parse_oem_unlock_allowed(&result.stdout) {
            return Err(Error::UnlockDenied(OEM_UNLOCK_DISABLED.to_string()));
        }
        self.log(obs, LogLevel::Info, "OEM unlocking is enabled");
        Ok(())
    }

    fn is_unlocked(&mut self, obs: &mut dyn FlashObserver) -> bool {
        let query = self.options.timeouts.query;

        let result = self.command(obs, Tool::Adb, &adb::getprop_args(adb::FLASH_LOCKED_PROP), query);
        if result.success {
            if let Some(locked) = adb::parse_flash_locked(&result.stdout) {
                return !locked;
            }
        }

        debug!("adb did not report the lock state, asking the bootloader");
        let result = self.command(
            obs,
            Tool::Fastboot,
            &fastboot::getvar_args(fastboot::VAR_UNLOCKED),
            query,
        );
        result.success && fastboot::reports_unlocked(&result.output())
    }

    fn in_bootloader(&mut self, obs: &mut dyn FlashObserver) -> bool {
        let query = self.options.timeouts.query;
        self.command(
            obs,
            Tool::Fastboot,
            &fastboot::getvar_args(fastboot::VAR_PRODUCT),
            query,
        )
        .success
    }

    fn reboot_to_bootloader_from_adb(&mut self, obs: &mut dyn FlashObserver) -> Result<()> {
        let timeouts = self.options.timeouts;
        let result = self.command(obs, Tool::Adb, adb::REBOOT_BOOTLOADER, timeouts.control);
        if !result.success {
            // The device may already be on its way down; the wait decides.
            self.log(
                obs,
                LogLevel::Warning,
                &format!("adb reboot bootloader failed: {}", result.failure_detail()),
            );
        }
        self.wait_for_bootloader(timeouts.fastboot_entry)
    }

    fn enter_bootloader(&mut self, obs: &mut dyn FlashObserver, codename: &str) -> Result<()> {
        self.progress(obs, "reboot_bootloader", 5, "Rebooting into the bootloader");
        self.checkpoint()?;

        if self.in_bootloader(obs) {
            self.log(obs, LogLevel::Info, "Device already in fastboot mode");
        } else {
            self.reboot_to_bootloader_from_adb(obs)?;
        }

        if self.options.verify_codename && !self.codename_verified {
            self.verify_codename(obs, codename)?;
        }

        self.progress(obs, "reboot_bootloader", 8, "Device in fastboot mode");
        Ok(())
    }

    fn verify_codename(&mut self, obs: &mut dyn FlashObserver, codename: &str) -> Result<()> {
        let query = self.options.timeouts.query;
        let result = self.command(
            obs,
            Tool::Fastboot,
            &fastboot::getvar_args(fastboot::VAR_PRODUCT),
            query,
        );
        let actual = fastboot::parse_getvar(&result.output(), fastboot::VAR_PRODUCT);

        match actual {
            Some(actual) if actual.eq_ignore_ascii_case(codename) => {
                self.log(obs, LogLevel::Info, &format!("Device reports {actual}"));
                self.codename_verified = true;
                Ok(())
            },
            actual => Err(Error::DeviceMismatch {
                expected: codename.to_string(),
                actual: actual.unwrap_or_else(|| "nothing".to_string()),
            }),
        }
    }

    fn flash_bootloader_phase(&mut self, obs: &mut dyn FlashObserver, plan: &PartitionPlan) -> Result<()> {
        let timeouts = self.options.timeouts;
        let total = usize::from(plan.bootloader.is_some())
            + usize::from(plan.radio.is_some())
            + plan.core.len();
        let mut index = 0;

        for (partition, image, percent) in [
            ("bootloader", plan.bootloader.as_deref(), 10),
            ("radio", plan.radio.as_deref(), 15),
        ] {
            let Some(image) = image else {
                self.log(obs, LogLevel::Warning, &format!("Bundle has no {partition} image, skipping"));
                continue;
            };
            index += 1;
            self.flash_partition(obs, Tool::Fastboot, partition, image, (index, total), percent, timeouts.flash)?;
            self.progress(obs, "reboot_bootloader", percent + 2, "Rebooting bootloader");
            self.command_ok(obs, Tool::Fastboot, fastboot::REBOOT_BOOTLOADER, timeouts.control)?;
            if !sleep_unless_cancelled(timeouts.reboot_settle, &self.cancel) {
                return Err(Error::Cancelled);
            }
            self.wait_for_bootloader(timeouts.reboot_reconnect)?;
        }

        let core_total = plan.core.len();
        for (i, (partition, image)) in plan.core.iter().enumerate() {
            index += 1;
            let percent = span(20, 30, i, core_total);
            self.flash_partition(
                obs,
                Tool::Fastboot,
                partition.name(),
                image,
                (index, total),
                percent,
                timeouts.flash,
            )?;
        }

        Ok(())
    }

    fn enter_fastbootd(&mut self, obs: &mut dyn FlashObserver) -> Result<()> {
        let timeouts = self.options.timeouts;
        self.progress(obs, "reboot_fastbootd", 52, "Rebooting into fastbootd");
        self.checkpoint()?;
        self.command_ok(obs, Tool::Fastboot, fastboot::REBOOT_FASTBOOTD, timeouts.control)?;

        if !self.transport.wait_for_fastbootd(timeouts.fastbootd_entry) {
            self.checkpoint()?;
            return Err(Error::DeviceTimeout(format!(
                "device did not enter fastbootd within {}s",
                timeouts.fastbootd_entry.as_secs()
            )));
        }

        self.progress(obs, "reboot_fastbootd", 55, "Device in fastbootd");
        Ok(())
    }

    fn flash_fastbootd_phase(&mut self, obs: &mut dyn FlashObserver, plan: &PartitionPlan) -> Result<()> {
        let timeout = self.options.timeouts.super_flash;
        let images = plan.dynamic.iter();
        let total = images.len();

        for (i, (partition, image)) in images.into_iter().enumerate() {
            let percent = span(55, 40, i, total);
            self.flash_partition(obs, Tool::Fastbootd, partition, image, (i + 1, total), percent, timeout)?;
        }
        Ok(())
    }

    fn finish(&mut self, obs: &mut dyn FlashObserver, lock_bootloader: bool) -> Result<()> {
        let control = self.options.timeouts.control;
        self.checkpoint()?;

        if lock_bootloader {
            self.progress(obs, "lock_bootloader", 96, "Locking bootloader");
            let result = self.command(obs, Tool::Fastbootd, fastboot::FLASHING_LOCK, control);
            if !result.success {
                self.log(
                    obs,
                    LogLevel::Warning,
                    &format!(
                        "Bootloader lock failed: {}; lock it from the bootloader menu",
                        result.failure_detail()
                    ),
                );
            }
        }

        self.progress(obs, "reboot", 98, "Rebooting device");
        let result = self.command(obs, Tool::Fastbootd, fastboot::REBOOT, control);
        if !result.success {
            self.log(
                obs,
                LogLevel::Warning,
                &format!("Reboot failed: {}; reboot the device manually", result.failure_detail()),
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn flash_partition(
        &mut self,
        obs: &mut dyn FlashObserver,
        tool: Tool,
        partition: &str,
        image: &Path,
        (index, total): (usize, usize),
        percent: u8,
        timeout: Duration,
    ) -> Result<()> {
        self.checkpoint()?;
        let step = format!("flash_{partition}");

        self.emit(
            obs,
            FlashProgress::new(self.state, &step, percent, format!("Flashing {partition}"))
                .with_partition(partition, index, total),
        );

        let image = image.to_string_lossy();
        self.command_ok(obs, tool, &fastboot::flash_args(partition, &image), timeout)?;

        self.emit(
            obs,
            FlashProgress::new(self.state, &step, percent, format!("Flashed {partition}"))
                .with_partition(partition, index, total),
        );
        Ok(())
    }

    fn wait_for_bootloader(&mut self, timeout: Duration) -> Result<()> {
        self.checkpoint()?;
        if self.transport.wait_for_fastboot(timeout) {
            return Ok(());
        }
        self.checkpoint()?;
        Err(Error::DeviceTimeout(format!(
            "device did not enter fastboot mode within {}s",
            timeout.as_secs()
        )))
    }

    fn command(
        &mut self,
        obs: &mut dyn FlashObserver,
        tool: Tool,
        args: &[&str],
        timeout: Duration,
    ) -> CommandResult {
        self.log(obs, LogLevel::Info, &format!("$ {} {}", tool.name(), args.join(" ")));
        match tool {
            Tool::Adb => self.transport.adb_command(args, timeout),
            Tool::Fastboot => self.transport.fastboot_command(args, timeout),
            Tool::Fastbootd => self.transport.fastbootd_command(args, timeout),
        }
    }

    fn command_ok(
        &mut self,
        obs: &mut dyn FlashObserver,
        tool: Tool,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandResult> {
        let result = self.command(obs, tool, args, timeout);
        if result.success {
            Ok(result)
        } else {
            Err(Error::CommandFailed {
                command: format!("{} {}", tool.name(), args.join(" ")),
                detail: result.failure_detail(),
            })
        }
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Enter `to`, announcing the phase to the observer.
    ///
    /// Terminal states get their own closing event from the caller.
    fn transition(&mut self, obs: &mut dyn FlashObserver, to: FlashState) {
        debug_assert!(
            self.state.can_transition_to(to),
            "illegal transition {} -> {to}",
            self.state
        );
        debug!("State {} -> {to}", self.state);
        self.state = to;
        self.history.push(to);
        if !to.is_terminal() {
            let message = format!("Entering {to} phase");
            self.log(obs, LogLevel::Info, &message);
            self.progress(obs, to.name(), self.percent, message);
        }
    }

    fn progress(
        &mut self,
        obs: &mut dyn FlashObserver,
        step: &str,
        percent: u8,
        message: impl Into<String>,
    ) {
        let event = FlashProgress::new(self.state, step, percent, message);
        self.emit(obs, event);
    }

    fn emit(&mut self, obs: &mut dyn FlashObserver, mut event: FlashProgress) {
        self.percent = event.progress_percent;
        self.log_lines.push(event.message.clone());
        event.log_lines.clone_from(&self.log_lines);
        debug!("[{}%] {}", event.progress_percent, event.message);
        obs.on_progress(&event);
    }

    fn log(&mut self, obs: &mut dyn FlashObserver, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => info!("{message}"),
            LogLevel::Warning => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
        }
        obs.on_log(message, level);
    }
}
