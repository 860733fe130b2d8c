//! Transport abstraction for talking to one device over adb/fastboot.
//!
//! The state machine never spawns processes itself. It issues protocol
//! commands through a [`Transport`], which lets production code shell out to
//! the host tools while tests script every answer.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------+
//! | FlashStateMachine  |
//! +---------+----------+
//!           |
//!           v
//! +---------+----------+        +--------------------+
//! |  Transport trait   +------->+ poll::poll_until   |
//! +---------+----------+        +--------------------+
//!           |
//!     +-----+------------------+
//!     v                        v
//! +---+----------------+  +----+-------------+
//! | ProcessTransport   |  |  test doubles    |
//! | (adb, fastboot)    |  |                  |
//! +--------------------+  +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use grapheneflash::port::Transport;
//!
//! fn product<T: Transport>(transport: &mut T) -> Option<String> {
//!     let result = transport.fastboot_command(&["getvar", "product"], Duration::from_secs(5));
//!     grapheneflash::protocol::fastboot::parse_getvar(&result.output(), "product")
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;
pub mod poll;

use std::time::Duration;

use crate::error::Result;

/// Outcome of one adb/fastboot invocation.
///
/// Spawn failures and per-call timeouts are folded in as
/// `success == false` with `return_code == -1` and the reason in `stderr`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommandResult {
    /// Whether the tool exited with status 0.
    pub success: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit status, or -1 when the tool never produced one.
    pub return_code: i32,
}

impl CommandResult {
    /// Successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
            return_code: 0,
        }
    }

    /// Failed result with the given exit status and stderr.
    pub fn failed(return_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            return_code,
        }
    }

    /// Set stderr (fastboot reports most things there).
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// stdout followed by stderr.
    pub fn output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// Short description of a failure for error messages.
    pub fn failure_detail(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let last = text.lines().rev().find(|l| !l.trim().is_empty());
        match last {
            Some(line) => format!("{} (exit code {})", line.trim(), self.return_code),
            None => format!("exit code {}", self.return_code),
        }
    }
}

/// Executes protocol commands against one device.
///
/// Implementations hold only the pinned serial, tool locations and timing
/// configuration; they are not reused across devices.
pub trait Transport {
    /// Serial this transport is pinned to, if any.
    fn serial(&self) -> Option<&str>;

    /// Verify the host tools are usable before any device command.
    fn check_tools(&mut self) -> Result<()> {
        Ok(())
    }

    /// Run an adb command.
    fn adb_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult;

    /// Run a fastboot command while the device is in the bootloader.
    fn fastboot_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult;

    /// Run a fastboot command while the device is in userspace fastbootd.
    fn fastbootd_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult;

    /// Poll until the device is listed in bootloader fastboot mode.
    fn wait_for_fastboot(&mut self, timeout: Duration) -> bool;

    /// Poll until the device answers as userspace fastbootd.
    fn wait_for_fastbootd(&mut self, timeout: Duration) -> bool;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn serial(&self) -> Option<&str> {
        (**self).serial()
    }

    fn check_tools(&mut self) -> Result<()> {
        (**self).check_tools()
    }

    fn adb_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult {
        (**self).adb_command(args, timeout)
    }

    fn fastboot_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult {
        (**self).fastboot_command(args, timeout)
    }

    fn fastbootd_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult {
        (**self).fastbootd_command(args, timeout)
    }

    fn wait_for_fastboot(&mut self, timeout: Duration) -> bool {
        (**self).wait_for_fastboot(timeout)
    }

    fn wait_for_fastbootd(&mut self, timeout: Duration) -> bool {
        (**self).wait_for_fastbootd(timeout)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn serial(&self) -> Option<&str> {
        (**self).serial()
    }

    fn check_tools(&mut self) -> Result<()> {
        (**self).check_tools()
    }

    fn adb_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult {
        (**self).adb_command(args, timeout)
    }

    fn fastboot_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult {
        (**self).fastboot_command(args, timeout)
    }

    fn fastbootd_command(&mut self, args: &[&str], timeout: Duration) -> CommandResult {
        (**self).fastbootd_command(args, timeout)
    }

    fn wait_for_fastboot(&mut self, timeout: Duration) -> bool {
        (**self).wait_for_fastboot(timeout)
    }

    fn wait_for_fastbootd(&mut self, timeout: Duration) -> bool {
        (**self).wait_for_fastbootd(timeout)
    }
}

// Re-export the process-backed implementation
#[cfg(feature = "native")]
pub use native::ProcessTransport;
pub use poll::{PollConfig, PollOutcome};
