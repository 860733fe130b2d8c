//! Error types for grapheneflash.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for grapheneflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for grapheneflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (bundle directories, child process plumbing).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A host tool (adb or fastboot) is missing or does not run.
    #[error("Tool unavailable: {tool}: {reason}")]
    ToolUnavailable {
        /// Tool name or path as configured.
        tool: String,
        /// Why the tool was rejected.
        reason: String,
    },

    /// The requested build could not be located or is incomplete.
    #[error("Bundle resolution failed: {0}")]
    BundleResolutionFailed(String),

    /// The device did not reach the expected protocol mode in time.
    #[error("Device timeout: {0}")]
    DeviceTimeout(String),

    /// The bootloader refused the unlock request.
    #[error("Bootloader unlock denied: {0}")]
    UnlockDenied(String),

    /// The user did not confirm the unlock on the device in time.
    #[error("Bootloader unlock not confirmed within {}s", .0.as_secs())]
    UnlockTimeout(Duration),

    /// The attached device is not the model the bundle was built for.
    #[error("Device mismatch: expected {expected}, device reports {actual}")]
    DeviceMismatch {
        /// Codename the bundle targets.
        expected: String,
        /// Product name reported by the device.
        actual: String,
    },

    /// A protocol command returned failure.
    #[error("Command failed: {command}: {detail}")]
    CommandFailed {
        /// Command line as issued (tool arguments only).
        command: String,
        /// stderr/stdout excerpt or exit status.
        detail: String,
    },

    /// No device attached, or none matching the selection.
    #[error("Device not found")]
    DeviceNotFound,

    /// Another job already owns this device.
    #[error("Device busy: {0} already has an active job")]
    DeviceBusy(String),

    /// The job was cancelled by its owner.
    #[error("Cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error means the device never showed up where expected.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Self::DeviceTimeout(_) | Self::DeviceMismatch { .. } | Self::DeviceNotFound
        )
    }
}
