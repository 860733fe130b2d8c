//! Flash states, progress events and the terminal outcome.

use std::fmt;
use std::path::PathBuf;

use crate::error::Error;

/// Phase of a flash job.
///
/// Phases run strictly in declaration order. `Adb` is skipped when the
/// bootloader is already known to be unlocked. `Error` can follow any
/// non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum FlashState {
    /// Bundle and partition plan resolution.
    Init,
    /// Bootloader unlock check and request.
    Adb,
    /// Getting the device into bootloader fastboot.
    Fastboot,
    /// Bootloader, radio and core partitions.
    FastbootFlash,
    /// Rebooting into userspace fastbootd.
    Fastbootd,
    /// Dynamic partitions.
    FastbootdFlash,
    /// Optional relock and final reboot.
    Final,
    /// Finished successfully.
    Done,
    /// Stopped on an error.
    Error,
}

impl FlashState {
    /// The designated successor, `None` for terminal states.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::Adb),
            Self::Adb => Some(Self::Fastboot),
            Self::Fastboot => Some(Self::FastbootFlash),
            Self::FastbootFlash => Some(Self::Fastbootd),
            Self::Fastbootd => Some(Self::FastbootdFlash),
            Self::FastbootdFlash => Some(Self::Final),
            Self::Final => Some(Self::Done),
            Self::Done | Self::Error => None,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Error || self.next() == Some(to) || (self == Self::Init && to == Self::Fastboot)
    }

    /// Wire name (`fastboot_flash`, ...).
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Adb => "adb",
            Self::Fastboot => "fastboot",
            Self::FastbootFlash => "fastboot_flash",
            Self::Fastbootd => "fastbootd",
            Self::FastbootdFlash => "fastbootd_flash",
            Self::Final => "final",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashProgress {
    /// Phase the event belongs to.
    pub state: FlashState,
    /// Short machine-friendly step name.
    pub step_name: String,
    /// Overall progress, 0-100.
    pub progress_percent: u8,
    /// Human-readable description.
    pub message: String,
    /// Partition being written, if any.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub partition: Option<String>,
    /// 1-based position of the partition within its phase.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub partition_index: Option<usize>,
    /// Number of partitions in the phase.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub total_partitions: Option<usize>,
    /// Messages of every event so far in this job.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub log_lines: Vec<String>,
}

impl FlashProgress {
    /// Event without partition details.
    pub fn new(
        state: FlashState,
        step_name: impl Into<String>,
        progress_percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            state,
            step_name: step_name.into(),
            progress_percent: progress_percent.min(100),
            message: message.into(),
            partition: None,
            partition_index: None,
            total_partitions: None,
            log_lines: Vec::new(),
        }
    }

    /// Attach partition details.
    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<String>, index: usize, total: usize) -> Self {
        self.partition = Some(partition.into());
        self.partition_index = Some(index);
        self.total_partitions = Some(total);
        self
    }
}

/// How a flash job ended.
#[derive(Debug)]
pub struct FlashOutcome {
    /// Whether the job reached [`FlashState::Done`].
    pub success: bool,
    /// The error that stopped the job.
    pub error: Option<Error>,
    /// `Done` or `Error`.
    pub final_state: FlashState,
    /// Image directory used, once resolved.
    pub bundle_path: Option<PathBuf>,
}

impl FlashOutcome {
    /// Error message, if the job failed.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    /// Convert into a `Result` carrying the bundle path.
    pub fn into_result(self) -> crate::Result<Option<PathBuf>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.bundle_path),
        }
    }
}
