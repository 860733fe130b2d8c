//! Progress and log delivery.

use std::fmt;
use std::sync::mpsc::{self, Receiver, SyncSender};

use log::debug;

use super::state::FlashProgress;

/// Severity of a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum LogLevel {
    /// Normal progress.
    Info,
    /// Something non-fatal went wrong.
    Warning,
    /// The job is about to fail.
    Error,
}

impl LogLevel {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives events from a running job, synchronously and in order.
pub trait FlashObserver {
    /// A phase or partition step started or finished.
    fn on_progress(&mut self, progress: &FlashProgress) {
        let _ = progress;
    }

    /// A log line was produced.
    fn on_log(&mut self, message: &str, level: LogLevel) {
        let _ = (message, level);
    }
}

impl<O: FlashObserver + ?Sized> FlashObserver for &mut O {
    fn on_progress(&mut self, progress: &FlashProgress) {
        (**self).on_progress(progress);
    }

    fn on_log(&mut self, message: &str, level: LogLevel) {
        (**self).on_log(message, level);
    }
}

/// Observer that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl FlashObserver for NullObserver {}

/// Event as delivered over a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    /// See [`FlashObserver::on_progress`].
    Progress(FlashProgress),
    /// See [`FlashObserver::on_log`].
    Log {
        /// Log message.
        message: String,
        /// Severity.
        level: LogLevel,
    },
}

/// Observer forwarding events into a bounded channel.
///
/// A full channel blocks the job until the consumer catches up, so events are
/// never dropped or reordered. Once the receiver is gone, events are discarded.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: SyncSender<FlashEvent>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end with room for `capacity` events.
    pub fn bounded(capacity: usize) -> (Self, Receiver<FlashEvent>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (Self { tx }, rx)
    }

    fn send(&self, event: FlashEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

impl FlashObserver for ChannelObserver {
    fn on_progress(&mut self, progress: &FlashProgress) {
        self.send(FlashEvent::Progress(progress.clone()));
    }

    fn on_log(&mut self, message: &str, level: LogLevel) {
        self.send(FlashEvent::Log {
            message: message.to_string(),
            level,
        });
    }
}
