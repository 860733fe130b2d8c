//! Bounded polling with cooperative cancellation.
//!
//! Every mode transition on the device is followed by a USB re-enumeration,
//! so "is it there yet?" is answered by asking again at a fixed interval until a
//! deadline. A check that errors or times out simply means "not yet".

use std::thread;
use std::time::{Duration, Instant};

use crate::job::CancelToken;

/// Default interval between presence checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default timeout for a single discovery command.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Granularity at which sleeps notice cancellation.
const CANCEL_SLICE: Duration = Duration::from_millis(100);

/// Timing of presence polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between checks.
    pub interval: Duration,
    /// Timeout for each discovery command.
    pub query_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl PollConfig {
    /// Set the check interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the per-query timeout.
    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }
}

/// How a bounded poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The check reported ready.
    Ready,
    /// The deadline passed.
    TimedOut,
    /// The cancel token fired.
    Cancelled,
}

impl PollOutcome {
    /// Whether the check succeeded.
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

/// Run `check` every `interval` until it returns `true`, `timeout` elapses
/// or `cancel` fires.
///
/// The check always runs at least once, even with a zero timeout.
pub fn poll_until<F>(
    timeout: Duration,
    interval: Duration,
    cancel: &CancelToken,
    mut check: F,
) -> PollOutcome
where
    F: FnMut() -> bool,
{
    let start = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        if check() {
            return PollOutcome::Ready;
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return PollOutcome::TimedOut;
        }
        if !sleep_unless_cancelled(interval.min(timeout - elapsed), cancel) {
            return PollOutcome::Cancelled;
        }
    }
}

/// Sleep for `duration`, waking early on cancellation.
///
/// Returns `false` if the token fired.
pub fn sleep_unless_cancelled(duration: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(CANCEL_SLICE.min(deadline - now));
    }
}
