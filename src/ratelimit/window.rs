//! Sliding window evaluation over the request log.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::trace;

use super::entry::{LogEntry, RequestLog};

/// Default trailing window: one hour.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);
/// Default number of requests admitted per window.
pub const DEFAULT_CAPACITY: usize = 100;

/// Window length and capacity for admission decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    /// Length of the trailing window
    pub window: Duration,
    /// Entries allowed to exist in the window before new requests are refused
    pub capacity: usize,
}

impl WindowPolicy {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self { window, capacity }
    }

    /// Evaluate `log` at `now` under this policy.
    pub fn evaluate(&self, log: RequestLog, now: DateTime<Utc>) -> WindowDecision {
        evaluate(log, now, self.window, self.capacity)
    }
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_CAPACITY)
    }
}

/// Outcome of evaluating the request log at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowDecision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Whole seconds to wait before retrying; zero when admitted
    pub retry_after: Duration,
    /// The log to persist, whatever the outcome
    pub trimmed_log: RequestLog,
}

/// Decide whether a request arriving at `now` is admitted.
///
/// Entries older than `now - window` are always discarded first. The request
/// is refused when `capacity` or more entries remain; otherwise an entry for
/// `now` is appended. On refusal the wait is the whole seconds left until the
/// oldest surviving entry goes stale, plus one: an entry exactly `window` old
/// still counts, so a retry at `now + retry_after` must land strictly past
/// that instant. With nothing left to measure from (only possible when
/// `capacity` is zero) the wait is the whole window, rounded up.
pub fn evaluate(
    mut log: RequestLog,
    now: DateTime<Utc>,
    window: Duration,
    capacity: usize,
) -> WindowDecision {
    // A window too long to represent reaches back past every entry.
    let cutoff = TimeDelta::from_std(window)
        .ok()
        .and_then(|span| now.checked_sub_signed(span));

    if let Some(cutoff) = cutoff {
        let discarded = log.discard_before(cutoff);
        if discarded > 0 {
            trace!(discarded, remaining = log.len(), "Discarded stale request log entries");
        }
    }

    if log.len() >= capacity {
        let retry_after = retry_after(&log, now, window);
        trace!(
            in_window = log.len(),
            capacity,
            retry_after_secs = retry_after.as_secs(),
            "Request log at capacity"
        );
        return WindowDecision {
            admitted: false,
            retry_after,
            trimmed_log: log,
        };
    }

    log.push(LogEntry::at(now));
    WindowDecision {
        admitted: true,
        retry_after: Duration::ZERO,
        trimmed_log: log,
    }
}

fn retry_after(log: &RequestLog, now: DateTime<Utc>, window: Duration) -> Duration {
    match log.oldest() {
        // An oldest entry from the future (clock skew) counts as just written.
        Some(oldest) => {
            let elapsed = now
                .signed_duration_since(oldest)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let remaining = window.saturating_sub(elapsed);
            Duration::from_secs(remaining.as_secs().saturating_add(1))
        }
        None => round_up_to_secs(window),
    }
}

fn round_up_to_secs(duration: Duration) -> Duration {
    if duration.subsec_nanos() == 0 {
        duration
    } else {
        Duration::from_secs(duration.as_secs().saturating_add(1))
    }
}
