//! User activity signals.

use chrono::{DateTime, TimeDelta, Utc};

/// What kind of input produced an activity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    /// Mouse or trackpad movement and clicks.
    Pointer,
    /// Key presses.
    Keyboard,
    /// Touch input.
    Touch,
    /// The application window gained focus.
    Focus,
}

/// One raw activity signal. Consumed by the idle timer and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityEvent {
    /// Input source.
    pub kind: ActivityKind,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Collapses bursts of raw signals into at most one tick per interval.
#[derive(Debug, Clone)]
pub struct ActivityThrottle {
    interval: TimeDelta,
    last: Option<DateTime<Utc>>,
}

impl ActivityThrottle {
    /// Creates a throttle passing at most one event per `interval`.
    #[must_use]
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval: TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX),
            last: None,
        }
    }

    /// Returns `true` if `event` should reset the idle timer.
    pub fn accept(&mut self, event: &ActivityEvent) -> bool {
        match self.last {
            Some(last)
                if last
                    .checked_add_signed(self.interval)
                    .is_none_or(|next| event.at < next) =>
            {
                false
            }
            _ => {
                self.last = Some(event.at);
                true
            }
        }
    }
}
