//! Session lifecycle: idle tracking, warning and forced logout, shared
//! across every running instance through the key-value store.

pub mod activity;
pub mod clock;
pub mod driver;
pub mod idle;
pub mod manager;
pub mod state;

use std::time::Duration;

pub use activity::{ActivityEvent, ActivityKind, ActivityThrottle};
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use driver::{SessionDriverConfig, SessionEvent, SessionHandle};
pub use idle::{Deadline, DeadlineKind};
pub use manager::SessionManager;
pub use state::{Preference, SessionPolicy, SessionState, SessionStatus, Transition};

/// Resolved `[session]` settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Idle policy after fail-closed resolution.
    pub policy: SessionPolicy,
    /// Polling period for stores that cannot announce changes.
    pub poll_interval: Duration,
    /// Minimum spacing between recorded activity events.
    pub activity_throttle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: SessionPolicy::default(),
            poll_interval: Duration::from_secs(5),
            activity_throttle: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    /// Driver settings with the given channel capacity.
    #[must_use]
    pub const fn driver(&self, channel_capacity: usize) -> SessionDriverConfig {
        SessionDriverConfig {
            poll_interval: self.poll_interval,
            activity_throttle: self.activity_throttle,
            channel_capacity,
        }
    }
}
