//! Single-deadline idle timer computation.

use chrono::{DateTime, Utc};

use super::state::{SessionState, SessionStatus};

/// What happens when a deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    /// The warning countdown starts.
    Warning,
    /// The session is logged out.
    Expiry,
}

/// The next instant the state machine must be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// When.
    pub at: DateTime<Utc>,
    /// What it triggers.
    pub kind: DeadlineKind,
}

/// Computes the only timer a session needs. Remembered, expired and
/// never-expiring sessions have none.
#[must_use]
pub fn next_deadline(state: &SessionState) -> Option<Deadline> {
    match state.status() {
        SessionStatus::Active => Some(Deadline {
            at: state.warning_at()?,
            kind: DeadlineKind::Warning,
        }),
        SessionStatus::Warning => Some(Deadline {
            at: state.expires_at()?,
            kind: DeadlineKind::Expiry,
        }),
        SessionStatus::Expired | SessionStatus::Remembered => None,
    }
}

/// Time from `now` until `at`; zero if it has passed.
#[must_use]
pub fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (at - now).to_std().unwrap_or_default()
}
