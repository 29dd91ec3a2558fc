//! Session expiry state machine.
//!
//! Pure: every function takes the current time as an argument. The
//! manager persists the results and the driver schedules the timer.
//!
//! ```text
//! login ──► Active ──(idle ≥ timeout - window)──► Warning ──(idle ≥ timeout)──► Expired
//!             ▲                                      │
//!             └────────────── activity ──────────────┘
//! login + remember-me ──► Remembered (absorbing)
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use convosync_proto::message::PrincipalId;

/// Idle timeout used when no preference is stored.
pub const DEFAULT_TIMEOUT_MINUTES: i64 = 30;

/// Warning window used when no preference is stored.
pub const DEFAULT_WARNING_MINUTES: i64 = 2;

/// Longest accepted idle timeout; anything above is treated as invalid.
pub const MAX_TIMEOUT_MINUTES: i64 = 24 * 60;

/// A stored idle preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference<T> {
    /// Nothing stored.
    Missing,
    /// Something stored that could not be understood.
    Invalid,
    /// A parsed value.
    Value(T),
}

/// Idle-logout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    auto_logout: bool,
    timeout: TimeDelta,
    warning_window: TimeDelta,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new(true, DEFAULT_TIMEOUT_MINUTES, DEFAULT_WARNING_MINUTES)
    }
}

impl SessionPolicy {
    /// Builds a policy. A warning window not shorter than the timeout is
    /// clamped to half the timeout.
    #[must_use]
    pub fn new(auto_logout: bool, timeout_minutes: i64, warning_minutes: i64) -> Self {
        let timeout = TimeDelta::minutes(timeout_minutes.clamp(1, MAX_TIMEOUT_MINUTES));
        let mut warning_window = TimeDelta::minutes(warning_minutes.max(0));
        if warning_window >= timeout {
            warning_window = timeout / 2;
        }
        Self {
            auto_logout,
            timeout,
            warning_window,
        }
    }

    /// Resolves stored preferences, failing closed.
    ///
    /// Missing values take the defaults (enabled, 30 minutes, 2 minute
    /// warning). If any value is invalid, auto-logout is forced on and the
    /// timeout becomes the shorter of the configured value and the default.
    #[must_use]
    pub fn from_preferences(
        auto_logout: Preference<bool>,
        timeout_minutes: Preference<i64>,
        warning_minutes: Preference<i64>,
    ) -> Self {
        let timeout_valid = match timeout_minutes {
            Preference::Value(t) => (1..=MAX_TIMEOUT_MINUTES).contains(&t),
            Preference::Missing => true,
            Preference::Invalid => false,
        };
        let warning_valid = match warning_minutes {
            Preference::Value(w) => w >= 0,
            Preference::Missing => true,
            Preference::Invalid => false,
        };
        let any_invalid =
            matches!(auto_logout, Preference::Invalid) || !timeout_valid || !warning_valid;

        let timeout = match timeout_minutes {
            Preference::Value(t) if any_invalid && t > 0 => t.min(DEFAULT_TIMEOUT_MINUTES),
            Preference::Value(t) if timeout_valid => t,
            _ => DEFAULT_TIMEOUT_MINUTES,
        };
        let warning = match warning_minutes {
            Preference::Value(w) if warning_valid => w,
            _ => DEFAULT_WARNING_MINUTES,
        };
        let enabled = match auto_logout {
            Preference::Value(enabled) if !any_invalid => enabled,
            _ => true,
        };
        if any_invalid {
            tracing::warn!(timeout, "invalid idle preferences, enforcing auto-logout");
        }
        Self::new(enabled, timeout, warning)
    }

    /// Returns the stricter of two policies: auto-logout on if either has
    /// it on, and the shorter timeout.
    #[must_use]
    pub fn stricter(self, other: Self) -> Self {
        let timeout = self.timeout.min(other.timeout);
        let warning_window = self.warning_window.max(other.warning_window);
        Self {
            auto_logout: self.auto_logout || other.auto_logout,
            timeout,
            warning_window: if warning_window >= timeout {
                timeout / 2
            } else {
                warning_window
            },
        }
    }

    /// Returns `true` if idle sessions are logged out.
    #[must_use]
    pub const fn auto_logout(&self) -> bool {
        self.auto_logout
    }

    /// Idle time until forced logout.
    #[must_use]
    pub const fn timeout(&self) -> TimeDelta {
        self.timeout
    }

    /// How long before logout the warning is shown.
    #[must_use]
    pub const fn warning_window(&self) -> TimeDelta {
        self.warning_window
    }

    /// Timeout in whole minutes.
    #[must_use]
    pub fn timeout_minutes(&self) -> i64 {
        self.timeout.num_minutes()
    }
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// The user is present or idle for less than the warning threshold.
    Active,
    /// Logout is imminent unless the user acts.
    Warning,
    /// The session ended; the user must log in again.
    Expired,
    /// Remember-me login: exempt from idle logout.
    Remembered,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Warning => write!(f, "warning"),
            Self::Expired => write!(f, "expired"),
            Self::Remembered => write!(f, "remembered"),
        }
    }
}

/// What changed as the result of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing observable changed.
    Unchanged,
    /// Activity pushed the expiry back while already active.
    Reset,
    /// Entered the warning state.
    Warning {
        /// Time left before logout.
        remaining: TimeDelta,
    },
    /// Activity during the warning returned the session to active.
    Resumed,
    /// The session expired.
    Expired,
}

/// The state of one logged-in session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    principal: PrincipalId,
    status: SessionStatus,
    last_activity: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    policy: SessionPolicy,
    remember_me: bool,
}

impl SessionState {
    /// Starts a session at `now`.
    #[must_use]
    pub fn login(
        principal: PrincipalId,
        policy: SessionPolicy,
        remember_me: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let mut state = Self {
            principal,
            status: SessionStatus::Active,
            last_activity: now,
            expires_at: None,
            policy,
            remember_me,
        };
        if remember_me {
            state.status = SessionStatus::Remembered;
        } else {
            state.expires_at = state.compute_expiry();
        }
        state
    }

    fn compute_expiry(&self) -> Option<DateTime<Utc>> {
        if self.policy.auto_logout && !self.remember_me {
            self.last_activity.checked_add_signed(self.policy.timeout)
        } else {
            None
        }
    }

    /// When the warning starts, if this session can expire.
    #[must_use]
    pub fn warning_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at?
            .checked_sub_signed(self.policy.warning_window)
    }

    /// Advances the state machine to `now`.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Transition {
        if !matches!(self.status, SessionStatus::Active | SessionStatus::Warning) {
            return Transition::Unchanged;
        }
        let (Some(expires_at), Some(warning_at)) = (self.expires_at, self.warning_at()) else {
            return Transition::Unchanged;
        };
        if now >= expires_at {
            self.status = SessionStatus::Expired;
            return Transition::Expired;
        }
        if now >= warning_at && self.status == SessionStatus::Active {
            self.status = SessionStatus::Warning;
            return Transition::Warning {
                remaining: expires_at - now,
            };
        }
        Transition::Unchanged
    }

    /// Applies user activity at `at`, from this or another instance.
    ///
    /// Activity only moves time forward: an older timestamp is ignored.
    /// Activity that arrives after the expiry instant does not revive the
    /// session.
    pub fn record_activity(&mut self, at: DateTime<Utc>) -> Transition {
        let evaluated = self.evaluate(at);
        match self.status {
            SessionStatus::Expired => return evaluated,
            SessionStatus::Remembered => {
                self.last_activity = self.last_activity.max(at);
                return Transition::Unchanged;
            }
            SessionStatus::Active | SessionStatus::Warning => {}
        }
        if at <= self.last_activity {
            return evaluated;
        }
        let was_warning = self.status == SessionStatus::Warning;
        self.last_activity = at;
        self.expires_at = self.compute_expiry();
        self.status = SessionStatus::Active;
        if was_warning {
            Transition::Resumed
        } else {
            Transition::Reset
        }
    }

    /// Ends the session immediately.
    pub fn expire(&mut self) -> Transition {
        if self.status == SessionStatus::Expired {
            Transition::Unchanged
        } else {
            self.status = SessionStatus::Expired;
            Transition::Expired
        }
    }

    /// The logged-in principal.
    #[must_use]
    pub const fn principal(&self) -> &PrincipalId {
        &self.principal
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.status
    }

    /// Last recorded activity.
    #[must_use]
    pub const fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Forced-logout instant, if the session can expire.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// The policy in force.
    #[must_use]
    pub const fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Whether the session was started with remember-me.
    #[must_use]
    pub const fn remember_me(&self) -> bool {
        self.remember_me
    }
}
