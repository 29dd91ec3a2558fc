//! Session ownership and cross-instance persistence.
//!
//! [`SessionManager`] owns the [`SessionState`] of this instance and
//! mirrors it into the shared key-value store so that other instances of
//! the application (tabs, windows, processes) agree on when the user was
//! last active. Timestamps only move forward: a remote value is adopted
//! only if it is newer than the local one.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use convosync_proto::message::PrincipalId;

use super::clock::Clock;
use super::idle::{self, Deadline};
use super::state::{SessionPolicy, SessionState, SessionStatus, Transition};
use crate::kv::{KeyValueStore, KvChange, KvError};

/// Last activity of the shared session, RFC 3339.
pub const LAST_ACTIVITY_KEY: &str = "session.lastActivity";

/// `"true"` if the shared session was started with remember-me.
pub const REMEMBER_ME_KEY: &str = "session.rememberMe";

/// Idle timeout of the shared session in minutes.
pub const TIMEOUT_KEY: &str = "session.timeoutMinutes";

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Owns one instance's view of the shared session.
pub struct SessionManager {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    policy: SessionPolicy,
    state: Option<SessionState>,
}

impl SessionManager {
    /// Creates a manager with no session.
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, policy: SessionPolicy) -> Self {
        Self {
            kv,
            clock,
            policy,
            state: None,
        }
    }

    /// Starts a session and publishes it to the shared store.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the session keys cannot be written. The
    /// local session is started regardless.
    pub fn login(
        &mut self,
        principal: PrincipalId,
        remember_me: bool,
    ) -> Result<SessionStatus, KvError> {
        let now = self.clock.now();
        let state = SessionState::login(principal, self.policy, remember_me, now);
        let status = state.status();
        tracing::info!(principal = %state.principal(), %status, "session started");
        self.state = Some(state);

        self.kv.set(REMEMBER_ME_KEY, if remember_me { "true" } else { "false" })?;
        self.kv
            .set(TIMEOUT_KEY, &self.policy.timeout_minutes().to_string())?;
        self.kv.set(LAST_ACTIVITY_KEY, &format_time(now))?;
        Ok(status)
    }

    /// Joins a session another instance already started.
    ///
    /// Returns `None` if the shared store holds no session. A stored
    /// last-activity that cannot be parsed ends the session. A stored
    /// timeout shorter than the local one wins.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the store cannot be read.
    pub fn resume(&mut self, principal: PrincipalId) -> Result<Option<SessionStatus>, KvError> {
        let Some(raw_activity) = self.kv.get(LAST_ACTIVITY_KEY)? else {
            return Ok(None);
        };
        let remember_me = self.kv.get(REMEMBER_ME_KEY)?.as_deref() == Some("true");
        let stored_timeout = self.kv.get(TIMEOUT_KEY)?;
        let policy = match stored_timeout.as_deref().map(str::parse::<i64>) {
            Some(Ok(minutes)) if minutes > 0 => self.policy.stricter(SessionPolicy::new(
                self.policy.auto_logout(),
                minutes,
                0,
            )),
            Some(_) => {
                tracing::warn!("unreadable stored timeout, enforcing auto-logout");
                self.policy
                    .stricter(SessionPolicy::new(true, self.policy.timeout_minutes(), 0))
            }
            None => self.policy,
        };
        self.policy = policy;

        let Some(last_activity) = parse_time(&raw_activity) else {
            tracing::warn!(value = %raw_activity, "unreadable stored activity, ending session");
            self.clear_keys()?;
            let mut state = SessionState::login(principal, policy, false, self.clock.now());
            state.expire();
            self.state = Some(state);
            return Ok(Some(SessionStatus::Expired));
        };

        let mut state = SessionState::login(principal, policy, remember_me, last_activity);
        let transition = state.evaluate(self.clock.now());
        let status = state.status();
        self.state = Some(state);
        if transition == Transition::Expired {
            self.clear_keys()?;
        }
        tracing::info!(%status, "session resumed from shared store");
        Ok(Some(status))
    }

    /// Applies local user activity and publishes it.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the new activity cannot be written. The local
    /// state is updated regardless.
    pub fn record_activity(&mut self, at: DateTime<Utc>) -> Result<Transition, KvError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(Transition::Unchanged);
        };
        let transition = state.record_activity(at);
        match transition {
            Transition::Reset | Transition::Resumed => {
                self.kv.set(LAST_ACTIVITY_KEY, &format_time(at))?;
            }
            Transition::Expired => self.clear_keys()?,
            Transition::Unchanged | Transition::Warning { .. } => {}
        }
        Ok(transition)
    }

    /// Re-evaluates the session at the current time.
    ///
    /// Newer activity from other instances is read first, so this instance
    /// never warns or expires while another one is in use.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the keys of an expired session cannot be
    /// cleared. A failed read is logged and the local state is used.
    pub fn tick(&mut self) -> Result<Transition, KvError> {
        let adopted = match self.sync_from_store() {
            Ok(transition) => transition,
            Err(e) => {
                tracing::warn!(error = %e, "could not read shared session, using local state");
                Transition::Unchanged
            }
        };
        if adopted == Transition::Expired {
            return Ok(adopted);
        }
        let now = self.clock.now();
        let Some(state) = self.state.as_mut() else {
            return Ok(Transition::Unchanged);
        };
        let transition = state.evaluate(now);
        if transition == Transition::Expired {
            tracing::info!(principal = %state.principal(), "session expired after inactivity");
            self.clear_keys()?;
        }
        Ok(match (adopted, transition) {
            (Transition::Resumed, Transition::Unchanged) => Transition::Resumed,
            (_, t) => t,
        })
    }

    /// Applies a change announced by the shared store.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] only when clearing keys after a remote logout
    /// fails.
    pub fn apply_change(&mut self, change: &KvChange) -> Result<Transition, KvError> {
        if change.key != LAST_ACTIVITY_KEY {
            return Ok(Transition::Unchanged);
        }
        Ok(self.adopt_remote(change.value.as_deref()))
    }

    /// Reads the shared last-activity and adopts it if newer.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the store cannot be read.
    pub fn sync_from_store(&mut self) -> Result<Transition, KvError> {
        if self.state.is_none() {
            return Ok(Transition::Unchanged);
        }
        let raw = self.kv.get(LAST_ACTIVITY_KEY)?;
        Ok(self.adopt_remote(raw.as_deref()))
    }

    fn adopt_remote(&mut self, raw: Option<&str>) -> Transition {
        let Some(state) = self.state.as_mut() else {
            return Transition::Unchanged;
        };
        match raw {
            // Another instance logged out or expired.
            None => {
                let transition = state.expire();
                if transition == Transition::Expired {
                    tracing::info!("session ended by another instance");
                }
                transition
            }
            Some(raw) => match parse_time(raw) {
                Some(at) => state.record_activity(at),
                None => {
                    tracing::warn!(value = %raw, "ignoring unreadable shared activity");
                    Transition::Unchanged
                }
            },
        }
    }

    /// Ends the session here and in every other instance.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the keys cannot be cleared.
    pub fn logout(&mut self) -> Result<(), KvError> {
        if let Some(state) = self.state.as_mut() {
            state.expire();
            tracing::info!(principal = %state.principal(), "logged out");
        }
        self.clear_keys()
    }

    fn clear_keys(&self) -> Result<(), KvError> {
        self.kv.remove(LAST_ACTIVITY_KEY)?;
        self.kv.remove(REMEMBER_ME_KEY)?;
        self.kv.remove(TIMEOUT_KEY)
    }

    /// Current status, or `None` before login.
    #[must_use]
    pub fn status(&self) -> Option<SessionStatus> {
        self.state.as_ref().map(SessionState::status)
    }

    /// Current state, or `None` before login.
    #[must_use]
    pub const fn state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    /// The next time [`SessionManager::tick`] must run.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Deadline> {
        self.state.as_ref().and_then(idle::next_deadline)
    }

    /// The clock this manager reads.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// The shared store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.kv)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("policy", &self.policy)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
