//! Background task that runs a [`SessionManager`].
//!
//! The task keeps a single timer armed for the next deadline and listens
//! for local activity and for changes other instances make to the shared
//! store. Stores that cannot announce changes are polled instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use super::activity::{ActivityEvent, ActivityKind, ActivityThrottle};
use super::clock::Clock;
use super::idle;
use super::manager::SessionManager;
use super::state::{SessionStatus, Transition};
use crate::kv::{KvChange, KvError};

/// Notifications for the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session will expire after `remaining` without activity.
    Warning {
        /// Time left before logout.
        remaining: Duration,
    },
    /// Activity during the warning kept the session alive.
    Resumed,
    /// The session expired from inactivity or was ended elsewhere.
    Expired,
    /// The user logged out from this instance.
    LoggedOut,
}

/// Tuning for the driver task.
#[derive(Debug, Clone, Copy)]
pub struct SessionDriverConfig {
    /// How often the shared store is read when it cannot be watched. Also
    /// the longest the idle timer sleeps before re-reading the clock, so a
    /// machine waking from suspend notices the elapsed time.
    pub poll_interval: Duration,
    /// Minimum spacing between recorded activity events.
    pub activity_throttle: Duration,
    /// Capacity of the input and event channels.
    pub channel_capacity: usize,
}

impl Default for SessionDriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            activity_throttle: Duration::from_secs(1),
            channel_capacity: 64,
        }
    }
}

enum Input {
    Activity(ActivityEvent),
    Logout,
}

enum Step {
    Deadline,
    Input(Option<Input>),
    Change(Result<KvChange, broadcast::error::RecvError>),
    Poll,
}

/// Handle to a running session driver.
///
/// Dropping the handle stops the driver.
pub struct SessionHandle {
    input: mpsc::Sender<Input>,
    status: watch::Receiver<SessionStatus>,
    events: mpsc::Receiver<SessionEvent>,
    clock: Arc<dyn Clock>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("status", &*self.status.borrow())
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Spawns a driver for a manager that has already logged in or
    /// resumed. A manager without a session starts out expired.
    #[must_use]
    pub fn spawn(manager: SessionManager, config: SessionDriverConfig) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (input, input_rx) = mpsc::channel(capacity);
        let (events_tx, events) = mpsc::channel(capacity);
        let initial = manager.status().unwrap_or(SessionStatus::Expired);
        let (status_tx, status) = watch::channel(initial);
        let clock = manager.clock();
        let task = tokio::spawn(run(manager, config, input_rx, status_tx, events_tx));
        Self {
            input,
            status,
            events,
            clock,
            task,
        }
    }

    /// Records user activity of `kind` now. Returns `false` if the driver
    /// has stopped or is backed up.
    pub fn record(&self, kind: ActivityKind) -> bool {
        let event = ActivityEvent {
            kind,
            at: self.clock.now(),
        };
        self.input.try_send(Input::Activity(event)).is_ok()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status change.
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Waits for the next event. Returns `None` once the driver has stopped
    /// and every event has been read.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Logs out here and in every other instance.
    pub async fn logout(&self) {
        if self.input.send(Input::Logout).await.is_err() {
            tracing::debug!("session driver already stopped");
        }
    }

    /// Returns `true` once the driver task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn poll_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn next_change(
    changes: &mut Option<broadcast::Receiver<KvChange>>,
) -> Result<KvChange, broadcast::error::RecvError> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_poll(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run(
    mut manager: SessionManager,
    config: SessionDriverConfig,
    mut input: mpsc::Receiver<Input>,
    status: watch::Sender<SessionStatus>,
    events: mpsc::Sender<SessionEvent>,
) {
    let clock = manager.clock();
    let mut throttle = ActivityThrottle::new(config.activity_throttle);
    let mut changes = manager.store().watch();
    let mut poll = if changes.is_some() {
        tracing::debug!("session sync: watching shared store");
        None
    } else {
        tracing::debug!(interval = ?config.poll_interval, "session sync: polling shared store");
        Some(poll_interval(config.poll_interval))
    };

    loop {
        if manager.status().is_none_or(|s| s == SessionStatus::Expired) {
            break;
        }
        let wait = manager
            .next_deadline()
            .map(|deadline| idle::until(deadline.at, clock.now()).min(config.poll_interval));

        let step = tokio::select! {
            () = sleep_for(wait) => Step::Deadline,
            received = input.recv() => Step::Input(received),
            change = next_change(&mut changes) => Step::Change(change),
            () = next_poll(&mut poll) => Step::Poll,
        };

        let outcome: Result<Transition, KvError> = match step {
            Step::Deadline | Step::Poll => manager.tick(),
            Step::Input(None) => break,
            Step::Input(Some(Input::Activity(event))) => {
                if !throttle.accept(&event) {
                    continue;
                }
                manager.record_activity(event.at)
            }
            Step::Input(Some(Input::Logout)) => {
                if let Err(e) = manager.logout() {
                    tracing::warn!(error = %e, "failed to clear shared session");
                }
                status.send_replace(SessionStatus::Expired);
                emit(&events, SessionEvent::LoggedOut);
                break;
            }
            Step::Change(Ok(change)) => manager.apply_change(&change),
            Step::Change(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                tracing::debug!(skipped, "missed shared store changes, re-reading");
                manager.sync_from_store()
            }
            Step::Change(Err(broadcast::error::RecvError::Closed)) => {
                tracing::info!("shared store stopped announcing changes, switching to polling");
                changes = None;
                poll = Some(poll_interval(config.poll_interval));
                continue;
            }
        };

        let transition = match outcome {
            Ok(transition) => transition,
            Err(e) => {
                tracing::warn!(error = %e, "shared session store error");
                continue;
            }
        };
        if let Some(current) = manager.status() {
            status.send_if_modified(|s| {
                let changed = *s != current;
                *s = current;
                changed
            });
        }
        match transition {
            Transition::Warning { remaining } => emit(
                &events,
                SessionEvent::Warning {
                    remaining: remaining.to_std().unwrap_or_default(),
                },
            ),
            Transition::Resumed => emit(&events, SessionEvent::Resumed),
            Transition::Expired => emit(&events, SessionEvent::Expired),
            Transition::Unchanged | Transition::Reset => {}
        }
    }
    tracing::debug!("session driver stopped");
}

fn emit(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(e) = events.try_send(event) {
        tracing::debug!(error = %e, "session event dropped");
    }
}
