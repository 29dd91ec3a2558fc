// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for the multi-instance session lifecycle.
//!
//! Two "tabs" share one key-value store. Driver tests run on paused tokio
//! time so half-hour timeouts take no wall time; the file-backed tests
//! step a manual clock instead.
//!
//! Verification command: `cargo test --test session_lifecycle`

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use convosync::kv::{FileKv, KeyValueStore, MemoryKv};
use convosync::session::manager::LAST_ACTIVITY_KEY;
use convosync::session::{
    ActivityKind, Clock, ManualClock, SessionDriverConfig, SessionEvent, SessionHandle, SessionManager,
    SessionPolicy, SessionStatus, SystemClock, TokioClock, Transition,
};
use convosync_proto::message::PrincipalId;
use tokio::time::{Instant, sleep};

// =============================================================================
// Test helpers
// =============================================================================

const MINUTE: Duration = Duration::from_secs(60);

fn alice() -> PrincipalId {
    PrincipalId::new("alice")
}

fn policy() -> SessionPolicy {
    SessionPolicy::new(true, 30, 2)
}

/// How a tab obtains its session.
#[derive(Clone, Copy)]
enum Start {
    Login { remember_me: bool },
    Resume,
}

fn tab(kv: &Arc<dyn KeyValueStore>, clock: TokioClock, start: Start) -> SessionHandle {
    let mut manager = SessionManager::new(Arc::clone(kv), Arc::new(clock), policy());
    match start {
        Start::Login { remember_me } => {
            manager.login(alice(), remember_me).unwrap();
        }
        Start::Resume => {
            let status = manager.resume(alice()).unwrap();
            assert!(
                matches!(
                    status,
                    Some(SessionStatus::Active | SessionStatus::Remembered)
                ),
                "resume found no live session: {status:?}"
            );
        }
    }
    SessionHandle::spawn(manager, SessionDriverConfig::default())
}

fn two_tabs(kv: &Arc<dyn KeyValueStore>) -> (SessionHandle, SessionHandle) {
    let clock = TokioClock::starting_at(Utc::now());
    let a = tab(kv, clock, Start::Login { remember_me: false });
    let b = tab(kv, clock, Start::Resume);
    (a, b)
}

async fn expect_warning(tab: &mut SessionHandle) -> Duration {
    match tab.next_event().await {
        Some(SessionEvent::Warning { remaining }) => remaining,
        other => panic!("expected warning, got {other:?}"),
    }
}

// =============================================================================
// Cross-tab activity
// =============================================================================

#[tokio::test(start_paused = true)]
async fn activity_in_one_tab_defers_warning_in_the_other() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let start = Instant::now();
    let (mut a, mut b) = two_tabs(&kv);

    // Tab B sits idle; the user works in tab A at minute 27.
    sleep(27 * MINUTE).await;
    assert!(a.record(ActivityKind::Pointer));

    // Without A's activity, B would warn at 28 and expire at 30.
    sleep(4 * MINUTE).await;
    assert_eq!(b.status(), SessionStatus::Active);
    assert_eq!(a.status(), SessionStatus::Active);

    let remaining = expect_warning(&mut b).await;
    assert!(remaining <= 2 * MINUTE);
    let elapsed = start.elapsed();
    assert!(elapsed > 54 * MINUTE && elapsed < 56 * MINUTE, "warned at {elapsed:?}");

    expect_warning(&mut a).await;
    assert_eq!(b.next_event().await, Some(SessionEvent::Expired));
    assert_eq!(a.next_event().await, Some(SessionEvent::Expired));
    assert!(start.elapsed() < 58 * MINUTE);
    assert_eq!(kv.get(LAST_ACTIVITY_KEY).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn activity_during_warning_resumes_every_tab() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let (mut a, mut b) = two_tabs(&kv);

    expect_warning(&mut a).await;
    expect_warning(&mut b).await;
    assert_eq!(b.status(), SessionStatus::Warning);

    assert!(b.record(ActivityKind::Keyboard));
    assert_eq!(b.next_event().await, Some(SessionEvent::Resumed));
    assert_eq!(a.next_event().await, Some(SessionEvent::Resumed));
    assert_eq!(a.status(), SessionStatus::Active);
    assert_eq!(b.status(), SessionStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn logout_in_one_tab_ends_every_tab() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let (mut a, mut b) = two_tabs(&kv);
    sleep(5 * MINUTE).await;

    a.logout().await;
    assert_eq!(a.next_event().await, Some(SessionEvent::LoggedOut));
    assert_eq!(b.next_event().await, Some(SessionEvent::Expired));
    assert_eq!(b.next_event().await, None);
    assert_eq!(b.status(), SessionStatus::Expired);

    // A third tab finds nothing to join.
    let mut manager = SessionManager::new(
        Arc::clone(&kv),
        Arc::new(TokioClock::new()),
        policy(),
    );
    assert_eq!(manager.resume(alice()).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn remembered_session_is_never_logged_out_for_idleness() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let clock = TokioClock::starting_at(Utc::now());
    let a = tab(&kv, clock, Start::Login { remember_me: true });
    let b = tab(&kv, clock, Start::Resume);

    sleep(12 * 60 * MINUTE).await;
    assert_eq!(a.status(), SessionStatus::Remembered);
    assert_eq!(b.status(), SessionStatus::Remembered);
    assert!(!a.is_finished());
    assert!(!b.is_finished());
}

// =============================================================================
// Stores without change notification
// =============================================================================

#[tokio::test(start_paused = true)]
async fn polling_tabs_stay_in_step() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::silent());
    let (a, mut b) = two_tabs(&kv);

    sleep(27 * MINUTE).await;
    assert!(a.record(ActivityKind::Touch));
    sleep(3 * MINUTE).await;
    assert_eq!(b.status(), SessionStatus::Active);

    a.logout().await;
    sleep(Duration::from_secs(6)).await;
    assert_eq!(b.next_event().await, Some(SessionEvent::Expired));
    assert_eq!(b.status(), SessionStatus::Expired);
}

#[test]
fn file_backed_tabs_share_activity_and_logout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let clock = Arc::new(ManualClock::new(Utc::now()));

    let mut a = SessionManager::new(Arc::new(FileKv::open(&path)), clock.clone(), policy());
    let mut b = SessionManager::new(Arc::new(FileKv::open(&path)), clock.clone(), policy());
    a.login(alice(), false).unwrap();
    assert_eq!(b.resume(alice()).unwrap(), Some(SessionStatus::Active));

    clock.advance(TimeDelta::minutes(20));
    assert_eq!(a.record_activity(clock.now()).unwrap(), Transition::Reset);

    // 35 minutes since login, 15 since A's activity.
    clock.advance(TimeDelta::minutes(15));
    b.tick().unwrap();
    assert_eq!(b.status(), Some(SessionStatus::Active));

    a.logout().unwrap();
    assert_eq!(b.tick().unwrap(), Transition::Expired);
    assert_eq!(b.status(), Some(SessionStatus::Expired));
}

#[test]
fn shorter_timeout_from_another_tab_wins() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));

    let mut strict = SessionManager::new(
        Arc::clone(&kv),
        clock.clone(),
        SessionPolicy::new(true, 10, 2),
    );
    strict.login(alice(), false).unwrap();

    let mut relaxed = SessionManager::new(Arc::clone(&kv), clock.clone(), policy());
    assert_eq!(relaxed.resume(alice()).unwrap(), Some(SessionStatus::Active));

    clock.advance(TimeDelta::minutes(11));
    relaxed.tick().unwrap();
    assert_eq!(relaxed.status(), Some(SessionStatus::Expired));
    assert_eq!(kv.get(LAST_ACTIVITY_KEY).unwrap(), None);
}

#[test]
fn tabs_started_apart_share_one_timeline() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let mut a = SessionManager::new(Arc::clone(&kv), Arc::new(SystemClock), policy());
    a.login(alice(), false).unwrap();

    std::thread::sleep(Duration::from_millis(20));
    let mut b = SessionManager::new(Arc::clone(&kv), Arc::new(SystemClock), policy());
    assert_eq!(b.resume(alice()).unwrap(), Some(SessionStatus::Active));

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(b.record_activity(SystemClock.now()).unwrap(), Transition::Reset);

    // A adopts B's activity: both tabs now count down from the same instant.
    assert_eq!(a.tick().unwrap(), Transition::Unchanged);
    assert!(a.next_deadline().is_some());
    assert_eq!(a.next_deadline(), b.next_deadline());
}
