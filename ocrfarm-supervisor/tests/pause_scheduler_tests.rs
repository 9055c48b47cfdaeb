//! Tests for automatic resume of expired pauses

mod common;

use chrono::Duration as ChronoDuration;
use common::{MockSupervisor, profile};
use ocrfarm_core::clock::{Clock, ManualClock};
use ocrfarm_core::state::{InMemoryRuntimeStateStore, RuntimeStateStore, SqliteRuntimeStateStore};
use ocrfarm_supervisor::PauseScheduler;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn scheduler(
    store: Arc<dyn RuntimeStateStore>,
    supervisor: &Arc<MockSupervisor>,
    clock: &ManualClock,
) -> PauseScheduler {
    PauseScheduler::new(
        store,
        supervisor.clone(),
        Arc::new(clock.clone()),
        Duration::from_secs(30),
    )
}

#[tokio::test]
async fn test_expired_pause_resumes_exactly_once() {
    let store = Arc::new(InMemoryRuntimeStateStore::new());
    let supervisor = Arc::new(MockSupervisor::new());
    let clock = ManualClock::default();
    let now = clock.now();

    let alice = profile("alice");
    let bob = profile("bob");
    let carol = profile("carol");
    store
        .set_pause(&alice, Some(now - ChronoDuration::minutes(1)), Some("rate limit"), now)
        .await
        .expect("Failed to pause alice");
    store
        .set_pause(&bob, Some(now + ChronoDuration::minutes(5)), Some("rate limit"), now)
        .await
        .expect("Failed to pause bob");
    store
        .set_pause(&carol, None, Some("manual"), now)
        .await
        .expect("Failed to pause carol");

    let scheduler = scheduler(store.clone(), &supervisor, &clock);

    assert_eq!(scheduler.resume_expired().await, vec![alice.clone()]);
    assert_eq!(supervisor.starts(), vec![alice.clone()]);

    let row = store.get(&alice).await.unwrap().expect("row exists");
    assert!(!row.is_paused);
    assert!(row.pause_until.is_none());
    assert!(row.pause_reason.is_none());

    // Nothing left to do for alice; bob and carol stay paused
    assert!(scheduler.resume_expired().await.is_empty());
    assert_eq!(supervisor.start_count(&alice), 1);
    assert!(store.get(&bob).await.unwrap().unwrap().is_paused);
    assert!(store.get(&carol).await.unwrap().unwrap().is_paused);

    clock.advance(Duration::from_secs(5 * 60));
    assert_eq!(scheduler.resume_expired().await, vec![bob.clone()]);
    assert_eq!(supervisor.start_count(&bob), 1);
}

#[tokio::test]
async fn test_failed_restart_still_resolves_pause() {
    let store = Arc::new(InMemoryRuntimeStateStore::new());
    let supervisor = Arc::new(MockSupervisor::new());
    let clock = ManualClock::default();
    let now = clock.now();
    let alice = profile("alice");
    supervisor.fail(&alice);

    store
        .set_pause(&alice, Some(now), Some("rate limit"), now)
        .await
        .expect("Failed to pause alice");

    let scheduler = scheduler(store.clone(), &supervisor, &clock);
    assert_eq!(scheduler.resume_expired().await, vec![alice.clone()]);
    assert!(!store.get(&alice).await.unwrap().unwrap().is_paused);
    assert!(scheduler.resume_expired().await.is_empty());
    assert_eq!(supervisor.start_count(&alice), 1);
}

#[tokio::test]
async fn test_racing_schedulers_have_one_winner() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = dir.path().join("runtime.db");
    let clock = ManualClock::default();
    let now = clock.now();
    let alice = profile("alice");

    let first: Arc<dyn RuntimeStateStore> =
        Arc::new(SqliteRuntimeStateStore::open(&db).expect("Failed to open store"));
    let second: Arc<dyn RuntimeStateStore> =
        Arc::new(SqliteRuntimeStateStore::open(&db).expect("Failed to open store"));
    first
        .set_pause(&alice, Some(now - ChronoDuration::seconds(1)), Some("rate limit"), now)
        .await
        .expect("Failed to pause alice");

    let supervisor = Arc::new(MockSupervisor::new());
    let a = scheduler(first, &supervisor, &clock);
    let b = scheduler(second, &supervisor, &clock);

    let (resumed_a, resumed_b) = tokio::join!(a.resume_expired(), b.resume_expired());

    assert_eq!(resumed_a.len() + resumed_b.len(), 1);
    assert_eq!(supervisor.start_count(&alice), 1);
}

#[tokio::test]
async fn test_run_loop_resumes_and_stops() {
    let store = Arc::new(InMemoryRuntimeStateStore::new());
    let supervisor = Arc::new(MockSupervisor::new());
    let clock = ManualClock::default();
    let now = clock.now();
    let alice = profile("alice");
    store
        .set_pause(&alice, Some(now - ChronoDuration::seconds(1)), None, now)
        .await
        .expect("Failed to pause alice");

    let scheduler = scheduler(store, &supervisor, &clock);
    let token = tokio_util::sync::CancellationToken::new();
    let run = scheduler.run(token.clone());
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => panic!("scheduler exited before cancellation"),
        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
    }
    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("scheduler did not stop");

    assert_eq!(supervisor.start_count(&alice), 1);
}
