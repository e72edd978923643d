//! Tests for the admission scheduler loop.
//!
//! Uses tokio's paused clock to verify:
//! - Nothing is promoted before the initial delay or while disabled
//! - Each tick promotes one batch per discovered queue
//! - A failing queue does not stop the others
//! - A stuck sweep is abandoned and later ticks proceed
//! - An abandoned two-step sweep still admits every popped user
//! - `stop()` ends the task

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wr_service::queue::{
    proceed_key, wait_key, InMemoryQueueStore, QueueManager, QueueManagerConfig, QueueStore,
};
use wr_service::scheduler::{AdmissionScheduler, SchedulerConfig};
use wr_service::token::{BoundedTokenCache, TokenIssuer};

fn scheduler(store: &InMemoryQueueStore, config: SchedulerConfig) -> AdmissionScheduler {
    let tokens = TokenIssuer::new(Arc::new(BoundedTokenCache::new(16))).unwrap();
    let manager = QueueManager::new(
        Arc::new(store.clone()),
        Arc::new(tokens),
        QueueManagerConfig::default(),
    );
    AdmissionScheduler::new(Arc::new(manager), config, CancellationToken::new())
}

fn active(batch_size: i64) -> SchedulerConfig {
    SchedulerConfig {
        enabled: true,
        batch_size,
        initial_delay: Duration::from_secs(5),
        interval: Duration::from_secs(1),
        scan_hint: 60,
    }
}

async fn enqueue(store: &InMemoryQueueStore, queue: &str, users: &[i64]) {
    for (arrival, user) in users.iter().enumerate() {
        store
            .add_if_absent(&wait_key(queue), &user.to_string(), f64::from(arrival as u32))
            .await
            .unwrap();
    }
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_first_sweep_waits_for_initial_delay() {
    let store = InMemoryQueueStore::new();
    enqueue(&store, "default", &[100, 101, 102]).await;
    let scheduler = scheduler(&store, active(60));
    let handle = scheduler.start();

    sleep_ms(4_900).await;
    assert_eq!(store.len(&wait_key("default")), 3);
    assert!(store.is_empty(&proceed_key("default")));

    sleep_ms(500).await;
    assert!(store.is_empty(&wait_key("default")));
    assert_eq!(store.len(&proceed_key("default")), 3);

    scheduler.stop();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_each_tick_promotes_one_batch_per_queue() {
    let store = InMemoryQueueStore::new();
    enqueue(&store, "default", &[1, 2, 3, 4, 5]).await;
    enqueue(&store, "vip", &[10, 11, 12]).await;
    let scheduler = scheduler(&store, active(2));
    let handle = scheduler.start();

    // First sweep at 5s
    sleep_ms(5_500).await;
    assert_eq!(store.len(&proceed_key("default")), 2);
    assert_eq!(store.len(&proceed_key("vip")), 2);

    // Second sweep at 6s
    sleep_ms(1_000).await;
    assert_eq!(store.len(&proceed_key("default")), 4);
    assert_eq!(store.len(&proceed_key("vip")), 3);
    assert!(store.is_empty(&wait_key("vip")));

    // Earliest arrivals first
    assert_eq!(
        store.members(&proceed_key("default")),
        vec!["1", "2", "3", "4"]
    );

    scheduler.stop();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disabled_scheduler_never_promotes() {
    let store = InMemoryQueueStore::new();
    enqueue(&store, "default", &[100, 101]).await;
    let scheduler = scheduler(
        &store,
        SchedulerConfig {
            enabled: false,
            ..active(60)
        },
    );
    let handle = scheduler.start();

    sleep_ms(20_000).await;
    assert_eq!(store.len(&wait_key("default")), 2);
    assert!(store.is_empty(&proceed_key("default")));

    scheduler.stop();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failing_queue_does_not_block_others() {
    let store = InMemoryQueueStore::new();
    enqueue(&store, "broken", &[1, 2]).await;
    enqueue(&store, "default", &[100, 101]).await;
    store.fail_key(&proceed_key("broken"));
    let scheduler = scheduler(&store, active(60));
    let handle = scheduler.start();

    sleep_ms(6_500).await;
    assert_eq!(store.len(&proceed_key("default")), 2);
    assert_eq!(store.len(&wait_key("broken")), 2);
    assert!(!handle.is_finished(), "Loop must survive per-queue failures");

    scheduler.stop();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_does_not_end_loop() {
    let store = InMemoryQueueStore::new();
    enqueue(&store, "default", &[100]).await;
    store.set_unavailable(true);
    let scheduler = scheduler(&store, active(60));
    let handle = scheduler.start();

    sleep_ms(7_500).await;
    assert!(!handle.is_finished());

    store.set_unavailable(false);
    sleep_ms(1_000).await;
    assert_eq!(store.len(&proceed_key("default")), 1);

    scheduler.stop();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stuck_sweep_is_abandoned() {
    let store = InMemoryQueueStore::new();
    enqueue(&store, "default", &[100, 101]).await;
    store.set_latency(Duration::from_secs(60));
    let scheduler = scheduler(&store, active(60));
    let handle = scheduler.start();

    // First sweep starts at 5s and hangs in discovery
    sleep_ms(5_500).await;
    store.set_latency(Duration::ZERO);

    // Abandoned at 6s; a later tick runs against the healthy store
    sleep_ms(3_000).await;
    assert!(store.is_empty(&wait_key("default")));
    assert_eq!(store.len(&proceed_key("default")), 2);

    scheduler.stop();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_two_step_sweep_timeout_loses_no_users() {
    let store = InMemoryQueueStore::new();
    enqueue(&store, "default", &[100, 101, 102]).await;
    store.set_latency(Duration::from_millis(400));

    let tokens = TokenIssuer::new(Arc::new(BoundedTokenCache::new(16))).unwrap();
    let manager = QueueManager::new(
        Arc::new(store.clone()),
        Arc::new(tokens),
        QueueManagerConfig {
            atomic_promotion: false,
            ..QueueManagerConfig::default()
        },
    );
    let scheduler =
        AdmissionScheduler::new(Arc::new(manager), active(60), CancellationToken::new());
    let handle = scheduler.start();

    // First sweep at 5s pops at 5.8s and is abandoned at 6s mid-insert
    sleep_ms(9_000).await;

    let waiting = store.len(&wait_key("default"));
    let admitted = store.len(&proceed_key("default"));
    assert_eq!(waiting + admitted, 3, "Every popped user must reach proceed");
    assert_eq!(
        store.members(&proceed_key("default")),
        vec!["100", "101", "102"]
    );

    scheduler.stop();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_first_sweep() {
    let store = InMemoryQueueStore::new();
    enqueue(&store, "default", &[100]).await;
    let scheduler = scheduler(&store, active(60));
    let handle = scheduler.start();

    sleep_ms(1_000).await;
    scheduler.stop();
    handle.await.unwrap();

    sleep_ms(10_000).await;
    assert_eq!(store.len(&wait_key("default")), 1);
}

#[tokio::test(start_paused = true)]
async fn test_parent_token_cancels_scheduler() {
    let store = InMemoryQueueStore::new();
    let tokens = TokenIssuer::new(Arc::new(BoundedTokenCache::new(16))).unwrap();
    let manager = QueueManager::new(
        Arc::new(store.clone()),
        Arc::new(tokens),
        QueueManagerConfig::default(),
    );
    let parent = CancellationToken::new();
    let scheduler =
        AdmissionScheduler::new(Arc::new(manager), active(60), parent.child_token());
    let handle = scheduler.start();

    sleep_ms(6_000).await;
    parent.cancel();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("Scheduler should exit after parent cancellation")
        .unwrap();
}
