//! Admission scheduler.
//!
//! Periodically discovers every queue with waiting users and promotes up to
//! `batch_size` of them per queue.
//!
//! # States
//!
//! - **Disabled**: every tick is a logged no-op
//! - **Active**: every tick runs one sweep (discover, then promote per queue)
//!
//! The state is fixed at construction from configuration.
//!
//! # Scheduling
//!
//! Sweeps run inline in the scheduler loop, so sweep N+1 never starts while
//! sweep N is running. Each sweep is bounded by a timeout equal to the tick
//! interval; an expired sweep is dropped and the next tick proceeds normally.
//! Dropping aborts in-flight atomic promotions, which either ran on the store
//! or did not. Two-step promotions run in their own task and complete anyway.
//!
//! # Graceful Shutdown
//!
//! `stop()` cancels the loop. A sweep already in progress completes (or times
//! out) before the task exits.

use crate::errors::WrError;
use crate::observability::metrics;
use crate::queue::{queue_name_from_wait_key, QueueManager, QueueStore, WAIT_KEY_SCAN_PATTERN};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default users promoted per queue per sweep.
pub const DEFAULT_BATCH_SIZE: i64 = 60;

/// Default delay before the first sweep.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Default sweep cadence.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Default `COUNT` hint for key scans.
pub const DEFAULT_SCAN_HINT: u64 = 60;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Active when true, Disabled otherwise.
    pub enabled: bool,
    /// Users promoted per queue per sweep.
    pub batch_size: i64,
    /// Delay before the first tick.
    pub initial_delay: Duration,
    /// Tick cadence; also the per-sweep timeout.
    pub interval: Duration,
    /// `COUNT` hint passed to the key scan.
    pub scan_hint: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: DEFAULT_BATCH_SIZE,
            initial_delay: DEFAULT_INITIAL_DELAY,
            interval: DEFAULT_INTERVAL,
            scan_hint: DEFAULT_SCAN_HINT,
        }
    }
}

/// Per-queue results of one sweep, sorted by queue name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Queues promoted successfully with the number of users moved.
    pub promoted: Vec<(String, u64)>,
    /// Queues whose promotion failed with the error message.
    pub failed: Vec<(String, String)>,
}

impl SweepReport {
    /// Total users moved across all queues.
    pub fn total_promoted(&self) -> u64 {
        self.promoted.iter().map(|(_, count)| count).sum()
    }

    /// Users moved for `queue` in this sweep, if it was promoted successfully.
    pub fn promoted_for(&self, queue: &str) -> Option<u64> {
        self.promoted
            .iter()
            .find(|(name, _)| name == queue)
            .map(|(_, count)| *count)
    }
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Scheduler is disabled; nothing was done.
    Disabled,
    /// Sweep finished; individual queues may still have failed.
    Completed(SweepReport),
    /// Queue discovery failed; no queue was promoted.
    DiscoveryFailed(String),
    /// Sweep exceeded the tick interval and was abandoned.
    TimedOut,
}

/// Discover the names of all queues that currently have a wait set.
///
/// Keys are deduplicated; keys that do not carry a queue name are skipped.
///
/// # Errors
///
/// Returns the store error (with context) if the scan fails.
pub async fn discover_queues(
    store: &dyn QueueStore,
    scan_hint: u64,
) -> Result<Vec<String>, WrError> {
    let keys = store
        .scan_keys(WAIT_KEY_SCAN_PATTERN, scan_hint)
        .await
        .map_err(|e| e.with_context("discover_queues"))?;

    let mut seen = HashSet::new();
    let mut queues = Vec::with_capacity(keys.len());
    for key in &keys {
        match queue_name_from_wait_key(key) {
            Some(queue) => {
                if seen.insert(queue) {
                    queues.push(queue.to_string());
                }
            }
            None => {
                debug!(target: "wr.scheduler", key = %key, "Skipping key without queue name");
            }
        }
    }

    Ok(queues)
}

/// Periodic promotion across all queues.
#[derive(Clone)]
pub struct AdmissionScheduler {
    manager: Arc<QueueManager>,
    config: SchedulerConfig,
    cancel_token: CancellationToken,
}

impl AdmissionScheduler {
    /// Create a scheduler. Pass a child of the service's shutdown token to tie
    /// the scheduler's lifetime to the process.
    pub fn new(
        manager: Arc<QueueManager>,
        config: SchedulerConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            manager,
            config,
            cancel_token,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Spawn the scheduler loop.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Stop the scheduler loop.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    #[instrument(skip_all, name = "wr.scheduler")]
    async fn run(&self) {
        info!(
            target: "wr.scheduler",
            enabled = self.config.enabled,
            batch_size = self.config.batch_size,
            initial_delay_ms = self.config.initial_delay.as_millis(),
            interval_ms = self.config.interval.as_millis(),
            "Starting admission scheduler"
        );

        tokio::select! {
            () = tokio::time::sleep(self.config.initial_delay) => {}
            () = self.cancel_token.cancelled() => {
                info!(target: "wr.scheduler", "Admission scheduler cancelled before first sweep");
                return;
            }
        }

        let mut interval = tokio::time::interval(self.config.interval.max(Duration::from_millis(1)));
        // A slow sweep pushes the schedule back instead of triggering a burst
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "wr.scheduler",
                        "Admission scheduler received shutdown signal, exiting"
                    );
                    break;
                }
            }
        }

        info!(target: "wr.scheduler", "Admission scheduler stopped");
    }

    /// Run a single tick.
    ///
    /// Separated from the loop to allow direct testing.
    pub async fn tick(&self) -> TickOutcome {
        if !self.config.enabled {
            debug!(target: "wr.scheduler", "Scheduler disabled, skipping sweep");
            metrics::record_sweep("disabled", Duration::ZERO);
            return TickOutcome::Disabled;
        }

        let start = Instant::now();
        match tokio::time::timeout(self.config.interval, self.sweep()).await {
            Ok(Ok(report)) => {
                metrics::record_sweep("success", start.elapsed());
                debug!(
                    target: "wr.scheduler",
                    queues = report.promoted.len() + report.failed.len(),
                    failed = report.failed.len(),
                    promoted = report.total_promoted(),
                    "Sweep completed"
                );
                TickOutcome::Completed(report)
            }
            Ok(Err(e)) => {
                metrics::record_sweep("error", start.elapsed());
                warn!(target: "wr.scheduler", error = %e, "Queue discovery failed, skipping sweep");
                TickOutcome::DiscoveryFailed(e.to_string())
            }
            Err(_) => {
                metrics::record_sweep("timeout", start.elapsed());
                warn!(
                    target: "wr.scheduler",
                    timeout_ms = self.config.interval.as_millis(),
                    "Sweep exceeded tick interval, abandoned"
                );
                TickOutcome::TimedOut
            }
        }
    }

    /// Discover every queue and promote each one concurrently.
    ///
    /// Per-queue failures are logged and collected; they never abort the sweep.
    ///
    /// # Errors
    ///
    /// Returns an error only when discovery itself fails.
    pub async fn sweep(&self) -> Result<SweepReport, WrError> {
        let queues = discover_queues(self.manager.store().as_ref(), self.config.scan_hint).await?;
        metrics::set_queues_discovered(queues.len());

        let mut tasks = JoinSet::new();
        let mut task_queues = HashMap::with_capacity(queues.len());
        for queue in queues {
            let manager = Arc::clone(&self.manager);
            let batch_size = self.config.batch_size;
            let task_queue = queue.clone();
            let handle = tasks.spawn(async move {
                let result = manager.promote(&task_queue, batch_size).await;
                (task_queue, result)
            });
            task_queues.insert(handle.id(), queue);
        }

        let mut report = SweepReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((queue, Ok(promoted))) => {
                    metrics::record_promoted("scheduler", promoted);
                    debug!(
                        target: "wr.scheduler",
                        queue = %queue,
                        requested = self.config.batch_size,
                        promoted = promoted,
                        "Queue swept"
                    );
                    report.promoted.push((queue, promoted));
                }
                Ok((queue, Err(e))) => {
                    metrics::record_queue_failure();
                    warn!(
                        target: "wr.scheduler",
                        queue = %queue,
                        error = %e,
                        "Promotion failed, continuing with remaining queues"
                    );
                    report.failed.push((queue, e.to_string()));
                }
                Err(e) => {
                    metrics::record_queue_failure();
                    let queue = task_queues.remove(&e.id()).unwrap_or_default();
                    error!(
                        target: "wr.scheduler",
                        queue = %queue,
                        error = %e,
                        "Promotion task failed"
                    );
                    report.failed.push((queue, e.to_string()));
                }
            }
        }

        report.promoted.sort();
        report.failed.sort();
        Ok(report)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_precision_loss
)]
mod tests {
    use super::*;
    use crate::queue::{proceed_key, wait_key, InMemoryQueueStore, QueueManagerConfig};
    use crate::token::{BoundedTokenCache, TokenIssuer};
    use async_trait::async_trait;

    fn scheduler_over(
        store: Arc<dyn QueueStore>,
        config: SchedulerConfig,
        manager_config: QueueManagerConfig,
    ) -> AdmissionScheduler {
        let tokens = TokenIssuer::new(Arc::new(BoundedTokenCache::new(16))).unwrap();
        let manager = QueueManager::new(store, Arc::new(tokens), manager_config);
        AdmissionScheduler::new(Arc::new(manager), config, CancellationToken::new())
    }

    fn scheduler(store: &InMemoryQueueStore, config: SchedulerConfig) -> AdmissionScheduler {
        scheduler_over(
            Arc::new(store.clone()),
            config,
            QueueManagerConfig::default(),
        )
    }

    /// Store whose atomic promotion panics for one queue.
    struct PanickingStore {
        inner: InMemoryQueueStore,
        poisoned_queue: &'static str,
    }

    #[async_trait]
    impl QueueStore for PanickingStore {
        async fn add_if_absent(&self, key: &str, member: &str, score: f64) -> Result<bool, WrError> {
            self.inner.add_if_absent(key, member, score).await
        }

        async fn rank(&self, key: &str, member: &str) -> Result<Option<u64>, WrError> {
            self.inner.rank(key, member).await
        }

        async fn pop_min(&self, key: &str, count: u64) -> Result<Vec<(String, f64)>, WrError> {
            self.inner.pop_min(key, count).await
        }

        async fn add_with_score(&self, key: &str, member: &str, score: f64) -> Result<(), WrError> {
            self.inner.add_with_score(key, member, score).await
        }

        async fn move_min(
            &self,
            source: &str,
            destination: &str,
            count: u64,
            score: f64,
        ) -> Result<Vec<String>, WrError> {
            if source == wait_key(self.poisoned_queue) {
                panic!("promotion blew up for {source}");
            }
            self.inner.move_min(source, destination, count, score).await
        }

        async fn scan_keys(&self, pattern: &str, hint: u64) -> Result<Vec<String>, WrError> {
            self.inner.scan_keys(pattern, hint).await
        }

        async fn ping(&self) -> Result<(), WrError> {
            self.inner.ping().await
        }
    }

    fn active(batch_size: i64) -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            batch_size,
            ..SchedulerConfig::default()
        }
    }

    async fn wait_for(store: &InMemoryQueueStore, queue: &str, users: std::ops::Range<i64>) {
        for (arrival, user) in users.enumerate() {
            store
                .add_if_absent(&wait_key(queue), &user.to_string(), arrival as f64)
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.batch_size, 60);
        assert_eq!(config.initial_delay, Duration::from_secs(5));
        assert_eq!(config.interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_discover_queues_extracts_names() {
        let store = InMemoryQueueStore::new();
        wait_for(&store, "default", 1..2).await;
        wait_for(&store, "vip", 1..2).await;
        store
            .add_with_score(&proceed_key("admitted-only"), "1", 0.0)
            .await
            .unwrap();

        let mut queues = discover_queues(&store, 60).await.unwrap();
        queues.sort();
        assert_eq!(queues, vec!["default".to_string(), "vip".to_string()]);
    }

    #[tokio::test]
    async fn test_discover_queues_keeps_colons_in_names() {
        let store = InMemoryQueueStore::new();
        wait_for(&store, "event:2024", 1..2).await;

        let queues = discover_queues(&store, 60).await.unwrap();
        assert_eq!(queues, vec!["event:2024".to_string()]);
    }

    #[tokio::test]
    async fn test_discover_queues_empty_store() {
        let store = InMemoryQueueStore::new();
        assert!(discover_queues(&store, 60).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discover_queues_failure_has_context() {
        let store = InMemoryQueueStore::new();
        store.set_unavailable(true);

        let err = discover_queues(&store, 60).await.unwrap_err();
        assert!(matches!(err, WrError::StoreUnavailable(ref msg) if msg.starts_with("discover_queues:")));
    }

    #[tokio::test]
    async fn test_disabled_tick_is_noop() {
        let store = InMemoryQueueStore::new();
        wait_for(&store, "default", 0..3).await;
        let scheduler = scheduler(&store, SchedulerConfig::default());

        assert_eq!(scheduler.tick().await, TickOutcome::Disabled);
        assert_eq!(store.len(&wait_key("default")), 3);
        assert!(store.is_empty(&proceed_key("default")));
    }

    #[tokio::test]
    async fn test_sweep_promotes_batch_per_queue() {
        let store = InMemoryQueueStore::new();
        wait_for(&store, "default", 0..100).await;
        wait_for(&store, "vip", 0..10).await;
        let scheduler = scheduler(&store, active(60));

        let report = scheduler.sweep().await.unwrap();

        assert_eq!(report.promoted_for("default"), Some(60));
        assert_eq!(report.promoted_for("vip"), Some(10));
        assert_eq!(report.total_promoted(), 70);
        assert!(report.failed.is_empty());
        assert_eq!(store.len(&wait_key("default")), 40);
        assert!(store.is_empty(&wait_key("vip")));
    }

    #[tokio::test]
    async fn test_sweep_admits_earliest_arrivals() {
        let store = InMemoryQueueStore::new();
        wait_for(&store, "default", 0..5).await;
        let scheduler = scheduler(&store, active(2));

        scheduler.sweep().await.unwrap();

        assert_eq!(
            store.members(&proceed_key("default")),
            vec!["0".to_string(), "1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failing_queue() {
        let store = InMemoryQueueStore::new();
        wait_for(&store, "broken", 0..3).await;
        wait_for(&store, "default", 0..3).await;
        store.fail_key(&proceed_key("broken"));
        let scheduler = scheduler(&store, active(60));

        let report = scheduler.sweep().await.unwrap();

        assert_eq!(report.promoted_for("default"), Some(3));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert_eq!(store.len(&wait_key("broken")), 3);
    }

    #[tokio::test]
    async fn test_tick_reports_discovery_failure() {
        let store = InMemoryQueueStore::new();
        store.set_unavailable(true);
        let scheduler = scheduler(&store, active(60));

        assert!(matches!(scheduler.tick().await, TickOutcome::DiscoveryFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_sweep_times_out_after_one_interval() {
        let store = InMemoryQueueStore::new();
        wait_for(&store, "default", 0..3).await;
        store.set_latency(Duration::from_secs(30));
        let scheduler = scheduler(&store, active(60));

        let start = tokio::time::Instant::now();
        assert_eq!(scheduler.tick().await, TickOutcome::TimedOut);
        let interval = scheduler.config().interval;
        assert!(start.elapsed() >= interval && start.elapsed() < interval * 2);

        store.set_latency(Duration::ZERO);
        match scheduler.tick().await {
            TickOutcome::Completed(report) => assert_eq!(report.promoted_for("default"), Some(3)),
            other => panic!("expected completed sweep, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_two_step_sweep_loses_no_users() {
        let store = InMemoryQueueStore::new();
        wait_for(&store, "default", 0..3).await;
        store.set_latency(Duration::from_millis(400));
        let scheduler = scheduler_over(
            Arc::new(store.clone()),
            active(60),
            QueueManagerConfig {
                atomic_promotion: false,
                ..QueueManagerConfig::default()
            },
        );

        // Discovery and pop fit in the interval; the inserts do not
        assert_eq!(scheduler.tick().await, TickOutcome::TimedOut);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.is_empty(&wait_key("default")));
        assert_eq!(store.members(&proceed_key("default")), vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_panicking_promotion_is_reported_as_failed() {
        let store = InMemoryQueueStore::new();
        wait_for(&store, "default", 0..2).await;
        wait_for(&store, "cursed", 0..2).await;
        let scheduler = scheduler_over(
            Arc::new(PanickingStore {
                inner: store.clone(),
                poisoned_queue: "cursed",
            }),
            active(60),
            QueueManagerConfig::default(),
        );

        let report = scheduler.sweep().await.unwrap();
        assert_eq!(report.promoted, vec![("default".to_string(), 2)]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "cursed");
        assert_eq!(store.len(&wait_key("cursed")), 2);
    }
}
