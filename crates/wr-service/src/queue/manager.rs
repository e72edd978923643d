//! Queue state machine.
//!
//! A queue is the pair of sorted sets sharing its name:
//!
//! ```text
//! register ──► users:queue:{q}:wait ──promote──► users:queue:{q}:proceed
//!              (score = arrival ts)              (score = admission ts)
//! ```
//!
//! # Promotion Atomicity
//!
//! Promotion either runs as one store-side script (`move_min`, default) or as
//! the two-step pop-then-insert sequence. In two-step mode a store failure after
//! the pop loses the popped users; the loss is logged with the member count.
//!
//! The two-step sequence runs in its own task. Dropping the `promote` future
//! (a sweep timeout, a client disconnect) never separates the pop from the
//! inserts: the task finishes and logs on its own.

use crate::errors::WrError;
use crate::queue::store::{proceed_key, wait_key, QueueStore};
use crate::observability::metrics;
use crate::token::TokenIssuer;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Default timeout for a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Rank reported for users absent from the wait set.
pub const NOT_WAITING: i64 = -1;

/// Queue manager settings.
#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    /// Upper bound on every store round-trip.
    pub store_timeout: Duration,
    /// Promote through the atomic store-side move instead of pop-then-insert.
    pub atomic_promotion: bool,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            atomic_promotion: true,
        }
    }
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// User joined the wait set.
    ///
    /// `rank` is 1-based, or [`NOT_WAITING`] when a concurrent promotion
    /// admitted the user between the insert and the rank lookup.
    Registered { rank: i64 },
    /// User was already waiting; nothing changed.
    AlreadyRegistered,
}

impl Registration {
    /// Rank of a fresh registration, or `WrError::AlreadyRegistered`.
    pub fn into_rank(self, queue: &str, user_id: i64) -> Result<i64, WrError> {
        match self {
            Registration::Registered { rank } => Ok(rank),
            Registration::AlreadyRegistered => Err(WrError::AlreadyRegistered {
                queue: queue.to_string(),
                user_id,
            }),
        }
    }
}

/// Admission-control operations over an ordered-set store.
///
/// Cheap to share behind an `Arc`; holds no per-queue state of its own.
pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    tokens: Arc<TokenIssuer>,
    config: QueueManagerConfig,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn QueueStore>,
        tokens: Arc<TokenIssuer>,
        config: QueueManagerConfig,
    ) -> Self {
        Self {
            store,
            tokens,
            config,
        }
    }

    /// Backing store (shared with queue discovery).
    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }

    /// Token issuer used by [`QueueManager::verify_token`].
    pub fn tokens(&self) -> Arc<TokenIssuer> {
        Arc::clone(&self.tokens)
    }

    /// Add `user_id` to the queue's wait set.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for an empty queue name and store errors
    /// (with operation context) when the store fails or times out.
    #[instrument(skip_all, fields(queue = %queue, user_id = user_id))]
    pub async fn register(&self, queue: &str, user_id: i64) -> Result<Registration, WrError> {
        validate_queue(queue)?;
        let key = wait_key(queue);
        let member = user_id.to_string();

        let inserted = self
            .call("add_if_absent", self.store.add_if_absent(&key, &member, now_score()))
            .await
            .map_err(|e| {
                metrics::record_registration("error");
                e.with_context("register")
            })?;

        if !inserted {
            metrics::record_registration("already_registered");
            debug!(
                target: "wr.queue.manager",
                queue = %queue,
                user_id = user_id,
                "User already waiting"
            );
            return Ok(Registration::AlreadyRegistered);
        }

        let position = self
            .call("rank", self.store.rank(&key, &member))
            .await
            .map_err(|e| {
                metrics::record_registration("error");
                e.with_context("register")
            })?;
        let rank = external_rank(position);

        metrics::record_registration("registered");
        debug!(
            target: "wr.queue.manager",
            queue = %queue,
            user_id = user_id,
            rank = rank,
            "Registered user in wait queue"
        );

        Ok(Registration::Registered { rank })
    }

    /// Move up to `count` earliest arrivals from wait to proceed.
    ///
    /// Returns the number actually moved. `count <= 0` is a no-op returning 0.
    #[instrument(skip_all, fields(queue = %queue, count = count))]
    pub async fn promote(&self, queue: &str, count: i64) -> Result<u64, WrError> {
        validate_queue(queue)?;
        let Ok(count) = u64::try_from(count) else {
            return Ok(0);
        };
        if count == 0 {
            return Ok(0);
        }

        let promoted = if self.config.atomic_promotion {
            self.promote_atomic(queue, count).await?
        } else {
            self.promote_two_step(queue, count).await?
        };

        if promoted > 0 {
            info!(
                target: "wr.queue.manager",
                queue = %queue,
                requested = count,
                promoted = promoted,
                "Promoted users to proceed"
            );
        }
        Ok(promoted)
    }

    async fn promote_atomic(&self, queue: &str, count: u64) -> Result<u64, WrError> {
        let moved = self
            .call(
                "move_min",
                self.store
                    .move_min(&wait_key(queue), &proceed_key(queue), count, now_score()),
            )
            .await
            .map_err(|e| e.with_context("promote"))?;
        Ok(moved.len() as u64)
    }

    async fn promote_two_step(&self, queue: &str, count: u64) -> Result<u64, WrError> {
        let store = Arc::clone(&self.store);
        let store_timeout = self.config.store_timeout;
        let owned_queue = queue.to_string();

        let task = tokio::spawn(
            async move { pop_then_insert(store.as_ref(), store_timeout, &owned_queue, count).await }
                .in_current_span(),
        );

        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    target: "wr.queue.manager",
                    queue = %queue,
                    error = %e,
                    "Two-step promotion task failed"
                );
                Err(WrError::StoreUnavailable(format!(
                    "promote: two-step task failed: {e}"
                )))
            }
        }
    }

    /// True iff `user_id` is in the queue's proceed set.
    #[instrument(skip_all, fields(queue = %queue, user_id = user_id))]
    pub async fn is_admitted(&self, queue: &str, user_id: i64) -> Result<bool, WrError> {
        validate_queue(queue)?;
        let position = self
            .call(
                "rank",
                self.store.rank(&proceed_key(queue), &user_id.to_string()),
            )
            .await
            .map_err(|e| e.with_context("is_admitted"))?;
        Ok(position.is_some())
    }

    /// 1-based position in the wait set, or [`NOT_WAITING`].
    #[instrument(skip_all, fields(queue = %queue, user_id = user_id))]
    pub async fn rank(&self, queue: &str, user_id: i64) -> Result<i64, WrError> {
        validate_queue(queue)?;
        let position = self
            .call("rank", self.store.rank(&wait_key(queue), &user_id.to_string()))
            .await
            .map_err(|e| e.with_context("rank"))?;
        Ok(external_rank(position))
    }

    /// Check that the store answers within the store timeout.
    pub async fn ping(&self) -> Result<(), WrError> {
        self.call("ping", self.store.ping()).await
    }

    /// True iff `presented` equals the canonical admission token.
    pub fn verify_token(&self, queue: &str, user_id: i64, flight_id: i64, presented: &str) -> bool {
        self.tokens.verify(queue, user_id, flight_id, presented)
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, WrError>
    where
        F: Future<Output = Result<T, WrError>>,
    {
        timed_call(self.config.store_timeout, operation, fut).await
    }
}

/// Run one store call under `store_timeout`, recording latency and failures.
async fn timed_call<T, F>(
    store_timeout: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, WrError>
where
    F: Future<Output = Result<T, WrError>>,
{
    let start = Instant::now();
    let result = match tokio::time::timeout(store_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(WrError::StoreTimeout(format!(
            "{operation} exceeded {}ms",
            store_timeout.as_millis()
        ))),
    };
    metrics::record_store_latency(operation, start.elapsed());

    if let Err(e) = &result {
        let kind = match e {
            WrError::StoreTimeout(_) => "timeout",
            _ => "unavailable",
        };
        metrics::record_store_error(operation, kind);
        warn!(
            target: "wr.queue.manager",
            operation = operation,
            error = %e,
            "Store call failed"
        );
    }
    result
}

/// Pop up to `count` waiting users, then insert each into the proceed set.
async fn pop_then_insert(
    store: &dyn QueueStore,
    store_timeout: Duration,
    queue: &str,
    count: u64,
) -> Result<u64, WrError> {
    let popped = timed_call(store_timeout, "pop_min", store.pop_min(&wait_key(queue), count))
        .await
        .map_err(|e| e.with_context("promote"))?;

    let proceed = proceed_key(queue);
    let admitted_at = now_score();
    let mut promoted = 0u64;

    for (member, _) in &popped {
        if let Err(e) = timed_call(
            store_timeout,
            "add_with_score",
            store.add_with_score(&proceed, member, admitted_at),
        )
        .await
        {
            let lost = popped.len() as u64 - promoted;
            error!(
                target: "wr.queue.manager",
                queue = %queue,
                promoted = promoted,
                lost_members = lost,
                error = %e,
                "Promotion interrupted after pop; remaining popped users were not admitted"
            );
            return Err(e.with_context("promote"));
        }
        promoted += 1;
    }

    Ok(promoted)
}

fn validate_queue(queue: &str) -> Result<(), WrError> {
    if queue.is_empty() {
        return Err(WrError::BadRequest("queue name must not be empty".to_string()));
    }
    Ok(())
}

/// Zero-based store position to external 1-based rank.
fn external_rank(position: Option<u64>) -> i64 {
    position
        .and_then(|p| i64::try_from(p).ok())
        .map_or(NOT_WAITING, |p| p.saturating_add(1))
}

/// Current Unix time in seconds as a sorted-set score.
fn now_score() -> f64 {
    // Second-resolution timestamps are exactly representable in f64
    #[allow(clippy::cast_precision_loss)]
    let score = chrono::Utc::now().timestamp() as f64;
    score
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueueStore;
    use crate::token::BoundedTokenCache;

    fn manager_with(store: &InMemoryQueueStore, config: QueueManagerConfig) -> QueueManager {
        let tokens = TokenIssuer::new(Arc::new(BoundedTokenCache::new(64))).unwrap();
        QueueManager::new(Arc::new(store.clone()), Arc::new(tokens), config)
    }

    fn manager(store: &InMemoryQueueStore) -> QueueManager {
        manager_with(store, QueueManagerConfig::default())
    }

    fn two_step() -> QueueManagerConfig {
        QueueManagerConfig {
            atomic_promotion: false,
            ..QueueManagerConfig::default()
        }
    }

    async fn register_all(manager: &QueueManager, queue: &str, users: &[i64]) -> Vec<i64> {
        let mut ranks = Vec::new();
        for user in users {
            let registration = manager.register(queue, *user).await.unwrap();
            ranks.push(registration.into_rank(queue, *user).unwrap());
        }
        ranks
    }

    #[tokio::test]
    async fn test_register_returns_arrival_ranks() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);

        let ranks = register_all(&manager, "default", &[100, 101, 102]).await;
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_arrival_order_beats_user_id_order() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);

        register_all(&manager, "default", &[500, 7]).await;
        assert!(manager.rank("default", 500).await.unwrap() < manager.rank("default", 7).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);

        register_all(&manager, "default", &[100]).await;
        let second = manager.register("default", 100).await.unwrap();

        assert_eq!(second, Registration::AlreadyRegistered);
        assert!(matches!(
            second.into_rank("default", 100),
            Err(WrError::AlreadyRegistered { user_id: 100, .. })
        ));
        // First registration is unaffected
        assert_eq!(manager.rank("default", 100).await.unwrap(), 1);
        assert_eq!(store.len(&wait_key("default")), 1);
    }

    #[tokio::test]
    async fn test_same_user_may_wait_in_different_queues() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);

        register_all(&manager, "a", &[100]).await;
        register_all(&manager, "b", &[100]).await;
        assert_eq!(manager.rank("a", 100).await.unwrap(), 1);
        assert_eq!(manager.rank("b", 100).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_registration_has_single_winner() {
        let store = InMemoryQueueStore::new();
        let manager = Arc::new(manager(&store));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.register("default", 42).await.unwrap() })
            })
            .collect();

        let mut registered = 0;
        for handle in handles {
            if let Registration::Registered { rank } = handle.await.unwrap() {
                assert_eq!(rank, 1);
                registered += 1;
            }
        }
        assert_eq!(registered, 1);
        assert_eq!(store.len(&wait_key("default")), 1);
    }

    #[tokio::test]
    async fn test_promote_end_to_end_scenario() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);
        register_all(&manager, "default", &[100, 101, 102]).await;

        assert_eq!(manager.promote("default", 2).await.unwrap(), 2);

        assert!(manager.is_admitted("default", 100).await.unwrap());
        assert!(manager.is_admitted("default", 101).await.unwrap());
        assert!(!manager.is_admitted("default", 102).await.unwrap());
        assert_eq!(manager.rank("default", 102).await.unwrap(), 1);
        assert_eq!(manager.rank("default", 100).await.unwrap(), NOT_WAITING);
    }

    #[tokio::test]
    async fn test_promote_two_step_scenario() {
        let store = InMemoryQueueStore::new();
        let manager = manager_with(&store, two_step());
        register_all(&manager, "default", &[100, 101, 102]).await;

        assert_eq!(manager.promote("default", 2).await.unwrap(), 2);
        assert_eq!(
            store.members(&proceed_key("default")),
            vec!["100".to_string(), "101".to_string()]
        );
        assert_eq!(store.members(&wait_key("default")), vec!["102".to_string()]);
    }

    #[tokio::test]
    async fn test_promote_zero_or_negative_is_noop() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);
        register_all(&manager, "default", &[100, 101]).await;

        assert_eq!(manager.promote("default", 0).await.unwrap(), 0);
        assert_eq!(manager.promote("default", -5).await.unwrap(), 0);

        assert_eq!(store.len(&wait_key("default")), 2);
        assert!(store.is_empty(&proceed_key("default")));
    }

    #[tokio::test]
    async fn test_promote_more_than_waiting_empties_queue() {
        for config in [QueueManagerConfig::default(), two_step()] {
            let store = InMemoryQueueStore::new();
            let manager = manager_with(&store, config);
            register_all(&manager, "default", &[100, 101, 102]).await;

            assert_eq!(manager.promote("default", 5).await.unwrap(), 3);
            assert!(store.is_empty(&wait_key("default")));
            assert_eq!(store.len(&proceed_key("default")), 3);
        }
    }

    #[tokio::test]
    async fn test_promote_empty_queue_returns_zero() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);

        assert_eq!(manager.promote("default", 5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_promote_admits_exactly_earliest_arrivals() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);
        let users: Vec<i64> = (1..=10).rev().collect();
        register_all(&manager, "default", &users).await;

        manager.promote("default", 4).await.unwrap();

        for (position, user) in users.iter().enumerate() {
            assert_eq!(
                manager.is_admitted("default", *user).await.unwrap(),
                position < 4,
                "user {user} at arrival position {position}"
            );
        }
    }

    #[tokio::test]
    async fn test_register_after_full_promotion_starts_at_rank_one() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);
        register_all(&manager, "default", &[100, 101, 102]).await;
        manager.promote("default", 3).await.unwrap();

        let ranks = register_all(&manager, "default", &[200]).await;
        assert_eq!(ranks, vec![1]);
    }

    #[tokio::test]
    async fn test_unknown_queue_behaves_as_empty() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);

        assert_eq!(manager.rank("never-used", 100).await.unwrap(), NOT_WAITING);
        assert!(!manager.is_admitted("never-used", 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_queue_name_rejected() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);

        assert!(matches!(
            manager.register("", 1).await,
            Err(WrError::BadRequest(_))
        ));
        assert!(matches!(manager.rank("", 1).await, Err(WrError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_store_errors_carry_operation_context() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);
        store.set_unavailable(true);

        let err = manager.register("default", 1).await.unwrap_err();
        assert!(matches!(err, WrError::StoreUnavailable(ref msg) if msg.starts_with("register:")));

        let err = manager.promote("default", 1).await.unwrap_err();
        assert!(matches!(err, WrError::StoreUnavailable(ref msg) if msg.starts_with("promote:")));
    }

    #[tokio::test]
    async fn test_two_step_insert_failure_loses_popped_users() {
        let store = InMemoryQueueStore::new();
        let manager = manager_with(&store, two_step());
        register_all(&manager, "default", &[100, 101]).await;

        store.set_failing_inserts(true);
        assert!(manager.promote("default", 2).await.is_err());

        // Popped from wait, never added to proceed
        assert!(store.is_empty(&wait_key("default")));
        assert!(store.is_empty(&proceed_key("default")));
    }

    #[tokio::test]
    async fn test_atomic_insert_failure_keeps_users_waiting() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);
        register_all(&manager, "default", &[100, 101]).await;

        store.set_failing_inserts(true);
        assert!(manager.promote("default", 2).await.is_err());

        assert_eq!(store.len(&wait_key("default")), 2);
        assert_eq!(manager.rank("default", 100).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_surfaces_timeout() {
        let store = InMemoryQueueStore::new();
        let manager = manager_with(
            &store,
            QueueManagerConfig {
                store_timeout: Duration::from_millis(100),
                ..QueueManagerConfig::default()
            },
        );
        store.set_latency(Duration::from_secs(5));

        let err = manager.rank("default", 1).await.unwrap_err();
        assert!(matches!(err, WrError::StoreTimeout(ref msg) if msg.starts_with("rank:")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_two_step_promotion_still_admits_popped_users() {
        let store = InMemoryQueueStore::new();
        let manager = manager_with(&store, two_step());
        register_all(&manager, "default", &[100, 101, 102]).await;
        store.set_latency(Duration::from_millis(400));

        // Caller gives up after the pop, while inserts are still in flight
        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), manager.promote("default", 3)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.is_empty(&wait_key("default")));
        assert_eq!(
            store.members(&proceed_key("default")),
            vec!["100", "101", "102"]
        );
    }

    #[tokio::test]
    async fn test_verify_token() {
        let store = InMemoryQueueStore::new();
        let manager = manager(&store);

        let token = crate::token::compute_token(&crate::token::TokenKey::new("default", 100, 1));
        assert!(manager.verify_token("default", 100, 1, &token));
        assert!(!manager.verify_token("default", 100, 1, ""));
        assert!(!manager.verify_token("default", 101, 1, &token));
    }
}
