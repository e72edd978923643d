//! In-memory sorted-set store.
//!
//! Mirrors the subset of Redis ZSET semantics the admission engine relies on:
//! - Members are unique per key; ordering is ascending by score
//! - Equal scores keep insertion order
//! - A set whose last member is removed disappears from the keyspace
//!
//! Failure and latency injection make store outages reproducible in tests.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = InMemoryQueueStore::new();
//! store.add_if_absent("users:queue:default:wait", "100", 1.0).await?;
//! assert_eq!(store.rank("users:queue:default:wait", "100").await?, Some(0));
//! ```

use crate::errors::WrError;
use crate::queue::store::QueueStore;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Entry {
    member: String,
    score: f64,
}

#[derive(Debug, Default)]
struct Inner {
    sets: HashMap<String, Vec<Entry>>,
    unavailable: bool,
    failing_keys: HashSet<String>,
    failing_inserts: bool,
    latency: Duration,
}

impl Inner {
    fn check(&self, key: &str) -> Result<(), WrError> {
        if self.unavailable {
            return Err(WrError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        if self.failing_keys.contains(key) {
            return Err(WrError::StoreUnavailable(format!(
                "injected failure for key {key}"
            )));
        }
        Ok(())
    }

    fn insert(&mut self, key: &str, member: &str, score: f64) {
        let entries = self.sets.entry(key.to_string()).or_default();
        entries.retain(|e| e.member != member);
        let position = entries.partition_point(|e| e.score <= score);
        entries.insert(
            position,
            Entry {
                member: member.to_string(),
                score,
            },
        );
    }

    fn pop(&mut self, key: &str, count: u64) -> Vec<Entry> {
        let Some(entries) = self.sets.get_mut(key) else {
            return Vec::new();
        };
        let take = usize::try_from(count)
            .unwrap_or(usize::MAX)
            .min(entries.len());
        let popped: Vec<Entry> = entries.drain(..take).collect();
        if entries.is_empty() {
            self.sets.remove(key);
        }
        popped
    }
}

/// Process-local `QueueStore`.
///
/// Cheaply cloneable; clones share the same keyspace.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryQueueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every subsequent call with `StoreUnavailable` while `unavailable` is set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Fail every call that touches `key`.
    pub fn fail_key(&self, key: &str) {
        self.lock().failing_keys.insert(key.to_string());
    }

    /// Fail `add_with_score` only, leaving pops working.
    ///
    /// Reproduces a store failure between the two steps of a non-atomic promotion.
    pub fn set_failing_inserts(&self, failing: bool) {
        self.lock().failing_inserts = failing;
    }

    /// Delay every call by `latency` before it touches the keyspace.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Members of `key` in ascending score order.
    pub fn members(&self, key: &str) -> Vec<String> {
        self.lock()
            .sets
            .get(key)
            .map(|entries| entries.iter().map(|e| e.member.clone()).collect())
            .unwrap_or_default()
    }

    /// Score of `member` in `key`.
    pub fn score(&self, key: &str, member: &str) -> Option<f64> {
        self.lock()
            .sets
            .get(key)
            .and_then(|entries| entries.iter().find(|e| e.member == member))
            .map(|e| e.score)
    }

    /// Number of members in `key`.
    pub fn len(&self, key: &str) -> usize {
        self.lock().sets.get(key).map_or(0, Vec::len)
    }

    /// True if `key` has no members.
    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn add_if_absent(&self, key: &str, member: &str, score: f64) -> Result<bool, WrError> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        inner.check(key)?;

        let exists = inner
            .sets
            .get(key)
            .is_some_and(|entries| entries.iter().any(|e| e.member == member));
        if exists {
            return Ok(false);
        }
        inner.insert(key, member, score);
        Ok(true)
    }

    async fn rank(&self, key: &str, member: &str) -> Result<Option<u64>, WrError> {
        self.simulate_latency().await;
        let inner = self.lock();
        inner.check(key)?;

        Ok(inner
            .sets
            .get(key)
            .and_then(|entries| entries.iter().position(|e| e.member == member))
            .map(|position| position as u64))
    }

    async fn pop_min(&self, key: &str, count: u64) -> Result<Vec<(String, f64)>, WrError> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        inner.check(key)?;

        Ok(inner
            .pop(key, count)
            .into_iter()
            .map(|e| (e.member, e.score))
            .collect())
    }

    async fn add_with_score(&self, key: &str, member: &str, score: f64) -> Result<(), WrError> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        inner.check(key)?;
        if inner.failing_inserts {
            return Err(WrError::StoreUnavailable(format!(
                "injected insert failure for key {key}"
            )));
        }

        inner.insert(key, member, score);
        Ok(())
    }

    async fn move_min(
        &self,
        source: &str,
        destination: &str,
        count: u64,
        score: f64,
    ) -> Result<Vec<String>, WrError> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        inner.check(source)?;
        inner.check(destination)?;
        if inner.failing_inserts {
            // The whole move is rejected, nothing is popped
            return Err(WrError::StoreUnavailable(format!(
                "injected insert failure for key {destination}"
            )));
        }

        let popped = inner.pop(source, count);
        for entry in &popped {
            inner.insert(destination, &entry.member, score);
        }
        Ok(popped.into_iter().map(|e| e.member).collect())
    }

    async fn scan_keys(&self, pattern: &str, _hint: u64) -> Result<Vec<String>, WrError> {
        self.simulate_latency().await;
        let inner = self.lock();
        if inner.unavailable {
            return Err(WrError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }

        let mut keys: Vec<String> = inner
            .sets
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), WrError> {
        self.simulate_latency().await;
        if self.lock().unavailable {
            return Err(WrError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

/// Redis-style glob matching supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    // Position of the last `*` seen and the text index it is currently absorbing up to
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(c) if *c == '?' || text.get(t) == Some(c) => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, absorbed)) => {
                    p = star + 1;
                    t = absorbed + 1;
                    backtrack = Some((star, absorbed + 1));
                }
                None => return false,
            },
        }
    }

    pattern
        .get(p..)
        .is_some_and(|rest| rest.iter().all(|c| *c == '*'))
}
