//! Ordered-set store contract consumed by the queue manager.
//!
//! # Key Patterns
//!
//! - `users:queue:{name}:wait` - Waiting users (ZSET scored by registration time)
//! - `users:queue:{name}:proceed` - Admitted users (ZSET scored by admission time)
//!
//! The key schema is shared with previously deployed instances and must not change.

use crate::errors::WrError;
use async_trait::async_trait;

/// Prefix shared by every queue key.
pub const QUEUE_KEY_PREFIX: &str = "users:queue:";

/// Suffix of wait-set keys.
pub const WAIT_KEY_SUFFIX: &str = ":wait";

/// Suffix of proceed-set keys.
pub const PROCEED_KEY_SUFFIX: &str = ":proceed";

/// SCAN pattern matching every wait set.
pub const WAIT_KEY_SCAN_PATTERN: &str = "users:queue:*:wait";

/// Wait-set key for a queue.
pub fn wait_key(queue: &str) -> String {
    format!("{QUEUE_KEY_PREFIX}{queue}{WAIT_KEY_SUFFIX}")
}

/// Proceed-set key for a queue.
pub fn proceed_key(queue: &str) -> String {
    format!("{QUEUE_KEY_PREFIX}{queue}{PROCEED_KEY_SUFFIX}")
}

/// Extract the queue name embedded in a wait-set key.
///
/// Returns `None` for keys outside the wait-set schema or with an empty name.
pub fn queue_name_from_wait_key(key: &str) -> Option<&str> {
    key.strip_prefix(QUEUE_KEY_PREFIX)
        .and_then(|rest| rest.strip_suffix(WAIT_KEY_SUFFIX))
        .filter(|name| !name.is_empty())
}

/// Sorted-set operations required by the admission engine.
///
/// Implementations carry no business logic. Members are user identifiers
/// rendered as decimal strings; scores are Unix timestamps in seconds.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert `member` unless it is already present (`ZADD NX`).
    ///
    /// Returns `true` if inserted. Never overwrites an existing score.
    async fn add_if_absent(&self, key: &str, member: &str, score: f64) -> Result<bool, WrError>;

    /// Zero-based position of `member` by ascending score, `None` if absent.
    async fn rank(&self, key: &str, member: &str) -> Result<Option<u64>, WrError>;

    /// Remove and return up to `count` lowest-scored members in ascending order.
    async fn pop_min(&self, key: &str, count: u64) -> Result<Vec<(String, f64)>, WrError>;

    /// Unconditional insert or score overwrite.
    async fn add_with_score(&self, key: &str, member: &str, score: f64) -> Result<(), WrError>;

    /// Pop up to `count` lowest-scored members of `source` and insert each into
    /// `destination` with `score`, as one atomic step.
    ///
    /// Returns the moved members in ascending order of their former score.
    async fn move_min(
        &self,
        source: &str,
        destination: &str,
        count: u64,
        score: f64,
    ) -> Result<Vec<String>, WrError>;

    /// Enumerate keys matching a glob `pattern` until the cursor is exhausted.
    ///
    /// `hint` is passed to the store as a batch-size hint, not a limit. Keys may
    /// repeat if the keyspace changes during the scan.
    async fn scan_keys(&self, pattern: &str, hint: u64) -> Result<Vec<String>, WrError>;

    /// Round-trip to the store without touching any key.
    async fn ping(&self) -> Result<(), WrError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        assert_eq!(wait_key("default"), "users:queue:default:wait");
        assert_eq!(proceed_key("default"), "users:queue:default:proceed");
        assert_eq!(wait_key("flight-42"), "users:queue:flight-42:wait");
    }

    #[test]
    fn test_queue_name_from_wait_key() {
        assert_eq!(
            queue_name_from_wait_key("users:queue:default:wait"),
            Some("default")
        );
        assert_eq!(
            queue_name_from_wait_key(&wait_key("concert")),
            Some("concert")
        );
    }

    #[test]
    fn test_queue_name_keeps_embedded_colons() {
        assert_eq!(
            queue_name_from_wait_key("users:queue:region:eu:wait"),
            Some("region:eu")
        );
    }

    #[test]
    fn test_queue_name_rejects_other_keys() {
        assert_eq!(queue_name_from_wait_key("users:queue:default:proceed"), None);
        assert_eq!(queue_name_from_wait_key("session:1:state"), None);
        assert_eq!(queue_name_from_wait_key("users:queue::wait"), None);
    }
}
