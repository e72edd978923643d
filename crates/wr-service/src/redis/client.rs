//! Redis implementation of [`QueueStore`].
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every call clones it instead of locking a shared handle.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = RedisQueueStore::new("redis://localhost:6379", Duration::from_secs(2)).await?;
//! store.add_if_absent("users:queue:default:wait", "100", 1_700_000_000.0).await?;
//! ```

use crate::errors::WrError;
use crate::queue::QueueStore;
use crate::redis::lua_scripts;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Sorted-set store backed by Redis.
#[derive(Clone)]
pub struct RedisQueueStore {
    connection: MultiplexedConnection,
    promote_script: Script,
}

impl RedisQueueStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the URL is invalid or the connection fails,
    /// `StoreTimeout` if connecting takes longer than `connect_timeout`.
    pub async fn new(redis_url: &str, connect_timeout: Duration) -> Result<Self, WrError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url, it may carry credentials
            error!(
                target: "wr.redis.store",
                error = %e,
                "Failed to open Redis client"
            );
            WrError::StoreUnavailable(format!("Failed to open Redis client: {e}"))
        })?;

        let connection =
            tokio::time::timeout(connect_timeout, client.get_multiplexed_async_connection())
                .await
                .map_err(|_| {
                    error!(
                        target: "wr.redis.store",
                        timeout_ms = connect_timeout.as_millis(),
                        "Timed out connecting to Redis"
                    );
                    WrError::StoreTimeout("Timed out connecting to Redis".to_string())
                })?
                .map_err(|e| {
                    error!(
                        target: "wr.redis.store",
                        error = %e,
                        "Failed to connect to Redis"
                    );
                    WrError::StoreUnavailable(format!("Failed to connect to Redis: {e}"))
                })?;

        Ok(Self {
            connection,
            promote_script: Script::new(lua_scripts::PROMOTE),
        })
    }
}

fn store_error(operation: &str, e: &redis::RedisError) -> WrError {
    warn!(
        target: "wr.redis.store",
        operation = operation,
        error = %e,
        "Redis command failed"
    );
    WrError::StoreUnavailable(format!("Redis {operation} failed: {e}"))
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    #[instrument(skip_all, fields(key = %key))]
    async fn add_if_absent(&self, key: &str, member: &str, score: f64) -> Result<bool, WrError> {
        let mut conn = self.connection.clone();
        let added: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg("NX")
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("zadd_nx", &e))?;
        Ok(added == 1)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn rank(&self, key: &str, member: &str) -> Result<Option<u64>, WrError> {
        let mut conn = self.connection.clone();
        let rank: Option<u64> = conn
            .zrank(key, member)
            .await
            .map_err(|e| store_error("zrank", &e))?;
        Ok(rank)
    }

    #[instrument(skip_all, fields(key = %key, count = count))]
    async fn pop_min(&self, key: &str, count: u64) -> Result<Vec<(String, f64)>, WrError> {
        let mut conn = self.connection.clone();
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(key)
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("zpopmin", &e))?;
        Ok(popped)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn add_with_score(&self, key: &str, member: &str, score: f64) -> Result<(), WrError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .zadd(key, member, score)
            .await
            .map_err(|e| store_error("zadd", &e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(source = %source, count = count))]
    async fn move_min(
        &self,
        source: &str,
        destination: &str,
        count: u64,
        score: f64,
    ) -> Result<Vec<String>, WrError> {
        let mut conn = self.connection.clone();
        let moved: Vec<String> = self
            .promote_script
            .key(source)
            .key(destination)
            .arg(count)
            .arg(score)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("promote_script", &e))?;

        debug!(
            target: "wr.redis.store",
            source = %source,
            moved = moved.len(),
            "Promotion script completed"
        );
        Ok(moved)
    }

    #[instrument(skip_all, fields(pattern = %pattern))]
    async fn scan_keys(&self, pattern: &str, hint: u64) -> Result<Vec<String>, WrError> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut seen = HashSet::new();
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(hint)
                .query_async(&mut conn)
                .await
                .map_err(|e| store_error("scan", &e))?;

            // SCAN may return a key more than once while the keyspace changes
            for key in batch {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn ping(&self) -> Result<(), WrError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("ping", &e))?;
        Ok(())
    }
}
