//! Admission tokens.
//!
//! A token proves that a user was admitted to a queue for a given flight, so the
//! web tier can re-verify entry on every page view without touching the store:
//!
//! ```text
//! token = hex(SHA-256("user-queue-{queue}-{user_id}-{flight_id}"))
//! ```
//!
//! The derivation is fixed: tokens issued by earlier deployments must keep
//! verifying. Computed tokens are memoized in an injected [`TokenCache`].

use crate::errors::WrError;
use crate::observability::metrics;
use ring::digest::{digest, SHA256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use subtle::ConstantTimeEq;
use tracing::{debug, error};

/// Namespace literal separating admission tokens from other SHA-256 derived values.
pub const TOKEN_NAMESPACE: &str = "user-queue";

/// Hex length of a SHA-256 digest.
pub const TOKEN_HEX_LENGTH: usize = 64;

/// SHA-256("abc"), FIPS 180-2 appendix B.1.
const SELF_TEST_INPUT: &[u8] = b"abc";
const SELF_TEST_DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

/// Composite cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub queue: String,
    pub user_id: i64,
    pub flight_id: i64,
}

impl TokenKey {
    pub fn new(queue: &str, user_id: i64, flight_id: i64) -> Self {
        Self {
            queue: queue.to_string(),
            user_id,
            flight_id,
        }
    }

    /// Digest input for this key.
    pub fn canonical_input(&self) -> String {
        format!(
            "{TOKEN_NAMESPACE}-{}-{}-{}",
            self.queue, self.user_id, self.flight_id
        )
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub token: String,
    /// True when the token was served without computing it.
    pub hit: bool,
}

/// Process-local token memoization.
///
/// Implementations must tolerate concurrent `get_or_insert_with` calls from
/// any number of request tasks. The cache is never authoritative: a token
/// missing from it is simply recomputed.
pub trait TokenCache: Send + Sync {
    /// Return the cached token for `key`, computing and storing it on a miss.
    fn get_or_insert_with(&self, key: &TokenKey, compute: &dyn Fn(&TokenKey) -> String)
        -> CachedToken;

    /// Number of cached tokens.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<TokenKey, String>,
    insertion_order: VecDeque<TokenKey>,
}

/// Token cache holding at most `capacity` entries, evicting oldest inserts first.
///
/// A capacity of zero disables caching.
#[derive(Debug)]
pub struct BoundedTokenCache {
    capacity: usize,
    inner: RwLock<CacheInner>,
}

impl BoundedTokenCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(CacheInner::default()),
        }
    }
}

impl TokenCache for BoundedTokenCache {
    fn get_or_insert_with(
        &self,
        key: &TokenKey,
        compute: &dyn Fn(&TokenKey) -> String,
    ) -> CachedToken {
        if self.capacity == 0 {
            return CachedToken {
                token: compute(key),
                hit: false,
            };
        }

        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(token) = inner.entries.get(key) {
                return CachedToken {
                    token: token.clone(),
                    hit: true,
                };
            }
        }

        // Hash outside the write lock
        let token = compute(key);

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inner.entries.get(key) {
            // Another request inserted the same key meanwhile; values are identical
            return CachedToken {
                token: existing.clone(),
                hit: false,
            };
        }

        while inner.entries.len() >= self.capacity {
            match inner.insertion_order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }

        inner.entries.insert(key.clone(), token.clone());
        inner.insertion_order.push_back(key.clone());

        CachedToken { token, hit: false }
    }

    fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

/// Compute the admission token for `key` without consulting any cache.
pub fn compute_token(key: &TokenKey) -> String {
    hex::encode(digest(&SHA256, key.canonical_input().as_bytes()))
}

/// Issues and verifies admission tokens.
pub struct TokenIssuer {
    cache: Arc<dyn TokenCache>,
}

impl TokenIssuer {
    /// Create an issuer after checking SHA-256 against a known answer.
    ///
    /// # Errors
    ///
    /// Returns `WrError::HashAlgorithmUnavailable` if the digest implementation
    /// produces a wrong result. Callers must treat this as fatal at startup.
    pub fn new(cache: Arc<dyn TokenCache>) -> Result<Self, WrError> {
        self_test()?;
        Ok(Self { cache })
    }

    /// Return the token for `(queue, user_id, flight_id)`.
    pub fn get_or_create(&self, queue: &str, user_id: i64, flight_id: i64) -> String {
        let key = TokenKey::new(queue, user_id, flight_id);
        let cached = self.cache.get_or_insert_with(&key, &compute_token);

        metrics::record_token_cache(if cached.hit { "hit" } else { "miss" });
        debug!(
            target: "wr.token",
            queue = %queue,
            cache_hit = cached.hit,
            "Resolved admission token"
        );

        cached.token
    }

    /// Check `presented` against the canonical token in constant time.
    pub fn verify(&self, queue: &str, user_id: i64, flight_id: i64, presented: &str) -> bool {
        let expected = self.get_or_create(queue, user_id, flight_id);
        // Length mismatch compares unequal without inspecting contents
        let valid = bool::from(expected.as_bytes().ct_eq(presented.as_bytes()));

        metrics::record_token_verification(if valid { "valid" } else { "invalid" });
        valid
    }

    /// Number of memoized tokens.
    pub fn cached_tokens(&self) -> usize {
        self.cache.len()
    }
}

fn self_test() -> Result<(), WrError> {
    let output = digest(&SHA256, SELF_TEST_INPUT);
    let encoded = hex::encode(output.as_ref());

    if encoded.len() != TOKEN_HEX_LENGTH || encoded != SELF_TEST_DIGEST {
        error!(
            target: "wr.token",
            "SHA-256 known-answer test failed"
        );
        return Err(WrError::HashAlgorithmUnavailable(
            "SHA-256 known-answer test failed".to_string(),
        ));
    }
    Ok(())
}
