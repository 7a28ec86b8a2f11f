//! Identity-provider key set: source abstraction and single-flight cache.
//!
//! The cache is read on every token validation and written only by a
//! refresh. Refreshes are lazy (cache miss, stale set, or forced after a
//! signature failure) and de-duplicated: callers that observed the same
//! fetch attempt counter queue on one mutex, the first performs the fetch,
//! the rest reuse its outcome instead of fetching again.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use tokio::sync::Mutex;

use crate::AuthError;

/// Where key sets come from.
#[async_trait]
pub trait KeySetSource: Send + Sync {
    /// Fetch the current key set.
    ///
    /// # Errors
    /// Returns [`AuthError::KeySetFetch`] on transport failure or
    /// [`AuthError::KeySetDecode`] if the document is not a JWKS.
    async fn fetch(&self) -> Result<JwkSet, AuthError>;
}

/// Fetches the JWKS document over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpKeySetSource {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySetSource {
    /// Build a source for `url` with a per-fetch timeout.
    ///
    /// # Errors
    /// Returns [`AuthError::KeySetFetch`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::KeySetFetch(format!("build client: {e}")))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::KeySetFetch(format!("GET {}: {e}", self.url)))?;
        resp.json::<JwkSet>()
            .await
            .map_err(|e| AuthError::KeySetDecode(format!("{}: {e}", self.url)))
    }
}

#[derive(Debug)]
struct CachedKeys {
    keys: Arc<JwkSet>,
    fetched_at: Option<Instant>,
    /// Incremented on every fetch attempt, successful or not.
    attempts: u64,
    last_error: Option<AuthError>,
}

/// Point-in-time view of the cache handed to a validation.
#[derive(Debug, Clone)]
pub struct KeySnapshot {
    pub keys: Arc<JwkSet>,
    attempts: u64,
    fetched_at: Option<Instant>,
}

impl KeySnapshot {
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.find(kid)
    }
}

/// Cached key set with lazy, de-duplicated refresh.
pub struct KeySetCache<S: KeySetSource> {
    source: S,
    state: RwLock<CachedKeys>,
    refresh_lock: Mutex<()>,
    refresh_interval: Duration,
    /// Minimum age before a signature failure may force a refetch.
    forced_refresh_min_age: Duration,
}

impl<S: KeySetSource> KeySetCache<S> {
    /// Create an empty cache. The first lookup fetches.
    #[must_use]
    pub fn new(source: S, refresh_interval: Duration) -> Self {
        Self {
            source,
            state: RwLock::new(CachedKeys {
                keys: Arc::new(JwkSet { keys: Vec::new() }),
                fetched_at: None,
                attempts: 0,
                last_error: None,
            }),
            refresh_lock: Mutex::new(()),
            refresh_interval,
            forced_refresh_min_age: Duration::from_secs(30),
        }
    }

    /// Override the minimum key-set age for signature-failure refetches.
    #[must_use]
    pub fn with_forced_refresh_min_age(mut self, age: Duration) -> Self {
        self.forced_refresh_min_age = age;
        self
    }

    /// Current cached keys without fetching.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> KeySnapshot {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let state = self.state.read().expect("key set read lock poisoned");
        KeySnapshot {
            keys: Arc::clone(&state.keys),
            attempts: state.attempts,
            fetched_at: state.fetched_at,
        }
    }

    /// `true` if the snapshot was never filled or is older than the refresh interval.
    #[must_use]
    pub fn is_stale(&self, snapshot: &KeySnapshot) -> bool {
        snapshot.fetched_at.is_none_or(|at| at.elapsed() >= self.refresh_interval)
    }

    /// Look up `kid`, refetching once if it is missing or the set is stale.
    ///
    /// A stale set whose refresh fails still answers from the old keys.
    ///
    /// # Errors
    /// Returns the fetch error when `kid` is not cached and the refetch failed.
    pub async fn key(&self, kid: &str) -> Result<Option<Jwk>, AuthError> {
        let snapshot = self.snapshot();
        let cached = snapshot.find(kid).cloned();
        if cached.is_some() && !self.is_stale(&snapshot) {
            return Ok(cached);
        }

        match self.refresh_after(snapshot.attempts).await {
            Ok(fresh) => Ok(fresh.find(kid).cloned()),
            Err(e) if cached.is_some() => {
                tracing::warn!(error = %e, "key set refresh failed, serving stale keys");
                Ok(cached)
            }
            Err(e) => Err(e),
        }
    }

    /// Refetch after a signature failure, unless the set is younger than the
    /// forced-refresh minimum age. Returns `None` when no refetch happened.
    ///
    /// # Errors
    /// Propagates the fetch error.
    pub async fn force_refresh(
        &self,
        seen: &KeySnapshot,
    ) -> Result<Option<KeySnapshot>, AuthError> {
        let young = seen.fetched_at.is_some_and(|at| at.elapsed() < self.forced_refresh_min_age);
        if young {
            return Ok(None);
        }
        self.refresh_after(seen.attempts).await?;
        Ok(Some(self.snapshot()))
    }

    /// Fetch unless another caller already attempted a fetch after `seen_attempts`.
    async fn refresh_after(&self, seen_attempts: u64) -> Result<Arc<JwkSet>, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let state = self.state.read().expect("key set read lock poisoned");
            if state.attempts != seen_attempts {
                return match &state.last_error {
                    Some(e) => Err(e.clone()),
                    None => Ok(Arc::clone(&state.keys)),
                };
            }
        }

        let outcome = self.source.fetch().await;

        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut state = self.state.write().expect("key set write lock poisoned");
        state.attempts += 1;
        match outcome {
            Ok(set) => {
                let (keys, attempt) = (set.keys.len(), state.attempts);
                tracing::info!(keys, attempt, "key set refreshed");
                state.keys = Arc::new(set);
                state.fetched_at = Some(Instant::now());
                state.last_error = None;
                Ok(Arc::clone(&state.keys))
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = state.attempts, "key set fetch failed");
                state.last_error = Some(e.clone());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::test_support::{hs256_key_set, StaticKeySource};

    #[tokio::test]
    async fn first_lookup_fetches_once() {
        let source = StaticKeySource::new(hs256_key_set("k1", b"secret"));
        let fetches = source.fetch_counter();
        let cache = KeySetCache::new(source, Duration::from_secs(3600));

        let first = cache.key("k1").await;
        let second = cache.key("k1").await;
        assert!(matches!(first, Ok(Some(_))), "k1 must be found");
        assert!(matches!(second, Ok(Some(_))), "k1 must be served from cache");
        assert_eq!(fetches.load(Ordering::SeqCst), 1, "a warm cache must not refetch");
    }

    #[tokio::test]
    async fn miss_refetches_exactly_once() {
        let source = StaticKeySource::new(hs256_key_set("k1", b"secret"));
        let fetches = source.fetch_counter();
        let cache = KeySetCache::new(source, Duration::from_secs(3600));
        let _ = cache.key("k1").await;

        let missing = cache.key("rotated-away").await;
        assert!(matches!(missing, Ok(None)), "unknown kid must resolve to None");
        assert_eq!(fetches.load(Ordering::SeqCst), 2, "one fetch to fill, one per miss");
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let source = StaticKeySource::new(hs256_key_set("k1", b"secret"))
            .with_delay(Duration::from_millis(50));
        let fetches = source.fetch_counter();
        let cache = Arc::new(KeySetCache::new(source, Duration::from_secs(3600)));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move { cache.key("nope").await }));
        }
        for task in tasks {
            match task.await {
                Ok(Ok(None)) => {}
                Ok(other) => panic!("expected a clean miss, got {other:?}"),
                Err(e) => panic!("task panicked: {e}"),
            }
        }
        let fetched = fetches.load(Ordering::SeqCst);
        assert_eq!(fetched, 1, "concurrent misses must not storm the provider");
    }

    #[tokio::test]
    async fn failed_fetch_is_reported_then_retried() {
        let source = StaticKeySource::failing();
        let fetches = source.fetch_counter();
        let cache = KeySetCache::new(source, Duration::from_secs(3600));

        assert!(matches!(cache.key("k1").await, Err(AuthError::KeySetFetch(_))));
        assert!(matches!(cache.key("k1").await, Err(AuthError::KeySetFetch(_))));
        assert_eq!(fetches.load(Ordering::SeqCst), 2, "the next request must retry the fetch");
    }

    #[tokio::test]
    async fn stale_set_refreshes_on_next_lookup() {
        let source = StaticKeySource::new(hs256_key_set("k1", b"secret"));
        let fetches = source.fetch_counter();
        let cache = KeySetCache::new(source, Duration::ZERO);

        let _ = cache.key("k1").await;
        let _ = cache.key("k1").await;
        let fetched = fetches.load(Ordering::SeqCst);
        assert_eq!(fetched, 2, "zero refresh interval refetches every lookup");
    }

    #[tokio::test]
    async fn forced_refresh_respects_minimum_age() {
        let source = StaticKeySource::new(hs256_key_set("k1", b"secret"));
        let fetches = source.fetch_counter();
        let cache = KeySetCache::new(source, Duration::from_secs(3600));
        let _ = cache.key("k1").await;

        let seen = cache.snapshot();
        match cache.force_refresh(&seen).await {
            Ok(None) => {}
            other => panic!("young key set must not be refetched, got {other:?}"),
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }
}
