//! Single-flight cache for the mail provider's access token.
//!
//! Callers pass the fetch as a closure; the cache holds an async mutex across
//! the check and the fetch so concurrent callers trigger one refresh.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;

/// Lifetime assumed when the token endpoint does not say
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(1800);

/// Token returned by a fetch
#[derive(Clone, PartialEq, Eq)]
pub struct FetchedToken {
    pub token: String,
    pub expires_in: Option<Duration>,
}

impl std::fmt::Debug for FetchedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedToken")
            .field("token", &redact(&self.token))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Explicit handle; no process-wide token state
#[derive(Default)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache").finish_non_exhaustive()
    }
}

impl TokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached token, or run `fetch` once and cache its result
    ///
    /// A failed fetch leaves the cache empty and returns the error.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedToken>>,
    {
        let mut slot = self.slot.lock().await;
        let now = Instant::now();

        if let Some(cached) = slot.as_ref() {
            if now < cached.expires_at {
                tracing::trace!("using cached access token");
                return Ok(cached.token.clone());
            }
            tracing::debug!("cached access token expired; refreshing");
        }
        *slot = None;

        let fetched = match fetch().await {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::error!(error = %err, "access token fetch failed");
                return Err(err);
            }
        };
        let ttl = fetched.expires_in.unwrap_or(DEFAULT_TOKEN_TTL);
        tracing::debug!(
            suffix = %redact(&fetched.token),
            ttl_secs = ttl.as_secs(),
            "access token refreshed"
        );

        *slot = Some(CachedToken {
            token: fetched.token.clone(),
            expires_at: now + ttl,
        });
        Ok(fetched.token)
    }

    /// Drop the cached token so the next call fetches
    pub async fn clear(&self) {
        *self.slot.lock().await = None;
    }
}

fn redact(token: &str) -> String {
    let tail: String = token
        .chars()
        .rev()
        .take(6)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fetcher(
        calls: Arc<AtomicUsize>,
        ttl: Duration,
    ) -> impl Future<Output = Result<FetchedToken>> {
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(FetchedToken {
                token: format!("ctok_{n}"),
                expires_in: Some(ttl),
            })
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let cache = Arc::new(TokenCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_refresh(|| fetcher(calls, Duration::from_secs(60)))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), "ctok_1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_refreshed() {
        let cache = TokenCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_refresh(|| fetcher(Arc::clone(&calls), Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        let second = cache
            .get_or_refresh(|| fetcher(Arc::clone(&calls), Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(first, "ctok_1");
        assert_eq!(second, "ctok_2");
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cache_empty() {
        let cache = TokenCache::new();
        let err = cache
            .get_or_refresh(|| async { Err(crate::Error::Runtime("502".to_string())) })
            .await;
        assert!(err.is_err());

        let calls = Arc::new(AtomicUsize::new(0));
        let token = cache
            .get_or_refresh(|| fetcher(Arc::clone(&calls), Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(token, "ctok_1");
    }

    #[tokio::test]
    async fn clear_forces_refetch() {
        let cache = TokenCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_refresh(|| fetcher(Arc::clone(&calls), Duration::from_secs(60)))
            .await
            .unwrap();
        cache.clear().await;
        cache
            .get_or_refresh(|| fetcher(Arc::clone(&calls), Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn redact_keeps_only_tail() {
        assert_eq!(redact("ctok_abcdef123456"), "***123456");
        assert_eq!(redact("abc"), "***abc");
    }
}
