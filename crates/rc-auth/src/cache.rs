//! Single-flight token cache shared by every credential provider backend.
//!
//! Spec §4.1: cache key is `(client_id, sorted scopes)`; concurrent
//! `get_token` calls for the same key during a refresh must collapse into
//! one authority request (S4 — Credential single-flight).

use chrono::Utc;
use dashmap::DashMap;
use rc_common::{CachedToken, CredentialMetrics};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

struct CacheEntry {
    cached: RwLock<Option<CachedToken>>,
    refresh_lock: Mutex<()>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            cached: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }
}

pub struct TokenCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    metrics: RwLock<CredentialMetrics>,
    skew_secs: i64,
}

/// `(client_id, sorted scopes)` as specified in spec §4.1.
pub fn cache_key(client_id: &str, scopes: &[String]) -> String {
    let mut sorted = scopes.to_vec();
    sorted.sort();
    format!("{client_id}|{}", sorted.join(","))
}

impl TokenCache {
    pub fn new(skew_secs: i64) -> Self {
        Self {
            entries: DashMap::new(),
            metrics: RwLock::new(CredentialMetrics::default()),
            skew_secs,
        }
    }

    /// Returns the cached token for `key` if still valid, otherwise calls
    /// `fetch` while holding the per-key refresh lock so concurrent callers
    /// for the same key block and then observe the freshly cached token
    /// rather than each issuing their own upstream request.
    pub async fn get_or_refresh<F, Fut>(&self, key: &str, fetch: F) -> rc_common::Result<CachedToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = rc_common::Result<CachedToken>>,
    {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CacheEntry::new()))
            .clone();

        if let Some(token) = Self::fresh(&entry, self.skew_secs).await {
            return Ok(token);
        }

        let _guard = entry.refresh_lock.lock().await;
        if let Some(token) = Self::fresh(&entry, self.skew_secs).await {
            return Ok(token);
        }

        let started = std::time::Instant::now();
        let result = fetch().await;
        self.record(&result, started.elapsed()).await;
        if let Ok(token) = &result {
            *entry.cached.write().await = Some(token.clone());
        }
        result
    }

    /// Testing hook (spec §4.1): drops every cached token and in-flight
    /// guard so the next `get_or_refresh` always hits the upstream.
    pub fn clear(&self) {
        self.entries.clear();
    }

    async fn fresh(entry: &CacheEntry, skew_secs: i64) -> Option<CachedToken> {
        let guard = entry.cached.read().await;
        let token = guard.as_ref()?;
        if token.is_valid(Utc::now(), skew_secs) {
            Some(token.clone())
        } else {
            None
        }
    }

    async fn record(&self, result: &rc_common::Result<CachedToken>, latency: std::time::Duration) {
        let mut metrics = self.metrics.write().await;
        metrics.total += 1;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        metrics.avg_latency_ms += (latency_ms - metrics.avg_latency_ms) / metrics.total as f64;
        match result {
            Ok(_) => {
                metrics.successes += 1;
                metrics.issued += 1;
                metrics.last_success_at = Some(Utc::now());
            }
            Err(_) => {
                metrics.failures += 1;
                metrics.last_failure_at = Some(Utc::now());
            }
        }
    }

    pub async fn metrics(&self) -> CredentialMetrics {
        self.metrics.read().await.clone()
    }

    /// Seconds until the cached token for `key` should be proactively
    /// renewed, or `None` if nothing is cached yet (spec §4.1 pre-expiry
    /// renewal).
    pub async fn seconds_until_refresh(&self, key: &str, refresh_before_secs: i64) -> Option<i64> {
        let entry = self.entries.get(key)?;
        let guard = entry.cached.read().await;
        let token = guard.as_ref()?;
        Some((token.remaining_seconds(Utc::now()) - refresh_before_secs).max(0))
    }

    /// Proactively refreshes the cached token for `key` if it is missing or
    /// its remaining TTL has dropped under `refresh_before_secs` (spec
    /// §4.1: "if served token's remaining TTL < refresh_before, trigger
    /// refresh"). A no-op otherwise, so the background ticker doesn't force
    /// an upstream call before one is actually due. Single-flight per key,
    /// same as `get_or_refresh`.
    pub async fn refresh_if_due<F, Fut>(&self, key: &str, refresh_before_secs: i64, fetch: F) -> rc_common::Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = rc_common::Result<CachedToken>>,
    {
        if self.seconds_until_refresh(key, refresh_before_secs).await.is_some_and(|remaining| remaining > 0) {
            return Ok(());
        }

        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CacheEntry::new()))
            .clone();
        let _guard = entry.refresh_lock.lock().await;
        if self.seconds_until_refresh(key, refresh_before_secs).await.is_some_and(|remaining| remaining > 0) {
            return Ok(());
        }

        let started = std::time::Instant::now();
        let result = fetch().await;
        self.record(&result, started.elapsed()).await;
        if let Ok(token) = &result {
            *entry.cached.write().await = Some(token.clone());
        }
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn single_flight_collapses_concurrent_refreshes() {
        let cache = Arc::new(TokenCache::new(60));
        let calls = Arc::new(AtomicU32::new(0));
        let key = cache_key("client", &["scope".to_string()]);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh(&key, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(CachedToken {
                            access_token: "tok".into(),
                            expires_at: Utc::now() + chrono::Duration::seconds(3600),
                            scopes: vec!["scope".into()],
                        })
                    })
                    .await
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().await.issued, 1);
    }

    #[tokio::test]
    async fn refresh_if_due_skips_a_token_well_within_its_window() {
        let cache = TokenCache::new(60);
        let calls = Arc::new(AtomicU32::new(0));
        let key = cache_key("client", &["scope".to_string()]);

        cache
            .get_or_refresh(&key, || async {
                Ok(CachedToken {
                    access_token: "tok-1".into(),
                    expires_at: Utc::now() + chrono::Duration::seconds(3600),
                    scopes: vec!["scope".into()],
                })
            })
            .await
            .unwrap();

        cache
            .refresh_if_due(&key, 300, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    unreachable!("should not be called while the token is well within its refresh window")
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_if_due_refreshes_a_token_past_its_window() {
        let cache = TokenCache::new(60);
        let key = cache_key("client", &["scope".to_string()]);

        cache
            .get_or_refresh(&key, || async {
                Ok(CachedToken {
                    access_token: "tok-1".into(),
                    expires_at: Utc::now() + chrono::Duration::seconds(100),
                    scopes: vec!["scope".into()],
                })
            })
            .await
            .unwrap();

        cache
            .refresh_if_due(&key, 300, || async {
                Ok(CachedToken {
                    access_token: "tok-2".into(),
                    expires_at: Utc::now() + chrono::Duration::seconds(3600),
                    scopes: vec!["scope".into()],
                })
            })
            .await
            .unwrap();

        let refreshed = TokenCache::fresh(cache.entries.get(&key).unwrap().value(), 0).await.unwrap();
        assert_eq!(refreshed.access_token, "tok-2");
    }
}
