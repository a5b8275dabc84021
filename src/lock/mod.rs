//! Singleton credential refresh.
//!
//! When many callers find a shared credential stale at once, one of them
//! takes a short-lived broker lock and refreshes; the rest poll the cache
//! until the new value appears. The lock is released by compare-and-delete
//! on the holder's token, so an expired holder never frees someone else's lock.

pub mod oauth;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use oauth::OAuthRefresher;

use crate::broker::Broker;
use crate::errors::RefreshError;

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub namespace: String,
    /// Lock lifetime; bounds how long a crashed holder blocks others.
    pub ttl: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            namespace: "github_token".into(),
            ttl: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            max_attempts: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Performs the actual upstream refresh for one subject.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, subject: &str) -> anyhow::Result<Credential>;
}

#[derive(Clone)]
pub struct RefreshLock {
    broker: Broker,
    config: LockConfig,
}

impl RefreshLock {
    pub fn new(broker: Broker, config: LockConfig) -> Self {
        Self { broker, config }
    }

    pub fn lock_key(&self, subject: &str) -> String {
        format!("{}_refresh_lock_{}", self.config.namespace, subject)
    }

    pub fn cache_key(&self, subject: &str) -> String {
        format!("{}_{}", self.config.namespace, subject)
    }

    /// Cached credential for `subject`, if still valid.
    pub async fn get_cached(&self, subject: &str) -> Result<Option<Credential>, RefreshError> {
        let Some(raw) = self.broker.get(&self.cache_key(subject)).await? else {
            return Ok(None);
        };
        let cached: Credential = serde_json::from_str(&raw)?;
        Ok(cached.is_fresh_at(Utc::now()).then_some(cached))
    }

    /// Drop the cached value, e.g. after the upstream rejected it.
    pub async fn invalidate(&self, subject: &str) -> Result<bool, RefreshError> {
        let removed = self.broker.del(&self.cache_key(subject)).await?;
        tracing::debug!(subject, removed, "cached credential invalidated");
        Ok(removed)
    }

    /// A fresh credential for `subject`, refreshing through `refresher` only
    /// if no other caller is already doing so.
    #[tracing::instrument(level = "debug", skip_all, fields(subject = %subject))]
    pub async fn credential<R>(&self, subject: &str, refresher: &R) -> Result<Credential, RefreshError>
    where
        R: CredentialRefresher + ?Sized,
    {
        if let Some(cached) = self.get_cached(subject).await? {
            return Ok(cached);
        }

        let lock_key = self.lock_key(subject);
        for attempt in 1..=self.config.max_attempts {
            let holder = uuid::Uuid::new_v4().to_string();
            if self
                .broker
                .set_nx(&lock_key, &holder, Some(self.config.ttl))
                .await?
            {
                tracing::debug!(attempt, "refresh lock acquired");
                let result = self.refresh_holding(subject, refresher).await;
                match self.broker.del_if_eq(&lock_key, &holder).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(subject, "refresh lock expired before release"),
                    Err(e) => tracing::warn!(subject, error = %e, "failed to release refresh lock"),
                }
                return result;
            }

            tokio::time::sleep(self.config.poll_interval).await;
            if let Some(cached) = self.get_cached(subject).await? {
                tracing::debug!(attempt, "credential refreshed by another holder");
                return Ok(cached);
            }
        }

        tracing::error!(subject, attempts = self.config.max_attempts, "credential refresh never completed");
        Err(RefreshError::Exhausted {
            subject: subject.to_string(),
            attempts: self.config.max_attempts,
        })
    }

    async fn refresh_holding<R>(&self, subject: &str, refresher: &R) -> Result<Credential, RefreshError>
    where
        R: CredentialRefresher + ?Sized,
    {
        // Another holder may have finished between our cache miss and acquiring the lock.
        if let Some(cached) = self.get_cached(subject).await? {
            return Ok(cached);
        }

        let fresh = refresher
            .refresh(subject)
            .await
            .map_err(RefreshError::Refresh)?;
        let validity = (fresh.expires_at - Utc::now()).to_std().unwrap_or_default();
        if validity.is_zero() {
            tracing::warn!(subject, expires_at = %fresh.expires_at, "refreshed credential is already expired; not caching");
        } else {
            self.broker
                .set(
                    &self.cache_key(subject),
                    &serde_json::to_string(&fresh)?,
                    Some(validity),
                )
                .await?;
        }
        tracing::info!(subject, expires_at = %fresh.expires_at, "credential refreshed");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts refreshes and hands out a distinct value per call.
    #[derive(Default)]
    struct CountingRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CredentialRefresher for CountingRefresher {
        async fn refresh(&self, _subject: &str) -> anyhow::Result<Credential> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                anyhow::bail!("upstream refused refresh");
            }
            Ok(Credential {
                value: format!("token-{}", n),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    fn config() -> LockConfig {
        LockConfig {
            poll_interval: Duration::from_millis(10),
            max_attempts: 200,
            ..LockConfig::default()
        }
    }

    #[tokio::test]
    async fn test_three_racing_callers_refresh_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broker.db");
        let refresher = Arc::new(CountingRefresher::default());

        let mut tasks = Vec::new();
        for _ in 0..3 {
            // One connection per caller, as if each were its own process.
            let lock = RefreshLock::new(Broker::open(&path)?, config());
            let refresher = Arc::clone(&refresher);
            tasks.push(tokio::spawn(async move {
                lock.credential("install-7", refresher.as_ref()).await
            }));
        }
        let mut values = Vec::new();
        for t in tasks {
            values.push(t.await??.value);
        }

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| v == "token-1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_cache_hit_skips_refresh() -> Result<()> {
        let lock = RefreshLock::new(Broker::in_memory()?, config());
        let refresher = CountingRefresher::default();
        let first = lock.credential("s", &refresher).await?;
        let second = lock.credential("s", &refresher).await?;
        assert_eq!(first, second);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        lock.invalidate("s").await?;
        let third = lock.credential("s", &refresher).await?;
        assert_eq!(third.value, "token-2");
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_when_lock_never_frees() -> Result<()> {
        let broker = Broker::in_memory()?;
        let lock = RefreshLock::new(
            broker.clone(),
            LockConfig {
                poll_interval: Duration::from_millis(5),
                max_attempts: 3,
                ..LockConfig::default()
            },
        );
        broker
            .set_nx(&lock.lock_key("s"), "someone-else", Some(Duration::from_secs(60)))
            .await?;
        let refresher = CountingRefresher::default();
        match lock.credential("s", &refresher).await {
            Err(RefreshError::Exhausted { subject, attempts }) => {
                assert_eq!(subject, "s");
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_released_when_refresh_fails() -> Result<()> {
        let broker = Broker::in_memory()?;
        let lock = RefreshLock::new(broker.clone(), config());
        let failing = CountingRefresher {
            fail: true,
            ..Default::default()
        };
        assert!(matches!(
            lock.credential("s", &failing).await,
            Err(RefreshError::Refresh(_))
        ));
        assert_eq!(broker.get(&lock.lock_key("s")).await?, None);

        let working = CountingRefresher::default();
        assert_eq!(lock.credential("s", &working).await?.value, "token-1");
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_cache_entry_is_ignored() -> Result<()> {
        let broker = Broker::in_memory()?;
        let lock = RefreshLock::new(broker.clone(), config());
        let stale = Credential {
            value: "old".into(),
            expires_at: Utc::now() - chrono::Duration::minutes(1),
        };
        broker
            .set(&lock.cache_key("s"), &serde_json::to_string(&stale)?, None)
            .await?;
        assert_eq!(lock.get_cached("s").await?, None);
        assert_eq!(lock.credential("s", &CountingRefresher::default()).await?.value, "token-1");
        Ok(())
    }

    #[test]
    fn test_key_layout() -> Result<()> {
        let lock = RefreshLock::new(Broker::in_memory()?, LockConfig::default());
        assert_eq!(lock.lock_key("42"), "github_token_refresh_lock_42");
        assert_eq!(lock.cache_key("42"), "github_token_42");
        Ok(())
    }
}
