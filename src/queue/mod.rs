//! Rate-limited request queue.
//!
//! Callers push jobs onto a broker list and poll a results hash; a single
//! worker drains the list while the window's token counter stays under the
//! budget gate and no provider cooldown is active.
//!
//! ```text
//! caller ──enqueue──▶ <ns>:requests ──lpop──▶ QueueWorker ──▶ CompletionClient
//!    ▲                                           │
//!    └──────await_result──── <ns>:results ◀──────┘  (+ <ns>:tpm, <ns>:backoff_until)
//! ```

pub mod client;
pub mod worker;

use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use client::{Completion, CompletionClient, HttpCompletionClient};
pub use worker::{QueueWorker, Tick};

use crate::broker::{Broker, now_ms};
use crate::errors::QueueError;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub namespace: String,
    pub tpm_budget: i64,
    /// Fraction of the budget at which dequeuing pauses.
    pub budget_ratio: f64,
    pub tpm_window: Duration,
    /// Cooldown used when a rate-limit response carries no hint.
    pub default_backoff: Duration,
    /// Ceiling on any cooldown, however long the provider asks for.
    pub max_backoff: Duration,
    /// Worker sleep when idle, over budget or backing off.
    pub idle: Duration,
    /// Caller poll interval while awaiting a result.
    pub poll_interval: Duration,
    /// Ceiling on any caller's wait.
    pub max_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "llm_queue".into(),
            tpm_budget: 100_000,
            budget_ratio: 0.98,
            tpm_window: Duration::from_secs(60),
            default_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(3600),
            idle: Duration::from_millis(200),
            poll_interval: Duration::from_millis(250),
            max_wait: Duration::from_secs(90),
        }
    }
}

/// Broker keys under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub requests: String,
    pub results: String,
    pub tpm: String,
    pub backoff_until: String,
}

impl QueueKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            requests: format!("{}:requests", namespace),
            results: format!("{}:results", namespace),
            tpm: format!("{}:tpm", namespace),
            backoff_until: format!("{}:backoff_until", namespace),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub request_id: uuid::Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub params: Value,
    pub enqueued_at: DateTime<Utc>,
}

/// Stored result of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Ok {
        response: Value,
    },
    Error {
        message: String,
        #[serde(default)]
        rate_limited: bool,
    },
}

/// Snapshot of the shared throttling state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUsage {
    pub tokens_used: i64,
    pub tpm_budget: i64,
    pub window_resets_in_ms: Option<u64>,
    pub backoff_until: Option<DateTime<Utc>>,
    pub queued: i64,
    pub results_waiting: i64,
}

/// Caller side of the queue.
#[derive(Clone)]
pub struct RateLimitedQueue {
    broker: Broker,
    config: QueueConfig,
    keys: QueueKeys,
}

impl RateLimitedQueue {
    pub fn new(broker: Broker, config: QueueConfig) -> Self {
        let keys = QueueKeys::new(&config.namespace);
        Self {
            broker,
            config,
            keys,
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Queue a request and return its id immediately. Not idempotent: each
    /// call is a new request.
    pub async fn enqueue(&self, params: Value, job_id: Option<String>) -> Result<uuid::Uuid, QueueError> {
        let job = QueueJob {
            request_id: uuid::Uuid::new_v4(),
            job_id,
            params,
            enqueued_at: Utc::now(),
        };
        let depth = self
            .broker
            .rpush(&self.keys.requests, &serde_json::to_string(&job)?)
            .await?;
        tracing::debug!(request_id = %job.request_id, depth, "request queued");
        Ok(job.request_id)
    }

    /// Wait for a request's result, up to `timeout` (capped at `max_wait`).
    /// The result is removed as it is read.
    pub async fn await_result(&self, request_id: uuid::Uuid, timeout: Duration) -> Result<Value, QueueError> {
        let waited_for = timeout.min(self.config.max_wait);
        let started = Instant::now();
        let field = request_id.to_string();
        loop {
            if let Some(raw) = self.broker.htake(&self.keys.results, &field).await? {
                return match serde_json::from_str::<JobOutcome>(&raw)? {
                    JobOutcome::Ok { response } => Ok(response),
                    JobOutcome::Error { message, .. } => Err(QueueError::Upstream(message)),
                };
            }
            let elapsed = started.elapsed();
            if elapsed >= waited_for {
                tracing::warn!(%request_id, waited_ms = elapsed.as_millis() as u64, "no result before timeout");
                return Err(QueueError::Timeout {
                    request_id,
                    waited: elapsed,
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(waited_for - elapsed)).await;
        }
    }

    /// Enqueue and wait in one call.
    pub async fn submit(&self, params: Value, job_id: Option<String>, timeout: Duration) -> Result<Value, QueueError> {
        let request_id = self.enqueue(params, job_id).await?;
        self.await_result(request_id, timeout).await
    }

    pub async fn usage(&self) -> Result<QueueUsage, QueueError> {
        let tokens_used = self
            .broker
            .get(&self.keys.tpm)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let window_resets_in_ms = self
            .broker
            .ttl(&self.keys.tpm)
            .await?
            .map(|d| d.as_millis() as u64);
        let backoff_until = self
            .broker
            .get(&self.keys.backoff_until)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|until| *until > now_ms())
            .and_then(|until| Utc.timestamp_millis_opt(until).single());
        Ok(QueueUsage {
            tokens_used,
            tpm_budget: self.config.tpm_budget,
            window_resets_in_ms,
            backoff_until,
            queued: self.broker.llen(&self.keys.requests).await?,
            results_waiting: self.broker.hlen(&self.keys.results).await?,
        })
    }
}
