use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::client::{CompletionClient, retry_after_from_message};
use super::{JobOutcome, QueueConfig, QueueJob, QueueKeys};
use crate::broker::{Broker, deadline_ms, now_ms};
use crate::errors::{CompletionError, QueueError};

/// What one worker iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// A provider cooldown is active for this much longer.
    BackingOff(Duration),
    /// The window's token counter is at or above the budget gate.
    OverBudget { used: i64, limit: i64 },
    /// Nothing queued.
    Idle,
    Completed { request_id: uuid::Uuid, tokens: i64 },
    RateLimited { request_id: uuid::Uuid, wait: Duration },
    Failed { request_id: uuid::Uuid },
    /// The queued payload could not be decoded.
    Dropped,
}

/// The single consumer of the request list. Exactly one should run per
/// deployment; all of its state lives in the broker.
pub struct QueueWorker<C> {
    broker: Broker,
    client: C,
    config: QueueConfig,
    keys: QueueKeys,
}

impl<C: CompletionClient> QueueWorker<C> {
    pub fn new(broker: Broker, client: C, config: QueueConfig) -> Self {
        let keys = QueueKeys::new(&config.namespace);
        Self {
            broker,
            client,
            config,
            keys,
        }
    }

    /// Token count at which dequeuing pauses.
    pub fn budget_gate(&self) -> i64 {
        (self.config.tpm_budget as f64 * self.config.budget_ratio).floor() as i64
    }

    /// One pass: check the cooldown, then the budget, then handle one job.
    pub async fn tick(&self) -> Result<Tick, QueueError> {
        if let Some(remaining) = self.backoff_remaining().await? {
            return Ok(Tick::BackingOff(remaining));
        }

        let used = self.tokens_used().await?;
        let limit = self.budget_gate();
        if used >= limit {
            return Ok(Tick::OverBudget { used, limit });
        }

        let Some(raw) = self.broker.lpop(&self.keys.requests).await? else {
            return Ok(Tick::Idle);
        };
        let job: QueueJob = match serde_json::from_str(&raw) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(error = %e, payload_len = raw.len(), "dropping undecodable queue job");
                return Ok(Tick::Dropped);
            }
        };

        let span = tracing::debug_span!("job", request_id = %job.request_id);
        self.process(job).instrument(span).await
    }

    /// Call the client and record the outcome. The job is already off the
    /// list here, so its result is written before any other bookkeeping; a
    /// job is only lost if the results hash itself cannot be written.
    async fn process(&self, job: QueueJob) -> Result<Tick, QueueError> {
        let request_id = job.request_id;
        match self.client.complete(&job.params).await {
            Ok(done) => {
                self.store(request_id, &JobOutcome::Ok {
                    response: done.response,
                })
                .await?;
                let used = self
                    .broker
                    .incr_by(&self.keys.tpm, done.total_tokens, Some(self.config.tpm_window))
                    .await
                    .inspect_err(|e| {
                        tracing::error!(%request_id, tokens = done.total_tokens, error = %e, "failed to count tokens for completed job");
                    })?;
                tracing::info!(%request_id, tokens = done.total_tokens, window_total = used, "job completed");
                Ok(Tick::Completed {
                    request_id,
                    tokens: done.total_tokens,
                })
            }
            Err(CompletionError::RateLimited {
                retry_after,
                message,
            }) => {
                let wait = retry_after
                    .or_else(|| retry_after_from_message(&message))
                    .unwrap_or(self.config.default_backoff)
                    .min(self.config.max_backoff);
                self.store(request_id, &JobOutcome::Error {
                    message: format!("rate limited, retry after {}ms: {}", wait.as_millis(), message),
                    rate_limited: true,
                })
                .await?;
                self.start_backoff(wait).await?;
                tracing::warn!(%request_id, wait_ms = wait.as_millis() as u64, "provider rate limit; pausing queue");
                Ok(Tick::RateLimited { request_id, wait })
            }
            Err(CompletionError::Upstream(message)) => {
                tracing::warn!(%request_id, error = %message, "job failed");
                self.store(request_id, &JobOutcome::Error {
                    message,
                    rate_limited: false,
                })
                .await?;
                Ok(Tick::Failed { request_id })
            }
        }
    }

    /// Run until cancelled. Errors from a single pass are logged and the
    /// loop continues after an idle pause.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(namespace = %self.config.namespace, budget = self.config.tpm_budget, "queue worker running");
        while !cancel.is_cancelled() {
            let pause = match self.tick().await {
                Ok(Tick::BackingOff(remaining)) => remaining.min(self.config.idle),
                Ok(Tick::OverBudget { used, limit }) => {
                    tracing::debug!(used, limit, "token budget reached; waiting for window reset");
                    self.config.idle
                }
                Ok(Tick::Idle) => self.config.idle,
                Ok(_) => Duration::ZERO,
                Err(e) => {
                    tracing::error!(error = %e, "queue worker pass failed");
                    self.config.idle
                }
            };
            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        tracing::info!("queue worker stopped");
    }

    async fn backoff_remaining(&self) -> Result<Option<Duration>, QueueError> {
        let Some(raw) = self.broker.get(&self.keys.backoff_until).await? else {
            return Ok(None);
        };
        let Ok(until) = raw.parse::<i64>() else {
            tracing::warn!(value = %raw, "clearing unreadable backoff deadline");
            self.broker.del(&self.keys.backoff_until).await?;
            return Ok(None);
        };
        let remaining = until.saturating_sub(now_ms());
        Ok((remaining > 0).then(|| Duration::from_millis(remaining as u64)))
    }

    async fn tokens_used(&self) -> Result<i64, QueueError> {
        let raw = self.broker.get(&self.keys.tpm).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn start_backoff(&self, wait: Duration) -> Result<(), QueueError> {
        let until = deadline_ms(wait);
        // The key outlives the deadline slightly; readers compare against the value.
        self.broker
            .set(
                &self.keys.backoff_until,
                &until.to_string(),
                Some(wait.saturating_add(Duration::from_secs(1))),
            )
            .await?;
        Ok(())
    }

    async fn store(&self, request_id: uuid::Uuid, outcome: &JobOutcome) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(outcome)?;
        self.broker
            .hset(&self.keys.results, &request_id.to_string(), &encoded)
            .await
            .inspect_err(|e| tracing::error!(%request_id, error = %e, "failed to store job result; job is lost"))?;
        Ok(())
    }
}
