//! Typed error hierarchy for runweave.
//!
//! One enum per mechanism:
//! - `EventLogError`: run/event chain store failures
//! - `BrokerError`: key/value and stream store failures
//! - `IngestError`: stream ingestion failures
//! - `CompletionError` / `QueueError`: rate-limited request queue failures
//! - `RefreshError`: singleton credential refresh failures
//!
//! Store internals attach context with `anyhow` and surface it through the
//! `Database` variants.

use std::time::Duration;

use thiserror::Error;

/// Errors from the event log.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Workflow run {id} not found")]
    RunNotFound { id: String },

    #[error("Event {id} not found")]
    EventNotFound { id: String },

    #[error("Workflow run {id} already exists with different {field}")]
    RunConflict { id: String, field: &'static str },

    #[error("Event {id} already belongs to run {existing_run}, not {requested_run}")]
    EventConflict {
        id: String,
        existing_run: String,
        requested_run: String,
    },

    #[error("Database error: {0:#}")]
    Database(#[from] anyhow::Error),
}

impl EventLogError {
    /// NotFound errors are never retried by callers.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EventLogError::RunNotFound { .. } | EventLogError::EventNotFound { .. }
        )
    }

    /// Whether re-applying the same request can ever succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            EventLogError::RunConflict { .. }
                | EventLogError::EventConflict { .. }
                | EventLogError::EventNotFound { .. }
        )
    }
}

/// Errors from the broker store.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Consumer group '{group}' does not exist on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    #[error("Invalid stream entry id '{0}'")]
    InvalidStreamId(String),

    #[error("Database error: {0:#}")]
    Database(#[from] anyhow::Error),
}

/// Errors from stream ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Malformed stream entry: {0}")]
    Malformed(String),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors reported by the token-metered external service.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Rate limited by provider: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),
}

/// Errors surfaced to callers of the rate-limited queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("No result for request {request_id} after {}ms", .waited.as_millis())]
    Timeout {
        request_id: uuid::Uuid,
        waited: Duration,
    },

    #[error("Request failed: {0}")]
    Upstream(String),

    #[error("Failed to encode or decode queue payload: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors from the singleton refresh lock.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Credential refresh for '{subject}' did not complete after {attempts} attempts; re-authenticate")]
    Exhausted { subject: String, attempts: u32 },

    #[error("Credential refresh failed: {0:#}")]
    Refresh(#[source] anyhow::Error),

    #[error("Failed to encode or decode cached credential: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
