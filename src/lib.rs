//! runweave: execution tracking and coordination for agents that resolve
//! GitHub issues.
//!
//! - [`eventlog`]: each workflow run's history as a chain of immutable events,
//!   with run state derived at read time.
//! - [`ingest`]: consumer-group ingestion of producer event streams into the log.
//! - [`queue`]: a shared LLM request queue drained by one worker under a
//!   tokens-per-minute budget, with 429 backoff.
//! - [`lock`]: singleton refresh of shared credentials across processes.
//!
//! [`broker`] provides the shared key/value, list, hash and stream primitives
//! the coordination modules build on.

pub mod broker;
pub mod config;
pub mod db;
pub mod errors;
pub mod eventlog;
pub mod ingest;
pub mod lock;
pub mod queue;
pub mod telemetry;
