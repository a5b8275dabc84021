//! Event log: the append-only, graph-shaped history of every workflow run.
//!
//! ## Shape
//!
//! ```text
//! (WorkflowRun) -[STARTS_WITH]-> (Event) -[NEXT]-> (Event) -[NEXT]-> ... (tail)
//!       |
//!       +-[BASED_ON_ISSUE]-> owner/repo#N
//! ```
//!
//! Each run has at most one `STARTS_WITH` edge and each event at most one
//! outgoing and one incoming edge, so the chain is always a simple linked
//! list. An explicit parent splices the new event in after the parent.
//!
//! Run state is never stored: [`EventLog::derive_state`] reads the latest
//! `workflow_state` event and reports long-running runs as timed out.

pub mod store;

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use runweave_common::{Event, IssueRef, RunState, WorkflowRun, WorkflowType};
use serde::Serialize;

pub use store::EventStore;

use crate::db::DbHandle;
use crate::errors::EventLogError;

/// Default age, in seconds, after which a still-running run is reported as timed out.
pub const DEFAULT_RUN_TIMEOUT_SECS: i64 = 3600;

/// Optional fields supplied when a run is created.
#[derive(Debug, Clone, Default)]
pub struct RunMeta {
    pub post_to_github: Option<bool>,
    pub issue: Option<IssueRef>,
    /// Launch time; defaults to now.
    pub created_at: Option<DateTime<Utc>>,
}

/// Outcome of an append. `inserted` is false when the id was already present.
#[derive(Debug, Clone, Serialize)]
pub struct Appended {
    pub event: Event,
    pub inserted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    #[serde(flatten)]
    pub run: WorkflowRun,
    pub event_count: i64,
    pub state: RunState,
}

/// Async handle to the event store, shared freely between tasks.
#[derive(Clone)]
pub struct EventLog {
    db: DbHandle<EventStore>,
    run_timeout: chrono::Duration,
}

impl EventLog {
    pub fn new(store: EventStore, run_timeout: chrono::Duration) -> Self {
        Self {
            db: DbHandle::new(store),
            run_timeout,
        }
    }

    pub fn open(path: &Path, run_timeout: chrono::Duration) -> Result<Self> {
        Ok(Self::new(EventStore::new(path)?, run_timeout))
    }

    /// In-memory log with the default timeout (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(
            EventStore::new_in_memory()?,
            chrono::Duration::seconds(DEFAULT_RUN_TIMEOUT_SECS),
        ))
    }

    pub fn run_timeout(&self) -> chrono::Duration {
        self.run_timeout
    }

    /// Create a run, or return it unchanged if it already exists with the
    /// same fields. An issue in `meta` is linked either way.
    pub async fn create_run(
        &self,
        id: &str,
        workflow_type: WorkflowType,
        meta: RunMeta,
    ) -> Result<WorkflowRun, EventLogError> {
        let id = id.to_string();
        let run = self
            .db
            .call(move |s| s.create_run(&id, workflow_type, &meta))
            .await?;
        tracing::debug!(run_id = %run.id, workflow_type = %run.workflow_type, "workflow run created");
        Ok(run)
    }

    pub async fn link_issue(&self, run_id: &str, issue: IssueRef) -> Result<WorkflowRun, EventLogError> {
        let run_id = run_id.to_string();
        self.db.call(move |s| s.link_issue(&run_id, &issue)).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, EventLogError> {
        let id = run_id.to_string();
        self.db
            .call(move |s| {
                s.get_run(&id)?
                    .ok_or(EventLogError::RunNotFound { id: id.clone() })
            })
            .await
    }

    /// Append `event` at the tail of the run's chain, or right after
    /// `parent_id` when given. Re-appending a known id is a no-op.
    pub async fn append(
        &self,
        run_id: &str,
        event: Event,
        parent_id: Option<&str>,
    ) -> Result<Appended, EventLogError> {
        let run_id = run_id.to_string();
        let parent_id = parent_id.map(str::to_string);
        let appended = self
            .db
            .call(move |s| s.append(&run_id, &event, parent_id.as_deref()))
            .await?;
        if appended.inserted {
            tracing::trace!(event_id = %appended.event.id, event_type = %appended.event.event_type(), "event appended");
        } else {
            tracing::debug!(event_id = %appended.event.id, "duplicate event ignored");
        }
        Ok(appended)
    }

    /// Full ordered history of a run. Each call is a fresh traversal.
    pub async fn read_chain(&self, run_id: &str) -> Result<Vec<Event>, EventLogError> {
        let run_id = run_id.to_string();
        self.db.call(move |s| s.read_chain(&run_id)).await
    }

    pub async fn derive_state(&self, run_id: &str) -> Result<RunState, EventLogError> {
        self.derive_state_at(run_id, Utc::now()).await
    }

    pub async fn derive_state_at(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RunState, EventLogError> {
        let run_id = run_id.to_string();
        let timeout = self.run_timeout;
        self.db
            .call(move |s| s.derive_state_at(&run_id, now, timeout))
            .await
    }

    pub async fn delete_event(&self, event_id: &str) -> Result<(), EventLogError> {
        let event_id = event_id.to_string();
        self.db.call(move |s| s.delete_event(&event_id)).await
    }

    /// Most recently created runs first.
    pub async fn list_runs(&self, limit: i64) -> Result<Vec<RunSummary>, EventLogError> {
        let timeout = self.run_timeout;
        self.db
            .call(move |s| s.list_runs(limit, Utc::now(), timeout))
            .await
    }

    pub async fn runs_for_issue(&self, issue: IssueRef) -> Result<Vec<RunSummary>, EventLogError> {
        let timeout = self.run_timeout;
        self.db
            .call(move |s| s.runs_for_issue(&issue, Utc::now(), timeout))
            .await
    }
}
