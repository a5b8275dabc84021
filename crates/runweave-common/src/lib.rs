//! Shared domain types for runweave.
//!
//! Producers (workflow executors) and the ingestion/read side agree on these
//! types: a [`WorkflowRun`] owns an ordered chain of immutable [`Event`]s, and
//! the run's effective state is derived from that chain at read time.

pub mod event;
pub mod run;

pub use event::{Event, EventKind, EventLabel, EventType};
pub use run::{IssueRef, RunState, WorkflowRun, WorkflowState, WorkflowType};
