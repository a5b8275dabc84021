use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use runweave_common::{Event, EventKind, IssueRef, RunState, WorkflowRun, WorkflowState, WorkflowType};

use super::{Appended, RunMeta, RunSummary};
use crate::db;
use crate::errors::EventLogError;

const STARTS_WITH: &str = "STARTS_WITH";
const NEXT: &str = "NEXT";

/// Ordered walk of a run's chain: `STARTS_WITH` once, then `NEXT` repeatedly.
/// Binds `?1` to the run id; yields `(id, depth)`.
const CHAIN_CTE: &str = "
    WITH RECURSIVE chain(id, depth) AS (
        SELECT to_id, 0 FROM event_edges WHERE rel = 'STARTS_WITH' AND from_id = ?1
        UNION ALL
        SELECT e.to_id, chain.depth + 1
        FROM event_edges e JOIN chain ON e.rel = 'NEXT' AND e.from_id = chain.id
    )";

/// Graph-shaped event store: runs, events and the typed edges between them.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Open (or create) the store at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let store = Self {
            conn: db::open_file(path)?,
        };
        store.run_migrations().context("Failed to run event store migrations")?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let store = Self {
            conn: db::open_in_memory()?,
        };
        store.run_migrations().context("Failed to run event store migrations")?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id TEXT PRIMARY KEY,
                    workflow_type TEXT NOT NULL,
                    post_to_github INTEGER,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS events (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    event_type TEXT NOT NULL,
                    label TEXT,
                    content TEXT,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS event_edges (
                    rel TEXT NOT NULL CHECK (rel IN ('STARTS_WITH', 'NEXT')),
                    from_id TEXT NOT NULL,
                    to_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                    run_id TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    UNIQUE (rel, from_id),
                    UNIQUE (to_id)
                );

                CREATE TABLE IF NOT EXISTS run_issues (
                    run_id TEXT PRIMARY KEY REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    repo TEXT NOT NULL,
                    number INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id);
                CREATE INDEX IF NOT EXISTS idx_events_type ON events(run_id, event_type);
                CREATE INDEX IF NOT EXISTS idx_run_issues_issue ON run_issues(repo, number);
                ",
            )
            .context("Failed to create event store tables")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(
        &self,
        id: &str,
        workflow_type: WorkflowType,
        meta: &RunMeta,
    ) -> Result<WorkflowRun, EventLogError> {
        let tx = db::immediate(&self.conn)?;

        match get_run(&tx, id)? {
            Some(existing) => {
                if existing.workflow_type != workflow_type {
                    return Err(EventLogError::RunConflict {
                        id: id.to_string(),
                        field: "type",
                    });
                }
                if let (Some(a), Some(b)) = (existing.post_to_github, meta.post_to_github)
                    && a != b
                {
                    return Err(EventLogError::RunConflict {
                        id: id.to_string(),
                        field: "postToGithub",
                    });
                }
            }
            None => {
                let created_at = meta.created_at.unwrap_or_else(Utc::now);
                tx.execute(
                    "INSERT INTO workflow_runs (id, workflow_type, post_to_github, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![id, workflow_type.as_str(), meta.post_to_github, format_ts(&created_at)],
                )
                .context("Failed to insert workflow run")?;
            }
        }

        if let Some(issue) = &meta.issue {
            link_issue(&tx, id, issue)?;
        }

        let run = get_run(&tx, id)?.context("Workflow run not found after insert")?;
        tx.commit().context("Failed to commit workflow run")?;
        Ok(run)
    }

    pub fn link_issue(&self, run_id: &str, issue: &IssueRef) -> Result<WorkflowRun, EventLogError> {
        let tx = db::immediate(&self.conn)?;
        if get_run(&tx, run_id)?.is_none() {
            return Err(EventLogError::RunNotFound {
                id: run_id.to_string(),
            });
        }
        link_issue(&tx, run_id, issue)?;
        let run = get_run(&tx, run_id)?.context("Workflow run not found after link")?;
        tx.commit().context("Failed to commit issue link")?;
        Ok(run)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<WorkflowRun>, EventLogError> {
        get_run(&self.conn, id)
    }

    // ── Chain ─────────────────────────────────────────────────────────

    /// Append an event to a run's chain.
    ///
    /// The whole check-then-create runs in one immediate transaction: the
    /// duplicate check, the tail lookup and both inserts either all happen or
    /// none do.
    pub fn append(
        &self,
        run_id: &str,
        event: &Event,
        parent_id: Option<&str>,
    ) -> Result<Appended, EventLogError> {
        let tx = db::immediate(&self.conn)?;

        if get_run(&tx, run_id)?.is_none() {
            return Err(EventLogError::RunNotFound {
                id: run_id.to_string(),
            });
        }

        if let Some(existing_run) = event_run(&tx, &event.id)? {
            if existing_run != run_id {
                return Err(EventLogError::EventConflict {
                    id: event.id.clone(),
                    existing_run,
                    requested_run: run_id.to_string(),
                });
            }
            let stored = get_event(&tx, &event.id)?.context("Event vanished during duplicate check")?;
            return Ok(Appended {
                event: stored,
                inserted: false,
            });
        }

        let event_type = event.event_type();
        let payload = serde_json::to_string(&event.kind).context("Failed to encode event payload")?;
        tx.execute(
            "INSERT INTO events (id, run_id, event_type, label, content, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.id,
                run_id,
                event_type.as_str(),
                event_type.label().map(|l| l.as_str()),
                event.content,
                payload,
                format_ts(&event.created_at),
            ],
        )
        .context("Failed to insert event")?;

        match parent_id {
            Some(parent) => {
                if event_run(&tx, parent)?.as_deref() != Some(run_id) {
                    return Err(EventLogError::EventNotFound {
                        id: parent.to_string(),
                    });
                }
                // Splice: parent -> new -> parent's previous successor.
                let old_next = next_of(&tx, parent)?;
                if old_next.is_some() {
                    tx.execute(
                        "DELETE FROM event_edges WHERE rel = 'NEXT' AND from_id = ?1",
                        params![parent],
                    )
                    .context("Failed to detach parent edge")?;
                }
                insert_edge(&tx, NEXT, parent, &event.id, run_id)?;
                if let Some(next) = old_next {
                    insert_edge(&tx, NEXT, &event.id, &next, run_id)?;
                }
            }
            None => match tail(&tx, run_id)? {
                Some(tail_id) => insert_edge(&tx, NEXT, &tail_id, &event.id, run_id)?,
                None => insert_edge(&tx, STARTS_WITH, run_id, &event.id, run_id)?,
            },
        }

        let stored = get_event(&tx, &event.id)?.context("Event not found after insert")?;
        tx.commit().context("Failed to commit append")?;
        Ok(Appended {
            event: stored,
            inserted: true,
        })
    }

    pub fn read_chain(&self, run_id: &str) -> Result<Vec<Event>, EventLogError> {
        if get_run(&self.conn, run_id)?.is_none() {
            return Err(EventLogError::RunNotFound {
                id: run_id.to_string(),
            });
        }
        let sql = format!(
            "{CHAIN_CTE}
             SELECT ev.id, ev.content, ev.payload, ev.created_at
             FROM chain JOIN events ev ON ev.id = chain.id
             ORDER BY chain.depth"
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare read_chain")?;
        let rows = stmt
            .query_map(params![run_id], EventRow::from_row)
            .context("Failed to query chain")?;
        let mut events = Vec::new();
        for row in rows {
            let r = row.context("Failed to read event row")?;
            events.push(r.into_event()?);
        }
        Ok(events)
    }

    /// Latest declared state in chain order, together with the run.
    pub fn latest_state(
        &self,
        run_id: &str,
    ) -> Result<(WorkflowRun, Option<WorkflowState>), EventLogError> {
        let run = get_run(&self.conn, run_id)?.ok_or_else(|| EventLogError::RunNotFound {
            id: run_id.to_string(),
        })?;
        let sql = format!(
            "{CHAIN_CTE}
             SELECT ev.payload
             FROM chain JOIN events ev ON ev.id = chain.id
             WHERE ev.event_type = 'workflow_state'
             ORDER BY chain.depth DESC LIMIT 1"
        );
        let payload: Option<String> = self
            .conn
            .query_row(&sql, params![run_id], |row| row.get(0))
            .optional()
            .context("Failed to query latest workflow state")?;
        let state = match payload {
            Some(p) => match serde_json::from_str::<EventKind>(&p)
                .context("Corrupt workflow_state payload")?
            {
                EventKind::WorkflowState { state } => Some(state),
                _ => None,
            },
            None => None,
        };
        Ok((run, state))
    }

    pub fn derive_state_at(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Result<RunState, EventLogError> {
        let (run, latest) = self.latest_state(run_id)?;
        Ok(RunState::derive(latest, run.created_at, now, timeout))
    }

    /// Remove an event, relinking its predecessor to its successor.
    pub fn delete_event(&self, event_id: &str) -> Result<(), EventLogError> {
        let tx = db::immediate(&self.conn)?;
        let run_id = event_run(&tx, event_id)?.ok_or_else(|| EventLogError::EventNotFound {
            id: event_id.to_string(),
        })?;

        let incoming: Option<(String, String)> = tx
            .query_row(
                "SELECT rel, from_id FROM event_edges WHERE to_id = ?1",
                params![event_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query incoming edge")?;
        let outgoing = next_of(&tx, event_id)?;

        tx.execute(
            "DELETE FROM event_edges WHERE to_id = ?1 OR (rel = 'NEXT' AND from_id = ?1)",
            params![event_id],
        )
        .context("Failed to detach event edges")?;
        tx.execute("DELETE FROM events WHERE id = ?1", params![event_id])
            .context("Failed to delete event")?;

        if let (Some((rel, from_id)), Some(next)) = (incoming, outgoing) {
            insert_edge(&tx, &rel, &from_id, &next, &run_id)?;
        }

        tx.commit().context("Failed to commit event deletion")?;
        Ok(())
    }

    // ── Read models ───────────────────────────────────────────────────

    pub fn list_runs(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Result<Vec<RunSummary>, EventLogError> {
        let ids = self.query_ids(
            "SELECT id FROM workflow_runs ORDER BY created_at DESC, id LIMIT ?1",
            params![limit],
        )?;
        self.summaries(ids, now, timeout)
    }

    pub fn runs_for_issue(
        &self,
        issue: &IssueRef,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Result<Vec<RunSummary>, EventLogError> {
        let ids = self.query_ids(
            "SELECT r.id FROM workflow_runs r JOIN run_issues i ON i.run_id = r.id
             WHERE i.repo = ?1 AND i.number = ?2
             ORDER BY r.created_at DESC, r.id",
            params![issue.repo, issue.number],
        )?;
        self.summaries(ids, now, timeout)
    }

    fn query_ids(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<String>, EventLogError> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare run query")?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, String>(0))
            .context("Failed to query runs")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read run id")?);
        }
        Ok(ids)
    }

    fn summaries(
        &self,
        ids: Vec<String>,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Result<Vec<RunSummary>, EventLogError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let (run, latest) = self.latest_state(&id)?;
            let event_count: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM events WHERE run_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .context("Failed to count events")?;
            let state = RunState::derive(latest, run.created_at, now, timeout);
            out.push(RunSummary {
                run,
                event_count,
                state,
            });
        }
        Ok(out)
    }
}

// ── Helpers shared by the transactional paths ─────────────────────────

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

fn get_run(conn: &Connection, id: &str) -> Result<Option<WorkflowRun>, EventLogError> {
    let row = conn
        .query_row(
            "SELECT r.id, r.workflow_type, r.post_to_github, r.created_at, i.repo, i.number
             FROM workflow_runs r LEFT JOIN run_issues i ON i.run_id = r.id
             WHERE r.id = ?1",
            params![id],
            |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    workflow_type: row.get(1)?,
                    post_to_github: row.get(2)?,
                    created_at: row.get(3)?,
                    issue_repo: row.get(4)?,
                    issue_number: row.get(5)?,
                })
            },
        )
        .optional()
        .context("Failed to query workflow run")?;
    match row {
        Some(r) => Ok(Some(r.into_run()?)),
        None => Ok(None),
    }
}

fn link_issue(conn: &Connection, run_id: &str, issue: &IssueRef) -> Result<(), EventLogError> {
    let existing: Option<(String, i64)> = conn
        .query_row(
            "SELECT repo, number FROM run_issues WHERE run_id = ?1",
            params![run_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("Failed to query issue link")?;
    match existing {
        Some((repo, number)) if repo == issue.repo && number == issue.number => Ok(()),
        Some(_) => Err(EventLogError::RunConflict {
            id: run_id.to_string(),
            field: "issue",
        }),
        None => {
            conn.execute(
                "INSERT INTO run_issues (run_id, repo, number) VALUES (?1, ?2, ?3)",
                params![run_id, issue.repo, issue.number],
            )
            .context("Failed to link issue")?;
            Ok(())
        }
    }
}

fn event_run(conn: &Connection, event_id: &str) -> Result<Option<String>, EventLogError> {
    Ok(conn
        .query_row(
            "SELECT run_id FROM events WHERE id = ?1",
            params![event_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to look up event")?)
}

fn get_event(conn: &Connection, event_id: &str) -> Result<Option<Event>, EventLogError> {
    let row = conn
        .query_row(
            "SELECT id, content, payload, created_at FROM events WHERE id = ?1",
            params![event_id],
            EventRow::from_row,
        )
        .optional()
        .context("Failed to query event")?;
    match row {
        Some(r) => Ok(Some(r.into_event()?)),
        None => Ok(None),
    }
}

fn next_of(conn: &Connection, event_id: &str) -> Result<Option<String>, EventLogError> {
    Ok(conn
        .query_row(
            "SELECT to_id FROM event_edges WHERE rel = 'NEXT' AND from_id = ?1",
            params![event_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query next edge")?)
}

/// Last event reachable from the run's head, if any.
fn tail(conn: &Connection, run_id: &str) -> Result<Option<String>, EventLogError> {
    let sql = format!("{CHAIN_CTE} SELECT id FROM chain ORDER BY depth DESC LIMIT 1");
    Ok(conn
        .query_row(&sql, params![run_id], |row| row.get(0))
        .optional()
        .context("Failed to locate chain tail")?)
}

fn insert_edge(
    conn: &Connection,
    rel: &str,
    from_id: &str,
    to_id: &str,
    run_id: &str,
) -> Result<(), EventLogError> {
    conn.execute(
        "INSERT INTO event_edges (rel, from_id, to_id, run_id) VALUES (?1, ?2, ?3, ?4)",
        params![rel, from_id, to_id, run_id],
    )
    .with_context(|| format!("Failed to link {} -[{}]-> {}", from_id, rel, to_id))?;
    Ok(())
}

struct RunRow {
    id: String,
    workflow_type: String,
    post_to_github: Option<bool>,
    created_at: String,
    issue_repo: Option<String>,
    issue_number: Option<i64>,
}

impl RunRow {
    fn into_run(self) -> Result<WorkflowRun> {
        let workflow_type = WorkflowType::from_str(&self.workflow_type).map_err(|e| anyhow::anyhow!(e))?;
        let issue = match (self.issue_repo, self.issue_number) {
            (Some(repo), Some(number)) => Some(IssueRef::new(repo, number)),
            _ => None,
        };
        Ok(WorkflowRun {
            id: self.id,
            workflow_type,
            created_at: parse_ts(&self.created_at)?,
            post_to_github: self.post_to_github,
            issue,
        })
    }
}

struct EventRow {
    id: String,
    content: Option<String>,
    payload: String,
    created_at: String,
}

impl EventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            payload: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        let kind: EventKind = serde_json::from_str(&self.payload)
            .with_context(|| format!("Corrupt payload for event {}", self.id))?;
        Ok(Event {
            created_at: parse_ts(&self.created_at)?,
            id: self.id,
            content: self.content,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_with_run(id: &str) -> Result<EventStore> {
        let store = EventStore::new_in_memory()?;
        store.create_run(id, WorkflowType::ResolveIssue, &RunMeta::default())?;
        Ok(store)
    }

    fn status(id: &str, text: &str) -> Event {
        Event::with_id(id, EventKind::Status, Some(text.to_string()))
    }

    fn chain_ids(store: &EventStore, run_id: &str) -> Result<Vec<String>> {
        Ok(store.read_chain(run_id)?.into_iter().map(|e| e.id).collect())
    }

    /// Events of the run with no outgoing NEXT edge.
    fn dangling_tails(store: &EventStore, run_id: &str) -> Result<i64> {
        Ok(store.conn.query_row(
            "SELECT COUNT(*) FROM events ev WHERE ev.run_id = ?1
             AND NOT EXISTS (SELECT 1 FROM event_edges e WHERE e.rel = 'NEXT' AND e.from_id = ev.id)",
            params![run_id],
            |row| row.get(0),
        )?)
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let store = EventStore::new_in_memory()?;
        let tables: Vec<String> = {
            let mut stmt = store
                .conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            names
        };
        for t in ["event_edges", "events", "run_issues", "workflow_runs"] {
            assert!(tables.iter().any(|name| name == t), "missing table {}", t);
        }
        // Migrations are idempotent.
        store.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_create_run_is_idempotent_for_identical_arguments() -> Result<()> {
        let store = EventStore::new_in_memory()?;
        let meta = RunMeta {
            post_to_github: Some(true),
            ..Default::default()
        };
        let first = store.create_run("run-1", WorkflowType::ResolveIssue, &meta)?;
        let second = store.create_run("run-1", WorkflowType::ResolveIssue, &meta)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_create_run_rejects_conflicting_type() -> Result<()> {
        let store = store_with_run("run-1")?;
        let err = store
            .create_run("run-1", WorkflowType::ApplyReview, &RunMeta::default())
            .unwrap_err();
        assert!(matches!(err, EventLogError::RunConflict { field: "type", .. }));
        Ok(())
    }

    #[test]
    fn test_create_run_rejects_conflicting_post_flag() -> Result<()> {
        let store = EventStore::new_in_memory()?;
        let yes = RunMeta {
            post_to_github: Some(true),
            ..Default::default()
        };
        let no = RunMeta {
            post_to_github: Some(false),
            ..Default::default()
        };
        store.create_run("run-1", WorkflowType::ResolveIssue, &yes)?;
        let err = store
            .create_run("run-1", WorkflowType::ResolveIssue, &no)
            .unwrap_err();
        assert!(matches!(err, EventLogError::RunConflict { field: "postToGithub", .. }));
        Ok(())
    }

    #[test]
    fn test_create_run_links_issue_on_second_call() -> Result<()> {
        let store = store_with_run("run-1")?;
        let meta = RunMeta {
            issue: Some(IssueRef::new("acme/widgets", 7)),
            ..Default::default()
        };
        let run = store.create_run("run-1", WorkflowType::ResolveIssue, &meta)?;
        assert_eq!(run.issue, Some(IssueRef::new("acme/widgets", 7)));

        // Linking again to the same issue is fine, a different one is not.
        store.link_issue("run-1", &IssueRef::new("acme/widgets", 7))?;
        let err = store
            .link_issue("run-1", &IssueRef::new("acme/widgets", 8))
            .unwrap_err();
        assert!(matches!(err, EventLogError::RunConflict { field: "issue", .. }));
        Ok(())
    }

    #[test]
    fn test_append_first_event_creates_head() -> Result<()> {
        let store = store_with_run("run-1")?;
        let appended = store.append("run-1", &status("e1", "cloning"), None)?;
        assert!(appended.inserted);
        let head: String = store.conn.query_row(
            "SELECT to_id FROM event_edges WHERE rel = 'STARTS_WITH' AND from_id = 'run-1'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(head, "e1");
        Ok(())
    }

    #[test]
    fn test_chain_integrity_preserves_append_order() -> Result<()> {
        let store = store_with_run("run-1")?;
        let ids: Vec<String> = (0..12).map(|i| format!("e{}", i)).collect();
        for id in &ids {
            store.append("run-1", &status(id, "step"), None)?;
        }
        assert_eq!(chain_ids(&store, "run-1")?, ids);
        assert_eq!(dangling_tails(&store, "run-1")?, 1);
        Ok(())
    }

    #[test]
    fn test_duplicate_append_is_a_no_op() -> Result<()> {
        let store = store_with_run("run-1")?;
        store.append("run-1", &status("e1", "first"), None)?;
        store.append("run-1", &status("e2", "second"), None)?;
        let again = store.append("run-1", &status("e1", "first, redelivered"), None)?;

        assert!(!again.inserted);
        assert_eq!(again.event.content.as_deref(), Some("first"));
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM events WHERE id = 'e1'", [], |r| r.get(0))?;
        assert_eq!(count, 1);
        assert_eq!(chain_ids(&store, "run-1")?, vec!["e1", "e2"]);
        Ok(())
    }

    #[test]
    fn test_append_same_id_to_other_run_conflicts() -> Result<()> {
        let store = store_with_run("run-1")?;
        store.create_run("run-2", WorkflowType::ApplyReview, &RunMeta::default())?;
        store.append("run-1", &status("e1", "x"), None)?;
        let err = store.append("run-2", &status("e1", "x"), None).unwrap_err();
        assert!(matches!(err, EventLogError::EventConflict { .. }));
        Ok(())
    }

    #[test]
    fn test_append_to_missing_run_leaves_no_orphan() -> Result<()> {
        let store = EventStore::new_in_memory()?;
        let err = store.append("ghost", &status("e1", "x"), None).unwrap_err();
        assert!(matches!(err, EventLogError::RunNotFound { .. }));
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn test_append_with_unknown_parent_rolls_back() -> Result<()> {
        let store = store_with_run("run-1")?;
        store.append("run-1", &status("e1", "x"), None)?;
        let err = store
            .append("run-1", &status("e2", "y"), Some("nope"))
            .unwrap_err();
        assert!(matches!(err, EventLogError::EventNotFound { ref id } if id == "nope"));
        assert!(get_event(&store.conn, "e2")?.is_none());
        assert_eq!(chain_ids(&store, "run-1")?, vec!["e1"]);
        Ok(())
    }

    #[test]
    fn test_append_with_parent_from_other_run_is_not_found() -> Result<()> {
        let store = store_with_run("run-1")?;
        store.create_run("run-2", WorkflowType::ResolveIssue, &RunMeta::default())?;
        store.append("run-2", &status("other", "x"), None)?;
        let err = store
            .append("run-1", &status("e1", "y"), Some("other"))
            .unwrap_err();
        assert!(matches!(err, EventLogError::EventNotFound { .. }));
        Ok(())
    }

    #[test]
    fn test_append_with_parent_splices_after_parent() -> Result<()> {
        let store = store_with_run("run-1")?;
        for id in ["a", "b", "c"] {
            store.append("run-1", &status(id, id), None)?;
        }
        store.append("run-1", &status("x", "inserted"), Some("a"))?;
        assert_eq!(chain_ids(&store, "run-1")?, vec!["a", "x", "b", "c"]);

        // Appending after the tail through an explicit parent is a plain append.
        store.append("run-1", &status("y", "end"), Some("c"))?;
        assert_eq!(chain_ids(&store, "run-1")?, vec!["a", "x", "b", "c", "y"]);
        assert_eq!(dangling_tails(&store, "run-1")?, 1);
        Ok(())
    }

    #[test]
    fn test_delete_middle_event_relinks_neighbours() -> Result<()> {
        let store = store_with_run("run-1")?;
        for id in ["a", "b", "c"] {
            store.append("run-1", &status(id, id), None)?;
        }
        store.delete_event("b")?;
        assert_eq!(chain_ids(&store, "run-1")?, vec!["a", "c"]);
        Ok(())
    }

    #[test]
    fn test_delete_head_moves_starts_with() -> Result<()> {
        let store = store_with_run("run-1")?;
        for id in ["a", "b"] {
            store.append("run-1", &status(id, id), None)?;
        }
        store.delete_event("a")?;
        assert_eq!(chain_ids(&store, "run-1")?, vec!["b"]);
        store.append("run-1", &status("c", "c"), None)?;
        assert_eq!(chain_ids(&store, "run-1")?, vec!["b", "c"]);
        Ok(())
    }

    #[test]
    fn test_delete_tail_and_sole_event() -> Result<()> {
        let store = store_with_run("run-1")?;
        for id in ["a", "b"] {
            store.append("run-1", &status(id, id), None)?;
        }
        store.delete_event("b")?;
        assert_eq!(chain_ids(&store, "run-1")?, vec!["a"]);
        store.delete_event("a")?;
        assert!(chain_ids(&store, "run-1")?.is_empty());
        let edges: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM event_edges", [], |r| r.get(0))?;
        assert_eq!(edges, 0);
        Ok(())
    }

    #[test]
    fn test_delete_unknown_event_is_not_found() -> Result<()> {
        let store = store_with_run("run-1")?;
        let err = store.delete_event("missing").unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[test]
    fn test_read_chain_of_missing_run_is_not_found() -> Result<()> {
        let store = EventStore::new_in_memory()?;
        assert!(matches!(
            store.read_chain("ghost").unwrap_err(),
            EventLogError::RunNotFound { .. }
        ));
        Ok(())
    }

    #[test]
    fn test_timeout_derivation_is_read_only() -> Result<()> {
        let store = EventStore::new_in_memory()?;
        let meta = RunMeta {
            created_at: Some(Utc::now() - Duration::hours(2)),
            ..Default::default()
        };
        store.create_run("run-1", WorkflowType::ResolveIssue, &meta)?;
        let running = Event::with_id(
            "s1",
            EventKind::WorkflowState {
                state: WorkflowState::Running,
            },
            None,
        );
        store.append("run-1", &running, None)?;

        let state = store.derive_state_at("run-1", Utc::now(), Duration::hours(1))?;
        assert_eq!(state, RunState::TimedOut);

        let chain = store.read_chain("run-1")?;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].declared_state(), Some(WorkflowState::Running));
        Ok(())
    }

    #[test]
    fn test_latest_state_follows_chain_order() -> Result<()> {
        let store = store_with_run("run-1")?;
        let state = |id: &str, s| {
            Event::with_id(id, EventKind::WorkflowState { state: s }, None)
        };
        store.append("run-1", &state("s1", WorkflowState::Running), None)?;
        store.append("run-1", &status("e1", "working"), None)?;
        store.append("run-1", &state("s2", WorkflowState::Error), None)?;
        let now = Utc::now();
        assert_eq!(
            store.derive_state_at("run-1", now, Duration::hours(1))?,
            RunState::Error
        );
        Ok(())
    }

    #[test]
    fn test_list_runs_and_runs_for_issue() -> Result<()> {
        let store = EventStore::new_in_memory()?;
        let issue = IssueRef::new("acme/widgets", 3);
        store.create_run(
            "run-a",
            WorkflowType::ResolveIssue,
            &RunMeta {
                issue: Some(issue.clone()),
                created_at: Some(Utc::now() - Duration::minutes(10)),
                ..Default::default()
            },
        )?;
        store.create_run("run-b", WorkflowType::ApplyReview, &RunMeta::default())?;
        store.append("run-a", &status("e1", "x"), None)?;

        let now = Utc::now();
        let runs = store.list_runs(10, now, Duration::hours(1))?;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run.id, "run-b");
        assert_eq!(runs[1].event_count, 1);

        let linked = store.runs_for_issue(&issue, now, Duration::hours(1))?;
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].run.id, "run-a");
        assert_eq!(linked[0].state, RunState::Running);
        Ok(())
    }
}
