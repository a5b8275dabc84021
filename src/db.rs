//! SQLite plumbing shared by the event log and the broker.
//!
//! Every participating process opens its own connection to the same database
//! file. Cross-process atomicity comes from SQLite's file lock: writes that
//! must read-then-modify run inside `BEGIN IMMEDIATE` transactions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Open (or create) a database file configured for multi-process access.
pub fn open_file(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("Failed to set busy timeout")?;
    let mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .context("Failed to enable WAL journal")?;
    tracing::debug!(path = %path.display(), journal_mode = %mode, "opened database");
    configure(&conn)?;
    Ok(conn)
}

/// Create an in-memory database (for testing).
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .context("Failed to enable foreign keys")
}

/// Start a transaction that takes the write lock up front.
///
/// Two processes that both read-then-write inside immediate transactions are
/// serialized by SQLite; the second one waits (up to the busy timeout) and
/// then observes the first one's writes.
pub fn immediate(conn: &Connection) -> Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .context("Failed to begin immediate transaction")
}

/// Async-safe handle to a store.
///
/// Wraps the store behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// off the async worker threads.
pub struct DbHandle<T> {
    inner: Arc<std::sync::Mutex<T>>,
}

impl<T> Clone for DbHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> DbHandle<T> {
    pub fn new(db: T) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R, E>(&self, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&T) -> std::result::Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<anyhow::Error> + Send + 'static,
    {
        let db = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || -> std::result::Result<R, E> {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .map_err(|e| E::from(anyhow::Error::new(e).context("DB task panicked")))?
    }
}
