use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::db;
use crate::errors::BrokerError;

/// Current wall-clock time in epoch milliseconds. All expiries are absolute.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Epoch milliseconds `after` from now, saturating instead of overflowing.
pub fn deadline_ms(after: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(after.as_millis()).unwrap_or(i64::MAX))
}

pub(crate) fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(deadline_ms)
}

/// Key/value, list, hash and stream store shared by all processes.
pub struct BrokerStore {
    pub(super) conn: Connection,
}

impl BrokerStore {
    /// Open (or create) the broker at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let store = Self {
            conn: db::open_file(path)?,
        };
        store.run_migrations().context("Failed to run broker migrations")?;
        Ok(store)
    }

    /// Create an in-memory broker (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let store = Self {
            conn: db::open_in_memory()?,
        };
        store.run_migrations().context("Failed to run broker migrations")?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    expires_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS list_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS hash_fields (
                    key TEXT NOT NULL,
                    field TEXT NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (key, field)
                );

                CREATE TABLE IF NOT EXISTS streams (
                    stream TEXT PRIMARY KEY,
                    last_ms INTEGER NOT NULL DEFAULT 0,
                    last_seq INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS stream_clock (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    last_ms INTEGER NOT NULL,
                    last_seq INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS stream_entries (
                    stream TEXT NOT NULL REFERENCES streams(stream) ON DELETE CASCADE,
                    ms INTEGER NOT NULL,
                    seq INTEGER NOT NULL,
                    fields TEXT NOT NULL,
                    PRIMARY KEY (stream, ms, seq)
                );

                CREATE TABLE IF NOT EXISTS stream_groups (
                    stream TEXT NOT NULL REFERENCES streams(stream) ON DELETE CASCADE,
                    group_name TEXT NOT NULL,
                    last_ms INTEGER NOT NULL,
                    last_seq INTEGER NOT NULL,
                    PRIMARY KEY (stream, group_name)
                );

                CREATE TABLE IF NOT EXISTS stream_pending (
                    stream TEXT NOT NULL,
                    group_name TEXT NOT NULL,
                    ms INTEGER NOT NULL,
                    seq INTEGER NOT NULL,
                    consumer TEXT NOT NULL,
                    delivered_at INTEGER NOT NULL,
                    delivery_count INTEGER NOT NULL,
                    PRIMARY KEY (stream, group_name, ms, seq),
                    FOREIGN KEY (stream, group_name)
                        REFERENCES stream_groups(stream, group_name) ON DELETE CASCADE
                );

                CREATE INDEX IF NOT EXISTS idx_list_items_key ON list_items(key, id);
                CREATE INDEX IF NOT EXISTS idx_kv_expiry ON kv(expires_at) WHERE expires_at IS NOT NULL;
                ",
            )
            .context("Failed to create broker tables")?;
        Ok(())
    }

    // ── Keys ──────────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_ms()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read key")?)
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        self.conn
            .execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
                params![key, value, expiry(ttl)],
            )
            .context("Failed to write key")?;
        Ok(())
    }

    /// Create `key` only if it is absent (or expired). Returns whether this
    /// call created it.
    pub fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, BrokerError> {
        let tx = db::immediate(&self.conn)?;
        tx.execute(
            "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, now_ms()],
        )
        .context("Failed to clear expired key")?;
        let created = tx
            .execute(
                "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expiry(ttl)],
            )
            .context("Failed to create key")?;
        tx.commit().context("Failed to commit set_nx")?;
        Ok(created == 1)
    }

    pub fn del(&self, key: &str) -> Result<bool, BrokerError> {
        let n = self
            .conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .context("Failed to delete key")?;
        Ok(n > 0)
    }

    /// Delete `key` only while it still holds `expected`.
    pub fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, BrokerError> {
        let n = self
            .conn
            .execute(
                "DELETE FROM kv WHERE key = ?1 AND value = ?2
                 AND (expires_at IS NULL OR expires_at > ?3)",
                params![key, expected, now_ms()],
            )
            .context("Failed to compare-and-delete key")?;
        Ok(n > 0)
    }

    /// Add `delta` to an integer key. A missing or expired key starts from
    /// zero and gets `ttl_if_new`; an existing key keeps its expiry.
    pub fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl_if_new: Option<Duration>,
    ) -> Result<i64, BrokerError> {
        let tx = db::immediate(&self.conn)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_ms()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read counter")?;
        let next = match current {
            Some(raw) => {
                let n: i64 = raw
                    .parse()
                    .with_context(|| format!("Key {} does not hold an integer", key))?;
                tx.execute(
                    "UPDATE kv SET value = ?2 WHERE key = ?1",
                    params![key, n.saturating_add(delta).to_string()],
                )
                .context("Failed to update counter")?;
                n.saturating_add(delta)
            }
            None => {
                tx.execute(
                    "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
                    params![key, delta.to_string(), expiry(ttl_if_new)],
                )
                .context("Failed to create counter")?;
                delta
            }
        };
        tx.commit().context("Failed to commit counter")?;
        Ok(next)
    }

    /// Remaining time to live. `None` for missing keys and keys without expiry.
    pub fn ttl(&self, key: &str) -> Result<Option<Duration>, BrokerError> {
        let expires_at: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT expires_at FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_ms()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read key expiry")?;
        Ok(expires_at
            .flatten()
            .map(|at| Duration::from_millis((at - now_ms()).max(0) as u64)))
    }

    // ── Lists ─────────────────────────────────────────────────────────

    /// Append to the tail of a list; returns the new length.
    pub fn rpush(&self, key: &str, value: &str) -> Result<i64, BrokerError> {
        self.conn
            .execute(
                "INSERT INTO list_items (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .context("Failed to push list item")?;
        self.llen(key)
    }

    /// Remove and return the head of a list. Two concurrent callers never
    /// receive the same item.
    pub fn lpop(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self
            .conn
            .query_row(
                "DELETE FROM list_items
                 WHERE id = (SELECT MIN(id) FROM list_items WHERE key = ?1)
                 RETURNING value",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to pop list item")?)
    }

    pub fn llen(&self, key: &str) -> Result<i64, BrokerError> {
        Ok(self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM list_items WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .context("Failed to count list items")?)
    }

    // ── Hashes ────────────────────────────────────────────────────────

    pub fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        self.conn
            .execute(
                "INSERT INTO hash_fields (key, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, field) DO UPDATE SET value = ?3",
                params![key, field, value],
            )
            .context("Failed to write hash field")?;
        Ok(())
    }

    pub fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM hash_fields WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read hash field")?)
    }

    /// Read and delete a hash field in one step.
    pub fn htake(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        Ok(self
            .conn
            .query_row(
                "DELETE FROM hash_fields WHERE key = ?1 AND field = ?2 RETURNING value",
                params![key, field],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to take hash field")?)
    }

    pub fn hlen(&self, key: &str) -> Result<i64, BrokerError> {
        Ok(self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM hash_fields WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .context("Failed to count hash fields")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_nx_only_creates_once() -> Result<()> {
        let b = BrokerStore::new_in_memory()?;
        assert!(b.set_nx("lock", "holder-a", Some(Duration::from_secs(5)))?);
        assert!(!b.set_nx("lock", "holder-b", Some(Duration::from_secs(5)))?);
        assert_eq!(b.get("lock")?.as_deref(), Some("holder-a"));
        Ok(())
    }

    #[test]
    fn test_set_nx_succeeds_after_expiry() -> Result<()> {
        let b = BrokerStore::new_in_memory()?;
        assert!(b.set_nx("lock", "a", Some(Duration::from_millis(20)))?);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(b.get("lock")?, None);
        assert!(b.set_nx("lock", "b", Some(Duration::from_secs(5)))?);
        assert_eq!(b.get("lock")?.as_deref(), Some("b"));
        Ok(())
    }

    #[test]
    fn test_del_if_eq_checks_holder() -> Result<()> {
        let b = BrokerStore::new_in_memory()?;
        b.set("lock", "mine", None)?;
        assert!(!b.del_if_eq("lock", "theirs")?);
        assert!(b.del_if_eq("lock", "mine")?);
        assert_eq!(b.get("lock")?, None);
        Ok(())
    }

    #[test]
    fn test_incr_by_creates_with_expiry_and_keeps_it() -> Result<()> {
        let b = BrokerStore::new_in_memory()?;
        assert_eq!(b.incr_by("tpm", 40_000, Some(Duration::from_secs(60)))?, 40_000);
        let first_ttl = b.ttl("tpm")?.expect("counter has expiry");
        assert!(first_ttl <= Duration::from_secs(60));
        assert_eq!(b.incr_by("tpm", 100, Some(Duration::from_secs(600)))?, 40_100);
        let second_ttl = b.ttl("tpm")?.expect("counter keeps expiry");
        assert!(second_ttl <= first_ttl);
        Ok(())
    }

    #[test]
    fn test_incr_by_restarts_after_window() -> Result<()> {
        let b = BrokerStore::new_in_memory()?;
        b.incr_by("tpm", 500, Some(Duration::from_millis(20)))?;
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(b.incr_by("tpm", 7, Some(Duration::from_millis(20)))?, 7);
        Ok(())
    }

    #[test]
    fn test_incr_by_rejects_non_integer() -> Result<()> {
        let b = BrokerStore::new_in_memory()?;
        b.set("k", "abc", None)?;
        assert!(matches!(b.incr_by("k", 1, None), Err(BrokerError::Database(_))));
        Ok(())
    }

    #[test]
    fn test_list_is_fifo() -> Result<()> {
        let b = BrokerStore::new_in_memory()?;
        assert_eq!(b.rpush("q", "a")?, 1);
        assert_eq!(b.rpush("q", "b")?, 2);
        b.rpush("other", "z")?;
        assert_eq!(b.lpop("q")?.as_deref(), Some("a"));
        assert_eq!(b.lpop("q")?.as_deref(), Some("b"));
        assert_eq!(b.lpop("q")?, None);
        assert_eq!(b.llen("other")?, 1);
        Ok(())
    }

    #[test]
    fn test_htake_reads_once() -> Result<()> {
        let b = BrokerStore::new_in_memory()?;
        b.hset("results", "req-1", "{\"ok\":true}")?;
        assert_eq!(b.hget("results", "req-1")?.as_deref(), Some("{\"ok\":true}"));
        assert_eq!(b.htake("results", "req-1")?.as_deref(), Some("{\"ok\":true}"));
        assert_eq!(b.htake("results", "req-1")?, None);
        assert_eq!(b.hlen("results")?, 0);
        Ok(())
    }

    #[test]
    fn test_huge_ttl_saturates() -> Result<()> {
        let b = BrokerStore::new_in_memory()?;
        assert!(b.set_nx("k", "v", Some(Duration::MAX))?);
        assert_eq!(b.get("k")?.as_deref(), Some("v"));
        assert!(b.ttl("k")?.is_some());
        assert_eq!(deadline_ms(Duration::MAX), i64::MAX);
        Ok(())
    }

    #[test]
    fn test_ttl_is_none_without_expiry() -> Result<()> {
        let b = BrokerStore::new_in_memory()?;
        b.set("plain", "v", None)?;
        assert_eq!(b.ttl("plain")?, None);
        assert_eq!(b.ttl("missing")?, None);
        assert!(b.del("plain")?);
        assert!(!b.del("plain")?);
        Ok(())
    }
}
