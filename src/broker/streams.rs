//! Append-only streams with consumer groups.
//!
//! Entry ids are `<ms>-<seq>`. They strictly increase per stream and are
//! unique across every stream in the broker, so an entry id names exactly
//! one entry even once streams are merged by a reader. A consumer
//! group remembers the last id it delivered and a pending list of entries
//! delivered but not yet acknowledged; pending entries idle for long enough
//! can be claimed by another consumer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use rusqlite::{OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};

use super::store::{BrokerStore, now_ms};
use crate::db;
use crate::errors::BrokerError;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StreamId {
    pub ms: i64,
    pub seq: i64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: i64, seq: i64) -> Self {
        Self { ms, seq }
    }

    fn next_after(last: StreamId, now: i64) -> StreamId {
        if now > last.ms {
            StreamId::new(now, 0)
        } else {
            StreamId::new(last.ms, last.seq + 1)
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BrokerError::InvalidStreamId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        let ms = ms.parse::<i64>().map_err(|_| invalid())?;
        let seq = seq.parse::<i64>().map_err(|_| invalid())?;
        if ms < 0 || seq < 0 {
            return Err(invalid());
        }
        Ok(StreamId { ms, seq })
    }
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Only entries added after the group is created (`$`).
    Latest,
    /// Every entry still in the stream (`0`).
    Beginning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream: String,
    pub id: StreamId,
    pub fields: BTreeMap<String, String>,
    /// How many times this entry has been delivered to the group, this time included.
    pub delivery_count: i64,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub id: StreamId,
    pub consumer: String,
    pub idle_ms: i64,
    pub delivery_count: i64,
}

/// Result of one auto-claim pass.
#[derive(Debug, Clone, Default)]
pub struct AutoClaim {
    /// Cursor for the next pass; [`StreamId::ZERO`] when the scan is complete.
    pub next: StreamId,
    pub entries: Vec<StreamEntry>,
    /// Pending ids whose entry no longer exists; they were dropped from the pending list.
    pub deleted: Vec<StreamId>,
}

impl BrokerStore {
    /// Append an entry and return its id. Ids come from one broker-wide
    /// clock, advanced in the same transaction as the insert.
    pub fn xadd(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<StreamId, BrokerError> {
        let encoded = serde_json::to_string(fields).context("Failed to encode stream fields")?;
        let tx = db::immediate(&self.conn)?;
        let last = ensure_stream(&tx, stream)?.max(clock(&tx)?);
        let id = StreamId::next_after(last, now_ms());
        tx.execute(
            "INSERT INTO stream_entries (stream, ms, seq, fields) VALUES (?1, ?2, ?3, ?4)",
            params![stream, id.ms, id.seq, encoded],
        )
        .context("Failed to insert stream entry")?;
        tx.execute(
            "UPDATE streams SET last_ms = ?2, last_seq = ?3 WHERE stream = ?1",
            params![stream, id.ms, id.seq],
        )
        .context("Failed to advance stream id")?;
        tx.execute(
            "INSERT INTO stream_clock (id, last_ms, last_seq) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET last_ms = ?1, last_seq = ?2",
            params![id.ms, id.seq],
        )
        .context("Failed to advance broker clock")?;
        tx.commit().context("Failed to commit stream entry")?;
        Ok(id)
    }

    pub fn xlen(&self, stream: &str) -> Result<i64, BrokerError> {
        Ok(self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM stream_entries WHERE stream = ?1",
                params![stream],
                |row| row.get(0),
            )
            .context("Failed to count stream entries")?)
    }

    /// Create a consumer group, creating the stream if needed. Returns false
    /// when the group already exists.
    pub fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, BrokerError> {
        let tx = db::immediate(&self.conn)?;
        let last = ensure_stream(&tx, stream)?;
        let from = match start {
            GroupStart::Latest => last,
            GroupStart::Beginning => StreamId::ZERO,
        };
        let created = tx
            .execute(
                "INSERT OR IGNORE INTO stream_groups (stream, group_name, last_ms, last_seq)
                 VALUES (?1, ?2, ?3, ?4)",
                params![stream, group, from.ms, from.seq],
            )
            .context("Failed to create consumer group")?;
        tx.commit().context("Failed to commit consumer group")?;
        Ok(created == 1)
    }

    /// Deliver up to `count` new entries per stream to `consumer` and record
    /// them as pending for the group.
    pub fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let tx = db::immediate(&self.conn)?;
        let now = now_ms();
        let mut delivered = Vec::new();
        for stream in streams {
            let last = group_cursor(&tx, stream, group)?.ok_or_else(|| BrokerError::NoGroup {
                stream: stream.clone(),
                group: group.to_string(),
            })?;
            let entries = entries_after(&tx, stream, last, count)?;
            for (id, fields) in entries {
                tx.execute(
                    "INSERT INTO stream_pending
                        (stream, group_name, ms, seq, consumer, delivered_at, delivery_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
                     ON CONFLICT(stream, group_name, ms, seq) DO UPDATE SET
                        consumer = ?5, delivered_at = ?6, delivery_count = delivery_count + 1",
                    params![stream, group, id.ms, id.seq, consumer, now],
                )
                .context("Failed to record pending entry")?;
                tx.execute(
                    "UPDATE stream_groups SET last_ms = ?3, last_seq = ?4
                     WHERE stream = ?1 AND group_name = ?2",
                    params![stream, group, id.ms, id.seq],
                )
                .context("Failed to advance group cursor")?;
                delivered.push(StreamEntry {
                    stream: stream.clone(),
                    id,
                    fields,
                    delivery_count: 1,
                });
            }
        }
        tx.commit().context("Failed to commit group read")?;
        Ok(delivered)
    }

    /// Acknowledge entries, removing them from the group's pending list.
    pub fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<usize, BrokerError> {
        let tx = db::immediate(&self.conn)?;
        let mut removed = 0;
        for id in ids {
            removed += tx
                .execute(
                    "DELETE FROM stream_pending
                     WHERE stream = ?1 AND group_name = ?2 AND ms = ?3 AND seq = ?4",
                    params![stream, group, id.ms, id.seq],
                )
                .context("Failed to acknowledge entry")?;
        }
        tx.commit().context("Failed to commit acknowledgement")?;
        Ok(removed)
    }

    pub fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError> {
        let now = now_ms();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ms, seq, consumer, delivered_at, delivery_count FROM stream_pending
                 WHERE stream = ?1 AND group_name = ?2 ORDER BY ms, seq",
            )
            .context("Failed to prepare pending query")?;
        let rows = stmt
            .query_map(params![stream, group], |row| {
                Ok(PendingEntry {
                    id: StreamId::new(row.get(0)?, row.get(1)?),
                    consumer: row.get(2)?,
                    idle_ms: now - row.get::<_, i64>(3)?,
                    delivery_count: row.get(4)?,
                })
            })
            .context("Failed to query pending entries")?;
        let pending = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read pending entries")?;
        Ok(pending)
    }

    /// Transfer pending entries idle for at least `min_idle` to `consumer`,
    /// scanning from `start`. Each claim counts as a delivery.
    pub fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: StreamId,
        count: usize,
    ) -> Result<AutoClaim, BrokerError> {
        let tx = db::immediate(&self.conn)?;
        if group_cursor(&tx, stream, group)?.is_none() {
            return Err(BrokerError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let now = now_ms();
        let idle_before = now.saturating_sub(i64::try_from(min_idle.as_millis()).unwrap_or(i64::MAX));
        let candidates: Vec<(StreamId, i64)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT ms, seq, delivery_count FROM stream_pending
                     WHERE stream = ?1 AND group_name = ?2
                       AND (ms > ?3 OR (ms = ?3 AND seq >= ?4))
                       AND delivered_at <= ?5
                     ORDER BY ms, seq LIMIT ?6",
                )
                .context("Failed to prepare claim scan")?;
            let rows = stmt
                .query_map(
                    params![stream, group, start.ms, start.seq, idle_before, count as i64 + 1],
                    |row| Ok((StreamId::new(row.get(0)?, row.get(1)?), row.get(2)?)),
                )
                .context("Failed to scan pending entries")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read claim candidates")?
        };

        let mut claim = AutoClaim::default();
        for (i, (id, deliveries)) in candidates.into_iter().enumerate() {
            if i == count {
                claim.next = id;
                break;
            }
            match entry_fields(&tx, stream, id)? {
                Some(fields) => {
                    tx.execute(
                        "UPDATE stream_pending
                         SET consumer = ?5, delivered_at = ?6, delivery_count = delivery_count + 1
                         WHERE stream = ?1 AND group_name = ?2 AND ms = ?3 AND seq = ?4",
                        params![stream, group, id.ms, id.seq, consumer, now],
                    )
                    .context("Failed to claim pending entry")?;
                    claim.entries.push(StreamEntry {
                        stream: stream.to_string(),
                        id,
                        fields,
                        delivery_count: deliveries + 1,
                    });
                }
                None => {
                    tx.execute(
                        "DELETE FROM stream_pending
                         WHERE stream = ?1 AND group_name = ?2 AND ms = ?3 AND seq = ?4",
                        params![stream, group, id.ms, id.seq],
                    )
                    .context("Failed to drop orphaned pending entry")?;
                    claim.deleted.push(id);
                }
            }
        }
        tx.commit().context("Failed to commit claim")?;
        Ok(claim)
    }

    /// Stream keys matching a glob pattern (`*` matches everything).
    pub fn stream_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let pattern = glob::Pattern::new(pattern)
            .with_context(|| format!("Invalid stream key pattern '{}'", pattern))?;
        let mut stmt = self
            .conn
            .prepare("SELECT stream FROM streams ORDER BY stream")
            .context("Failed to prepare stream key query")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to list streams")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read stream keys")?;
        Ok(keys.into_iter().filter(|k| pattern.matches(k)).collect())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

fn ensure_stream(tx: &Transaction<'_>, stream: &str) -> Result<StreamId, BrokerError> {
    tx.execute(
        "INSERT OR IGNORE INTO streams (stream) VALUES (?1)",
        params![stream],
    )
    .context("Failed to register stream")?;
    Ok(tx
        .query_row(
            "SELECT last_ms, last_seq FROM streams WHERE stream = ?1",
            params![stream],
            |row| Ok(StreamId::new(row.get(0)?, row.get(1)?)),
        )
        .context("Failed to read stream head")?)
}

/// Last id handed out on any stream. A broker created before the clock row
/// existed starts from its highest stream head.
fn clock(tx: &Transaction<'_>) -> Result<StreamId, BrokerError> {
    let read = |sql: &str| {
        tx.query_row(sql, [], |row| Ok(StreamId::new(row.get(0)?, row.get(1)?)))
            .optional()
    };
    let clock = match read("SELECT last_ms, last_seq FROM stream_clock WHERE id = 1")
        .context("Failed to read broker clock")?
    {
        Some(id) => id,
        None => read("SELECT last_ms, last_seq FROM streams ORDER BY last_ms DESC, last_seq DESC LIMIT 1")
            .context("Failed to read stream heads")?
            .unwrap_or_default(),
    };
    Ok(clock)
}

fn group_cursor(
    tx: &Transaction<'_>,
    stream: &str,
    group: &str,
) -> Result<Option<StreamId>, BrokerError> {
    Ok(tx
        .query_row(
            "SELECT last_ms, last_seq FROM stream_groups WHERE stream = ?1 AND group_name = ?2",
            params![stream, group],
            |row| Ok(StreamId::new(row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("Failed to read group cursor")?)
}

fn entries_after(
    tx: &Transaction<'_>,
    stream: &str,
    after: StreamId,
    count: usize,
) -> Result<Vec<(StreamId, BTreeMap<String, String>)>, BrokerError> {
    let mut stmt = tx
        .prepare(
            "SELECT ms, seq, fields FROM stream_entries
             WHERE stream = ?1 AND (ms > ?2 OR (ms = ?2 AND seq > ?3))
             ORDER BY ms, seq LIMIT ?4",
        )
        .context("Failed to prepare stream read")?;
    let rows = stmt
        .query_map(params![stream, after.ms, after.seq, count as i64], |row| {
            Ok((
                StreamId::new(row.get(0)?, row.get(1)?),
                row.get::<_, String>(2)?,
            ))
        })
        .context("Failed to read stream entries")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to collect stream entries")?;
    rows.into_iter()
        .map(|(id, raw)| decode_fields(&raw).map(|fields| (id, fields)))
        .collect()
}

fn entry_fields(
    tx: &Transaction<'_>,
    stream: &str,
    id: StreamId,
) -> Result<Option<BTreeMap<String, String>>, BrokerError> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT fields FROM stream_entries WHERE stream = ?1 AND ms = ?2 AND seq = ?3",
            params![stream, id.ms, id.seq],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to read stream entry")?;
    raw.as_deref().map(decode_fields).transpose()
}

fn decode_fields(raw: &str) -> Result<BTreeMap<String, String>, BrokerError> {
    Ok(serde_json::from_str(raw).context("Failed to decode stream fields")?)
}
