//! Shared coordination store.
//!
//! Keys with expiry, FIFO lists, hashes and consumer-group streams, held in a
//! SQLite file that every web, worker and ingest process opens. The queue,
//! the refresh lock and the ingestor only talk to each other through here.

pub mod store;
pub mod streams;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;

pub use store::{BrokerStore, deadline_ms, now_ms};
pub use streams::{AutoClaim, GroupStart, PendingEntry, StreamEntry, StreamId};

use crate::db::DbHandle;
use crate::errors::BrokerError;

/// Async handle to the broker. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    db: DbHandle<BrokerStore>,
}

impl Broker {
    pub fn new(store: BrokerStore) -> Self {
        Self {
            db: DbHandle::new(store),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(BrokerStore::new(path)?))
    }

    /// In-memory broker (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(BrokerStore::new_in_memory()?))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let key = key.to_string();
        self.db.call(move |b| b.get(&key)).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BrokerError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.db.call(move |b| b.set(&key, &value, ttl)).await
    }

    pub async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, BrokerError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.db.call(move |b| b.set_nx(&key, &value, ttl)).await
    }

    pub async fn del(&self, key: &str) -> Result<bool, BrokerError> {
        let key = key.to_string();
        self.db.call(move |b| b.del(&key)).await
    }

    pub async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, BrokerError> {
        let (key, expected) = (key.to_string(), expected.to_string());
        self.db.call(move |b| b.del_if_eq(&key, &expected)).await
    }

    pub async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl_if_new: Option<Duration>,
    ) -> Result<i64, BrokerError> {
        let key = key.to_string();
        self.db.call(move |b| b.incr_by(&key, delta, ttl_if_new)).await
    }

    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, BrokerError> {
        let key = key.to_string();
        self.db.call(move |b| b.ttl(&key)).await
    }

    pub async fn rpush(&self, key: &str, value: &str) -> Result<i64, BrokerError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.db.call(move |b| b.rpush(&key, &value)).await
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let key = key.to_string();
        self.db.call(move |b| b.lpop(&key)).await
    }

    pub async fn llen(&self, key: &str) -> Result<i64, BrokerError> {
        let key = key.to_string();
        self.db.call(move |b| b.llen(&key)).await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        self.db.call(move |b| b.hset(&key, &field, &value)).await
    }

    pub async fn htake(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let (key, field) = (key.to_string(), field.to_string());
        self.db.call(move |b| b.htake(&key, &field)).await
    }

    pub async fn hlen(&self, key: &str) -> Result<i64, BrokerError> {
        let key = key.to_string();
        self.db.call(move |b| b.hlen(&key)).await
    }

    pub async fn xadd(
        &self,
        stream: &str,
        fields: BTreeMap<String, String>,
    ) -> Result<StreamId, BrokerError> {
        let stream = stream.to_string();
        self.db.call(move |b| b.xadd(&stream, &fields)).await
    }

    pub async fn xlen(&self, stream: &str) -> Result<i64, BrokerError> {
        let stream = stream.to_string();
        self.db.call(move |b| b.xlen(&stream)).await
    }

    pub async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, BrokerError> {
        let (stream, group) = (stream.to_string(), group.to_string());
        self.db
            .call(move |b| b.create_group(&stream, &group, start))
            .await
    }

    pub async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: Vec<String>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let (group, consumer) = (group.to_string(), consumer.to_string());
        self.db
            .call(move |b| b.read_group(&group, &consumer, &streams, count))
            .await
    }

    pub async fn ack(&self, stream: &str, group: &str, ids: Vec<StreamId>) -> Result<usize, BrokerError> {
        let (stream, group) = (stream.to_string(), group.to_string());
        self.db.call(move |b| b.ack(&stream, &group, &ids)).await
    }

    pub async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError> {
        let (stream, group) = (stream.to_string(), group.to_string());
        self.db.call(move |b| b.pending(&stream, &group)).await
    }

    pub async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: StreamId,
        count: usize,
    ) -> Result<AutoClaim, BrokerError> {
        let (stream, group, consumer) = (stream.to_string(), group.to_string(), consumer.to_string());
        self.db
            .call(move |b| b.auto_claim(&stream, &group, &consumer, min_idle, start, count))
            .await
    }

    pub async fn stream_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let pattern = pattern.to_string();
        self.db.call(move |b| b.stream_keys(&pattern)).await
    }
}
