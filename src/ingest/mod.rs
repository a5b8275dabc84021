//! Stream ingestion: moves run events from broker streams into the event log.
//!
//! Every ingest process joins one consumer group, so each entry is handled
//! by exactly one live consumer. An entry is acknowledged only once its event
//! is persisted, or once it has been copied to the dead-letter stream; anything
//! else stays pending and is claimed again by whichever consumer next scans
//! for idle entries.

pub mod envelope;

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, GroupStart, StreamEntry, StreamId};
use crate::errors::{EventLogError, IngestError};
use crate::eventlog::EventLog;

pub use envelope::{Envelope, canonical_type, decode, encode};

/// Suffix of the stream that receives entries delivered too many times.
pub const DEAD_LETTER_SUFFIX: &str = ":dead";

/// Which streams to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    /// One shared stream.
    Key(String),
    /// Every stream whose key matches a glob, e.g. `workflow:*:events`.
    Pattern(String),
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub source: StreamSource,
    pub group: String,
    pub consumer: String,
    /// Where groups created during the first scan start reading.
    pub start: GroupStart,
    pub batch_size: usize,
    /// Longest a single read waits for new entries.
    pub block: Duration,
    pub poll_interval: Duration,
    pub rescan_interval: Duration,
    pub claim_min_idle: Duration,
    pub max_deliveries: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source: StreamSource::Pattern("workflow:*:events".into()),
            group: "neo4j_ingest".into(),
            consumer: default_consumer_name(),
            start: GroupStart::Latest,
            batch_size: 50,
            block: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            rescan_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(60),
            max_deliveries: 10,
        }
    }
}

/// `<host>-<pid>-<short uuid>`, unique per process.
pub fn default_consumer_name() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "ingest".to_string());
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &id[..8])
}

/// What happened to one stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Persisted,
    Duplicate,
    /// Undecodable; acked without persistence.
    Malformed,
    /// Delivered more than `max_deliveries` times, or rejected by the event
    /// log for good; copied aside and acked.
    DeadLettered,
    /// Transient failure; left pending for a later claim.
    Pending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct IngestStats {
    pub persisted: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub dead_lettered: usize,
    pub pending: usize,
}

impl IngestStats {
    pub fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Persisted => self.persisted += 1,
            EntryOutcome::Duplicate => self.duplicates += 1,
            EntryOutcome::Malformed => self.malformed += 1,
            EntryOutcome::DeadLettered => self.dead_lettered += 1,
            EntryOutcome::Pending => self.pending += 1,
        }
    }

    pub fn merge(&mut self, other: IngestStats) {
        self.persisted += other.persisted;
        self.duplicates += other.duplicates;
        self.malformed += other.malformed;
        self.dead_lettered += other.dead_lettered;
        self.pending += other.pending;
    }

    pub fn handled(&self) -> usize {
        self.persisted + self.duplicates + self.malformed + self.dead_lettered + self.pending
    }
}

pub struct StreamIngestor {
    log: EventLog,
    broker: Broker,
    config: IngestConfig,
    streams: BTreeSet<String>,
    scanned: bool,
}

impl StreamIngestor {
    pub fn new(log: EventLog, broker: Broker, config: IngestConfig) -> Self {
        Self {
            log,
            broker,
            config,
            streams: BTreeSet::new(),
            scanned: false,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.config.consumer
    }

    /// Streams this consumer currently reads from.
    pub fn streams(&self) -> Vec<String> {
        self.streams.iter().cloned().collect()
    }

    /// Discover streams and make sure the group exists on each. Streams
    /// first seen after the initial scan are read from the beginning, since
    /// they were created while this consumer was already running.
    pub async fn refresh_streams(&mut self) -> Result<usize, IngestError> {
        let keys = match &self.config.source {
            StreamSource::Key(key) => vec![key.clone()],
            StreamSource::Pattern(pattern) => self.broker.stream_keys(pattern).await?,
        };
        let start = if self.scanned {
            GroupStart::Beginning
        } else {
            self.config.start
        };
        let mut added = 0;
        for key in keys {
            if key.ends_with(DEAD_LETTER_SUFFIX) || self.streams.contains(&key) {
                continue;
            }
            let created = self
                .broker
                .create_group(&key, &self.config.group, start)
                .await?;
            tracing::debug!(stream = %key, group = %self.config.group, created, "joined stream");
            self.streams.insert(key);
            added += 1;
        }
        self.scanned = true;
        if added > 0 {
            tracing::info!(added, total = self.streams.len(), "stream set updated");
        }
        Ok(added)
    }

    /// Claim and process entries left pending by consumers that went quiet.
    pub async fn claim_pending(&self, cancel: &CancellationToken) -> Result<IngestStats, IngestError> {
        let mut stats = IngestStats::default();
        for stream in &self.streams {
            let mut cursor = StreamId::ZERO;
            loop {
                if cancel.is_cancelled() {
                    return Ok(stats);
                }
                let claim = self
                    .broker
                    .auto_claim(
                        stream,
                        &self.config.group,
                        &self.config.consumer,
                        self.config.claim_min_idle,
                        cursor,
                        self.config.batch_size,
                    )
                    .await?;
                if !claim.deleted.is_empty() {
                    tracing::warn!(stream = %stream, count = claim.deleted.len(), "dropped pending ids with no entry");
                }
                if !claim.entries.is_empty() {
                    tracing::info!(stream = %stream, count = claim.entries.len(), "replaying claimed entries");
                }
                stats.merge(self.process_batch(claim.entries, cancel).await?);
                if claim.next == StreamId::ZERO {
                    break;
                }
                cursor = claim.next;
            }
        }
        Ok(stats)
    }

    /// Read one batch of new entries, waiting up to `block` for some to
    /// arrive, and process it.
    pub async fn consume_once(&self, cancel: &CancellationToken) -> Result<IngestStats, IngestError> {
        if self.streams.is_empty() {
            return Ok(IngestStats::default());
        }
        let deadline = Instant::now() + self.config.block;
        let streams = self.streams();
        loop {
            let entries = self
                .broker
                .read_group(
                    &self.config.group,
                    &self.config.consumer,
                    streams.clone(),
                    self.config.batch_size,
                )
                .await?;
            if !entries.is_empty() {
                return self.process_batch(entries, cancel).await;
            }
            if Instant::now() >= deadline {
                return Ok(IngestStats::default());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(IngestStats::default()),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn process_batch(
        &self,
        entries: Vec<StreamEntry>,
        cancel: &CancellationToken,
    ) -> Result<IngestStats, IngestError> {
        let mut stats = IngestStats::default();
        for entry in entries {
            // Unstarted entries stay pending and are reclaimed later.
            if cancel.is_cancelled() {
                break;
            }
            stats.record(self.process_entry(&entry).await?);
        }
        Ok(stats)
    }

    /// Persist one entry and acknowledge it when that is final.
    #[tracing::instrument(level = "debug", skip_all, fields(stream = %entry.stream, entry_id = %entry.id))]
    pub async fn process_entry(&self, entry: &StreamEntry) -> Result<EntryOutcome, IngestError> {
        if entry.delivery_count > self.config.max_deliveries {
            self.dead_letter(entry, "delivery limit exceeded").await?;
            return Ok(EntryOutcome::DeadLettered);
        }

        let envelope = match decode(entry) {
            Ok(envelope) => envelope,
            Err(IngestError::Malformed(reason)) => {
                tracing::warn!(stream = %entry.stream, entry_id = %entry.id, %reason, "dropping malformed entry");
                self.ack(entry).await?;
                return Ok(EntryOutcome::Malformed);
            }
            Err(e) => return Err(e),
        };

        match self
            .log
            .append(&envelope.run_id, envelope.event, None)
            .await
        {
            Ok(appended) => {
                self.ack(entry).await?;
                if appended.inserted {
                    tracing::debug!(run_id = %envelope.run_id, "event persisted");
                    Ok(EntryOutcome::Persisted)
                } else {
                    Ok(EntryOutcome::Duplicate)
                }
            }
            Err(e) if e.is_permanent() => {
                self.dead_letter(entry, &e.to_string()).await?;
                Ok(EntryOutcome::DeadLettered)
            }
            Err(e) => {
                log_transient(entry, &envelope.run_id, &e);
                Ok(EntryOutcome::Pending)
            }
        }
    }

    async fn ack(&self, entry: &StreamEntry) -> Result<(), IngestError> {
        self.broker
            .ack(&entry.stream, &self.config.group, vec![entry.id])
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, entry: &StreamEntry, reason: &str) -> Result<(), IngestError> {
        let target = format!("{}{}", entry.stream, DEAD_LETTER_SUFFIX);
        let mut fields: BTreeMap<String, String> = entry.fields.clone();
        fields.insert("sourceId".into(), entry.id.to_string());
        fields.insert("deliveries".into(), entry.delivery_count.to_string());
        fields.insert("reason".into(), reason.to_string());
        let dead_id = self.broker.xadd(&target, fields).await?;
        self.ack(entry).await?;
        tracing::error!(
            stream = %entry.stream,
            entry_id = %entry.id,
            deliveries = entry.delivery_count,
            reason,
            dead_letter = %format!("{}/{}", target, dead_id),
            "moved entry to dead-letter stream"
        );
        Ok(())
    }

    /// Startup, replay, then read until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<IngestStats, IngestError> {
        let mut total = self.startup(&cancel).await?;
        let mut last_scan = Instant::now();
        tracing::info!(consumer = %self.config.consumer, group = %self.config.group, streams = self.streams.len(), "ingestor running");

        while !cancel.is_cancelled() {
            if last_scan.elapsed() >= self.config.rescan_interval {
                last_scan = Instant::now();
                if let Err(e) = self.rescan(&cancel, &mut total).await {
                    tracing::error!(error = %e, "stream rescan failed");
                }
            }
            if self.streams.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                // Without streams there is nothing to block on; rescan sooner.
                if let Err(e) = self.rescan(&cancel, &mut total).await {
                    tracing::error!(error = %e, "stream rescan failed");
                }
                continue;
            }
            match self.consume_once(&cancel).await {
                Ok(stats) => total.merge(stats),
                Err(e) => {
                    tracing::error!(error = %e, "ingest batch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        tracing::info!(?total, "ingestor stopped");
        Ok(total)
    }

    /// Startup and replay plus a single read pass.
    pub async fn run_once(mut self, cancel: CancellationToken) -> Result<IngestStats, IngestError> {
        let mut total = self.startup(&cancel).await?;
        total.merge(self.consume_once(&cancel).await?);
        Ok(total)
    }

    async fn startup(&mut self, cancel: &CancellationToken) -> Result<IngestStats, IngestError> {
        self.refresh_streams().await?;
        self.claim_pending(cancel).await
    }

    async fn rescan(&mut self, cancel: &CancellationToken, total: &mut IngestStats) -> Result<(), IngestError> {
        self.refresh_streams().await?;
        total.merge(self.claim_pending(cancel).await?);
        Ok(())
    }
}

fn log_transient(entry: &StreamEntry, run_id: &str, err: &EventLogError) {
    if matches!(err, EventLogError::RunNotFound { .. }) {
        tracing::warn!(stream = %entry.stream, entry_id = %entry.id, run_id, deliveries = entry.delivery_count, "run not found yet; leaving entry pending");
    } else {
        tracing::error!(stream = %entry.stream, entry_id = %entry.id, run_id, error = %err, "failed to persist entry; leaving it pending");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::RunMeta;
    use anyhow::Result;
    use runweave_common::{Event, EventKind, WorkflowType};

    fn config(consumer: &str) -> IngestConfig {
        IngestConfig {
            source: StreamSource::Pattern("workflow:*:events".into()),
            consumer: consumer.into(),
            start: GroupStart::Beginning,
            block: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            claim_min_idle: Duration::from_millis(20),
            max_deliveries: 3,
            ..IngestConfig::default()
        }
    }

    async fn setup() -> Result<(EventLog, Broker)> {
        let log = EventLog::in_memory()?;
        log.create_run("run-1", WorkflowType::ResolveIssue, RunMeta::default())
            .await?;
        Ok((log, Broker::in_memory()?))
    }

    async fn emit(broker: &Broker, run_id: &str, content: &str) -> Result<StreamId> {
        let event = Event::new(EventKind::Status, Some(content.to_string()));
        Ok(broker
            .xadd(&format!("workflow:{}:events", run_id), encode(run_id, &event)?)
            .await?)
    }

    #[tokio::test]
    async fn test_events_are_persisted_in_stream_order() -> Result<()> {
        let (log, broker) = setup().await?;
        for i in 0..5 {
            emit(&broker, "run-1", &format!("step {}", i)).await?;
        }
        let stats = StreamIngestor::new(log.clone(), broker.clone(), config("c1"))
            .run_once(CancellationToken::new())
            .await?;
        assert_eq!(stats.persisted, 5);

        let chain = log.read_chain("run-1").await?;
        let contents: Vec<_> = chain.iter().filter_map(|e| e.content.clone()).collect();
        let expected: Vec<_> = (0..5).map(|i| format!("step {}", i)).collect();
        assert_eq!(contents, expected);
        assert!(broker.pending("workflow:run-1:events", "neo4j_ingest").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_redelivered_entry_is_not_duplicated() -> Result<()> {
        let (log, broker) = setup().await?;
        let id = emit(&broker, "run-1", "once").await?;
        let mut ingestor = StreamIngestor::new(log.clone(), broker.clone(), config("c1"));
        ingestor.refresh_streams().await?;
        let entries = broker
            .read_group("neo4j_ingest", "c1", ingestor.streams(), 10)
            .await?;
        assert_eq!(entries[0].id, id);

        // The first attempt persists; a crash before ack means it is seen again.
        assert_eq!(ingestor.process_entry(&entries[0]).await?, EntryOutcome::Persisted);
        assert_eq!(ingestor.process_entry(&entries[0]).await?, EntryOutcome::Duplicate);
        assert_eq!(log.read_chain("run-1").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_crashed_consumer_entries_are_replayed() -> Result<()> {
        let (log, broker) = setup().await?;
        emit(&broker, "run-1", "a").await?;
        emit(&broker, "run-1", "b").await?;

        // Consumer "crashed" reads both entries and dies without acking.
        let mut crashed = StreamIngestor::new(log.clone(), broker.clone(), config("crashed"));
        crashed.refresh_streams().await?;
        let taken = broker
            .read_group("neo4j_ingest", "crashed", crashed.streams(), 10)
            .await?;
        assert_eq!(taken.len(), 2);
        drop(crashed);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let stats = StreamIngestor::new(log.clone(), broker.clone(), config("survivor"))
            .run_once(CancellationToken::new())
            .await?;
        assert_eq!(stats.persisted, 2);
        let contents: Vec<_> = log
            .read_chain("run-1")
            .await?
            .into_iter()
            .filter_map(|e| e.content)
            .collect();
        assert_eq!(contents, vec!["a", "b"]);
        assert!(broker.pending("workflow:run-1:events", "neo4j_ingest").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_entry_is_acked_and_skipped() -> Result<()> {
        let (log, broker) = setup().await?;
        broker
            .xadd(
                "workflow:run-1:events",
                BTreeMap::from([("event".to_string(), "{not json".to_string())]),
            )
            .await?;
        emit(&broker, "run-1", "good").await?;

        let stats = StreamIngestor::new(log.clone(), broker.clone(), config("c1"))
            .run_once(CancellationToken::new())
            .await?;
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.persisted, 1);
        assert!(broker.pending("workflow:run-1:events", "neo4j_ingest").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_run_stays_pending_then_dead_letters() -> Result<()> {
        let (log, broker) = setup().await?;
        emit(&broker, "ghost", "orphan").await?;
        let stream = "workflow:ghost:events";

        let stats = StreamIngestor::new(log.clone(), broker.clone(), config("c1"))
            .run_once(CancellationToken::new())
            .await?;
        assert_eq!(stats.pending, 1);
        assert_eq!(broker.pending(stream, "neo4j_ingest").await?.len(), 1);

        let mut dead = 0;
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let stats = StreamIngestor::new(log.clone(), broker.clone(), config("c1"))
                .run_once(CancellationToken::new())
                .await?;
            dead += stats.dead_lettered;
        }
        assert_eq!(dead, 1);
        assert!(broker.pending(stream, "neo4j_ingest").await?.is_empty());
        assert_eq!(broker.xlen("workflow:ghost:events:dead").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_many_runs_emitting_together_are_all_persisted() -> Result<()> {
        let log = EventLog::in_memory()?;
        let broker = Broker::in_memory()?;
        let runs: Vec<String> = (0..100).map(|i| format!("r{}", i)).collect();
        for run in &runs {
            log.create_run(run, WorkflowType::ResolveIssue, RunMeta::default())
                .await?;
        }
        let mut emitted = 0;
        for run in &runs {
            emit(&broker, run, "started").await?;
            emitted += 1;
        }

        let stats = StreamIngestor::new(log.clone(), broker.clone(), config("c1"))
            .run_once(CancellationToken::new())
            .await?;
        assert_eq!(stats.persisted, emitted);
        assert_eq!(stats.dead_lettered, 0);
        for run in &runs {
            assert_eq!(log.read_chain(run).await?.len(), 1, "run {}", run);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_event_id_conflict_is_dead_lettered() -> Result<()> {
        let (log, broker) = setup().await?;
        log.create_run("run-2", WorkflowType::ApplyReview, RunMeta::default())
            .await?;
        let id = emit(&broker, "run-1", "mine").await?;
        // Another run already holds an event with the entry's id.
        log.append(
            "run-2",
            Event::with_id(id.to_string(), EventKind::Status, Some("squatter".into())),
            None,
        )
        .await?;

        let stats = StreamIngestor::new(log.clone(), broker.clone(), config("c1"))
            .run_once(CancellationToken::new())
            .await?;
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.malformed, 0);
        assert!(broker.pending("workflow:run-1:events", "neo4j_ingest").await?.is_empty());
        assert_eq!(broker.xlen("workflow:run-1:events:dead").await?, 1);
        assert!(log.read_chain("run-1").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() -> Result<()> {
        let (log, broker) = setup().await?;
        emit(&broker, "run-1", "before").await?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            StreamIngestor::new(log.clone(), broker.clone(), config("c1")).run(cancel.clone()),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        emit(&broker, "run-1", "during").await?;
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(5), task).await???;
        assert_eq!(stats.persisted, 2);
        assert_eq!(log.read_chain("run-1").await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_fixed_key_source() -> Result<()> {
        let (log, broker) = setup().await?;
        let event = Event::new(EventKind::Status, Some("shared".into()));
        broker.xadd("workflow_events", encode("run-1", &event)?).await?;

        let cfg = IngestConfig {
            source: StreamSource::Key("workflow_events".into()),
            ..config("c1")
        };
        let stats = StreamIngestor::new(log.clone(), broker, cfg)
            .run_once(CancellationToken::new())
            .await?;
        assert_eq!(stats.persisted, 1);
        Ok(())
    }

    #[test]
    fn test_default_consumer_names_are_unique() {
        assert_ne!(default_consumer_name(), default_consumer_name());
    }
}
