//! The consume → apply → commit → acknowledge cycle.
//!
//! Per batch: one store transaction; per event: watermark check, mutation, watermark
//! advance; then commit, then acknowledge. Any per-event failure rolls the whole
//! transaction back and rewinds the source so the batch is retried as a unit.

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::applier::{ApplyOutcome, MutationApplier, SkipReason};
use super::connection::{ConnectionManager, Connector, HandleState};
use super::models::{Batch, ChangeEvent, PartitionKey, SourceRecord};
use super::source::EventSource;
use super::store::{ApplyTransaction, TargetStore};
use super::watermark::BatchWatermarks;
use crate::config::ReplicatorConfig;
use crate::error::{Endpoint, ReplicatorError, Result};
use crate::metrics;

/// Proof that a batch's writes are durable in the target store.
///
/// Only the engine creates receipts, and only right after a successful commit;
/// `EventSource::acknowledge` accepts nothing else.
#[derive(Debug)]
pub struct CommitReceipt {
    positions: Vec<(PartitionKey, i64)>,
}

impl CommitReceipt {
    fn new(positions: Vec<(PartitionKey, i64)>) -> Self {
        Self { positions }
    }

    /// Next offset to consume, per partition
    pub fn positions(&self) -> &[(PartitionKey, i64)] {
        &self.positions
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub polled: usize,
    pub applied: u64,
    pub duplicates: u64,
    pub tombstones: u64,
    pub empty_rows: u64,
    pub unknown_ops: u64,
    /// Watermarks moved by the committed transaction
    pub watermarks: Vec<(PartitionKey, i64)>,
}

impl CycleReport {
    pub fn skipped(&self) -> u64 {
        self.duplicates + self.tombstones + self.empty_rows + self.unknown_ops
    }

    /// Skip counts keyed by their metric label
    pub fn skips_by_label(&self) -> [(&'static str, u64); 4] {
        [
            (metrics::SKIP_DUPLICATE, self.duplicates),
            (metrics::SKIP_TOMBSTONE, self.tombstones),
            (metrics::SKIP_EMPTY_ROW, self.empty_rows),
            (metrics::SKIP_UNKNOWN_OP, self.unknown_ops),
        ]
    }

    fn count_skip(&mut self, reason: &SkipReason) {
        match reason {
            SkipReason::Tombstone => self.tombstones += 1,
            SkipReason::EmptyRow => self.empty_rows += 1,
            SkipReason::UnknownOperation(_) => self.unknown_ops += 1,
        }
    }
}

/// Running totals since start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub cycles: u64,
    pub events_processed: u64,
    pub events_applied: u64,
    pub duplicates_skipped: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub ack_failures: u64,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub failure_pause: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &ReplicatorConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_timeout: config.poll_timeout(),
            failure_pause: config.failure_pause(),
        }
    }
}

enum RecordOutcome {
    Applied,
    Duplicate,
    Skipped(SkipReason),
}

pub struct ApplyEngine<S, T>
where
    S: Connector,
    S::Handle: EventSource,
    T: Connector,
    T::Handle: TargetStore,
{
    source: ConnectionManager<S>,
    store: ConnectionManager<T>,
    applier: MutationApplier,
    settings: EngineSettings,
    stats: RunStats,
    started: Instant,
}

impl<S, T> ApplyEngine<S, T>
where
    S: Connector,
    S::Handle: EventSource,
    T: Connector,
    T::Handle: TargetStore,
{
    pub fn new(
        source: ConnectionManager<S>,
        store: ConnectionManager<T>,
        applier: MutationApplier,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            store,
            applier,
            settings,
            stats: RunStats::default(),
            started: Instant::now(),
        }
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn source_state(&self) -> HandleState {
        self.source.state()
    }

    pub fn store_state(&self) -> HandleState {
        self.store.state()
    }

    /// Open both handles up front so an unreachable endpoint fails at startup
    pub async fn connect(&mut self) -> Result<()> {
        self.store.acquire().await?;
        self.source.acquire().await?;
        Ok(())
    }

    /// One poll → apply → commit → acknowledge cycle.
    ///
    /// An empty poll returns an empty report. On failure nothing from the batch is
    /// committed or acknowledged and the batch will be delivered again.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.stats.cycles += 1;

        let records = self.poll().await?;
        if records.is_empty() {
            return Ok(CycleReport::default());
        }

        let batch = Batch::from_records(records);
        let started = Instant::now();

        let (mut report, receipt) = match self.apply_batch(&batch).await {
            Ok(committed) => committed,
            Err(e) => {
                self.stats.batches_failed += 1;
                metrics::record_batch_failed();
                error!(
                    events = batch.len(),
                    error = %e,
                    "Batch failed, rolled back"
                );
                self.invalidate(&e);
                self.rewind(&batch).await;
                return Err(e);
            }
        };
        report.polled = batch.len();

        let elapsed = started.elapsed().as_secs_f64();
        self.record_commit(&report, elapsed);

        // Writes are durable; only now may the source move past them
        self.acknowledge(&receipt).await?;
        Ok(report)
    }

    /// Run cycles until `shutdown` flips to true (or its sender goes away).
    ///
    /// Shutdown is observed between cycles: an in-flight batch always commits or
    /// rolls back first. Unreachable endpoints end the loop with the fatal error.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<RunStats> {
        info!(
            batch_size = self.settings.batch_size,
            poll_timeout_secs = self.settings.poll_timeout.as_secs_f64(),
            "Apply engine started"
        );

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested");
                break;
            }

            match self.run_cycle().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal error, stopping apply engine");
                    self.close().await;
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        error = %e,
                        pause_secs = self.settings.failure_pause.as_secs_f64(),
                        "Cycle failed, pausing"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.failure_pause) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                info!("Shutdown channel closed");
                                break;
                            }
                        }
                    }
                }
            }

            if shutdown.has_changed().is_err() {
                info!("Shutdown channel closed");
                break;
            }
        }

        self.close().await;
        Ok(self.stats.clone())
    }

    /// Release both handles and log the totals
    pub async fn close(&mut self) {
        self.source.shutdown().await;
        self.store.shutdown().await;
        info!(
            processed = self.stats.events_processed,
            applied = self.stats.events_applied,
            duplicates = self.stats.duplicates_skipped,
            batches = self.stats.batches_committed,
            errors = self.stats.batches_failed,
            elapsed_secs = self.started.elapsed().as_secs_f64(),
            "Apply engine stopped"
        );
    }

    async fn poll(&mut self) -> Result<Vec<SourceRecord>> {
        let batch_size = self.settings.batch_size;
        let wait = self.settings.poll_timeout;

        let source = self.source.health_check().await?;
        match source.poll(batch_size, wait).await {
            Ok(records) => Ok(records),
            Err(e) => {
                self.invalidate(&e);
                Err(e)
            }
        }
    }

    /// Apply every event of the batch in one transaction and commit it
    async fn apply_batch(&mut self, batch: &Batch) -> Result<(CycleReport, CommitReceipt)> {
        let store = self.store.health_check().await?;
        let mut tx = store.begin().await?;
        let mut watermarks = BatchWatermarks::new();
        let mut report = CycleReport::default();

        for partition in batch.partitions() {
            for record in &partition.records {
                let outcome = Self::apply_record(
                    &self.applier,
                    tx.as_mut(),
                    &mut watermarks,
                    record,
                )
                .await;

                match outcome {
                    Ok(RecordOutcome::Applied) => report.applied += 1,
                    Ok(RecordOutcome::Duplicate) => report.duplicates += 1,
                    Ok(RecordOutcome::Skipped(reason)) => report.count_skip(&reason),
                    Err(e) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!(error = %rollback_err, "Rollback failed");
                        }
                        return Err(e.at_event(&record.topic, record.partition, record.offset));
                    }
                }
            }
        }

        tx.commit().await?;

        report.watermarks = watermarks.advanced();
        Ok((report, CommitReceipt::new(batch.ack_positions())))
    }

    async fn apply_record(
        applier: &MutationApplier,
        tx: &mut dyn ApplyTransaction,
        watermarks: &mut BatchWatermarks,
        record: &SourceRecord,
    ) -> Result<RecordOutcome> {
        let key = record.key();

        if watermarks.is_applied(tx, &key, record.offset).await? {
            debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Already applied, skipping"
            );
            return Ok(RecordOutcome::Duplicate);
        }

        let event = ChangeEvent::decode(record)?;
        match applier.apply(tx, &event).await? {
            ApplyOutcome::Written(_) => {
                watermarks.advance(tx, &key, record.offset).await?;
                Ok(RecordOutcome::Applied)
            }
            ApplyOutcome::Skipped(reason) => Ok(RecordOutcome::Skipped(reason)),
        }
    }

    async fn acknowledge(&mut self, receipt: &CommitReceipt) -> Result<()> {
        let result = match self.source.current() {
            Some(source) => source.acknowledge(receipt).await,
            None => Err(ReplicatorError::Unavailable {
                endpoint: Endpoint::Source,
                reason: "no live consumer to acknowledge on".to_string(),
            }),
        };

        if let Err(e) = &result {
            self.stats.ack_failures += 1;
            error!(
                error = %e,
                "Acknowledgment failed after commit; the batch will be redelivered and skipped"
            );
            self.source.mark_stale(&e.to_string());
        }
        result
    }

    fn record_commit(&mut self, report: &CycleReport, elapsed_secs: f64) {
        self.stats.batches_committed += 1;
        self.stats.events_processed += report.polled as u64;
        self.stats.events_applied += report.applied;
        self.stats.duplicates_skipped += report.duplicates;

        metrics::record_batch_committed(elapsed_secs);
        metrics::record_applied(report.applied);
        for (label, count) in report.skips_by_label() {
            metrics::record_skipped(label, count);
        }
        for (key, offset) in &report.watermarks {
            metrics::set_watermark(key, *offset);
        }

        info!(
            events = report.polled,
            applied = report.applied,
            skipped = report.skipped(),
            total_processed = self.stats.events_processed,
            total_errors = self.stats.batches_failed,
            elapsed_secs = elapsed_secs,
            "Batch committed"
        );
    }

    /// Mark the handle named by a connectivity error as stale
    fn invalidate(&mut self, err: &ReplicatorError) {
        match err.stale_endpoint() {
            Some(Endpoint::Source) => self.source.mark_stale(&err.to_string()),
            Some(Endpoint::Store) => self.store.mark_stale(&err.to_string()),
            None => {}
        }
    }

    /// Put the batch back at the head of each partition
    async fn rewind(&mut self, batch: &Batch) {
        let positions = batch.rewind_positions();
        let Some(source) = self.source.current() else {
            // A replacement consumer resumes from the last acknowledged offsets
            return;
        };

        if let Err(e) = source.rewind(&positions).await {
            warn!(error = %e, "Rewind failed, replacing consumer");
            self.source.mark_stale(&e.to_string());
        }
    }
}
