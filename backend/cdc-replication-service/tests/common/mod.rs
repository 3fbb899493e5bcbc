//! In-memory event log and target store for driving the apply engine in tests

#![allow(dead_code)]

use async_trait::async_trait;
use cdc_replication_service::services::cdc::{
    ApplyEngine, ApplyTransaction, CommitReceipt, ConnectionManager, Connector, EngineSettings,
    EventSource, Identifier, Mutation, MutationApplier, PartitionKey, RowImage, SourceRecord,
    TableRef, TargetStore,
};
use cdc_replication_service::{Endpoint, ReplicatorError, Result};
use resilience::RetryConfig;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const USERS: &str = "cdc.public.users";

// ==================== Event log ====================

#[derive(Default)]
struct LogState {
    partitions: BTreeMap<PartitionKey, Vec<SourceRecord>>,
    /// Next offset to consume per partition, as acknowledged
    committed: HashMap<PartitionKey, i64>,
    /// Read position of the live consumer
    position: HashMap<PartitionKey, i64>,
    unreachable: bool,
    fail_next_acks: u32,
    fail_next_polls: u32,
    acks: u32,
    connects: u32,
    releases: u32,
}

/// A partitioned log with consumer-group style committed offsets
#[derive(Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<LogState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap()
    }

    /// Append a record at the partition's next offset; returns the offset
    pub fn publish(&self, topic: &str, partition: i32, payload: Option<Value>) -> i64 {
        self.publish_raw(topic, partition, payload.map(|v| serde_json::to_vec(&v).unwrap()))
    }

    pub fn publish_raw(&self, topic: &str, partition: i32, payload: Option<Vec<u8>>) -> i64 {
        let next = self
            .lock()
            .partitions
            .get(&PartitionKey::new(topic, partition))
            .and_then(|records| records.last())
            .map_or(0, |last| last.offset + 1);
        self.publish_at(topic, partition, next, payload);
        next
    }

    /// Append at an explicit offset, which must be past the partition's last one
    pub fn publish_at(&self, topic: &str, partition: i32, offset: i64, payload: Option<Vec<u8>>) {
        let mut state = self.lock();
        let key = PartitionKey::new(topic, partition);
        let records = state.partitions.entry(key).or_default();
        records.push(SourceRecord {
            topic: topic.to_string(),
            partition,
            offset,
            payload,
        });
    }

    /// Acknowledged next offset of a partition
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&PartitionKey::new(topic, partition))
            .copied()
    }

    /// Move the group's committed offset back, as after a lost acknowledgment
    pub fn redeliver_from(&self, topic: &str, partition: i32, offset: i64) {
        let mut state = self.lock();
        let key = PartitionKey::new(topic, partition);
        state.committed.insert(key.clone(), offset);
        state.position.insert(key, offset);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn fail_next_acks(&self, count: u32) {
        self.lock().fail_next_acks = count;
    }

    pub fn fail_next_polls(&self, count: u32) {
        self.lock().fail_next_polls = count;
    }

    pub fn acks(&self) -> u32 {
        self.lock().acks
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    pub fn releases(&self) -> u32 {
        self.lock().releases
    }
}

pub struct MemorySource {
    log: MemoryLog,
}

#[async_trait]
impl EventSource for MemorySource {
    async fn poll(&mut self, max_records: usize, wait: Duration) -> Result<Vec<SourceRecord>> {
        let batch = {
            let mut guard = self.log.lock();
            let state = &mut *guard;

            if state.fail_next_polls > 0 {
                state.fail_next_polls -= 1;
                return Err(ReplicatorError::Unavailable {
                    endpoint: Endpoint::Source,
                    reason: "broker transport failure".to_string(),
                });
            }

            let mut batch = Vec::new();
            for (key, records) in &state.partitions {
                let position = state.position.entry(key.clone()).or_insert(0);
                let start = *position;
                for record in records.iter().filter(|r| r.offset >= start) {
                    if batch.len() == max_records {
                        break;
                    }
                    batch.push(record.clone());
                    *position = record.offset + 1;
                }
            }
            batch
        };

        // An idle consumer blocks for the poll timeout
        if batch.is_empty() {
            tokio::time::sleep(wait).await;
        }
        Ok(batch)
    }

    async fn acknowledge(&mut self, receipt: &CommitReceipt) -> Result<()> {
        let mut state = self.log.lock();
        if state.fail_next_acks > 0 {
            state.fail_next_acks -= 1;
            return Err(ReplicatorError::Unavailable {
                endpoint: Endpoint::Source,
                reason: "coordinator not available".to_string(),
            });
        }

        for (key, next_offset) in receipt.positions() {
            state.committed.insert(key.clone(), *next_offset);
        }
        state.acks += 1;
        Ok(())
    }

    async fn rewind(&mut self, positions: &[(PartitionKey, i64)]) -> Result<()> {
        let mut state = self.log.lock();
        for (key, offset) in positions {
            state.position.insert(key.clone(), *offset);
        }
        Ok(())
    }
}

pub struct MemorySourceConnector {
    log: MemoryLog,
}

#[async_trait]
impl Connector for MemorySourceConnector {
    type Handle = MemorySource;

    fn endpoint(&self) -> Endpoint {
        Endpoint::Source
    }

    fn describe(&self) -> String {
        "memory-log".to_string()
    }

    async fn connect(&self) -> Result<MemorySource> {
        let mut state = self.log.lock();
        if state.unreachable {
            return Err(ReplicatorError::Unavailable {
                endpoint: Endpoint::Source,
                reason: "all brokers down".to_string(),
            });
        }

        // A new group member resumes from the committed offsets
        state.position = state.committed.clone();
        state.connects += 1;
        Ok(MemorySource {
            log: self.log.clone(),
        })
    }

    async fn probe(&self, _handle: &MemorySource) -> Result<()> {
        if self.log.lock().unreachable {
            return Err(ReplicatorError::Unavailable {
                endpoint: Endpoint::Source,
                reason: "metadata request timed out".to_string(),
            });
        }
        Ok(())
    }

    async fn release(&self, _handle: MemorySource) {
        self.log.lock().releases += 1;
    }
}

// ==================== Target store ====================

#[derive(Clone, Default)]
struct Tables {
    rows: BTreeMap<String, BTreeMap<String, RowImage>>,
    watermarks: BTreeMap<PartitionKey, i64>,
}

#[derive(Default)]
struct DbState {
    committed: Tables,
    unreachable: bool,
    fail_next_probes: u32,
    fail_next_commits: u32,
    /// Execute fails with a dropped connection when the row key equals this value
    fail_execute_on_key: Option<Value>,
    statements: u64,
    commits: u32,
    rollbacks: u32,
    connects: u32,
}

/// Transactional in-memory tables plus the watermark table
#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<DbState>>,
}

fn key_repr(value: &Value) -> String {
    value.to_string()
}

/// `schema.table` when qualified, the bare table name otherwise
fn table_key(table: &TableRef) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", schema.as_str(), table.name.as_str()),
        None => table.name.as_str().to_string(),
    }
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap()
    }

    pub fn row(&self, table: &str, id: Value) -> Option<Value> {
        self.lock()
            .committed
            .rows
            .get(table)
            .and_then(|t| t.get(&key_repr(&id)))
            .map(|row| Value::Object(row.clone()))
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock()
            .committed
            .rows
            .get(table)
            .map_or(0, |t| t.len())
    }

    pub fn watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .watermarks
            .get(&PartitionKey::new(topic, partition))
            .copied()
    }

    pub fn seed_row(&self, table: &str, row: Value) {
        let row = row.as_object().cloned().unwrap();
        let key = key_repr(&row["id"]);
        self.lock()
            .committed
            .rows
            .entry(table.to_string())
            .or_default()
            .insert(key, row);
    }

    pub fn seed_watermark(&self, topic: &str, partition: i32, offset: i64) {
        self.lock()
            .committed
            .watermarks
            .insert(PartitionKey::new(topic, partition), offset);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn fail_next_probes(&self, count: u32) {
        self.lock().fail_next_probes = count;
    }

    pub fn fail_next_commits(&self, count: u32) {
        self.lock().fail_next_commits = count;
    }

    pub fn fail_execute_on_key(&self, key: Option<Value>) {
        self.lock().fail_execute_on_key = key;
    }

    /// Statements executed, committed or not
    pub fn statements(&self) -> u64 {
        self.lock().statements
    }

    pub fn commits(&self) -> u32 {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> u32 {
        self.lock().rollbacks
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }
}

pub struct MemoryStore {
    db: MemoryDb,
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn ApplyTransaction>> {
        let staged = self.db.lock().committed.clone();
        Ok(Box::new(MemoryTx {
            db: self.db.clone(),
            staged,
        }))
    }
}

/// Works on a private copy of the tables; commit swaps it in
pub struct MemoryTx {
    db: MemoryDb,
    staged: Tables,
}

#[async_trait]
impl ApplyTransaction for MemoryTx {
    async fn committed_offset(&mut self, key: &PartitionKey) -> Result<Option<i64>> {
        Ok(self.staged.watermarks.get(key).copied())
    }

    async fn advance_watermark(&mut self, key: &PartitionKey, offset: i64) -> Result<()> {
        let entry = self.staged.watermarks.entry(key.clone()).or_insert(offset);
        *entry = (*entry).max(offset);
        Ok(())
    }

    async fn execute(&mut self, mutation: &Mutation) -> Result<u64> {
        let fail_on = {
            let mut state = self.db.lock();
            state.statements += 1;
            state.fail_execute_on_key.clone()
        };

        match mutation {
            Mutation::Upsert {
                table,
                key_column,
                row,
                ..
            } => {
                let key = row[key_column.as_str()].clone();
                if fail_on.as_ref() == Some(&key) {
                    return Err(ReplicatorError::Database(sqlx::Error::PoolClosed));
                }

                let rows = self
                    .staged
                    .rows
                    .entry(table_key(table))
                    .or_default();
                match rows.get_mut(&key_repr(&key)) {
                    Some(existing) => {
                        if row.len() == 1 {
                            return Ok(0);
                        }
                        for (column, value) in row {
                            existing.insert(column.clone(), value.clone());
                        }
                    }
                    None => {
                        rows.insert(key_repr(&key), row.clone());
                    }
                }
                Ok(1)
            }
            Mutation::Delete { table, key, .. } => {
                if fail_on.as_ref() == Some(key) {
                    return Err(ReplicatorError::Database(sqlx::Error::PoolClosed));
                }

                let removed = self
                    .staged
                    .rows
                    .get_mut(&table_key(table))
                    .and_then(|rows| rows.remove(&key_repr(key)));
                Ok(removed.map_or(0, |_| 1))
            }
            Mutation::Skip(_) => Ok(0),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.db.lock();
        if state.fail_next_commits > 0 {
            state.fail_next_commits -= 1;
            state.rollbacks += 1;
            return Err(ReplicatorError::Database(sqlx::Error::PoolTimedOut));
        }
        state.committed = self.staged;
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.db.lock().rollbacks += 1;
        Ok(())
    }
}

pub struct MemoryStoreConnector {
    db: MemoryDb,
}

#[async_trait]
impl Connector for MemoryStoreConnector {
    type Handle = MemoryStore;

    fn endpoint(&self) -> Endpoint {
        Endpoint::Store
    }

    fn describe(&self) -> String {
        "memory-db".to_string()
    }

    async fn connect(&self) -> Result<MemoryStore> {
        let mut state = self.db.lock();
        if state.unreachable {
            return Err(ReplicatorError::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))));
        }
        state.connects += 1;
        Ok(MemoryStore {
            db: self.db.clone(),
        })
    }

    async fn probe(&self, _handle: &MemoryStore) -> Result<()> {
        let mut state = self.db.lock();
        if state.fail_next_probes > 0 {
            state.fail_next_probes -= 1;
            return Err(ReplicatorError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }

    async fn release(&self, _handle: MemoryStore) {}
}

// ==================== Wiring ====================

pub type TestEngine = ApplyEngine<MemorySourceConnector, MemoryStoreConnector>;

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
    }
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        batch_size: 100,
        poll_timeout: Duration::from_millis(10),
        failure_pause: Duration::from_millis(1),
    }
}

pub fn engine(log: &MemoryLog, db: &MemoryDb) -> TestEngine {
    engine_with(log, db, settings())
}

pub fn engine_with(log: &MemoryLog, db: &MemoryDb, settings: EngineSettings) -> TestEngine {
    let source = ConnectionManager::new(
        MemorySourceConnector { log: log.clone() },
        fast_retry(),
        Duration::from_secs(1),
    );
    let store = ConnectionManager::new(
        MemoryStoreConnector { db: db.clone() },
        fast_retry(),
        Duration::from_secs(1),
    );
    let applier = MutationApplier::new(Identifier::parse("id").unwrap(), None);
    ApplyEngine::new(source, store, applier, settings)
}

// ==================== Payloads ====================

pub fn create(after: Value) -> Option<Value> {
    Some(json!({"payload": {"op": "c", "before": null, "after": after}}))
}

pub fn update(before: Value, after: Value) -> Option<Value> {
    Some(json!({"payload": {"op": "u", "before": before, "after": after}}))
}

pub fn delete(before: Value) -> Option<Value> {
    Some(json!({"payload": {"op": "d", "before": before, "after": null}}))
}

pub fn bytes(payload: Option<Value>) -> Option<Vec<u8>> {
    payload.map(|v| serde_json::to_vec(&v).unwrap())
}

pub fn tombstone() -> Option<Value> {
    Some(json!({"payload": {"op": null, "before": null, "after": null}}))
}
