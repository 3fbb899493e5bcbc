use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use crate::error::{ReplicatorError, Result};

/// PostgreSQL limit on identifier length, in bytes
const MAX_IDENTIFIER_LEN: usize = 63;

/// Field → value map of one row image
pub type RowImage = Map<String, Value>;

/// One raw record as delivered by the event source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// `None` for a log-compaction tombstone
    pub payload: Option<Vec<u8>>,
}

impl SourceRecord {
    pub fn key(&self) -> PartitionKey {
        PartitionKey::new(&self.topic, self.partition)
    }
}

/// Identity of one ordered stream: topic plus partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Target table for a topic, as `(schema, table)`.
///
/// `cdc.public.users` → `(None, "users")`: the last segment of three or more.
/// `public.users` → `(Some("public"), "users")`: a two-segment topic names its schema.
/// A topic without dots is the table name itself.
pub fn table_from_topic(topic: &str) -> (Option<&str>, &str) {
    let segments: Vec<&str> = topic.split('.').collect();
    match segments.as_slice() {
        [schema, table] => (Some(*schema), *table),
        [.., table] if segments.len() >= 3 => (None, *table),
        _ => (None, topic),
    }
}

/// A validated SQL identifier (table, column or schema name), always rendered quoted
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(String);

impl Identifier {
    /// Accepts `[A-Za-z_][A-Za-z0-9_]*` up to 63 bytes
    pub fn parse(name: &str) -> Result<Self> {
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

        if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
            Ok(Self(name.to_string()))
        } else {
            Err(ReplicatorError::InvalidIdentifier(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Change operation carried by an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// `c`
    Create,
    /// `r`, initial snapshot read
    Snapshot,
    /// `u`
    Update,
    /// `d`
    Delete,
    /// `op` absent or null, or no payload at all
    Tombstone,
    /// Any other code, e.g. `t` (truncate) or schema-change markers
    Unknown(String),
}

impl Operation {
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some("c") => Operation::Create,
            Some("r") => Operation::Snapshot,
            Some("u") => Operation::Update,
            Some("d") => Operation::Delete,
            None => Operation::Tombstone,
            Some(other) => Operation::Unknown(other.to_string()),
        }
    }
}

/// Envelope fields shared by the schema-wrapped and bare encodings
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    op: Option<Value>,
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    after: Option<Value>,
}

/// One decoded row-level change
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Target table name derived from the topic
    pub stream: String,
    /// Schema named by a two-segment topic
    pub stream_schema: Option<String>,
    pub operation: Operation,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
}

impl ChangeEvent {
    /// Decode a source record.
    ///
    /// Accepts `{"payload": {...}}` and the bare `{"op": .., "before": .., "after": ..}`
    /// form. An absent value or a `null` payload decodes to a tombstone.
    pub fn decode(record: &SourceRecord) -> Result<Self> {
        let envelope = match &record.payload {
            None => Envelope::default(),
            Some(bytes) => parse_envelope(bytes)?,
        };

        let operation = match envelope.op {
            None | Some(Value::Null) => Operation::Tombstone,
            Some(Value::String(code)) => Operation::from_code(Some(&code)),
            Some(other) => Operation::Unknown(other.to_string()),
        };

        let (stream_schema, stream) = table_from_topic(&record.topic);

        Ok(Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            stream: stream.to_string(),
            stream_schema: stream_schema.map(str::to_string),
            operation,
            before: row_image(envelope.before, "before")?,
            after: row_image(envelope.after, "after")?,
        })
    }

    pub fn key(&self) -> PartitionKey {
        PartitionKey::new(&self.topic, self.partition)
    }
}

fn parse_envelope(bytes: &[u8]) -> Result<Envelope> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ReplicatorError::MalformedEvent(format!("invalid JSON: {}", e)))?;

    let mut object = match value {
        Value::Null => return Ok(Envelope::default()),
        Value::Object(object) => object,
        other => {
            return Err(ReplicatorError::MalformedEvent(format!(
                "expected a JSON object, got {}",
                json_type(&other)
            )))
        }
    };

    let inner = match object.remove("payload") {
        Some(Value::Null) => return Ok(Envelope::default()),
        Some(payload) => payload,
        None => Value::Object(object),
    };

    serde_json::from_value(inner)
        .map_err(|e| ReplicatorError::MalformedEvent(format!("invalid envelope: {}", e)))
}

fn row_image(value: Option<Value>, image: &str) -> Result<Option<RowImage>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(row)) => Ok(Some(row)),
        Some(other) => Err(ReplicatorError::MalformedEvent(format!(
            "`{}` must be an object, got {}",
            image,
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Records of one partition, in arrival order
#[derive(Debug, Clone)]
pub struct PartitionBatch {
    pub key: PartitionKey,
    pub records: Vec<SourceRecord>,
}

impl PartitionBatch {
    pub fn first_offset(&self) -> Option<i64> {
        self.records.first().map(|r| r.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(|r| r.offset)
    }
}

/// Records pulled in one poll, grouped by partition.
///
/// Partitions appear in first-seen order and records keep arrival order within their
/// partition. Nothing is implied about order across partitions.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    partitions: Vec<PartitionBatch>,
}

impl Batch {
    pub fn from_records(records: Vec<SourceRecord>) -> Self {
        let mut index: HashMap<PartitionKey, usize> = HashMap::new();
        let mut partitions: Vec<PartitionBatch> = Vec::new();

        for record in records {
            let key = record.key();
            match index.get(&key) {
                Some(&i) => partitions[i].records.push(record),
                None => {
                    index.insert(key.clone(), partitions.len());
                    partitions.push(PartitionBatch {
                        key,
                        records: vec![record],
                    });
                }
            }
        }

        Self { partitions }
    }

    pub fn partitions(&self) -> &[PartitionBatch] {
        &self.partitions
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(|p| p.records.is_empty())
    }

    /// Where each partition must restart for the batch to be redelivered
    pub fn rewind_positions(&self) -> Vec<(PartitionKey, i64)> {
        self.partitions
            .iter()
            .filter_map(|p| p.first_offset().map(|o| (p.key.clone(), o)))
            .collect()
    }

    /// Next offset to consume per partition once the batch is durable
    pub fn ack_positions(&self) -> Vec<(PartitionKey, i64)> {
        self.partitions
            .iter()
            .filter_map(|p| p.last_offset().map(|o| (p.key.clone(), o + 1)))
            .collect()
    }
}
