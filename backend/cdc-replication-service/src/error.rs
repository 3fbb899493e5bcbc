use idempotent_consumer::WatermarkError;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReplicatorError>;

/// Exit status for startup failures other than unreachable endpoints
pub const EXIT_STARTUP_FAILURE: i32 = 1;

/// Exit status when the event source or target store cannot be reached after all retries
pub const EXIT_UNREACHABLE: i32 = 2;

/// The two external systems the replicator holds handles to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Source,
    Store,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Source => "source",
            Endpoint::Store => "store",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Source => f.write_str("event source"),
            Endpoint::Store => f.write_str("target store"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Watermark error: {0}")]
    Watermark(#[from] WatermarkError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Payload could not be decoded into a change event
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Missing primary key {column:?} in {image} image for table {table}")]
    MissingPrimaryKey {
        table: String,
        column: String,
        image: &'static str,
    },

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A live handle was needed but the endpoint is not usable right now
    #[error("{endpoint} unavailable: {reason}")]
    Unavailable { endpoint: Endpoint, reason: String },

    #[error("Event {topic}[{partition}]@{offset} failed: {source}")]
    EventFailed {
        topic: String,
        partition: i32,
        offset: i64,
        source: Box<ReplicatorError>,
    },

    #[error("{endpoint} unreachable after {attempts} attempts: {last_error}")]
    Unreachable {
        endpoint: Endpoint,
        attempts: u32,
        last_error: String,
    },
}

impl ReplicatorError {
    /// Which endpoint's handle this error invalidates, if any.
    ///
    /// Connectivity failures mark the handle stale so it is replaced before the next
    /// cycle; data errors leave handles alone.
    pub fn stale_endpoint(&self) -> Option<Endpoint> {
        match self {
            ReplicatorError::Database(e) => is_connection_error(e).then_some(Endpoint::Store),
            ReplicatorError::Watermark(e) => e.is_transient().then_some(Endpoint::Store),
            ReplicatorError::Kafka(_) => Some(Endpoint::Source),
            ReplicatorError::Unavailable { endpoint, .. } => Some(*endpoint),
            ReplicatorError::EventFailed { source, .. } => source.stale_endpoint(),
            _ => None,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        self.stale_endpoint().is_some()
    }

    /// Only exhausting connection retries ends the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplicatorError::Unreachable { .. })
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            EXIT_UNREACHABLE
        } else {
            EXIT_STARTUP_FAILURE
        }
    }

    /// Wrap a per-event failure with the event's position
    pub fn at_event(self, topic: &str, partition: i32, offset: i64) -> Self {
        ReplicatorError::EventFailed {
            topic: topic.to_string(),
            partition,
            offset,
            source: Box::new(self),
        }
    }
}

fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}
