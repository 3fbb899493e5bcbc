mod applier;
mod connection;
mod engine;
mod models;
mod source;
mod store;
mod watermark;

pub use applier::{ApplyOutcome, Mutation, MutationApplier, SkipReason, Statement, TableRef};
pub use connection::{ConnectionManager, Connector, HandleState};
pub use engine::{ApplyEngine, CommitReceipt, CycleReport, EngineSettings, RunStats};
pub use models::{
    table_from_topic, Batch, ChangeEvent, Identifier, Operation, PartitionBatch, PartitionKey,
    RowImage, SourceRecord,
};
pub use source::{EventSource, KafkaConnector, KafkaEventSource, KafkaSettings};
pub use store::{ApplyTransaction, PgApplyTransaction, PgConnector, PgTargetStore, TargetStore};
pub use watermark::BatchWatermarks;
