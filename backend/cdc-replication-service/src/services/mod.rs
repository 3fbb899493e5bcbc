pub mod cdc;

pub use cdc::{ApplyEngine, EngineSettings, KafkaConnector, KafkaSettings, PgConnector};
