//! Change-data-capture replication: applies row-level change events from Kafka to
//! PostgreSQL with per-partition offset watermarks, so redelivery never produces
//! duplicate or out-of-order effects.

pub mod config;
pub mod error;
pub mod metrics;
pub mod services;

pub use config::ReplicatorConfig;
pub use error::{Endpoint, ReplicatorError, Result};
