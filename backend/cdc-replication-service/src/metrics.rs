//! Prometheus metrics for the replicator
//!
//! Exposed on `GET /metrics` when `METRICS_PORT` is set

use actix_web::{dev::Server, web, App, HttpResponse, HttpServer};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGaugeVec, TextEncoder,
};
use tracing::info;

use crate::error::Endpoint;
use crate::services::cdc::PartitionKey;

/// `reason` label values of `cdc_events_skipped_total`
pub const SKIP_DUPLICATE: &str = "duplicate";
pub const SKIP_TOMBSTONE: &str = "tombstone";
pub const SKIP_EMPTY_ROW: &str = "empty_row";
pub const SKIP_UNKNOWN_OP: &str = "unknown_op";

lazy_static::lazy_static! {
    static ref EVENTS_APPLIED: IntCounter = register_int_counter!(
        "cdc_events_applied_total",
        "Change events written to the target store"
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref EVENTS_SKIPPED: IntCounterVec = register_int_counter_vec!(
        "cdc_events_skipped_total",
        "Change events that produced no write, by reason",
        &["reason"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref BATCHES_COMMITTED: IntCounter = register_int_counter!(
        "cdc_batches_committed_total",
        "Batches committed to the target store"
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref BATCHES_FAILED: IntCounter = register_int_counter!(
        "cdc_batches_failed_total",
        "Batches rolled back"
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref RECONNECTS: IntCounterVec = register_int_counter_vec!(
        "cdc_reconnects_total",
        "Handles replaced after going stale",
        &["target"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref WATERMARK_OFFSET: IntGaugeVec = register_int_gauge_vec!(
        "cdc_watermark_offset",
        "Last committed watermark per partition",
        &["topic", "partition"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref BATCH_DURATION: Histogram = register_histogram!(
        "cdc_batch_duration_seconds",
        "Time from first write to commit for one batch",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).expect("Prometheus metrics registration should succeed at startup");
}

pub fn record_applied(count: u64) {
    EVENTS_APPLIED.inc_by(count);
}

pub fn record_skipped(reason: &str, count: u64) {
    if count > 0 {
        EVENTS_SKIPPED.with_label_values(&[reason]).inc_by(count);
    }
}

pub fn record_batch_committed(seconds: f64) {
    BATCHES_COMMITTED.inc();
    BATCH_DURATION.observe(seconds);
}

pub fn record_batch_failed() {
    BATCHES_FAILED.inc();
}

pub fn record_reconnect(endpoint: Endpoint) {
    RECONNECTS.with_label_values(&[endpoint.as_str()]).inc();
}

pub fn set_watermark(key: &PartitionKey, offset: i64) {
    WATERMARK_OFFSET
        .with_label_values(&[key.topic.as_str(), &key.partition.to_string()])
        .set(offset);
}

/// Text exposition of the default registry
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

async fn metrics_handler() -> HttpResponse {
    match render() {
        Ok(body) => HttpResponse::Ok()
            .content_type(TextEncoder::new().format_type())
            .body(body),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Bind the `/metrics` endpoint; the returned server must be polled (spawned) to serve
pub fn serve(port: u16) -> std::io::Result<Server> {
    info!("Starting metrics server on 0.0.0.0:{}", port);

    let server = HttpServer::new(|| App::new().route("/metrics", web::get().to(metrics_handler)))
        .workers(1)
        .disable_signals()
        .bind(("0.0.0.0", port))?
        .run();
    Ok(server)
}
