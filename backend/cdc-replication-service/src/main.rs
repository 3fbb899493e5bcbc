use anyhow::{Context, Result};
use cdc_replication_service::error::EXIT_STARTUP_FAILURE;
use cdc_replication_service::services::cdc::{
    ApplyEngine, ConnectionManager, EngineSettings, KafkaConnector, KafkaSettings,
    MutationApplier, PgConnector,
};
use cdc_replication_service::{metrics, ReplicatorConfig, ReplicatorError};
use idempotent_consumer::WatermarkStore;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cdc_replication_service=info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run() -> Result<()> {
    let config = ReplicatorConfig::from_env().context("Invalid configuration")?;
    config.log_config();

    let metrics_server = match config.metrics_port {
        Some(port) => {
            let server = metrics::serve(port).context("Failed to bind metrics server")?;
            let handle = server.handle();
            actix_web::rt::spawn(server);
            Some(handle)
        }
        None => None,
    };

    let schema = config.schema()?;
    let watermarks = WatermarkStore::new(schema.as_ref().map(|s| s.as_str()))
        .map_err(ReplicatorError::from)?;
    let applier = MutationApplier::new(config.primary_key()?, schema);

    let db = config.db_config();
    db.log_config();
    let store = ConnectionManager::new(
        PgConnector::new(db, watermarks),
        config.retry_config(),
        config.connect_timeout(),
    );
    let source = ConnectionManager::new(
        KafkaConnector::new(KafkaSettings::from_config(&config)),
        config.retry_config(),
        config.connect_timeout(),
    );
    let mut engine = ApplyEngine::new(source, store, applier, EngineSettings::from_config(&config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, finishing current cycle");
        let _ = shutdown_tx.send(true);
    });

    let result = match engine.connect().await {
        Ok(()) => engine.run(shutdown_rx).await,
        Err(e) => {
            engine.close().await;
            Err(e)
        }
    };

    if let Some(handle) = metrics_server {
        handle.stop(true).await;
    }

    let stats = result?;
    info!(
        cycles = stats.cycles,
        processed = stats.events_processed,
        applied = stats.events_applied,
        duplicates = stats.duplicates_skipped,
        batches_committed = stats.batches_committed,
        batches_failed = stats.batches_failed,
        "cdc-replication-service stopped"
    );
    Ok(())
}

#[actix_web::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting cdc-replication-service");

    if let Err(e) = run().await {
        let code = e
            .downcast_ref::<ReplicatorError>()
            .map_or(EXIT_STARTUP_FAILURE, ReplicatorError::exit_code);
        error!(error = ?e, exit_code = code, "cdc-replication-service failed");
        std::process::exit(code);
    }
}
