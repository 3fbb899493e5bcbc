//! Pool creation tests against a live PostgreSQL
//!
//! Run with: TARGET_DB_HOST=localhost TARGET_DB_PORT=5433 cargo test -p db-pool -- --ignored

use db_pool::{create_pool, ping, DbConfig};
use std::time::{Duration, Instant};

fn test_config() -> DbConfig {
    DbConfig {
        service_name: "db-pool-test".to_string(),
        host: std::env::var("TARGET_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: std::env::var("TARGET_DB_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5433),
        database: std::env::var("TARGET_DB_NAME").unwrap_or_else(|_| "targetdb".to_string()),
        user: std::env::var("TARGET_DB_USER").unwrap_or_else(|_| "migration".to_string()),
        password: std::env::var("TARGET_DB_PASSWORD")
            .unwrap_or_else(|_| "migration_secret".to_string()),
        connect_timeout_secs: 5,
        acquire_timeout_secs: 2,
        ..Default::default()
    }
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_create_pool_and_ping() {
    let pool = create_pool(&test_config())
        .await
        .expect("Failed to create test pool");

    ping(&pool).await.expect("Liveness probe should succeed");
    assert!(pool.size() >= 1);

    pool.close().await;
    assert!(ping(&pool).await.is_err());
}

#[tokio::test]
async fn test_unreachable_server_fails_fast() {
    // Nothing listens on port 1
    let config = DbConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        acquire_timeout_secs: 2,
        ..test_config()
    };

    let started = Instant::now();
    let result = create_pool(&config).await;

    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(10));
}
