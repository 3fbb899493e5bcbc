use async_trait::async_trait;
use db_pool::DbConfig;
use idempotent_consumer::WatermarkStore;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

use super::applier::{Mutation, Statement};
use super::connection::Connector;
use super::models::PartitionKey;
use crate::error::{Endpoint, Result};

/// One open transaction against the target store.
///
/// Row writes and watermark updates issued through the same transaction become
/// visible together on `commit`, or not at all.
#[async_trait]
pub trait ApplyTransaction: Send {
    /// Watermark as seen inside this transaction
    async fn committed_offset(&mut self, key: &PartitionKey) -> Result<Option<i64>>;

    /// Raise the watermark to `offset` (never lowers it)
    async fn advance_watermark(&mut self, key: &PartitionKey, offset: i64) -> Result<()>;

    /// Run one mutation; returns rows affected
    async fn execute(&mut self, mutation: &Mutation) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Live handle to the target store
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn ApplyTransaction>>;
}

/// PostgreSQL target store backed by a pool
pub struct PgTargetStore {
    pool: PgPool,
    watermarks: WatermarkStore,
    service_name: String,
}

impl PgTargetStore {
    /// Wrap a pool whose watermark table already exists
    pub fn new(pool: PgPool, watermarks: WatermarkStore, service_name: impl Into<String>) -> Self {
        Self {
            pool,
            watermarks,
            service_name: service_name.into(),
        }
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn begin(&self) -> Result<Box<dyn ApplyTransaction>> {
        db_pool::update_pool_metrics(&self.pool, &self.service_name);
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgApplyTransaction {
            tx,
            watermarks: self.watermarks.clone(),
        }))
    }
}

pub struct PgApplyTransaction {
    tx: Transaction<'static, Postgres>,
    watermarks: WatermarkStore,
}

#[async_trait]
impl ApplyTransaction for PgApplyTransaction {
    async fn committed_offset(&mut self, key: &PartitionKey) -> Result<Option<i64>> {
        Ok(self
            .watermarks
            .committed_offset(&mut self.tx, &key.topic, key.partition)
            .await?)
    }

    async fn advance_watermark(&mut self, key: &PartitionKey, offset: i64) -> Result<()> {
        self.watermarks
            .advance(&mut self.tx, &key.topic, key.partition, offset)
            .await?;
        Ok(())
    }

    async fn execute(&mut self, mutation: &Mutation) -> Result<u64> {
        let Some(statement) = Statement::for_mutation(mutation) else {
            return Ok(0);
        };

        let result = sqlx::query(&statement.sql)
            .bind(Json(&statement.row))
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Opens verified pools to the target database and bootstraps the watermark table
pub struct PgConnector {
    db: DbConfig,
    watermarks: WatermarkStore,
}

impl PgConnector {
    pub fn new(db: DbConfig, watermarks: WatermarkStore) -> Self {
        Self { db, watermarks }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Handle = PgTargetStore;

    fn endpoint(&self) -> Endpoint {
        Endpoint::Store
    }

    fn describe(&self) -> String {
        self.db.display_target()
    }

    async fn connect(&self) -> Result<PgTargetStore> {
        let pool = db_pool::create_pool(&self.db).await?;

        if let Err(e) = self.watermarks.initialize(&pool).await {
            pool.close().await;
            return Err(e.into());
        }

        match self.watermarks.list(&pool).await {
            Ok(watermarks) => {
                info!(
                    partitions = watermarks.len(),
                    "Loaded stored watermarks"
                );
                for w in &watermarks {
                    debug!(
                        topic = %w.topic,
                        partition = w.partition,
                        committed_offset = w.committed_offset,
                        updated_at = %w.updated_at,
                        "Stored watermark"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Could not list stored watermarks"),
        }

        Ok(PgTargetStore::new(
            pool,
            self.watermarks.clone(),
            self.db.service_name.clone(),
        ))
    }

    async fn probe(&self, handle: &PgTargetStore) -> Result<()> {
        db_pool::ping(&handle.pool).await?;
        Ok(())
    }

    async fn release(&self, handle: PgTargetStore) {
        handle.pool.close().await;
        debug!(target_db = %self.describe(), "Target store pool closed");
    }
}
