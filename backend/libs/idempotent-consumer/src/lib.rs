//! # Idempotent Consumer: Offset Watermarks
//!
//! Persists, per (topic, partition), the highest source offset whose effect has been
//! durably applied to the target database. Consumers check the watermark before
//! applying an event and advance it in the **same transaction** as the row write, so
//! a redelivered event is absorbed instead of re-applied.
//!
//! ## Architecture
//!
//! ```text
//! Kafka → Consumer → BEGIN
//!                     ├─ committed_offset(topic, partition)   skip if offset <= watermark
//!                     ├─ row mutation
//!                     └─ advance(topic, partition, offset)     GREATEST(existing, offset)
//!                    COMMIT → acknowledge Kafka offsets
//! ```
//!
//! A crash between COMMIT and the Kafka acknowledgment causes redelivery, which the
//! watermark check turns into a skip.
//!
//! ## Usage
//!
//! ```ignore
//! use idempotent_consumer::WatermarkStore;
//! # use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let store = WatermarkStore::new(None)?;
//! store.initialize(&pool).await?;
//!
//! let mut tx = pool.begin().await?;
//! if !store.is_applied(&mut tx, "cdc.public.users", 0, 42).await? {
//!     // write the row here, using the same transaction
//!     store.advance(&mut tx, "cdc.public.users", 0, 42).await?;
//! }
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Table
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS _cdc_offsets (
//!     topic            TEXT        NOT NULL,
//!     partition_id     INTEGER     NOT NULL,
//!     committed_offset BIGINT      NOT NULL,
//!     updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (topic, partition_id)
//! );
//! ```
//!
//! The primary key is the backstop when several consumer instances share the table:
//! each instance only touches the partitions it owns.

mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, warn};

pub use error::{WatermarkError, WatermarkResult};

/// Name of the control table holding one watermark row per (topic, partition)
pub const WATERMARK_TABLE: &str = "_cdc_offsets";

/// PostgreSQL limit on identifier length, in bytes
const MAX_IDENTIFIER_LEN: usize = 63;

/// One stored watermark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub topic: String,
    pub partition: i32,
    /// Highest offset whose mutation has been durably applied
    pub committed_offset: i64,
    pub updated_at: DateTime<Utc>,
}

/// SQL access to the watermark table.
///
/// Stateless apart from the (optionally schema-qualified) table name; the per-event
/// operations borrow the caller's connection so they join its transaction.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    table: String,
}

impl WatermarkStore {
    /// Create a store for `_cdc_offsets`, optionally inside `schema`
    pub fn new(schema: Option<&str>) -> WatermarkResult<Self> {
        let table = match schema {
            Some(schema) => {
                validate_identifier(schema)?;
                format!("\"{}\".\"{}\"", schema, WATERMARK_TABLE)
            }
            None => format!("\"{}\"", WATERMARK_TABLE),
        };
        Ok(Self { table })
    }

    /// Quoted, possibly schema-qualified table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the watermark table if it does not exist
    pub async fn initialize(&self, pool: &PgPool) -> WatermarkResult<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                topic            TEXT        NOT NULL,
                partition_id     INTEGER     NOT NULL,
                committed_offset BIGINT      NOT NULL,
                updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (topic, partition_id)
            )
            "#,
            self.table
        );

        sqlx::query(&ddl).execute(pool).await?;

        info!(table = %self.table, "Watermark table initialized");
        Ok(())
    }

    /// Current committed offset for a partition, or `None` if nothing was applied yet
    pub async fn committed_offset(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        partition: i32,
    ) -> WatermarkResult<Option<i64>> {
        validate_topic(topic)?;

        let sql = format!(
            "SELECT committed_offset FROM {} WHERE topic = $1 AND partition_id = $2",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(topic)
            .bind(partition)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("committed_offset")?)),
            None => Ok(None),
        }
    }

    /// True iff a stored watermark exists and is `>= offset`
    pub async fn is_applied(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> WatermarkResult<bool> {
        let applied = self
            .committed_offset(conn, topic, partition)
            .await?
            .is_some_and(|committed| committed >= offset);

        if applied {
            debug!(topic = %topic, partition, offset, "Offset already applied");
        }

        Ok(applied)
    }

    /// Upsert the watermark to `offset`, never lowering it.
    ///
    /// Runs on the caller's connection; it becomes durable only when the caller's
    /// transaction commits. Returns the stored value after the upsert.
    pub async fn advance(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> WatermarkResult<i64> {
        validate_topic(topic)?;
        if offset < 0 {
            return Err(WatermarkError::InvalidOffset(offset));
        }

        let sql = format!(
            r#"
            INSERT INTO {table} (topic, partition_id, committed_offset, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (topic, partition_id) DO UPDATE
            SET committed_offset = GREATEST({table}.committed_offset, EXCLUDED.committed_offset),
                updated_at = EXCLUDED.updated_at
            RETURNING committed_offset
            "#,
            table = self.table
        );
        let stored: i64 = sqlx::query(&sql)
            .bind(topic)
            .bind(partition)
            .bind(offset)
            .bind(Utc::now())
            .fetch_one(&mut *conn)
            .await?
            .try_get("committed_offset")?;

        if stored > offset {
            warn!(
                topic = %topic,
                partition,
                offset,
                stored,
                "Watermark advance ignored, stored offset is higher"
            );
        } else {
            debug!(topic = %topic, partition, offset, "Watermark advanced");
        }

        Ok(stored)
    }

    /// Every stored watermark, ordered by topic then partition
    pub async fn list(&self, pool: &PgPool) -> WatermarkResult<Vec<Watermark>> {
        let sql = format!(
            "SELECT topic, partition_id, committed_offset, updated_at FROM {} \
             ORDER BY topic, partition_id",
            self.table
        );
        let rows = sqlx::query(&sql).fetch_all(pool).await?;

        rows.iter()
            .map(|row| {
                Ok(Watermark {
                    topic: row.try_get("topic")?,
                    partition: row.try_get("partition_id")?,
                    committed_offset: row.try_get("committed_offset")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    /// Delete the watermark of one partition, or of every partition of `topic`.
    ///
    /// Operational tool for forcing a replay; the apply path never calls it.
    /// Returns the number of rows removed.
    pub async fn reset(
        &self,
        pool: &PgPool,
        topic: &str,
        partition: Option<i32>,
    ) -> WatermarkResult<u64> {
        validate_topic(topic)?;

        let result = match partition {
            Some(partition) => {
                let sql = format!(
                    "DELETE FROM {} WHERE topic = $1 AND partition_id = $2",
                    self.table
                );
                sqlx::query(&sql)
                    .bind(topic)
                    .bind(partition)
                    .execute(pool)
                    .await?
            }
            None => {
                let sql = format!("DELETE FROM {} WHERE topic = $1", self.table);
                sqlx::query(&sql).bind(topic).execute(pool).await?
            }
        };

        warn!(
            topic = %topic,
            partition = ?partition,
            removed = result.rows_affected(),
            "Watermarks reset"
        );
        Ok(result.rows_affected())
    }
}

fn validate_topic(topic: &str) -> WatermarkResult<()> {
    if topic.is_empty() {
        return Err(WatermarkError::InvalidTopic("topic cannot be empty".to_string()));
    }
    if topic.len() > 249 {
        return Err(WatermarkError::InvalidTopic(format!(
            "topic too long ({} chars, max 249)",
            topic.len()
        )));
    }
    Ok(())
}

fn validate_identifier(name: &str) -> WatermarkResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(WatermarkError::InvalidSchema(name.to_string()))
    }
}
