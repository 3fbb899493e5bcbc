use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use super::models::PartitionKey;
use super::store::ApplyTransaction;
use crate::error::Result;

/// Watermark view of one batch transaction.
///
/// The stored watermark of a partition is read through the transaction once, then
/// tracked locally as the batch advances it. Only this transaction writes the
/// partitions it holds, so the local value stays equal to what the transaction sees.
#[derive(Debug, Default)]
pub struct BatchWatermarks {
    committed: HashMap<PartitionKey, Option<i64>>,
    advanced: BTreeMap<PartitionKey, i64>,
}

impl BatchWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest applied offset of the partition as of this point in the transaction
    pub async fn committed_offset(
        &mut self,
        tx: &mut dyn ApplyTransaction,
        key: &PartitionKey,
    ) -> Result<Option<i64>> {
        if let Some(offset) = self.committed.get(key) {
            return Ok(*offset);
        }

        let offset = tx.committed_offset(key).await?;
        debug!(partition_key = %key, committed_offset = ?offset, "Loaded watermark");
        self.committed.insert(key.clone(), offset);
        Ok(offset)
    }

    /// True iff the partition's watermark exists and is `>= offset`
    pub async fn is_applied(
        &mut self,
        tx: &mut dyn ApplyTransaction,
        key: &PartitionKey,
        offset: i64,
    ) -> Result<bool> {
        Ok(self
            .committed_offset(tx, key)
            .await?
            .is_some_and(|committed| committed >= offset))
    }

    /// Raise the watermark inside the transaction
    pub async fn advance(
        &mut self,
        tx: &mut dyn ApplyTransaction,
        key: &PartitionKey,
        offset: i64,
    ) -> Result<()> {
        let current = self.committed_offset(tx, key).await?;
        tx.advance_watermark(key, offset).await?;

        let raised = current.map_or(offset, |c| c.max(offset));
        self.committed.insert(key.clone(), Some(raised));
        self.advanced.insert(key.clone(), raised);
        Ok(())
    }

    /// Partitions whose watermark this transaction moved, with their new value
    pub fn advanced(&self) -> Vec<(PartitionKey, i64)> {
        self.advanced
            .iter()
            .map(|(key, offset)| (key.clone(), *offset))
            .collect()
    }
}
