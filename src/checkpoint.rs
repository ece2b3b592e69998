//! The persisted block from which indexing resumes.

use crate::database::Database;
use anyhow::Result;
use std::sync::Arc;

pub struct Checkpoint {
    database: Arc<dyn Database>,
    start_block: u64,
}

impl Checkpoint {
    pub fn new(database: Arc<dyn Database>, start_block: u64) -> Self {
        Self {
            database,
            start_block,
        }
    }

    /// Returns the block to resume scanning from.
    ///
    /// Falls back to the newest block in the transaction audit trail for
    /// datastores written before checkpoints were stored, and never returns a
    /// block before the configured start block.
    pub async fn load(&self) -> Result<u64> {
        let stored = match self.database.checkpoint().await? {
            Some(block) => Some(block),
            None => self.database.latest_transaction_block().await?,
        };
        let block = stored.map_or(self.start_block, |block| block.max(self.start_block));
        tracing::debug!(?stored, %block, "loaded checkpoint");
        Ok(block)
    }

    /// Raises the checkpoint to `block` and returns the stored value, which
    /// is larger than `block` if the checkpoint was already ahead.
    pub async fn advance(&self, block: u64) -> Result<u64> {
        let stored = self.database.advance_checkpoint(block).await?;
        tracing::trace!(%block, %stored, "advanced checkpoint");
        Ok(stored)
    }
}
