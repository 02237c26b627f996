//! Execution catch-up: which blocks still need executing, and recording
//! the outcome.

use std::collections::HashSet;

use forkline_common::{BlockHash, ChainBlockLink, ExecutionStatus};
use tracing::debug;

use crate::{ChainManager, ChainManagerError};

impl ChainManager {
    /// Blocks on the way to `block_hash` that have not been executed, in
    /// ascending height order.
    ///
    /// Walks back from `block_hash` until an executed block or a missing
    /// link. A failed block anywhere on the walk poisons its descendants
    /// and the result is empty. Takes no chain lock.
    pub async fn get_not_executed_blocks(
        &self,
        block_hash: &BlockHash,
    ) -> Result<Vec<ChainBlockLink>, ChainManagerError> {
        let mut output = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = *block_hash;

        while visited.insert(cursor) {
            let Some(link) = self.get_chain_block_link(&cursor).await? else {
                break;
            };
            match link.execution_status {
                ExecutionStatus::Success => break,
                ExecutionStatus::Failed => {
                    debug!(
                        hash = %block_hash,
                        failed = %link.block_hash,
                        "Branch poisoned by failed block"
                    );
                    output.clear();
                    break;
                }
                ExecutionStatus::None => {
                    cursor = link.previous_block_hash;
                    output.push(link);
                }
            }
        }

        output.reverse();
        Ok(output)
    }

    /// Record the execution outcome of a block. Write-once: the stored
    /// status must still be `None` and the new one must not be.
    pub async fn set_chain_block_link_execution_status(
        &self,
        link: &ChainBlockLink,
        status: ExecutionStatus,
    ) -> Result<ChainBlockLink, ChainManagerError> {
        if status == ExecutionStatus::None {
            return Err(ChainManagerError::InvalidExecutionStatus);
        }
        let chain = self.get_chain().await?.ok_or(ChainManagerError::ChainNotFound {
            chain_id: self.config().chain_id,
        })?;
        let _guard = chain.lock().await;

        let mut stored = self.require_chain_block_link(&link.block_hash).await?;
        if stored.execution_status != ExecutionStatus::None {
            return Err(ChainManagerError::ExecutionStatusAlreadySet {
                hash: stored.block_hash,
                status: stored.execution_status,
            });
        }

        stored.execution_status = status;
        self.put_chain_block_link(&stored).await?;
        debug!(hash = %stored.block_hash, height = stored.height, %status, "Execution status set");
        Ok(stored)
    }
}
