//! Error types for chain manager operations.

use forkline_common::{BlockHash, BlockHeight, ExecutionStatus};

/// Errors returned by [`ChainManager`](crate::ChainManager) operations.
///
/// Everything except `Store` is a caller bug: the caller skipped a check
/// it was required to make. Routine outcomes such as an orphan block or a
/// stale irreversibility proposal are ordinary return values instead.
#[derive(Debug, thiserror::Error)]
pub enum ChainManagerError {
    #[error("chain {chain_id} already exists")]
    ChainAlreadyExists { chain_id: u32 },

    #[error("chain {chain_id} has not been created")]
    ChainNotFound { chain_id: u32 },

    #[error("block not found: {hash}")]
    BlockNotFound { hash: BlockHash },

    /// Only linked blocks may become irreversible.
    #[error("cannot set unlinked block {hash} at height {height} as irreversible")]
    UnlinkedIrreversibleBlock { hash: BlockHash, height: BlockHeight },

    #[error("execution status of block {hash} is already {status}")]
    ExecutionStatusAlreadySet {
        hash: BlockHash,
        status: ExecutionStatus,
    },

    #[error("execution status can only be set to success or failed")]
    InvalidExecutionStatus,

    #[error("best chain height cannot go back from {current} to {requested}")]
    BestChainHeightRegression {
        current: BlockHeight,
        requested: BlockHeight,
    },

    /// Failure reported by the underlying key-value store or codec.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}
