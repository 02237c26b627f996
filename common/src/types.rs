//! Chain bookkeeping records shared between the chain manager and its callers.

use std::collections::BTreeMap;
use std::fmt;

use bitmask_enum::bitmask;
use serde::{Deserialize, Serialize};

use crate::hash::BlockHash;

/// Block height type.
pub type BlockHeight = u64;

/// Height assigned to the genesis block of every chain.
pub const GENESIS_BLOCK_HEIGHT: BlockHeight = 1;

/// Execution outcome recorded against a block link.
///
/// Transitions are write-once: `None` moves to `Success` or `Failed` and
/// never changes again, short of a rollback to the last irreversible block.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
#[cbor(index_only)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    #[n(0)]
    None,
    #[n(1)]
    Success,
    #[n(2)]
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::None => write!(f, "none"),
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One known block header and its place in the fork tree.
///
/// Identity and ancestry never change once stored; only `is_linked`,
/// `execution_status` and `is_irreversible_block` are updated.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ChainBlockLink {
    #[n(0)]
    pub block_hash: BlockHash,
    #[n(1)]
    pub previous_block_hash: BlockHash,
    #[n(2)]
    pub height: BlockHeight,
    /// Ancestry is known and stored all the way down to genesis.
    #[n(3)]
    pub is_linked: bool,
    #[n(4)]
    pub execution_status: ExecutionStatus,
    /// Covered by a last-irreversible-block advancement. Never cleared.
    #[n(5)]
    pub is_irreversible_block: bool,
}

impl ChainBlockLink {
    /// A fresh, unlinked, unexecuted link as announced by a block source.
    pub fn new(block_hash: BlockHash, previous_block_hash: BlockHash, height: BlockHeight) -> Self {
        Self {
            block_hash,
            previous_block_hash,
            height,
            is_linked: false,
            execution_status: ExecutionStatus::None,
            is_irreversible_block: false,
        }
    }
}

/// Canonical block hash at a height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ChainBlockIndex {
    #[n(0)]
    pub block_hash: BlockHash,
}

/// Aggregate root holding the global pointers of one logical chain.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Chain {
    #[n(0)]
    pub id: u32,
    #[n(1)]
    pub genesis_block_hash: BlockHash,
    #[n(2)]
    pub longest_chain_hash: BlockHash,
    #[n(3)]
    pub longest_chain_height: BlockHeight,
    #[n(4)]
    pub best_chain_hash: BlockHash,
    #[n(5)]
    pub best_chain_height: BlockHeight,
    #[n(6)]
    pub last_irreversible_block_hash: BlockHash,
    #[n(7)]
    pub last_irreversible_block_height: BlockHeight,
    /// Branch tip hash -> tip height.
    #[n(8)]
    pub branches: BTreeMap<BlockHash, BlockHeight>,
    /// Missing previous-block hash -> hash of the block waiting on it.
    #[n(9)]
    pub not_linked_blocks: BTreeMap<BlockHash, BlockHash>,
}

impl Chain {
    /// A chain whose every pointer is the genesis block.
    pub fn new(id: u32, genesis_block_hash: BlockHash) -> Self {
        Self {
            id,
            genesis_block_hash,
            longest_chain_hash: genesis_block_hash,
            longest_chain_height: GENESIS_BLOCK_HEIGHT,
            best_chain_hash: genesis_block_hash,
            best_chain_height: GENESIS_BLOCK_HEIGHT,
            last_irreversible_block_hash: genesis_block_hash,
            last_irreversible_block_height: GENESIS_BLOCK_HEIGHT,
            branches: BTreeMap::from([(genesis_block_hash, GENESIS_BLOCK_HEIGHT)]),
            not_linked_blocks: BTreeMap::new(),
        }
    }
}

/// Outcome flags of a single attach call.
///
/// Exactly one of `NewBlockLinked` / `NewBlockNotLinked` describes the
/// directly attached block. `NewBlocksLinked` reports that waiting orphans
/// were linked behind it and `LongestChainFound` that the longest-chain
/// pointer moved.
#[bitmask(u8)]
pub enum BlockAttachOperationStatus {
    NewBlockNotLinked,
    NewBlockLinked,
    LongestChainFound,
    NewBlocksLinked,
}

impl fmt::Display for BlockAttachOperationStatus {
    /// Set flag names joined by `|`, or `none`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::NewBlockNotLinked, "new-block-not-linked"),
            (Self::NewBlockLinked, "new-block-linked"),
            (Self::LongestChainFound, "longest-chain-found"),
            (Self::NewBlocksLinked, "new-blocks-linked"),
        ];
        let set: Vec<&str> =
            names.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, name)| *name).collect();
        if set.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// Bookkeeping entries made stale by a new last irreversible block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscardedBranch {
    /// Branch tips that do not descend from the last irreversible block.
    pub branch_keys: Vec<BlockHash>,
    /// `not_linked_blocks` keys whose waiting block can no longer be linked.
    pub not_linked_keys: Vec<BlockHash>,
}

impl DiscardedBranch {
    pub fn is_empty(&self) -> bool {
        self.branch_keys.is_empty() && self.not_linked_keys.is_empty()
    }
}
