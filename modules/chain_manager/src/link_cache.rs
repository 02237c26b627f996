//! Write-through cache of recently written block links.

use dashmap::DashMap;
use forkline_common::{BlockHash, BlockHeight, ChainBlockLink};

/// Holds whole link records keyed by block hash. Entries are replaced as
/// a unit, so a reader sees either the old or the new record.
#[derive(Default)]
pub struct ChainBlockLinkCache {
    links: DashMap<BlockHash, ChainBlockLink>,
}

impl ChainBlockLinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &BlockHash) -> Option<ChainBlockLink> {
        self.links.get(hash).map(|link| link.clone())
    }

    pub fn set(&self, link: &ChainBlockLink) {
        self.links.insert(link.block_hash, link.clone());
    }

    pub fn remove(&self, hash: &BlockHash) {
        self.links.remove(hash);
    }

    pub fn links(&self) -> Vec<ChainBlockLink> {
        self.links.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Drop every link at or below `height`; those are settled and read
    /// back from the store when needed.
    pub fn evict_up_to(&self, height: BlockHeight) {
        self.links.retain(|_, link| link.height > height);
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
