//! Last irreversible block (LIB) advancement, pruning and rollback.

use std::collections::HashSet;

use forkline_common::{BlockHash, BlockHeight, Chain, DiscardedBranch, ExecutionStatus};
use tracing::{debug, info, warn};

use crate::{ChainHandle, ChainManager, ChainManagerError};

impl ChainManager {
    /// Make `block_hash` the last irreversible block.
    ///
    /// Returns `false`, changing nothing, when the block does not descend
    /// from the current LIB. An unknown or unlinked block is an error.
    /// On success every block between the old and new LIB is marked
    /// irreversible and indexed by height, and branches that no longer
    /// descend from the new LIB are dropped.
    pub async fn set_irreversible_block(
        &self,
        chain: &ChainHandle,
        block_hash: BlockHash,
    ) -> Result<bool, ChainManagerError> {
        let mut guard = chain.lock().await;
        let target = self.require_chain_block_link(&block_hash).await?;
        if !target.is_linked {
            return Err(ChainManagerError::UnlinkedIrreversibleBlock {
                hash: block_hash,
                height: target.height,
            });
        }

        let lib_hash = guard.last_irreversible_block_hash;
        let lib_height = guard.last_irreversible_block_height;
        if block_hash == lib_hash {
            return Ok(true);
        }
        if target.height <= lib_height {
            debug!(
                hash = %block_hash,
                height = target.height,
                lib_height,
                "Block is not above LIB"
            );
            return Ok(false);
        }

        // Collect the path from the target down to just above the LIB
        let target_height = target.height;
        let mut path = Vec::new();
        let mut current = target;
        let boundary = loop {
            let parent = self.require_chain_block_link(&current.previous_block_hash).await?;
            let descending = parent.height < current.height;
            path.push(current);
            if parent.height <= lib_height || !descending {
                break parent;
            }
            current = parent;
        };
        if boundary.block_hash != lib_hash {
            debug!(
                hash = %block_hash,
                height = target_height,
                lib = %lib_hash,
                lib_height,
                "Block does not descend from LIB"
            );
            return Ok(false);
        }

        for mut link in path.into_iter().rev() {
            link.is_irreversible_block = true;
            self.put_chain_block_index(link.height, link.block_hash).await?;
            self.put_chain_block_link(&link).await?;
        }

        let mut working = guard.clone();
        working.last_irreversible_block_hash = block_hash;
        working.last_irreversible_block_height = target_height;

        let discarded = self.get_discarded_branch(&working, block_hash, target_height).await?;
        prune_chain_branch(&mut working, &discarded);

        self.save_chain(&working).await?;
        *guard = working;
        self.evict_cached_links_up_to(target_height);

        info!(
            lib = %block_hash,
            lib_height = target_height,
            discarded_branches = discarded.branch_keys.len(),
            discarded_not_linked = discarded.not_linked_keys.len(),
            "Advanced last irreversible block"
        );
        Ok(true)
    }

    /// Bookkeeping entries that can no longer matter once `lib_hash` at
    /// `lib_height` is irreversible: branch tips not descending from it,
    /// and waiting blocks that are missing or at or below its height.
    pub async fn get_discarded_branch(
        &self,
        chain: &Chain,
        lib_hash: BlockHash,
        lib_height: BlockHeight,
    ) -> Result<DiscardedBranch, ChainManagerError> {
        let mut discarded = DiscardedBranch::default();

        for (&tip, &height) in &chain.branches {
            if tip == lib_hash {
                continue;
            }
            if height <= lib_height || !self.descends_from(tip, lib_hash, lib_height).await? {
                discarded.branch_keys.push(tip);
            }
        }

        for (&missing, &waiting) in &chain.not_linked_blocks {
            match self.get_chain_block_link(&waiting).await? {
                Some(link) if link.height > lib_height => {}
                _ => discarded.not_linked_keys.push(missing),
            }
        }

        Ok(discarded)
    }

    /// Remove discarded entries from the chain.
    pub async fn clean_chain_branch(
        &self,
        chain: &ChainHandle,
        discarded: &DiscardedBranch,
    ) -> Result<(), ChainManagerError> {
        if discarded.is_empty() {
            return Ok(());
        }
        let mut guard = chain.lock().await;
        let mut working = guard.clone();
        prune_chain_branch(&mut working, discarded);
        self.save_chain(&working).await?;
        *guard = working;
        Ok(())
    }

    /// Roll the chain back to its last irreversible block.
    ///
    /// Every block above the LIB that a branch tip reaches becomes unlinked
    /// and unexecuted, so it can be attached and executed again.
    pub async fn reset_chain_to_lib(&self, chain: &ChainHandle) -> Result<(), ChainManagerError> {
        let mut guard = chain.lock().await;
        let mut working = guard.clone();
        let lib_hash = working.last_irreversible_block_hash;
        let lib_height = working.last_irreversible_block_height;

        let mut visited = HashSet::new();
        let mut reset = 0usize;
        for &tip in working.branches.keys() {
            let mut cursor = tip;
            while cursor != lib_hash && visited.insert(cursor) {
                let Some(mut link) = self.get_chain_block_link(&cursor).await? else {
                    break;
                };
                if link.height <= lib_height {
                    break;
                }
                cursor = link.previous_block_hash;
                link.is_linked = false;
                link.execution_status = ExecutionStatus::None;
                self.put_chain_block_link(&link).await?;
                reset += 1;
            }
        }

        working.branches.clear();
        working.branches.insert(lib_hash, lib_height);
        working.not_linked_blocks.clear();
        working.best_chain_hash = lib_hash;
        working.best_chain_height = lib_height;
        working.longest_chain_hash = lib_hash;
        working.longest_chain_height = lib_height;

        self.save_chain(&working).await?;
        *guard = working;

        warn!(lib = %lib_hash, lib_height, reset, "Chain reset to last irreversible block");
        Ok(())
    }

    /// Whether walking back from `block_hash` reaches `lib_hash` before
    /// dropping to `lib_height`.
    pub(crate) async fn descends_from(
        &self,
        block_hash: BlockHash,
        lib_hash: BlockHash,
        lib_height: BlockHeight,
    ) -> Result<bool, ChainManagerError> {
        let mut cursor = block_hash;
        loop {
            if cursor == lib_hash {
                return Ok(true);
            }
            let Some(link) = self.get_chain_block_link(&cursor).await? else {
                return Ok(false);
            };
            if link.height <= lib_height {
                return Ok(false);
            }
            cursor = link.previous_block_hash;
        }
    }
}

/// Drop discarded keys. If the longest tip went with them, the highest
/// surviving tip takes over; with no tips left the LIB becomes the only one.
fn prune_chain_branch(chain: &mut Chain, discarded: &DiscardedBranch) {
    for key in &discarded.branch_keys {
        chain.branches.remove(key);
    }
    for key in &discarded.not_linked_keys {
        chain.not_linked_blocks.remove(key);
    }

    if chain.branches.is_empty() {
        chain.branches.insert(
            chain.last_irreversible_block_hash,
            chain.last_irreversible_block_height,
        );
    }

    if !chain.branches.contains_key(&chain.longest_chain_hash) {
        let mut longest: Option<(BlockHash, BlockHeight)> = None;
        for (&hash, &height) in &chain.branches {
            if longest.is_none_or(|(_, h)| height > h) {
                longest = Some((hash, height));
            }
        }
        if let Some((hash, height)) = longest {
            debug!(longest = %hash, height, "Longest chain moved after pruning");
            chain.longest_chain_hash = hash;
            chain.longest_chain_height = height;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use crate::ChainManagerError;
    use forkline_common::ExecutionStatus;

    /// Genesis 1, main line 2..=6 and a fork 102 -> 103 off genesis.
    async fn forked_chain() -> (crate::ChainManager, crate::ChainHandle) {
        let (manager, chain) = new_chain().await;
        for n in 2..=6 {
            attach(&manager, &chain, n, n - 1, n).await;
        }
        attach(&manager, &chain, 102, 1, 2).await;
        attach(&manager, &chain, 103, 102, 3).await;
        (manager, chain)
    }

    #[tokio::test]
    async fn advancing_lib_indexes_and_marks_path() {
        let (manager, chain) = forked_chain().await;
        assert!(manager.set_irreversible_block(&chain, hash(4)).await.unwrap());

        for n in 2..=4 {
            assert_eq!(manager.get_chain_block_index(n).await.unwrap(), Some(hash(n)));
            let link = manager.get_chain_block_link(&hash(n)).await.unwrap().unwrap();
            assert!(link.is_irreversible_block);
        }
        assert_eq!(manager.get_chain_block_index(5).await.unwrap(), None);
        let link5 = manager.get_chain_block_link(&hash(5)).await.unwrap().unwrap();
        assert!(!link5.is_irreversible_block);

        let chain = chain.lock().await;
        assert_eq!(chain.last_irreversible_block_hash, hash(4));
        assert_eq!(chain.last_irreversible_block_height, 4);
        assert_eq!(chain.branches.len(), 1);
        assert!(chain.branches.contains_key(&hash(6)));
    }

    #[tokio::test]
    async fn block_off_lib_ancestry_is_rejected() {
        let (manager, chain) = forked_chain().await;
        assert!(manager.set_irreversible_block(&chain, hash(3)).await.unwrap());

        assert!(!manager.set_irreversible_block(&chain, hash(103)).await.unwrap());
        assert!(!manager.set_irreversible_block(&chain, hash(2)).await.unwrap());
        let chain = chain.lock().await;
        assert_eq!(chain.last_irreversible_block_hash, hash(3));
    }

    #[tokio::test]
    async fn current_lib_is_accepted_again() {
        let (manager, chain) = forked_chain().await;
        assert!(manager.set_irreversible_block(&chain, hash(1)).await.unwrap());
        assert!(manager.set_irreversible_block(&chain, hash(3)).await.unwrap());
        assert!(manager.set_irreversible_block(&chain, hash(3)).await.unwrap());
    }

    #[tokio::test]
    async fn unlinked_or_unknown_targets_are_errors() {
        let (manager, chain) = forked_chain().await;
        attach(&manager, &chain, 9, 8, 9).await;

        assert!(matches!(
            manager.set_irreversible_block(&chain, hash(9)).await,
            Err(ChainManagerError::UnlinkedIrreversibleBlock { height: 9, .. })
        ));
        assert!(matches!(
            manager.set_irreversible_block(&chain, hash(77)).await,
            Err(ChainManagerError::BlockNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn longest_moves_when_its_branch_is_pruned() {
        let (manager, chain) = new_chain().await;
        attach(&manager, &chain, 2, 1, 2).await;
        attach(&manager, &chain, 102, 1, 2).await;
        attach(&manager, &chain, 103, 102, 3).await;
        assert_eq!(chain.lock().await.longest_chain_hash, hash(103));

        assert!(manager.set_irreversible_block(&chain, hash(2)).await.unwrap());

        let chain = chain.lock().await;
        assert_eq!(chain.branches.len(), 1);
        assert_eq!(chain.longest_chain_hash, hash(2));
        assert_eq!(chain.longest_chain_height, 2);
    }

    #[tokio::test]
    async fn stale_waiting_blocks_are_discarded() {
        let (manager, chain) = forked_chain().await;
        attach(&manager, &chain, 203, 202, 3).await;
        attach(&manager, &chain, 208, 207, 8).await;

        assert!(manager.set_irreversible_block(&chain, hash(4)).await.unwrap());

        let chain = chain.lock().await;
        assert!(!chain.not_linked_blocks.contains_key(&hash(202)));
        assert_eq!(chain.not_linked_blocks[&hash(207)], hash(208));
    }

    #[tokio::test]
    async fn discarded_branch_can_be_computed_and_cleaned_separately() {
        let (manager, chain) = forked_chain().await;
        let snapshot = chain.lock().await.clone();

        let discarded = manager.get_discarded_branch(&snapshot, hash(3), 3).await.unwrap();
        assert_eq!(discarded.branch_keys, vec![hash(103)]);
        assert!(discarded.not_linked_keys.is_empty());

        manager.clean_chain_branch(&chain, &discarded).await.unwrap();
        assert!(!chain.lock().await.branches.contains_key(&hash(103)));
    }

    #[tokio::test]
    async fn reset_unlinks_everything_above_lib() {
        let (manager, chain) = forked_chain().await;
        assert!(manager.set_irreversible_block(&chain, hash(3)).await.unwrap());
        manager.set_best_chain(&chain, 5, hash(5)).await.unwrap();
        let link5 = manager.get_chain_block_link(&hash(5)).await.unwrap().unwrap();
        manager
            .set_chain_block_link_execution_status(&link5, ExecutionStatus::Success)
            .await
            .unwrap();

        manager.reset_chain_to_lib(&chain).await.unwrap();

        {
            let chain = chain.lock().await;
            assert_eq!(chain.branches.len(), 1);
            assert_eq!(chain.branches[&hash(3)], 3);
            assert_eq!(chain.best_chain_hash, hash(3));
            assert_eq!(chain.longest_chain_hash, hash(3));
            assert!(chain.not_linked_blocks.is_empty());
        }
        for n in 4..=6 {
            let link = manager.get_chain_block_link(&hash(n)).await.unwrap().unwrap();
            assert!(!link.is_linked);
            assert_eq!(link.execution_status, ExecutionStatus::None);
        }
        assert!(manager.get_chain_block_link(&hash(3)).await.unwrap().unwrap().is_linked);

        // Blocks above the LIB link again when re-announced
        attach(&manager, &chain, 4, 3, 4).await;
        assert!(manager.get_chain_block_link(&hash(4)).await.unwrap().unwrap().is_linked);
    }

    #[tokio::test]
    async fn lib_advance_evicts_settled_links_from_cache() {
        let (manager, chain) = forked_chain().await;
        assert!(manager.get_cached_chain_block_link(&hash(3)).is_some());

        assert!(manager.set_irreversible_block(&chain, hash(4)).await.unwrap());

        assert!(manager.get_cached_chain_block_link(&hash(3)).is_none());
        assert!(manager.get_cached_chain_block_link(&hash(5)).is_some());
        let link3 = manager.get_chain_block_link(&hash(3)).await.unwrap().unwrap();
        assert!(link3.is_irreversible_block);
    }
}
