//! Block attachment and fork choice.
//!
//! A block is linked when its whole ancestry down to genesis is stored.
//! Linked blocks extend or fork the tree of branch tips; blocks whose
//! parent is unknown wait in `not_linked_blocks` until the parent links,
//! at which point the whole waiting run links behind it.
//!
//! Only blocks extending the last irreversible block become branch tips.
//! A block forking off below it is stored linked but never competes for
//! the longest chain.

use forkline_common::{BlockAttachOperationStatus, BlockHash, BlockHeight, Chain, ChainBlockLink};
use tracing::{debug, info, trace, warn};

use crate::{ChainHandle, ChainManager, ChainManagerError};

/// Where a block's previous block stands in the fork tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parent {
    Missing,
    /// Linked and descending from the last irreversible block.
    Live,
    /// Linked, but on a fork below the last irreversible block.
    Stale,
}

impl ChainManager {
    /// Attach a block announced by a block source.
    ///
    /// Blocks may arrive in any order and more than once. The returned
    /// flags describe what this call resolved: exactly one of
    /// `NewBlockLinked` or `NewBlockNotLinked` for the block itself, plus
    /// `NewBlocksLinked` when waiting blocks linked behind it and
    /// `LongestChainFound` when the longest chain moved.
    pub async fn attach_block_to_chain(
        &self,
        chain: &ChainHandle,
        link: ChainBlockLink,
    ) -> Result<BlockAttachOperationStatus, ChainManagerError> {
        let mut guard = chain.lock().await;
        let mut working = guard.clone();
        let block_hash = link.block_hash;
        trace!(
            hash = %block_hash,
            height = link.height,
            previous = %link.previous_block_hash,
            "Attaching block"
        );

        let mut status = BlockAttachOperationStatus::none();
        let mut new_tips: Vec<(BlockHash, BlockHeight)> = Vec::new();

        let mut live = false;
        let link = match self.get_chain_block_link(&block_hash).await? {
            Some(stored) if stored.is_linked => {
                debug!(hash = %block_hash, "Block already linked");
                status |= BlockAttachOperationStatus::NewBlockLinked;
                live = self.parent_of(&working, &block_hash).await? == Parent::Live;
                None
            }
            // Ancestry of a known block never changes, keep what is stored
            Some(stored) => Some(stored),
            None => Some(ChainBlockLink {
                is_linked: false,
                is_irreversible_block: false,
                ..link
            }),
        };

        if let Some(link) = link {
            match self.parent_of(&working, &link.previous_block_hash).await? {
                Parent::Missing => {
                    self.put_chain_block_link(&link).await?;
                    working
                        .not_linked_blocks
                        .entry(link.previous_block_hash)
                        .or_insert(block_hash);
                    status |= BlockAttachOperationStatus::NewBlockNotLinked;
                }
                parent => {
                    live = parent == Parent::Live;
                    new_tips.push((link.block_hash, link.height));
                    self.link_block(&mut working, link, live).await?;
                    status |= BlockAttachOperationStatus::NewBlockLinked;
                }
            }
        }

        if status.contains(BlockAttachOperationStatus::NewBlockLinked) {
            let linked = self.link_waiting_blocks(&mut working, block_hash, live).await?;
            if !linked.is_empty() {
                status |= BlockAttachOperationStatus::NewBlocksLinked;
                new_tips.extend(linked);
            }
        }

        let mut longest: Option<(BlockHash, BlockHeight)> = None;
        for (hash, height) in new_tips {
            if working.branches.contains_key(&hash) && longest.is_none_or(|(_, h)| height > h) {
                longest = Some((hash, height));
            }
        }
        if let Some((hash, height)) = longest {
            if height > working.longest_chain_height {
                working.longest_chain_hash = hash;
                working.longest_chain_height = height;
                status |= BlockAttachOperationStatus::LongestChainFound;
            }
        }

        self.save_chain(&working).await?;
        *guard = working;

        info!(
            hash = %block_hash,
            %status,
            longest_height = guard.longest_chain_height,
            longest = %guard.longest_chain_hash,
            "Attached block"
        );
        Ok(status)
    }

    /// Point the best chain at `best_chain_hash`. The height may stay or
    /// grow, never shrink.
    pub async fn set_best_chain(
        &self,
        chain: &ChainHandle,
        best_chain_height: BlockHeight,
        best_chain_hash: BlockHash,
    ) -> Result<(), ChainManagerError> {
        let mut guard = chain.lock().await;
        if best_chain_height < guard.best_chain_height {
            return Err(ChainManagerError::BestChainHeightRegression {
                current: guard.best_chain_height,
                requested: best_chain_height,
            });
        }

        let mut working = guard.clone();
        working.best_chain_hash = best_chain_hash;
        working.best_chain_height = best_chain_height;
        self.save_chain(&working).await?;
        *guard = working;

        debug!(hash = %best_chain_hash, height = best_chain_height, "Best chain set");
        Ok(())
    }

    /// Abandon the longest branch and fall back to the best chain.
    pub async fn remove_longest_branch(
        &self,
        chain: &ChainHandle,
    ) -> Result<(), ChainManagerError> {
        let mut guard = chain.lock().await;
        let mut working = guard.clone();

        working.branches.remove(&working.longest_chain_hash);
        working.branches.insert(working.best_chain_hash, working.best_chain_height);
        warn!(
            longest = %working.longest_chain_hash,
            longest_height = working.longest_chain_height,
            best = %working.best_chain_hash,
            best_height = working.best_chain_height,
            "Removing longest branch"
        );
        working.longest_chain_hash = working.best_chain_hash;
        working.longest_chain_height = working.best_chain_height;

        self.save_chain(&working).await?;
        *guard = working;
        Ok(())
    }

    async fn parent_of(
        &self,
        chain: &Chain,
        block_hash: &BlockHash,
    ) -> Result<Parent, ChainManagerError> {
        let lib_hash = chain.last_irreversible_block_hash;
        let lib_height = chain.last_irreversible_block_height;
        if chain.branches.contains_key(block_hash) || *block_hash == lib_hash {
            return Ok(Parent::Live);
        }
        let Some(parent) = self.get_chain_block_link(block_hash).await? else {
            return Ok(Parent::Missing);
        };
        if !parent.is_linked {
            return Ok(Parent::Missing);
        }
        if parent.height > lib_height
            && self.descends_from(*block_hash, lib_hash, lib_height).await?
        {
            Ok(Parent::Live)
        } else {
            Ok(Parent::Stale)
        }
    }

    /// Mark `link` linked. A live block becomes a branch tip: extending a
    /// tip replaces it, attaching below a tip starts a fork.
    async fn link_block(
        &self,
        chain: &mut Chain,
        mut link: ChainBlockLink,
        live: bool,
    ) -> Result<(), ChainManagerError> {
        if !live {
            debug!(
                hash = %link.block_hash,
                parent = %link.previous_block_hash,
                lib_height = chain.last_irreversible_block_height,
                "Block forks below LIB, not a branch tip"
            );
        } else {
            if chain.branches.remove(&link.previous_block_hash).is_none() {
                debug!(hash = %link.block_hash, parent = %link.previous_block_hash, "Fork");
            }
            chain.branches.insert(link.block_hash, link.height);
        }
        if chain.not_linked_blocks.get(&link.previous_block_hash) == Some(&link.block_hash) {
            chain.not_linked_blocks.remove(&link.previous_block_hash);
        }

        link.is_linked = true;
        self.put_chain_block_link(&link).await
    }

    /// Link every block waiting, directly or transitively, on `block_hash`.
    /// Waiting blocks inherit `live` from the block they wait on.
    ///
    /// Runs on an explicit worklist. With a cascade cap, also resumes runs
    /// an earlier call left waiting behind a block that is linked by now.
    /// Returns the blocks it linked.
    async fn link_waiting_blocks(
        &self,
        chain: &mut Chain,
        block_hash: BlockHash,
        live: bool,
    ) -> Result<Vec<(BlockHash, BlockHeight)>, ChainManagerError> {
        let max_cascade_length = self.config.max_cascade_length;
        let mut linked = Vec::new();

        let mut pending: Vec<(BlockHash, bool)> = Vec::new();
        if max_cascade_length != 0 {
            let parked: Vec<BlockHash> =
                chain.not_linked_blocks.keys().filter(|key| **key != block_hash).copied().collect();
            for parent in parked {
                match self.parent_of(chain, &parent).await? {
                    Parent::Missing => {}
                    state => pending.push((parent, state == Parent::Live)),
                }
            }
        }
        pending.push((block_hash, live));

        while let Some((parent, live)) = pending.pop() {
            let Some(waiting) = chain.not_linked_blocks.get(&parent).copied() else {
                continue;
            };
            if max_cascade_length != 0 && linked.len() >= max_cascade_length {
                warn!(
                    parent = %parent,
                    waiting = %waiting,
                    max_cascade_length,
                    "Cascade cap reached, leaving blocks waiting"
                );
                break;
            }

            chain.not_linked_blocks.remove(&parent);
            let Some(orphan) = self.get_chain_block_link(&waiting).await? else {
                continue;
            };
            if orphan.is_linked || orphan.previous_block_hash != parent {
                continue;
            }

            trace!(hash = %waiting, parent = %parent, "Linking waiting block");
            linked.push((orphan.block_hash, orphan.height));
            self.link_block(chain, orphan, live).await?;
            pending.push((waiting, live));
        }

        Ok(linked)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use crate::{ChainManagerConfig, ChainManagerError};
    use forkline_common::BlockAttachOperationStatus as Status;
    use test_case::test_case;

    #[tokio::test]
    async fn linear_growth_finds_longest_chain_every_time() {
        let (manager, chain) = new_chain().await;
        for n in 2..=10 {
            let status = attach(&manager, &chain, n, n - 1, n).await;
            assert_eq!(status, Status::NewBlockLinked | Status::LongestChainFound);
        }

        let chain = chain.lock().await;
        assert_eq!(chain.longest_chain_height, 10);
        assert_eq!(chain.longest_chain_hash, hash(10));
        assert_eq!(chain.branches.len(), 1);
        assert_eq!(chain.branches[&hash(10)], 10);
    }

    #[tokio::test]
    async fn orphan_waits_for_its_parent() {
        let (manager, chain) = new_chain().await;
        let status = attach(&manager, &chain, 4, 3, 4).await;
        assert_eq!(status, Status::NewBlockNotLinked);
        {
            let chain = chain.lock().await;
            assert_eq!(chain.not_linked_blocks[&hash(3)], hash(4));
            assert_eq!(chain.longest_chain_height, 1);
        }
        let stored = manager.get_chain_block_link(&hash(4)).await.unwrap().unwrap();
        assert!(!stored.is_linked);

        assert_eq!(
            attach(&manager, &chain, 2, 1, 2).await,
            Status::NewBlockLinked | Status::LongestChainFound
        );
        assert_eq!(
            attach(&manager, &chain, 3, 2, 3).await,
            Status::NewBlockLinked | Status::NewBlocksLinked | Status::LongestChainFound
        );

        let chain = chain.lock().await;
        assert_eq!(chain.longest_chain_height, 4);
        assert_eq!(chain.longest_chain_hash, hash(4));
        assert!(chain.not_linked_blocks.is_empty());
        assert_eq!(chain.branches.len(), 1);
        assert!(manager.get_chain_block_link(&hash(4)).await.unwrap().unwrap().is_linked);
    }

    #[tokio::test]
    async fn cascade_follows_chained_orphans() {
        let (manager, chain) = new_chain().await;
        assert_eq!(attach(&manager, &chain, 5, 4, 5).await, Status::NewBlockNotLinked);
        assert_eq!(attach(&manager, &chain, 4, 3, 4).await, Status::NewBlockNotLinked);
        assert_eq!(attach(&manager, &chain, 3, 2, 3).await, Status::NewBlockNotLinked);

        let status = attach(&manager, &chain, 2, 1, 2).await;
        assert_eq!(
            status,
            Status::NewBlockLinked | Status::NewBlocksLinked | Status::LongestChainFound
        );
        let chain = chain.lock().await;
        assert_eq!(chain.longest_chain_hash, hash(5));
        assert_eq!(chain.longest_chain_height, 5);
        assert!(chain.not_linked_blocks.is_empty());
    }

    #[tokio::test]
    async fn same_height_fork_keeps_first_longest() {
        let (manager, chain) = new_chain().await;
        attach(&manager, &chain, 2, 1, 2).await;

        let status = attach(&manager, &chain, 102, 1, 2).await;
        assert_eq!(status, Status::NewBlockLinked);

        let chain = chain.lock().await;
        assert_eq!(chain.longest_chain_hash, hash(2));
        assert_eq!(chain.branches.len(), 2);
        assert_eq!(chain.branches[&hash(102)], 2);
    }

    #[tokio::test]
    async fn mid_chain_fork_keeps_existing_tip() {
        let (manager, chain) = new_chain().await;
        for n in 2..=4 {
            attach(&manager, &chain, n, n - 1, n).await;
        }
        attach(&manager, &chain, 103, 2, 3).await;

        let chain = chain.lock().await;
        assert_eq!(chain.branches.len(), 2);
        assert!(chain.branches.contains_key(&hash(4)));
        assert!(chain.branches.contains_key(&hash(103)));
    }

    #[tokio::test]
    async fn reattaching_linked_block_is_a_no_op() {
        let (manager, chain) = new_chain().await;
        attach(&manager, &chain, 2, 1, 2).await;
        let before = chain.lock().await.clone();

        assert_eq!(attach(&manager, &chain, 2, 1, 2).await, Status::NewBlockLinked);
        assert_eq!(*chain.lock().await, before);
    }

    #[tokio::test]
    async fn second_orphan_on_same_gap_does_not_take_the_slot() {
        let (manager, chain) = new_chain().await;
        attach(&manager, &chain, 3, 2, 3).await;
        attach(&manager, &chain, 103, 2, 3).await;
        assert_eq!(chain.lock().await.not_linked_blocks[&hash(2)], hash(3));

        attach(&manager, &chain, 2, 1, 2).await;
        assert!(!manager.get_chain_block_link(&hash(103)).await.unwrap().unwrap().is_linked);

        // Announcing it again once the parent is known links it
        assert_eq!(attach(&manager, &chain, 103, 2, 3).await, Status::NewBlockLinked);
        assert_eq!(chain.lock().await.branches.len(), 2);
    }

    #[test_case(1, 3 ; "cap of one")]
    #[test_case(2, 4 ; "cap of two")]
    #[test_case(0, 6 ; "no cap")]
    #[tokio::test]
    async fn cascade_cap_bounds_one_call(cap: usize, longest_height: u64) {
        let manager = manager_with(ChainManagerConfig {
            max_cascade_length: cap,
            ..ChainManagerConfig::default()
        });
        let chain = manager.create(hash(1)).await.unwrap();
        for n in (3..=6).rev() {
            attach(&manager, &chain, n, n - 1, n).await;
        }

        attach(&manager, &chain, 2, 1, 2).await;
        assert_eq!(chain.lock().await.longest_chain_height, longest_height);

        // Any later linking call resumes what was left waiting
        while !chain.lock().await.not_linked_blocks.is_empty() {
            attach(&manager, &chain, 2, 1, 2).await;
        }
        assert_eq!(chain.lock().await.longest_chain_height, 6);
    }

    #[tokio::test]
    async fn capped_run_resumes_after_its_parent_is_extended() {
        let manager = manager_with(ChainManagerConfig {
            max_cascade_length: 1,
            ..ChainManagerConfig::default()
        });
        let chain = manager.create(hash(1)).await.unwrap();
        attach(&manager, &chain, 4, 3, 4).await;
        attach(&manager, &chain, 3, 2, 3).await;
        attach(&manager, &chain, 2, 1, 2).await;
        assert_eq!(chain.lock().await.not_linked_blocks[&hash(3)], hash(4));

        // 3 stops being a tip, block 4 still links behind it
        assert_eq!(
            attach(&manager, &chain, 103, 3, 4).await,
            Status::NewBlockLinked | Status::NewBlocksLinked | Status::LongestChainFound
        );

        assert!(manager.get_chain_block_link(&hash(4)).await.unwrap().unwrap().is_linked);
        let chain = chain.lock().await;
        assert!(chain.not_linked_blocks.is_empty());
        assert_eq!(chain.branches.len(), 2);
        assert!(chain.branches.contains_key(&hash(4)));
        assert!(chain.branches.contains_key(&hash(103)));
        assert_eq!(chain.longest_chain_height, 4);
    }

    #[tokio::test]
    async fn fork_below_lib_never_becomes_a_tip() {
        let (manager, chain) = new_chain().await;
        for n in 2..=6 {
            attach(&manager, &chain, n, n - 1, n).await;
        }
        assert!(manager.set_irreversible_block(&chain, hash(5)).await.unwrap());

        // 2 -> 103 -> ... -> 108 outgrows the main line
        assert_eq!(attach(&manager, &chain, 103, 2, 3).await, Status::NewBlockLinked);
        for n in 104..=108 {
            assert_eq!(attach(&manager, &chain, n, n - 1, n - 100).await, Status::NewBlockLinked);
        }
        assert!(manager.get_chain_block_link(&hash(108)).await.unwrap().unwrap().is_linked);

        // Sibling of the LIB, and a waiting run behind the stale fork
        assert_eq!(attach(&manager, &chain, 205, 4, 5).await, Status::NewBlockLinked);
        assert_eq!(attach(&manager, &chain, 110, 109, 10).await, Status::NewBlockNotLinked);
        assert_eq!(
            attach(&manager, &chain, 109, 108, 9).await,
            Status::NewBlockLinked | Status::NewBlocksLinked
        );

        {
            let chain = chain.lock().await;
            assert_eq!(chain.longest_chain_hash, hash(6));
            assert_eq!(chain.longest_chain_height, 6);
            assert_eq!(chain.branches.len(), 1);
            assert!(chain.branches.contains_key(&hash(6)));
            assert!(chain.not_linked_blocks.is_empty());
        }

        // Building on the LIB itself still forks
        assert_eq!(attach(&manager, &chain, 306, 5, 6).await, Status::NewBlockLinked);
        assert_eq!(
            attach(&manager, &chain, 307, 306, 7).await,
            Status::NewBlockLinked | Status::LongestChainFound
        );
        let chain = chain.lock().await;
        assert_eq!(chain.longest_chain_hash, hash(307));
        assert_eq!(chain.branches.len(), 2);
    }

    #[tokio::test]
    async fn best_chain_never_goes_back() {
        let (manager, chain) = new_chain().await;
        manager.set_best_chain(&chain, 5, hash(5)).await.unwrap();

        let result = manager.set_best_chain(&chain, 2, hash(2)).await;
        assert!(matches!(
            result,
            Err(ChainManagerError::BestChainHeightRegression {
                current: 5,
                requested: 2
            })
        ));
        let chain = chain.lock().await;
        assert_eq!(chain.best_chain_height, 5);
        assert_eq!(chain.best_chain_hash, hash(5));
    }

    #[tokio::test]
    async fn removing_longest_branch_falls_back_to_best() {
        let (manager, chain) = new_chain().await;
        attach(&manager, &chain, 2, 1, 2).await;
        attach(&manager, &chain, 102, 1, 2).await;
        attach(&manager, &chain, 103, 102, 3).await;
        manager.set_best_chain(&chain, 2, hash(2)).await.unwrap();

        manager.remove_longest_branch(&chain).await.unwrap();

        let chain = chain.lock().await;
        assert_eq!(chain.longest_chain_hash, hash(2));
        assert_eq!(chain.longest_chain_height, 2);
        assert!(!chain.branches.contains_key(&hash(103)));
        assert!(chain.branches.contains_key(&hash(2)));
    }
}
