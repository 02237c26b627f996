//! Recorded chain commands and their replay through the chain manager.

use anyhow::{anyhow, Context, Result};
use forkline_common::{
    BlockAttachOperationStatus, BlockHash, BlockHeight, ChainBlockLink, ExecutionStatus,
};
use forkline_module_chain_manager::{ChainHandle, ChainManager};
use serde::Deserialize;
use tracing::{info, warn};

/// One line of a replay file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ReplayCommand {
    Genesis {
        hash: BlockHash,
    },
    Attach {
        hash: BlockHash,
        previous: BlockHash,
        height: BlockHeight,
    },
    Irreversible {
        hash: BlockHash,
    },
    BestChain {
        hash: BlockHash,
        height: BlockHeight,
    },
    Executed {
        hash: BlockHash,
        status: ExecutionStatus,
    },
    NotExecuted {
        hash: BlockHash,
    },
    ResetToLib,
}

/// Parse JSON lines, skipping blank lines and `#` comments.
pub fn parse_commands(text: &str) -> Result<Vec<ReplayCommand>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(number, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Bad command on line {}", number + 1))
        })
        .collect()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub attached: usize,
    pub linked: usize,
    pub not_linked: usize,
    pub cascades: usize,
    pub longest_changes: usize,
    pub irreversible_accepted: usize,
    pub irreversible_rejected: usize,
    pub executed: usize,
}

pub struct Replayer {
    manager: ChainManager,
    chain: Option<ChainHandle>,
    summary: ReplaySummary,
}

impl Replayer {
    /// Picks up an existing chain from the store, if there is one.
    pub async fn new(manager: ChainManager) -> Result<Self> {
        let chain = manager.get_chain().await?;
        if chain.is_some() {
            info!("Continuing existing chain");
        }
        Ok(Self {
            manager,
            chain,
            summary: ReplaySummary::default(),
        })
    }

    pub fn summary(&self) -> &ReplaySummary {
        &self.summary
    }

    fn chain(&self) -> Result<ChainHandle> {
        self.chain.clone().ok_or_else(|| anyhow!("No chain yet, replay a genesis command first"))
    }

    pub async fn apply(&mut self, command: &ReplayCommand) -> Result<()> {
        match command {
            ReplayCommand::Genesis { hash } => {
                self.chain = Some(self.manager.create(*hash).await?);
            }

            ReplayCommand::Attach {
                hash,
                previous,
                height,
            } => {
                let chain = self.chain()?;
                let link = ChainBlockLink::new(*hash, *previous, *height);
                let status = self.manager.attach_block_to_chain(&chain, link).await?;

                self.summary.attached += 1;
                if status.contains(BlockAttachOperationStatus::NewBlockLinked) {
                    self.summary.linked += 1;
                }
                if status.contains(BlockAttachOperationStatus::NewBlockNotLinked) {
                    self.summary.not_linked += 1;
                }
                if status.contains(BlockAttachOperationStatus::NewBlocksLinked) {
                    self.summary.cascades += 1;
                }
                if status.contains(BlockAttachOperationStatus::LongestChainFound) {
                    self.summary.longest_changes += 1;
                }
            }

            ReplayCommand::Irreversible { hash } => {
                let chain = self.chain()?;
                if self.manager.set_irreversible_block(&chain, *hash).await? {
                    self.summary.irreversible_accepted += 1;
                } else {
                    warn!(hash = %hash, "Irreversible block rejected");
                    self.summary.irreversible_rejected += 1;
                }
            }

            ReplayCommand::BestChain { hash, height } => {
                let chain = self.chain()?;
                self.manager.set_best_chain(&chain, *height, *hash).await?;
            }

            ReplayCommand::Executed { hash, status } => {
                let link = self
                    .manager
                    .get_chain_block_link(hash)
                    .await?
                    .ok_or_else(|| anyhow!("Executed unknown block {hash}"))?;
                self.manager.set_chain_block_link_execution_status(&link, *status).await?;
                self.summary.executed += 1;
            }

            ReplayCommand::NotExecuted { hash } => {
                let blocks = self.manager.get_not_executed_blocks(hash).await?;
                info!(
                    hash = %hash,
                    count = blocks.len(),
                    from = blocks.first().map(|link| link.height),
                    to = blocks.last().map(|link| link.height),
                    "Blocks to execute"
                );
            }

            ReplayCommand::ResetToLib => {
                let chain = self.chain()?;
                self.manager.reset_chain_to_lib(&chain).await?;
            }
        }
        Ok(())
    }

    /// Log the final chain pointers and the replay counters.
    pub async fn finish(&self) -> Result<()> {
        if let Some(chain) = &self.chain {
            let chain = chain.lock().await;
            info!(
                longest = %chain.longest_chain_hash,
                longest_height = chain.longest_chain_height,
                best = %chain.best_chain_hash,
                best_height = chain.best_chain_height,
                lib = %chain.last_irreversible_block_hash,
                lib_height = chain.last_irreversible_block_height,
                branches = chain.branches.len(),
                not_linked = chain.not_linked_blocks.len(),
                "Final chain"
            );
        }
        info!(summary = ?self.summary, "Replay complete");
        Ok(())
    }
}
