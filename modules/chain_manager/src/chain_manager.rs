//! Forkline chain manager.
//!
//! Keeps every known block header of one chain as a [`ChainBlockLink`],
//! links headers into a fork tree as their ancestry becomes known, follows
//! the longest chain and advances the last irreversible block (LIB). All
//! "pointers" between blocks are hashes resolved through the stores.

use std::sync::{Arc, OnceLock};

use config::Config;
use forkline_common::{
    BlockHash, BlockHeight, Chain, ChainBlockIndex, ChainBlockLink, ExecutionStatus,
    GENESIS_BLOCK_HEIGHT,
};
use tokio::sync::Mutex;
use tracing::info;

pub mod configuration;
pub mod error;
mod execution;
mod fork_choice;
mod irreversibility;
pub mod link_cache;
pub mod stores;

pub use configuration::{ChainManagerConfig, StoreType};
pub use error::ChainManagerError;
pub use link_cache::ChainBlockLinkCache;
pub use stores::{open_store, BlockchainStore, KeyValueStore, Keyspace};

/// Shared, lockable chain aggregate.
///
/// Mutating operations hold the lock for their whole duration, which makes
/// them the per-chain critical section.
pub type ChainHandle = Arc<Mutex<Chain>>;

/// The chain record is the only one in its keyspace, so its key is just
/// the chain id prefix.
const CHAIN_KEY: &[u8] = &[];

pub struct ChainManager {
    config: ChainManagerConfig,
    chains: BlockchainStore<Chain>,
    chain_block_links: BlockchainStore<ChainBlockLink>,
    chain_block_indexes: BlockchainStore<ChainBlockIndex>,
    link_cache: Option<ChainBlockLinkCache>,
    handle: OnceLock<ChainHandle>,
    create_lock: Mutex<()>,
}

impl ChainManager {
    pub fn new(config: ChainManagerConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let chain_id = config.chain_id;
        Self {
            chains: BlockchainStore::new(store.clone(), Keyspace::Chains, chain_id),
            chain_block_links: BlockchainStore::new(
                store.clone(),
                Keyspace::ChainBlockLinks,
                chain_id,
            ),
            chain_block_indexes: BlockchainStore::new(store, Keyspace::ChainBlockIndexes, chain_id),
            link_cache: config.link_cache.then(ChainBlockLinkCache::new),
            handle: OnceLock::new(),
            create_lock: Mutex::new(()),
            config,
        }
    }

    /// Read the configuration and open the store it names.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let config = ChainManagerConfig::new(config)?;
        let store = open_store(&config)?;
        Ok(Self::new(config, store))
    }

    pub fn config(&self) -> &ChainManagerConfig {
        &self.config
    }

    /// Create the chain from its genesis block.
    ///
    /// Fails if the chain already exists, in memory or in the store.
    pub async fn create(
        &self,
        genesis_block_hash: BlockHash,
    ) -> Result<ChainHandle, ChainManagerError> {
        let _guard = self.create_lock.lock().await;
        if self.handle.get().is_some() || self.chains.contains(CHAIN_KEY).await? {
            return Err(ChainManagerError::ChainAlreadyExists {
                chain_id: self.config.chain_id,
            });
        }

        let genesis = ChainBlockLink {
            block_hash: genesis_block_hash,
            previous_block_hash: BlockHash::empty(),
            height: GENESIS_BLOCK_HEIGHT,
            is_linked: true,
            execution_status: ExecutionStatus::None,
            is_irreversible_block: true,
        };
        self.put_chain_block_link(&genesis).await?;
        self.put_chain_block_index(GENESIS_BLOCK_HEIGHT, genesis_block_hash).await?;

        let chain = Chain::new(self.config.chain_id, genesis_block_hash);
        self.chains.set(CHAIN_KEY, &chain).await?;

        info!(
            chain_id = chain.id,
            genesis = %genesis_block_hash,
            "Created chain"
        );
        Ok(self.handle.get_or_init(|| Arc::new(Mutex::new(chain))).clone())
    }

    /// The chain handle, loading the persisted aggregate on first use.
    /// `None` until the chain has been created.
    pub async fn get_chain(&self) -> Result<Option<ChainHandle>, ChainManagerError> {
        if let Some(handle) = self.handle.get() {
            return Ok(Some(handle.clone()));
        }

        let _guard = self.create_lock.lock().await;
        if let Some(handle) = self.handle.get() {
            return Ok(Some(handle.clone()));
        }
        let Some(chain) = self.chains.get(CHAIN_KEY).await? else {
            return Ok(None);
        };
        info!(
            chain_id = chain.id,
            longest = chain.longest_chain_height,
            lib = chain.last_irreversible_block_height,
            "Loaded chain"
        );
        Ok(Some(self.handle.get_or_init(|| Arc::new(Mutex::new(chain))).clone()))
    }

    /// Look up a block link, cache first.
    pub async fn get_chain_block_link(
        &self,
        block_hash: &BlockHash,
    ) -> Result<Option<ChainBlockLink>, ChainManagerError> {
        if let Some(link) = self.get_cached_chain_block_link(block_hash) {
            return Ok(Some(link));
        }
        Ok(self.chain_block_links.get(block_hash.as_ref()).await?)
    }

    /// Canonical block hash at `height`. Only settled for heights up to
    /// the last irreversible block.
    pub async fn get_chain_block_index(
        &self,
        height: BlockHeight,
    ) -> Result<Option<BlockHash>, ChainManagerError> {
        let index = self.chain_block_indexes.get(&height.to_be_bytes()).await?;
        Ok(index.map(|index| index.block_hash))
    }

    /// Forget a block link, in the store and in the cache.
    pub async fn remove_chain_block_link(
        &self,
        block_hash: &BlockHash,
    ) -> Result<(), ChainManagerError> {
        self.chain_block_links.remove(block_hash.as_ref()).await?;
        self.remove_cached_chain_block_link(block_hash);
        Ok(())
    }

    pub fn get_cached_chain_block_link(&self, block_hash: &BlockHash) -> Option<ChainBlockLink> {
        self.link_cache.as_ref().and_then(|cache| cache.get(block_hash))
    }

    pub fn get_cached_chain_block_links(&self) -> Vec<ChainBlockLink> {
        self.link_cache.as_ref().map(|cache| cache.links()).unwrap_or_default()
    }

    pub fn remove_cached_chain_block_link(&self, block_hash: &BlockHash) {
        if let Some(cache) = &self.link_cache {
            cache.remove(block_hash);
        }
    }

    /// Store first, then cache, so the cache never holds a record the
    /// store does not.
    pub(crate) async fn put_chain_block_link(
        &self,
        link: &ChainBlockLink,
    ) -> Result<(), ChainManagerError> {
        self.chain_block_links.set(link.block_hash.as_ref(), link).await?;
        if let Some(cache) = &self.link_cache {
            cache.set(link);
        }
        Ok(())
    }

    pub(crate) async fn put_chain_block_index(
        &self,
        height: BlockHeight,
        block_hash: BlockHash,
    ) -> Result<(), ChainManagerError> {
        let index = ChainBlockIndex { block_hash };
        Ok(self.chain_block_indexes.set(&height.to_be_bytes(), &index).await?)
    }

    pub(crate) async fn save_chain(&self, chain: &Chain) -> Result<(), ChainManagerError> {
        Ok(self.chains.set(CHAIN_KEY, chain).await?)
    }

    pub(crate) async fn require_chain_block_link(
        &self,
        block_hash: &BlockHash,
    ) -> Result<ChainBlockLink, ChainManagerError> {
        self.get_chain_block_link(block_hash)
            .await?
            .ok_or(ChainManagerError::BlockNotFound { hash: *block_hash })
    }

    pub(crate) fn evict_cached_links_up_to(&self, height: BlockHeight) {
        if let Some(cache) = &self.link_cache {
            cache.evict_up_to(height);
        }
    }
}
