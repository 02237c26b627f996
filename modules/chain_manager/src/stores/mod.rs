//! Key-value persistence for chain records.
//!
//! A [`KeyValueStore`] holds raw bytes in a few named keyspaces. The chain
//! manager never talks to it directly: it goes through a typed
//! [`BlockchainStore`] per record type, which prefixes every key with the
//! chain id and CBOR-encodes the values.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::configuration::{ChainManagerConfig, StoreType};

pub mod fjall;
pub mod in_memory;

/// Logical tables of the chain manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    Chains,
    ChainBlockLinks,
    ChainBlockIndexes,
}

impl Keyspace {
    pub const ALL: [Keyspace; 3] =
        [Keyspace::Chains, Keyspace::ChainBlockLinks, Keyspace::ChainBlockIndexes];

    pub fn name(&self) -> &'static str {
        match self {
            Keyspace::Chains => "chains",
            Keyspace::ChainBlockLinks => "chain-block-links",
            Keyspace::ChainBlockIndexes => "chain-block-indexes",
        }
    }
}

/// Raw byte store.
/// Single-key writes must be atomic; nothing else is assumed.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn set(&self, keyspace: Keyspace, key: &[u8], value: Vec<u8>) -> Result<()>;

    async fn contains(&self, keyspace: Keyspace, key: &[u8]) -> Result<bool>;

    async fn remove(&self, keyspace: Keyspace, key: &[u8]) -> Result<()>;
}

/// Open the backend named in the configuration.
pub fn open_store(config: &ChainManagerConfig) -> Result<Arc<dyn KeyValueStore>> {
    let store: Arc<dyn KeyValueStore> = match config.store {
        StoreType::Memory => Arc::new(self::in_memory::InMemoryStore::new()),
        StoreType::Fjall => {
            Arc::new(self::fjall::FjallStore::new(&config.database_path, config.clear_on_start)?)
        }
    };
    Ok(store)
}

/// Typed view over one keyspace, scoped to a single chain.
pub struct BlockchainStore<T> {
    store: Arc<dyn KeyValueStore>,
    keyspace: Keyspace,
    prefix: Vec<u8>,
    _record: PhantomData<fn() -> T>,
}

impl<T> BlockchainStore<T>
where
    T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
{
    pub fn new(store: Arc<dyn KeyValueStore>, keyspace: Keyspace, chain_id: u32) -> Self {
        Self {
            store,
            keyspace,
            prefix: chain_id.to_be_bytes().to_vec(),
            _record: PhantomData,
        }
    }

    fn storage_key(&self, key: &[u8]) -> Vec<u8> {
        let mut storage_key = Vec::with_capacity(self.prefix.len() + key.len());
        storage_key.extend_from_slice(&self.prefix);
        storage_key.extend_from_slice(key);
        storage_key
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<T>> {
        let Some(bytes) = self.store.get(self.keyspace, &self.storage_key(key)).await? else {
            return Ok(None);
        };
        Ok(Some(minicbor::decode(&bytes)?))
    }

    pub async fn set(&self, key: &[u8], value: &T) -> Result<()> {
        let bytes = minicbor::to_vec(value)?;
        self.store.set(self.keyspace, &self.storage_key(key), bytes).await
    }

    pub async fn contains(&self, key: &[u8]) -> Result<bool> {
        self.store.contains(self.keyspace, &self.storage_key(key)).await
    }

    pub async fn remove(&self, key: &[u8]) -> Result<()> {
        self.store.remove(self.keyspace, &self.storage_key(key)).await
    }
}
