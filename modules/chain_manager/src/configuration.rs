//! Chain manager configuration, read from the `config` tree.

use std::fmt;

use anyhow::{bail, Result};
use config::Config;
use tracing::info;

const DEFAULT_CHAIN_ID: (&str, i64) = ("chain-id", 9992731);
const DEFAULT_STORE: (&str, &str) = ("store", "memory");
const DEFAULT_DATABASE_PATH: (&str, &str) = ("database-path", "fjall-chain");
const DEFAULT_CLEAR_ON_START: (&str, bool) = ("clear-on-start", false);
const DEFAULT_MAX_CASCADE_LENGTH: (&str, i64) = ("max-cascade-length", 0);
const DEFAULT_LINK_CACHE: (&str, bool) = ("link-cache", true);

/// Backing key-value store selected by the `store` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Memory,
    Fjall,
}

impl StoreType {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "memory" => Ok(StoreType::Memory),
            "fjall" => Ok(StoreType::Fjall),
            other => bail!("Unknown store type {other}"),
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreType::Memory => write!(f, "memory"),
            StoreType::Fjall => write!(f, "fjall"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainManagerConfig {
    /// Prefix for every storage key, so several chains can share one store.
    pub chain_id: u32,
    pub store: StoreType,
    pub database_path: String,
    pub clear_on_start: bool,
    /// Most waiting orphans a single attach call will link; 0 means no cap.
    pub max_cascade_length: usize,
    pub link_cache: bool,
}

impl Default for ChainManagerConfig {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_CHAIN_ID.1 as u32,
            store: StoreType::Memory,
            database_path: DEFAULT_DATABASE_PATH.1.to_string(),
            clear_on_start: DEFAULT_CLEAR_ON_START.1,
            max_cascade_length: DEFAULT_MAX_CASCADE_LENGTH.1 as usize,
            link_cache: DEFAULT_LINK_CACHE.1,
        }
    }
}

impl ChainManagerConfig {
    pub fn new(config: &Config) -> Result<Self> {
        let chain_id = config.get_int(DEFAULT_CHAIN_ID.0).unwrap_or(DEFAULT_CHAIN_ID.1);
        let Ok(chain_id) = u32::try_from(chain_id) else {
            bail!("Invalid chain id {chain_id}");
        };

        let store = config.get_string(DEFAULT_STORE.0).unwrap_or(DEFAULT_STORE.1.to_string());
        let store = StoreType::parse(&store)?;

        let max_cascade_length = config
            .get_int(DEFAULT_MAX_CASCADE_LENGTH.0)
            .unwrap_or(DEFAULT_MAX_CASCADE_LENGTH.1)
            .max(0) as usize;

        let result = Self {
            chain_id,
            store,
            database_path: config
                .get_string(DEFAULT_DATABASE_PATH.0)
                .unwrap_or(DEFAULT_DATABASE_PATH.1.to_string()),
            clear_on_start: config
                .get_bool(DEFAULT_CLEAR_ON_START.0)
                .unwrap_or(DEFAULT_CLEAR_ON_START.1),
            max_cascade_length,
            link_cache: config.get_bool(DEFAULT_LINK_CACHE.0).unwrap_or(DEFAULT_LINK_CACHE.1),
        };

        info!(
            chain_id = result.chain_id,
            store = %result.store,
            max_cascade_length = result.max_cascade_length,
            link_cache = result.link_cache,
            "Chain manager configured"
        );
        Ok(result)
    }
}
