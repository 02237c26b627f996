//! In-memory key-value store using DashMap
// Nothing survives a restart; used for tests and throwaway replays

use super::{KeyValueStore, Keyspace};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::info;

pub struct InMemoryStore {
    /// One map per keyspace
    keyspaces: HashMap<Keyspace, DashMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        info!("Storing chain records in memory (DashMap)");
        Self {
            keyspaces: Keyspace::ALL
                .into_iter()
                .map(|keyspace| (keyspace, DashMap::new()))
                .collect(),
        }
    }

    fn keyspace(&self, keyspace: Keyspace) -> &DashMap<Vec<u8>, Vec<u8>> {
        // Every keyspace is created up front
        &self.keyspaces[&keyspace]
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        // Clone out of the shard guard, it must not be held across an await
        Ok(self.keyspace(keyspace).get(key).map(|value| value.clone()))
    }

    async fn set(&self, keyspace: Keyspace, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.keyspace(keyspace).insert(key.to_vec(), value);
        Ok(())
    }

    async fn contains(&self, keyspace: Keyspace, key: &[u8]) -> Result<bool> {
        Ok(self.keyspace(keyspace).contains_key(key))
    }

    async fn remove(&self, keyspace: Keyspace, key: &[u8]) -> Result<()> {
        self.keyspace(keyspace).remove(key);
        Ok(())
    }
}
