//! On-disk key-value store using Fjall

use super::{KeyValueStore, Keyspace};
use anyhow::Result;
use async_trait::async_trait;
use fjall::{Database, KeyspaceCreateOptions, PersistMode};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

pub struct FjallStore {
    database: Database,
    keyspaces: HashMap<Keyspace, fjall::Keyspace>,
}

impl FjallStore {
    pub fn new(path: &str, clear_on_start: bool) -> Result<Self> {
        info!("Storing chain records with Fjall on disk ({path})");
        let path = Path::new(path);
        if clear_on_start && path.exists() {
            fs::remove_dir_all(path)?;
        }

        let database = Database::builder(path).open()?;
        let mut keyspaces = HashMap::new();
        for keyspace in Keyspace::ALL {
            let handle = database.keyspace(keyspace.name(), KeyspaceCreateOptions::default)?;
            keyspaces.insert(keyspace, handle);
        }

        Ok(Self {
            database,
            keyspaces,
        })
    }

    fn keyspace(&self, keyspace: Keyspace) -> &fjall::Keyspace {
        // Every keyspace is opened in `new`
        &self.keyspaces[&keyspace]
    }
}

#[async_trait]
impl KeyValueStore for FjallStore {
    async fn get(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.keyspace(keyspace).get(key)?.map(|value| value.to_vec()))
    }

    async fn set(&self, keyspace: Keyspace, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.keyspace(keyspace).insert(key, value)?;

        // The chain aggregate carries the global pointers, make it durable
        // before reporting success
        if keyspace == Keyspace::Chains {
            self.database.persist(PersistMode::Buffer)?;
        }
        Ok(())
    }

    async fn contains(&self, keyspace: Keyspace, key: &[u8]) -> Result<bool> {
        Ok(self.keyspace(keyspace).get(key)?.is_some())
    }

    async fn remove(&self, keyspace: Keyspace, key: &[u8]) -> Result<()> {
        self.keyspace(keyspace).remove(key)?;
        Ok(())
    }
}
