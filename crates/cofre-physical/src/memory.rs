//! In-memory backend
//!
//! A process-local twin of the production backend, used by tests and
//! single-node development. Per-key expiry is honored lazily by every
//! conditional operation, so leases behave as if the store ran its own
//! expiry timer. Shard-level locking in `DashMap` makes each entry
//! operation atomic, which is all the lease primitives require.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use cofre_common::{Result, LOCK_SUBPATH};

use crate::backend::{full_key, list_children, list_prefix, Backend, Entry, HaBackend};
use crate::config::{BackendConfig, LockConfig};
use crate::lease::{LeaseLock, LeaseStore};

/// In-memory storage backend with HA capability.
#[derive(Debug)]
pub struct MemoryBackend {
    path: String,
    lock_config: LockConfig,
    store: Arc<MemoryStore>,
}

#[derive(Debug, Default)]
struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

#[derive(Debug)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn plain(value: Vec<u8>) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn leased(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

impl MemoryBackend {
    pub fn new(conf: &HashMap<String, String>) -> Result<Self> {
        let config = BackendConfig::parse(conf)?;
        Ok(Self {
            path: config.path,
            lock_config: config.lock,
            store: Arc::new(MemoryStore::default()),
        })
    }

    /// Drop the lease record for lock `name`, as if the store-side expiry
    /// timer had fired while the holder was partitioned away. Test
    /// support.
    pub fn force_expire(&self, name: &str) -> bool {
        let key = full_key(&self.path, &format!("{}/{}", LOCK_SUBPATH, name));
        self.store.entries.remove(&key).is_some()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn put(&self, entry: &Entry) -> Result<()> {
        self.store.entries.insert(
            full_key(&self.path, &entry.key),
            StoredValue::plain(entry.value.clone()),
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let stored = self.store.entries.get(&full_key(&self.path, key));
        Ok(stored
            .filter(|v| v.live())
            .map(|v| Entry::new(key, v.value.clone())))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.entries.remove(&full_key(&self.path, key));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let real_prefix = list_prefix(&self.path, prefix);
        let matches: Vec<String> = self
            .store
            .entries
            .iter()
            .filter(|entry| entry.value().live() && entry.key().starts_with(&real_prefix))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(list_children(matches, &real_prefix))
    }
}

impl HaBackend for MemoryBackend {
    fn lock_with(&self, name: &str, identity: &str) -> Result<LeaseLock> {
        let key = full_key(&self.path, &format!("{}/{}", LOCK_SUBPATH, name));
        Ok(LeaseLock::new(
            Arc::clone(&self.store) as Arc<dyn LeaseStore>,
            key,
            identity.to_string(),
            self.lock_config,
        ))
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn try_acquire(&self, key: &str, identity: &str, ttl: Duration) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    Ok(false)
                } else {
                    occupied.insert(StoredValue::leased(identity.as_bytes().to_vec(), ttl));
                    Ok(true)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(StoredValue::leased(identity.as_bytes().to_vec(), ttl));
                Ok(true)
            }
        }
    }

    async fn renew_if_owner(&self, key: &str, identity: &str, ttl: Duration) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if !occupied.get().live() {
                    occupied.remove();
                    Ok(false)
                } else if occupied.get().value == identity.as_bytes() {
                    occupied.get_mut().expires_at = Some(Instant::now() + ttl);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(_) => Ok(false),
        }
    }

    async fn release_if_owner(&self, key: &str, identity: &str) -> Result<bool> {
        let removed = self
            .entries
            .remove_if(key, |_, stored| {
                stored.live() && stored.value == identity.as_bytes()
            })
            .is_some();
        Ok(removed)
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let stored = self.entries.get(key);
        Ok(stored
            .filter(|v| v.live())
            .map(|v| String::from_utf8_lossy(&v.value).into_owned()))
    }
}
