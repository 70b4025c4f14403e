//! Storage backend contract
//!
//! A backend stores opaque values behind `/`-delimited hierarchical keys,
//! all namespaced under a configured path prefix that is never exposed to
//! callers. HA-capable backends additionally hand out lease locks for
//! leader election.

use std::collections::HashSet;

use async_trait::async_trait;

use cofre_common::Result;

use crate::lease::LeaseLock;

/// A single stored key/value pair. The value is opaque to this layer;
/// encoding belongs to the callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Physical storage contract consumed by the layers above.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Upsert an entry. Overwriting an existing key is not an error.
    async fn put(&self, entry: &Entry) -> Result<()>;

    /// Read an entry. An absent key is `Ok(None)`, never an error.
    async fn get(&self, key: &str) -> Result<Option<Entry>>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List the immediate child names one level below `prefix`.
    ///
    /// Children that themselves have descendants appear once, with a
    /// trailing `/`; leaf keys appear bare. `prefix == ""` lists the top
    /// level. Results are sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// A backend that can also coordinate leader election across several
/// server processes sharing the same backing store.
pub trait HaBackend: Backend + std::fmt::Debug {
    /// Create a lock object for the named lease key. `identity` is the
    /// caller-chosen opaque value that proves ownership of the lease.
    fn lock_with(&self, name: &str, identity: &str) -> Result<LeaseLock>;
}

/// Collapse a flat key listing into directory-style immediate children.
///
/// `real_prefix` is the fully namespaced prefix (with trailing `/`) the
/// keys were matched against. Anything past the first `/` below the
/// prefix is truncated to a single `dir/` name, emitted once no matter
/// how many descendants were reached through it.
pub(crate) fn list_children<I>(keys: I, real_prefix: &str) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen_dirs: HashSet<String> = HashSet::new();
    let mut results = Vec::new();

    for key in keys {
        let Some(rest) = key.strip_prefix(real_prefix) else {
            continue;
        };
        match rest.split_once('/') {
            None => {
                if !rest.is_empty() {
                    results.push(rest.to_string());
                }
            }
            Some((dir, _)) => {
                let dir = format!("{}/", dir);
                if seen_dirs.insert(dir.clone()) {
                    results.push(dir);
                }
            }
        }
    }

    results.sort();
    results
}

/// Join the namespace root and a caller-supplied key into the key that
/// actually hits the store.
pub(crate) fn full_key(path: &str, key: &str) -> String {
    format!("{}/{}", path, key)
}

/// The fully namespaced prefix used for listing, always ending in `/`.
pub(crate) fn list_prefix(path: &str, prefix: &str) -> String {
    let real = format!("{}/{}", path, prefix);
    if real.ends_with('/') {
        real
    } else {
        format!("{}/", real)
    }
}
