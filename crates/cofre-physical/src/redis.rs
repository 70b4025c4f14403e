//! Redis backend
//!
//! The production backend. Storage entries live in a flat keyspace under
//! the namespace root, values base64-encoded; the directory-style `list`
//! truncation happens client-side. Lease claims use `SET NX PX`, and the
//! conditional renew/release steps run as server-side Lua scripts so the
//! value check and the write are one indivisible operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use redis::Script;

use cofre_common::{CofreError, Result, LOCK_SUBPATH};

use crate::backend::{full_key, list_children, list_prefix, Backend, Entry, HaBackend};
use crate::config::{BackendConfig, LockConfig};
use crate::lease::{LeaseLock, LeaseStore};
use crate::pool::ConnectionPool;

// Extend the lease expiry only while the stored value still matches the
// holder's identity.
const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

// Delete the lease only while the stored value still matches the
// holder's identity.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed storage backend with HA capability.
#[derive(Debug)]
pub struct RedisBackend {
    path: String,
    lock_config: LockConfig,
    store: Arc<RedisStore>,
}

#[derive(Debug)]
struct RedisStore {
    pool: ConnectionPool,
}

impl RedisBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let pool = ConnectionPool::new(&config.url)?;
        Ok(Self {
            path: config.path,
            lock_config: config.lock,
            store: Arc::new(RedisStore { pool }),
        })
    }

    pub fn from_conf(conf: &HashMap<String, String>) -> Result<Self> {
        Self::new(BackendConfig::parse(conf)?)
    }
}

fn store_err(err: redis::RedisError) -> CofreError {
    CofreError::StoreError(err.to_string())
}

#[async_trait]
impl Backend for RedisBackend {
    async fn put(&self, entry: &Entry) -> Result<()> {
        let mut conn = self.store.pool.get().await?;
        redis::cmd("SET")
            .arg(full_key(&self.path, &entry.key))
            .arg(BASE64.encode(&entry.value))
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        self.store.pool.put(conn);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let mut conn = self.store.pool.get().await?;
        let reply: Option<String> = redis::cmd("GET")
            .arg(full_key(&self.path, key))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        self.store.pool.put(conn);

        match reply {
            None => Ok(None),
            Some(encoded) => {
                let value = BASE64.decode(encoded.as_bytes()).map_err(|err| {
                    CofreError::StoreError(format!("undecodable value at '{}': {}", key, err))
                })?;
                Ok(Some(Entry::new(key, value)))
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.store.pool.get().await?;
        redis::cmd("DEL")
            .arg(full_key(&self.path, key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;
        self.store.pool.put(conn);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let real_prefix = list_prefix(&self.path, prefix);
        let mut conn = self.store.pool.get().await?;
        // Flat pattern match; the hierarchy is reconstructed client-side.
        let matches: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", real_prefix))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        self.store.pool.put(conn);
        Ok(list_children(matches, &real_prefix))
    }
}

impl HaBackend for RedisBackend {
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
impl LeaseStore for RedisStore {
    async fn try_acquire(&self, key: &str, identity: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        // NX: claim only when absent; PX: attach the expiry in the same
        // command so there is no window without a timer.
        let claimed: bool = redis::cmd("SET")
            .arg(key)
            .arg(identity)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        self.pool.put(conn);
        Ok(claimed)
    }

    async fn renew_if_owner(&self, key: &str, identity: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let extended: i64 = Script::new(RENEW_SCRIPT)
            .key(key)
            .arg(identity)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        self.pool.put(conn);
        Ok(extended == 1)
    }

    async fn release_if_owner(&self, key: &str, identity: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(identity)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        self.pool.put(conn);
        Ok(deleted == 1)
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        self.pool.put(conn);
        Ok(value)
    }
}
