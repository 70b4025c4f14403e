//! Cofre Physical - Pluggable persistence and HA coordination
//!
//! This crate provides:
//! - The storage backend contract (hierarchical key/value over a shared
//!   namespace)
//! - A registry mapping configured backend kinds to constructors
//! - A lease-based distributed lock for leader election across server
//!   processes sharing one backing store
//! - The Redis-backed production backend with its connection pool, and an
//!   in-memory twin for tests and single-node development

pub mod backend;
pub mod config;
pub mod lease;
pub mod memory;
pub mod pool;
pub mod redis;
pub mod registry;

// Re-export commonly used types
pub use backend::{Backend, Entry, HaBackend};
pub use config::{BackendConfig, LockConfig};
pub use lease::{LeaseLock, LeaseStore, LockState};
pub use memory::MemoryBackend;
pub use self::redis::RedisBackend;
pub use registry::{new_backend, BackendFactory, BackendRegistry};
