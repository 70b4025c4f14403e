//! Cofre Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Cofre
//! components:
//! - Error types
//! - Common constants

pub mod error;

// Re-exports for convenience
pub use error::{CofreError, Result};

/// Default namespace root used when the configuration does not set `path`
pub const DEFAULT_STORAGE_PATH: &str = "cofre";

/// Reserved sub-path under the namespace root where lease keys live
pub const LOCK_SUBPATH: &str = "_lock";
