//! Error types for Cofre
//!
//! This module defines `CofreError`, the application-specific error enum
//! shared by every Cofre component.

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum CofreError {
    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("unknown physical backend kind '{0}'")]
    UnknownBackend(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("invalid lease configuration: {0}")]
    InvalidLeaseConfig(String),

    #[error("lease '{0}' is not held by this instance")]
    NotLockOwner(String),

    #[error("store error: {0}")]
    StoreError(String),
}

/// Convenience alias used across all Cofre crates
pub type Result<T> = std::result::Result<T, CofreError>;
