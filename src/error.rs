//! Error types for Draupnir

use thiserror::Error;

use crate::store::StoreError;
use crate::whitelist::FirewallError;

/// Result type alias for Draupnir
pub type Result<T> = std::result::Result<T, Error>;

/// Draupnir errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Firewall error
    #[error(transparent)]
    Firewall(#[from] FirewallError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an error with context, keeping its message
    pub fn context(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Internal(format!("{context}: {err}"))
    }
}
