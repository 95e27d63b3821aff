//! Error types for BridgeLink

use thiserror::Error;

/// Main error type for BridgeLink operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using BridgeLink's Error
pub type Result<T> = std::result::Result<T, Error>;
