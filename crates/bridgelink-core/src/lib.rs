//! BridgeLink Core - Shared types and configuration
//!
//! This crate provides the foundational types used across all BridgeLink components.

pub mod config;
pub mod error;
pub mod ip;
pub mod status;

pub use config::{ApiScheme, Config};
pub use error::{Error, Result};
pub use ip::is_valid_ip;
pub use status::TestStatus;
