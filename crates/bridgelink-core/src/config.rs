//! Configuration types for BridgeLink

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Device type sent to the bridge when requesting a token.
///
/// The bridge stores it next to the minted username; the format is
/// `<application>#<device>` and must stay under 40 characters.
pub const DEFAULT_DEVICE_TYPE: &str = "bridgelink#hub";

/// URL scheme used to talk to the bridge API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiScheme {
    #[default]
    Http,
    Https,
}

impl ApiScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiScheme::Http => "http",
            ApiScheme::Https => "https",
        }
    }
}

impl std::str::FromStr for ApiScheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(ApiScheme::Http),
            "https" => Ok(ApiScheme::Https),
            _ => Err(format!("Invalid scheme: {}. Use: http, https", s)),
        }
    }
}

/// Main configuration for BridgeLink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Timeout applied to every request sent to a bridge, in milliseconds
    pub request_timeout_ms: u64,
    /// Device type string sent with the registration request
    pub device_type: String,
    /// Storage file override (defaults to the user config directory)
    pub storage_path: Option<PathBuf>,
    /// Seconds between background health checks
    pub health_check_interval_secs: u64,
    /// Scheme used for bridge URLs
    pub scheme: ApiScheme,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            storage_path: None,
            health_check_interval_secs: 60,
            scheme: ApiScheme::Http,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder pattern: set device type
    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }

    /// Builder pattern: set storage path
    pub fn with_storage_path(mut self, path: Option<PathBuf>) -> Self {
        self.storage_path = path;
        self
    }

    /// Builder pattern: set health check interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_secs = interval.as_secs().max(1);
        self
    }

    /// Builder pattern: set URL scheme
    pub fn with_scheme(mut self, scheme: ApiScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Base URL of the bridge API at `ip`
    pub fn api_base_url(&self, ip: &str) -> String {
        format!("{}://{}/api", self.scheme.as_str(), ip)
    }

    /// Reject values the bridge or the scheduler cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.device_type.is_empty() || self.device_type.len() > 40 {
            return Err(crate::Error::Config(format!(
                "device type must be 1-40 characters, got {}",
                self.device_type.len()
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "request timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
