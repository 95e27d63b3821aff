//! Bridge identity and pairing record
//!
//! Represents a paired (or in-pairing) bridge with its address, token and
//! health flags.

use bridgelink_core::TestStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a bridge record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BridgeId(pub Uuid);

impl BridgeId {
    /// Generate a new random bridge ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// First eight characters, used in display names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for BridgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BridgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bridge known to the hub
///
/// `ip` and `token` are blank when unknown and are the only fields written to
/// the credential store. `active`, `connected`, `token_status` and
/// `last_checked` are runtime observations recomputed by the health checker.
#[derive(Debug, Clone)]
pub struct BridgeRecord {
    id: BridgeId,
    pub ip: String,
    pub token: String,
    /// Human-readable name (e.g., "Hue Bridge 3f2a91c0")
    pub human_name: String,
    /// Short label shown next to the name, defaults to the address
    pub label_name: String,
    /// When the health checker last visited this bridge
    pub last_checked: Option<DateTime<Utc>>,
    /// Address present and bridge answering
    pub active: bool,
    /// Event subscription status
    pub connected: bool,
    /// Result of the last token validation
    pub token_status: TestStatus,
}

impl BridgeRecord {
    /// Create a blank record with a fresh ID
    pub fn new() -> Self {
        Self::with_id(BridgeId::new())
    }

    pub fn with_id(id: BridgeId) -> Self {
        let human_name = format!("Hue Bridge {}", id.short());
        Self {
            id,
            ip: String::new(),
            token: String::new(),
            human_name,
            label_name: String::new(),
            last_checked: None,
            active: false,
            connected: false,
            token_status: TestStatus::NotTested,
        }
    }

    /// Assigned once at creation
    pub fn id(&self) -> &BridgeId {
        &self.id
    }

    pub fn has_ip(&self) -> bool {
        !self.ip.trim().is_empty()
    }

    pub fn has_token(&self) -> bool {
        !self.token.trim().is_empty()
    }

    /// Set the address and keep the label in step with it
    pub fn set_ip(&mut self, ip: impl Into<String>) {
        let ip = ip.into();
        if self.label_name.is_empty() || self.label_name == self.ip {
            self.label_name = ip.clone();
        }
        self.ip = ip;
    }

    pub fn clear_ip(&mut self) {
        if self.label_name == self.ip {
            self.label_name.clear();
        }
        self.ip.clear();
    }

    /// Drop runtime observations, e.g. after the address changed
    pub fn reset_health(&mut self) {
        self.active = false;
        self.connected = false;
        self.token_status = TestStatus::NotTested;
    }
}

impl Default for BridgeRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of a bridge for display, without the token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfo {
    pub id: String,
    pub name: String,
    pub label: String,
    pub ip: String,
    pub active: bool,
    pub token_status: TestStatus,
    pub last_checked: Option<DateTime<Utc>>,
}

impl From<&BridgeRecord> for BridgeInfo {
    fn from(record: &BridgeRecord) -> Self {
        Self {
            id: record.id().to_string(),
            name: record.human_name.clone(),
            label: record.label_name.clone(),
            ip: record.ip.clone(),
            active: record.active,
            token_status: record.token_status,
            last_checked: record.last_checked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_id_generation() {
        let id1 = BridgeId::new();
        let id2 = BridgeId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.short().len(), 8);
    }

    #[test]
    fn test_bridge_id_parse() {
        let id = BridgeId::new();
        let parsed = BridgeId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(BridgeId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_record_keeps_its_id() {
        let id = BridgeId::new();
        let mut record = BridgeRecord::with_id(id.clone());
        record.set_ip("192.168.1.2");
        record.token = "abc".to_string();
        record.reset_health();
        assert_eq!(record.id(), &id);
        assert_eq!(record.clone().id(), &id);
    }

    #[test]
    fn test_new_record_is_blank() {
        let record = BridgeRecord::new();
        assert!(!record.has_ip());
        assert!(!record.has_token());
        assert!(!record.active);
        assert!(record.human_name.starts_with("Hue Bridge "));
    }

    #[test]
    fn test_label_follows_ip() {
        let mut record = BridgeRecord::new();
        record.set_ip("192.168.1.2");
        assert_eq!(record.label_name, "192.168.1.2");

        record.set_ip("192.168.1.3");
        assert_eq!(record.label_name, "192.168.1.3");

        record.label_name = "Living room".to_string();
        record.set_ip("192.168.1.4");
        assert_eq!(record.label_name, "Living room");

        record.clear_ip();
        assert!(!record.has_ip());
        assert_eq!(record.label_name, "Living room");
    }
}
