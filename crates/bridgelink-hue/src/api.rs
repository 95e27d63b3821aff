//! Hue bridge REST API: reachability, registration and token checks
//!
//! Registration follows the bridge's link-button flow:
//! 1. Client POSTs `{"devicetype": "..."}` to `/api`
//! 2. If the link button was pressed within the last 30 seconds the bridge
//!    answers `[{"success":{"username":"<token>"}}]`
//! 3. Otherwise it answers `[{"error":{"type":101,...}}]`
//!
//! Nothing here retries. Another attempt needs another button press, so that
//! decision belongs to the caller.

use crate::transport::{HttpResponse, Transport, TransportError};
use async_trait::async_trait;
use bridgelink_core::{is_valid_ip, Config};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bridge error code for "link button not pressed"
pub const LINK_BUTTON_NOT_PRESSED: u16 = 101;

/// Why a token request did not produce a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum TokenErrorKind {
    #[error("no error")]
    None,
    #[error("malformed bridge address")]
    BadIp,
    #[error("bridge did not answer successfully")]
    UnsuccessfulResponse,
    #[error("bridge answered without a token")]
    TokenNotFound,
    #[error("bridge response could not be parsed")]
    CannotParseResponseBody,
    #[error("link button was not pressed")]
    ButtonNotHit,
}

/// Result of one registration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOutcome {
    pub token: Option<String>,
    pub error: TokenErrorKind,
}

impl TokenOutcome {
    pub fn success(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            error: TokenErrorKind::None,
        }
    }

    pub fn failure(error: TokenErrorKind) -> Self {
        Self { token: None, error }
    }

    pub fn is_success(&self) -> bool {
        self.error == TokenErrorKind::None && self.token.is_some()
    }
}

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    devicetype: &'a str,
}

/// One element of the array every bridge API call answers with
#[derive(Debug, Deserialize)]
struct ApiEntry {
    #[serde(default)]
    success: Option<RegistrationSuccess>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct RegistrationSuccess {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: u16,
    description: String,
}

/// Probe: does a bridge answer at this address?
#[async_trait]
pub trait ReachabilityChecker: Send + Sync {
    async fn is_reachable(&self, ip: &str, cancel: &CancellationToken) -> bool;
}

/// Registration handshake that mints a token
#[async_trait]
pub trait TokenProtocol: Send + Sync {
    async fn request_token(&self, ip: &str, cancel: &CancellationToken) -> TokenOutcome;
}

/// Authenticated probe: does this token still work?
///
/// An unreachable bridge and a rejected token both read as `false`.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn is_token_valid(&self, ip: &str, token: &str, cancel: &CancellationToken) -> bool;
}

/// Client for the bridge API over any [`Transport`]
pub struct HueApi {
    transport: Arc<dyn Transport>,
    config: Config,
}

impl HueApi {
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Self {
        Self { transport, config }
    }

    fn base_url(&self, ip: &str) -> String {
        self.config.api_base_url(ip)
    }

    fn status_url(&self, ip: &str) -> String {
        format!("{}/config", self.base_url(ip))
    }

    fn authenticated_status_url(&self, ip: &str, token: &str) -> String {
        format!("{}/{}/config", self.base_url(ip), token)
    }
}

#[async_trait]
impl ReachabilityChecker for HueApi {
    async fn is_reachable(&self, ip: &str, cancel: &CancellationToken) -> bool {
        if !is_valid_ip(ip) {
            return false;
        }

        match self.transport.get(&self.status_url(ip), cancel).await {
            Ok(response) if response.is_success() => {
                debug!("Bridge at {} is reachable", ip);
                true
            }
            Ok(response) => {
                debug!("Bridge at {} answered with status {}", ip, response.status);
                false
            }
            Err(e) => {
                debug!("Bridge at {} unreachable: {}", ip, e);
                false
            }
        }
    }
}

#[async_trait]
impl TokenProtocol for HueApi {
    async fn request_token(&self, ip: &str, cancel: &CancellationToken) -> TokenOutcome {
        if !is_valid_ip(ip) {
            return TokenOutcome::failure(TokenErrorKind::BadIp);
        }

        let body = match serde_json::to_string(&RegistrationRequest {
            devicetype: &self.config.device_type,
        }) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode registration request: {}", e);
                return TokenOutcome::failure(TokenErrorKind::UnsuccessfulResponse);
            }
        };

        let response = match self.transport.post(&self.base_url(ip), &body, cancel).await {
            Ok(response) => response,
            Err(TransportError::Cancelled) => {
                info!("Token request to {} cancelled", ip);
                return TokenOutcome::failure(TokenErrorKind::UnsuccessfulResponse);
            }
            Err(e) => {
                warn!("Token request to {} failed: {}", ip, e);
                return TokenOutcome::failure(TokenErrorKind::UnsuccessfulResponse);
            }
        };

        let outcome = classify_registration(&response);
        match &outcome.token {
            Some(_) => info!("Bridge at {} issued a token", ip),
            None => info!("Bridge at {} refused registration: {}", ip, outcome.error),
        }
        outcome
    }
}

#[async_trait]
impl TokenValidator for HueApi {
    async fn is_token_valid(&self, ip: &str, token: &str, cancel: &CancellationToken) -> bool {
        if !is_valid_ip(ip) || token.trim().is_empty() {
            return false;
        }

        let url = self.authenticated_status_url(ip, token);
        let response = match self.transport.get(&url, cancel).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                debug!("Token check at {} answered with status {}", ip, response.status);
                return false;
            }
            Err(e) => {
                debug!("Token check at {} failed: {}", ip, e);
                return false;
            }
        };

        is_authorized_body(&response.body)
    }
}

/// Map a registration response onto a token or an error kind
fn classify_registration(response: &HttpResponse) -> TokenOutcome {
    if !response.is_success() {
        return TokenOutcome::failure(TokenErrorKind::UnsuccessfulResponse);
    }

    let entries: Vec<ApiEntry> = match serde_json::from_str(&response.body) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Unparseable registration body: {}", e);
            return TokenOutcome::failure(TokenErrorKind::CannotParseResponseBody);
        }
    };

    let Some(first) = entries.into_iter().next() else {
        return TokenOutcome::failure(TokenErrorKind::CannotParseResponseBody);
    };

    match (first.success, first.error) {
        (Some(success), _) => match success.username {
            Some(username) if !username.trim().is_empty() => TokenOutcome::success(username),
            _ => TokenOutcome::failure(TokenErrorKind::TokenNotFound),
        },
        (None, Some(error)) if error.kind == LINK_BUTTON_NOT_PRESSED => {
            TokenOutcome::failure(TokenErrorKind::ButtonNotHit)
        }
        (None, Some(error)) => {
            debug!("Bridge error {}: {}", error.kind, error.description);
            TokenOutcome::failure(TokenErrorKind::CannotParseResponseBody)
        }
        (None, None) => TokenOutcome::failure(TokenErrorKind::CannotParseResponseBody),
    }
}

/// A bridge rejects unknown tokens with an error array, still under 200
fn is_authorized_body(body: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Array(entries)) => !entries
            .iter()
            .any(|entry| entry.get("error").is_some()),
        Ok(_) => true,
        Err(_) => false,
    }
}
