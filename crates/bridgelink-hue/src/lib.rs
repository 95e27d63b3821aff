//! BridgeLink Hue - Bridge pairing and health checks
//!
//! Pairs with Hue bridges reachable by local IP and keeps re-checking the
//! ones already paired.
//!
//! # Pairing Flow
//!
//! 1. `PairingMachine::begin()` opens a session with a fresh bridge ID
//! 2. `submit_ip()` validates the address and probes `GET /api/config`
//! 3. The user presses the link button on the bridge
//! 4. `confirm_button_pressed()` sends `POST /api` and stores the minted token
//! 5. `complete()` saves the bridge in the `BridgeRegistry`
//!
//! # Example
//!
//! ```no_run
//! use bridgelink_core::Config;
//! use bridgelink_hue::{
//!     BridgeRegistry, FileCredentialStore, HealthChecker, HttpTransport, HueApi,
//!     LocalNetworkProber, PairingMachine,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example() {
//!     let config = Config::default();
//!     let store = Arc::new(FileCredentialStore::new().await.unwrap());
//!     let registry = Arc::new(BridgeRegistry::load(store).await);
//!     let transport = Arc::new(HttpTransport::new(config.request_timeout()).unwrap());
//!     let api = Arc::new(HueApi::new(transport, config));
//!     let prober = Arc::new(LocalNetworkProber::new());
//!
//!     let pairing =
//!         PairingMachine::new(api.clone(), api.clone(), prober.clone(), registry.clone());
//!     pairing.begin().await.unwrap();
//!     pairing.submit_ip("192.168.1.2").await.unwrap();
//!     // ... press the link button ...
//!     pairing.confirm_button_pressed().await.unwrap();
//!     pairing.complete().await.unwrap();
//!
//!     let checker = HealthChecker::new(api.clone(), api, prober, registry);
//!     let report = checker.run(&CancellationToken::new()).await;
//!     println!("Bridges: {}", report.status);
//! }
//! ```

pub mod api;
pub mod connectivity;
pub mod health;
pub mod pairing;
pub mod record;
pub mod registry;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use api::{
    HueApi, ReachabilityChecker, TokenErrorKind, TokenOutcome, TokenProtocol, TokenValidator,
    LINK_BUTTON_NOT_PRESSED,
};
pub use connectivity::{ConnectivityProber, LocalNetworkProber};
pub use health::{BridgeHealth, CheckOutcome, HealthChecker, HealthEvent, HealthReport};
pub use pairing::{PairingError, PairingMachine, PairingResult, PairingState};
pub use record::{BridgeId, BridgeInfo, BridgeRecord};
pub use registry::{BridgeRegistry, HealthUpdate, RegistryError, RegistryResult};
pub use store::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, StorageError, StorageResult,
};
pub use transport::{HttpResponse, HttpTransport, Transport, TransportError, TransportResult};
