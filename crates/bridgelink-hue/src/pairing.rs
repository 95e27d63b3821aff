//! Bridge pairing state machine
//!
//! Onboards exactly one bridge at a time:
//! 1. `begin()` creates a pending record with a fresh ID
//! 2. `submit_ip()` validates the address and probes the bridge
//! 3. The user presses the bridge's link button, then `confirm_button_pressed()`
//!    requests a token
//! 4. `complete()` moves the pending record into the registry
//!
//! Every error state can be left through `acknowledge_error()` or `go_back()`.
//! Calls that need the bridge are single-flight: while one is waiting for a
//! response, every other mutating call is rejected with [`PairingError::Busy`].

use crate::api::{ReachabilityChecker, TokenErrorKind, TokenProtocol};
use crate::connectivity::ConnectivityProber;
use crate::record::BridgeRecord;
use crate::registry::{BridgeRegistry, RegistryError};
use bridgelink_core::{is_valid_ip, TestStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Where a pairing session stands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PairingState {
    /// Idle, no session
    #[default]
    NotInitializing,
    Stage1GetIp,
    Stage1ErrorBadIpFormat,
    Stage1ErrorNoBridgeAtIp,
    Stage2PressBridgeButton,
    Stage2ErrorNoTokenFromBridge,
    Stage2ErrorCannotParseResponse,
    Stage2ErrorButtonNotPushed,
    Stage2ErrorUnsuccessfulResponse,
    Stage3AllGoodAndDone,
}

impl PairingState {
    /// Pairing stage (0 when idle)
    pub fn stage(&self) -> u8 {
        match self {
            PairingState::NotInitializing => 0,
            PairingState::Stage1GetIp
            | PairingState::Stage1ErrorBadIpFormat
            | PairingState::Stage1ErrorNoBridgeAtIp => 1,
            PairingState::Stage2PressBridgeButton
            | PairingState::Stage2ErrorNoTokenFromBridge
            | PairingState::Stage2ErrorCannotParseResponse
            | PairingState::Stage2ErrorButtonNotPushed
            | PairingState::Stage2ErrorUnsuccessfulResponse => 2,
            PairingState::Stage3AllGoodAndDone => 3,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            PairingState::Stage1ErrorBadIpFormat
                | PairingState::Stage1ErrorNoBridgeAtIp
                | PairingState::Stage2ErrorNoTokenFromBridge
                | PairingState::Stage2ErrorCannotParseResponse
                | PairingState::Stage2ErrorButtonNotPushed
                | PairingState::Stage2ErrorUnsuccessfulResponse
        )
    }

    pub fn is_idle(&self) -> bool {
        *self == PairingState::NotInitializing
    }

    /// Stage-2 error state for a failed token request
    ///
    /// `None` and `BadIp` have no state: the address was validated before
    /// stage 2 was entered, so seeing them here is a broken precondition.
    pub fn for_token_error(kind: TokenErrorKind) -> Option<Self> {
        match kind {
            TokenErrorKind::UnsuccessfulResponse => {
                Some(PairingState::Stage2ErrorUnsuccessfulResponse)
            }
            TokenErrorKind::TokenNotFound => Some(PairingState::Stage2ErrorNoTokenFromBridge),
            TokenErrorKind::CannotParseResponseBody => {
                Some(PairingState::Stage2ErrorCannotParseResponse)
            }
            TokenErrorKind::ButtonNotHit => Some(PairingState::Stage2ErrorButtonNotPushed),
            TokenErrorKind::None | TokenErrorKind::BadIp => None,
        }
    }

    /// Short instruction for whoever is driving the session
    pub fn prompt(&self) -> &'static str {
        match self {
            PairingState::NotInitializing => "Not pairing",
            PairingState::Stage1GetIp => "Enter the bridge's IP address",
            PairingState::Stage1ErrorBadIpFormat => {
                "That is not an IP address. Use four numbers 0-255 separated by dots"
            }
            PairingState::Stage1ErrorNoBridgeAtIp => {
                "No bridge answered at that address. Check it and that the bridge is powered"
            }
            PairingState::Stage2PressBridgeButton => {
                "Press the link button on the bridge, then confirm"
            }
            PairingState::Stage2ErrorNoTokenFromBridge => {
                "The bridge answered but sent no token. Press the link button and try again"
            }
            PairingState::Stage2ErrorCannotParseResponse => {
                "The bridge sent a response that could not be read"
            }
            PairingState::Stage2ErrorButtonNotPushed => {
                "The link button was not pressed. Press it and confirm within 30 seconds"
            }
            PairingState::Stage2ErrorUnsuccessfulResponse => {
                "The bridge did not answer the request"
            }
            PairingState::Stage3AllGoodAndDone => "Paired. Finish to save the bridge",
        }
    }
}

impl std::fmt::Display for PairingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PairingState::NotInitializing => "NOT_INITIALIZING",
            PairingState::Stage1GetIp => "STAGE_1_GET_IP",
            PairingState::Stage1ErrorBadIpFormat => "STAGE_1_ERROR_BAD_IP_FORMAT",
            PairingState::Stage1ErrorNoBridgeAtIp => "STAGE_1_ERROR_NO_BRIDGE_AT_IP",
            PairingState::Stage2PressBridgeButton => "STAGE_2_PRESS_BRIDGE_BUTTON",
            PairingState::Stage2ErrorNoTokenFromBridge => "STAGE_2_ERROR_NO_TOKEN_FROM_BRIDGE",
            PairingState::Stage2ErrorCannotParseResponse => "STAGE_2_ERROR_CANNOT_PARSE_RESPONSE",
            PairingState::Stage2ErrorButtonNotPushed => "STAGE_2_ERROR_BUTTON_NOT_PUSHED",
            PairingState::Stage2ErrorUnsuccessfulResponse => {
                "STAGE_2_ERROR_UNSUCCESSFUL_RESPONSE"
            }
            PairingState::Stage3AllGoodAndDone => "STAGE_3_ALL_GOOD_AND_DONE",
        };
        f.write_str(s)
    }
}

/// Pairing errors
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("A pairing session is already in progress")]
    AlreadyPairing,
    #[error("Cannot {operation} while in state {state}")]
    InvalidTransition {
        operation: &'static str,
        state: PairingState,
    },
    #[error("Still waiting for a bridge response")]
    Busy,
    #[error("Request cancelled")]
    Cancelled,
    #[error("Pairing invariant violated: {0}")]
    InvariantViolation(String),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type PairingResult<T> = Result<T, PairingError>;

/// Mutable session data, guarded by one lock
struct Session {
    state: PairingState,
    pending: Option<BridgeRecord>,
    protocol_status: TestStatus,
    cancel: CancellationToken,
}

impl Session {
    fn idle() -> Self {
        Self {
            state: PairingState::NotInitializing,
            pending: None,
            protocol_status: TestStatus::NotTested,
            cancel: CancellationToken::new(),
        }
    }
}

/// Clears the waiting-for-response flag when dropped
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives one pairing session at a time
pub struct PairingMachine {
    reachability: Arc<dyn ReachabilityChecker>,
    tokens: Arc<dyn TokenProtocol>,
    prober: Arc<dyn ConnectivityProber>,
    registry: Arc<BridgeRegistry>,
    session: Mutex<Session>,
    waiting_for_response: AtomicBool,
    state_tx: watch::Sender<PairingState>,
}

impl PairingMachine {
    pub fn new(
        reachability: Arc<dyn ReachabilityChecker>,
        tokens: Arc<dyn TokenProtocol>,
        prober: Arc<dyn ConnectivityProber>,
        registry: Arc<BridgeRegistry>,
    ) -> Self {
        let (state_tx, _) = watch::channel(PairingState::NotInitializing);
        Self {
            reachability,
            tokens,
            prober,
            registry,
            session: Mutex::new(Session::idle()),
            waiting_for_response: AtomicBool::new(false),
            state_tx,
        }
    }

    /// Current state
    pub fn state(&self) -> PairingState {
        *self.state_tx.borrow()
    }

    /// Receive every state change
    pub fn subscribe(&self) -> watch::Receiver<PairingState> {
        self.state_tx.subscribe()
    }

    pub fn is_waiting_for_response(&self) -> bool {
        self.waiting_for_response.load(Ordering::SeqCst)
    }

    /// Copy of the bridge being paired, if a session is open
    pub async fn pending(&self) -> Option<BridgeRecord> {
        self.session.lock().await.pending.clone()
    }

    /// Outcome of the last token request in this session
    pub async fn protocol_status(&self) -> TestStatus {
        self.session.lock().await.protocol_status
    }

    /// Abort the bridge request in flight, if any
    ///
    /// The interrupted call returns [`PairingError::Cancelled`] and the state
    /// stays where it was before the call.
    pub async fn cancel(&self) {
        let session = self.session.lock().await;
        if self.is_waiting_for_response() {
            info!("Cancelling pending bridge request");
            session.cancel.cancel();
        }
    }

    /// Open a session: idle -> STAGE_1_GET_IP
    pub async fn begin(&self) -> PairingResult<PairingState> {
        let _flight = self.enter_flight()?;
        let mut session = self.session.lock().await;

        if !session.state.is_idle() {
            error!(
                "Cannot begin pairing: session already in state {}",
                session.state
            );
            return Err(PairingError::AlreadyPairing);
        }

        let record = BridgeRecord::new();
        info!("Started pairing session for bridge {}", record.id());
        session.pending = Some(record);
        session.protocol_status = TestStatus::NotTested;
        session.cancel = CancellationToken::new();
        Ok(self.transition(&mut session, PairingState::Stage1GetIp))
    }

    /// Validate and probe the bridge address
    pub async fn submit_ip(&self, candidate: &str) -> PairingResult<PairingState> {
        let _flight = self.enter_flight()?;
        let cancel = {
            let mut session = self.session.lock().await;
            self.expect_state(&session, "submit an address", &[PairingState::Stage1GetIp])?;
            self.require_pending(&mut session)?;

            if !is_valid_ip(candidate) {
                warn!("Rejected malformed bridge address {:?}", candidate);
                return Ok(self.transition(&mut session, PairingState::Stage1ErrorBadIpFormat));
            }
            if !self.prober.has_route_to(candidate) {
                warn!("No local network route to {}", candidate);
                return Ok(self.transition(&mut session, PairingState::Stage1ErrorNoBridgeAtIp));
            }
            session.cancel.clone()
        };

        let reachable = self.reachability.is_reachable(candidate, &cancel).await;

        let mut session = self.session.lock().await;
        if cancel.is_cancelled() {
            session.cancel = CancellationToken::new();
            return Err(PairingError::Cancelled);
        }

        if !reachable {
            warn!("No bridge answered at {}", candidate);
            return Ok(self.transition(&mut session, PairingState::Stage1ErrorNoBridgeAtIp));
        }

        self.require_pending(&mut session)?.set_ip(candidate);
        info!("Found bridge at {}", candidate);
        Ok(self.transition(&mut session, PairingState::Stage2PressBridgeButton))
    }

    /// Request a token now that the link button has been pressed
    pub async fn confirm_button_pressed(&self) -> PairingResult<PairingState> {
        let _flight = self.enter_flight()?;
        let (ip, cancel) = {
            let mut session = self.session.lock().await;
            self.expect_state(
                &session,
                "confirm the button press",
                &[PairingState::Stage2PressBridgeButton],
            )?;
            let pending = self.require_pending(&mut session)?;
            if !pending.has_ip() {
                let id = pending.id().clone();
                return Err(self.abort(
                    &mut session,
                    format!("pending bridge {} reached stage 2 without an address", id),
                ));
            }
            let ip = pending.ip.clone();
            session.protocol_status = TestStatus::Testing;
            (ip, session.cancel.clone())
        };

        let outcome = self.tokens.request_token(&ip, &cancel).await;

        let mut session = self.session.lock().await;
        if cancel.is_cancelled() {
            session.cancel = CancellationToken::new();
            session.protocol_status = TestStatus::NotTested;
            return Err(PairingError::Cancelled);
        }

        if let Some(token) = outcome.token.clone().filter(|_| outcome.is_success()) {
            self.require_pending(&mut session)?.token = token;
            session.protocol_status = TestStatus::TestGood;
            info!("Bridge at {} issued a token", ip);
            return Ok(self.transition(&mut session, PairingState::Stage3AllGoodAndDone));
        }

        session.protocol_status = TestStatus::TestBad;
        match PairingState::for_token_error(outcome.error) {
            Some(state) => {
                warn!("Token request to {} failed: {}", ip, outcome.error);
                Ok(self.transition(&mut session, state))
            }
            None => Err(self.abort(
                &mut session,
                format!("token request reported {:?} after address validation", outcome.error),
            )),
        }
    }

    /// Leave an error state for the nearest non-error state
    pub async fn acknowledge_error(&self) -> PairingResult<PairingState> {
        let _flight = self.enter_flight()?;
        let mut session = self.session.lock().await;

        let next = match session.state {
            PairingState::Stage1ErrorBadIpFormat | PairingState::Stage1ErrorNoBridgeAtIp => {
                if let Some(pending) = session.pending.as_mut() {
                    pending.clear_ip();
                }
                PairingState::Stage1GetIp
            }
            state if state.is_error() => PairingState::Stage2PressBridgeButton,
            state => {
                warn!("No error to acknowledge in state {}", state);
                return Err(PairingError::InvalidTransition {
                    operation: "acknowledge an error",
                    state,
                });
            }
        };

        Ok(self.transition(&mut session, next))
    }

    /// Step back one stage
    ///
    /// From idle this is logged and the machine stays idle.
    pub async fn go_back(&self) -> PairingResult<PairingState> {
        let _flight = self.enter_flight()?;
        let mut session = self.session.lock().await;

        let next = match session.state {
            PairingState::NotInitializing => {
                warn!("Cannot go back: not pairing");
                return Err(PairingError::InvalidTransition {
                    operation: "go back",
                    state: PairingState::NotInitializing,
                });
            }
            PairingState::Stage1GetIp
            | PairingState::Stage1ErrorBadIpFormat
            | PairingState::Stage1ErrorNoBridgeAtIp
            | PairingState::Stage3AllGoodAndDone => PairingState::NotInitializing,
            PairingState::Stage2ErrorNoTokenFromBridge
            | PairingState::Stage2ErrorButtonNotPushed => PairingState::Stage2PressBridgeButton,
            PairingState::Stage2PressBridgeButton
            | PairingState::Stage2ErrorCannotParseResponse
            | PairingState::Stage2ErrorUnsuccessfulResponse => PairingState::Stage1GetIp,
        };

        match next {
            PairingState::NotInitializing => {
                if let Some(record) = session.pending.take() {
                    info!("Discarded pending bridge {}", record.id());
                }
                session.protocol_status = TestStatus::NotTested;
            }
            PairingState::Stage1GetIp => {
                if let Some(pending) = session.pending.as_mut() {
                    pending.clear_ip();
                    pending.token.clear();
                }
                session.protocol_status = TestStatus::NotTested;
            }
            _ => {}
        }

        Ok(self.transition(&mut session, next))
    }

    /// Save the paired bridge and return to idle
    pub async fn complete(&self) -> PairingResult<BridgeRecord> {
        let _flight = self.enter_flight()?;
        let mut session = self.session.lock().await;
        self.expect_state(
            &session,
            "complete pairing",
            &[PairingState::Stage3AllGoodAndDone],
        )?;

        let record = self.require_pending(&mut session)?.clone();
        self.registry.promote(record.clone()).await?;

        session.pending = None;
        session.protocol_status = TestStatus::NotTested;
        info!("Bridge {} paired at {}", record.id(), record.ip);
        self.transition(&mut session, PairingState::NotInitializing);
        Ok(record)
    }

    fn enter_flight(&self) -> PairingResult<InFlight<'_>> {
        self.waiting_for_response
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| InFlight(&self.waiting_for_response))
            .map_err(|_| {
                warn!("Rejected pairing call: still waiting for a bridge response");
                PairingError::Busy
            })
    }

    fn expect_state(
        &self,
        session: &Session,
        operation: &'static str,
        allowed: &[PairingState],
    ) -> PairingResult<()> {
        if allowed.contains(&session.state) {
            Ok(())
        } else {
            error!("Cannot {} while in state {}", operation, session.state);
            Err(PairingError::InvalidTransition {
                operation,
                state: session.state,
            })
        }
    }

    fn require_pending<'s>(
        &self,
        session: &'s mut Session,
    ) -> PairingResult<&'s mut BridgeRecord> {
        if session.pending.is_none() {
            let state = session.state;
            return Err(self.abort(session, format!("no pending bridge in state {}", state)));
        }
        session
            .pending
            .as_mut()
            .ok_or_else(|| PairingError::InvariantViolation("pending bridge vanished".into()))
    }

    /// End the session after a broken precondition
    fn abort(&self, session: &mut Session, reason: String) -> PairingError {
        error!("Aborting pairing session: {}", reason);
        *session = Session::idle();
        self.state_tx.send_replace(PairingState::NotInitializing);
        PairingError::InvariantViolation(reason)
    }

    fn transition(&self, session: &mut Session, next: PairingState) -> PairingState {
        if session.state != next {
            info!("Pairing: {} -> {}", session.state, next);
        }
        session.state = next;
        self.state_tx.send_replace(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TokenOutcome;
    use crate::store::MemoryCredentialStore;
    use crate::testing::{FixedProber, RoutedProber};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Bridge double answering probes and token requests from scripts
    #[derive(Default)]
    struct FakeBridge {
        reachable: AtomicBool,
        outcomes: std::sync::Mutex<VecDeque<TokenOutcome>>,
        probes: AtomicUsize,
        token_requests: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl FakeBridge {
        fn reachable() -> Self {
            let bridge = Self::default();
            bridge.reachable.store(true, Ordering::SeqCst);
            bridge
        }

        fn gated(gate: Arc<Notify>) -> Self {
            let mut bridge = Self::reachable();
            bridge.gate = Some(gate);
            bridge
        }

        fn queue(&self, outcome: TokenOutcome) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        async fn wait(&self, cancel: &CancellationToken) -> bool {
            match &self.gate {
                Some(gate) => tokio::select! {
                    _ = gate.notified() => true,
                    _ = cancel.cancelled() => false,
                },
                None => true,
            }
        }
    }

    #[async_trait]
    impl ReachabilityChecker for FakeBridge {
        async fn is_reachable(&self, _ip: &str, cancel: &CancellationToken) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.wait(cancel).await && self.reachable.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenProtocol for FakeBridge {
        async fn request_token(&self, _ip: &str, cancel: &CancellationToken) -> TokenOutcome {
            self.token_requests.fetch_add(1, Ordering::SeqCst);
            if !self.wait(cancel).await {
                return TokenOutcome::failure(TokenErrorKind::UnsuccessfulResponse);
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(TokenOutcome::failure(TokenErrorKind::ButtonNotHit))
        }
    }

    async fn machine_with(bridge: Arc<FakeBridge>) -> (Arc<PairingMachine>, Arc<BridgeRegistry>) {
        let registry =
            Arc::new(BridgeRegistry::load(Arc::new(MemoryCredentialStore::new())).await);
        let machine = PairingMachine::new(
            bridge.clone(),
            bridge,
            Arc::new(FixedProber::new(true)),
            registry.clone(),
        );
        (Arc::new(machine), registry)
    }

    async fn at_stage_2(bridge: Arc<FakeBridge>) -> (Arc<PairingMachine>, Arc<BridgeRegistry>) {
        let (machine, registry) = machine_with(bridge).await;
        machine.begin().await.unwrap();
        assert_eq!(
            machine.submit_ip("192.168.1.1").await.unwrap(),
            PairingState::Stage2PressBridgeButton
        );
        (machine, registry)
    }

    #[tokio::test]
    async fn test_begin_creates_fresh_pending_bridge() {
        let (machine, _) = machine_with(Arc::new(FakeBridge::reachable())).await;
        assert_eq!(machine.state(), PairingState::NotInitializing);
        assert!(machine.pending().await.is_none());

        assert_eq!(machine.begin().await.unwrap(), PairingState::Stage1GetIp);
        let first = machine.pending().await.unwrap();
        assert!(!first.has_ip());

        assert!(matches!(
            machine.begin().await,
            Err(PairingError::AlreadyPairing)
        ));
        assert_eq!(machine.pending().await.unwrap().id(), first.id());

        machine.go_back().await.unwrap();
        machine.begin().await.unwrap();
        assert_ne!(machine.pending().await.unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_bad_ip_makes_no_network_call() {
        let bridge = Arc::new(FakeBridge::reachable());
        let (machine, _) = machine_with(bridge.clone()).await;
        machine.begin().await.unwrap();

        for candidate in ["19216811", "192.168.1.256", " 192.168.1.1", "a.b.c.d"] {
            assert_eq!(
                machine.submit_ip(candidate).await.unwrap(),
                PairingState::Stage1ErrorBadIpFormat
            );
            assert_eq!(
                machine.acknowledge_error().await.unwrap(),
                PairingState::Stage1GetIp
            );
        }
        assert_eq!(bridge.probes.load(Ordering::SeqCst), 0);
        assert!(!machine.pending().await.unwrap().has_ip());
    }

    #[tokio::test]
    async fn test_unreachable_bridge_leaves_ip_unset() {
        let bridge = Arc::new(FakeBridge::default());
        let (machine, _) = machine_with(bridge.clone()).await;
        machine.begin().await.unwrap();

        assert_eq!(
            machine.submit_ip("192.168.1.1").await.unwrap(),
            PairingState::Stage1ErrorNoBridgeAtIp
        );
        assert_eq!(bridge.probes.load(Ordering::SeqCst), 1);
        assert!(!machine.pending().await.unwrap().has_ip());

        assert_eq!(
            machine.acknowledge_error().await.unwrap(),
            PairingState::Stage1GetIp
        );
    }

    #[tokio::test]
    async fn test_no_network_skips_probe() {
        let bridge = Arc::new(FakeBridge::reachable());
        let registry =
            Arc::new(BridgeRegistry::load(Arc::new(MemoryCredentialStore::new())).await);
        let machine = PairingMachine::new(
            bridge.clone(),
            bridge.clone(),
            Arc::new(FixedProber::new(false)),
            registry,
        );
        machine.begin().await.unwrap();

        assert_eq!(
            machine.submit_ip("192.168.1.1").await.unwrap(),
            PairingState::Stage1ErrorNoBridgeAtIp
        );
        assert_eq!(bridge.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lan_without_default_route_reaches_bridge() {
        let bridge = Arc::new(FakeBridge::reachable());
        let registry =
            Arc::new(BridgeRegistry::load(Arc::new(MemoryCredentialStore::new())).await);
        let machine = PairingMachine::new(
            bridge.clone(),
            bridge.clone(),
            Arc::new(RoutedProber::new(&["192.168.1.1"])),
            registry,
        );
        machine.begin().await.unwrap();

        assert_eq!(
            machine.submit_ip("192.168.1.1").await.unwrap(),
            PairingState::Stage2PressBridgeButton
        );
        assert_eq!(bridge.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_button_not_pushed_then_success() {
        let bridge = Arc::new(FakeBridge::reachable());
        bridge.queue(TokenOutcome::failure(TokenErrorKind::ButtonNotHit));
        bridge.queue(TokenOutcome::success("abc123"));
        let (machine, registry) = at_stage_2(bridge.clone()).await;

        assert_eq!(
            machine.confirm_button_pressed().await.unwrap(),
            PairingState::Stage2ErrorButtonNotPushed
        );
        assert!(!machine.pending().await.unwrap().has_token());
        assert_eq!(machine.protocol_status().await, TestStatus::TestBad);

        assert_eq!(
            machine.acknowledge_error().await.unwrap(),
            PairingState::Stage2PressBridgeButton
        );
        assert_eq!(machine.pending().await.unwrap().ip, "192.168.1.1");

        assert_eq!(
            machine.confirm_button_pressed().await.unwrap(),
            PairingState::Stage3AllGoodAndDone
        );
        assert_eq!(machine.protocol_status().await, TestStatus::TestGood);
        assert_eq!(bridge.token_requests.load(Ordering::SeqCst), 2);

        let record = machine.complete().await.unwrap();
        assert_eq!(machine.state(), PairingState::NotInitializing);
        assert!(machine.pending().await.is_none());

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), record.id());
        assert_eq!(snapshot[0].ip, "192.168.1.1");
        assert_eq!(snapshot[0].token, "abc123");
    }

    #[tokio::test]
    async fn test_token_errors_map_to_stage_2_states() {
        let cases = [
            (
                TokenErrorKind::UnsuccessfulResponse,
                PairingState::Stage2ErrorUnsuccessfulResponse,
            ),
            (
                TokenErrorKind::TokenNotFound,
                PairingState::Stage2ErrorNoTokenFromBridge,
            ),
            (
                TokenErrorKind::CannotParseResponseBody,
                PairingState::Stage2ErrorCannotParseResponse,
            ),
            (
                TokenErrorKind::ButtonNotHit,
                PairingState::Stage2ErrorButtonNotPushed,
            ),
        ];

        for (kind, expected) in cases {
            let bridge = Arc::new(FakeBridge::reachable());
            bridge.queue(TokenOutcome::failure(kind));
            let (machine, _) = at_stage_2(bridge).await;
            assert_eq!(machine.confirm_button_pressed().await.unwrap(), expected);
            assert!(!machine.pending().await.unwrap().has_token());
        }
    }

    #[tokio::test]
    async fn test_impossible_token_errors_abort_session() {
        for kind in [TokenErrorKind::None, TokenErrorKind::BadIp] {
            let bridge = Arc::new(FakeBridge::reachable());
            bridge.queue(TokenOutcome::failure(kind));
            let (machine, registry) = at_stage_2(bridge).await;

            assert!(matches!(
                machine.confirm_button_pressed().await,
                Err(PairingError::InvariantViolation(_))
            ));
            assert_eq!(machine.state(), PairingState::NotInitializing);
            assert!(machine.pending().await.is_none());
            assert!(registry.is_empty().await);
        }
    }

    #[tokio::test]
    async fn test_operations_from_wrong_state() {
        let (machine, registry) = machine_with(Arc::new(FakeBridge::reachable())).await;

        assert!(matches!(
            machine.submit_ip("192.168.1.1").await,
            Err(PairingError::InvalidTransition { .. })
        ));
        assert!(matches!(
            machine.confirm_button_pressed().await,
            Err(PairingError::InvalidTransition { .. })
        ));
        assert!(matches!(
            machine.complete().await,
            Err(PairingError::InvalidTransition { .. })
        ));
        assert!(matches!(
            machine.acknowledge_error().await,
            Err(PairingError::InvalidTransition { .. })
        ));
        assert!(matches!(
            machine.go_back().await,
            Err(PairingError::InvalidTransition { .. })
        ));
        assert_eq!(machine.state(), PairingState::NotInitializing);

        machine.begin().await.unwrap();
        assert!(matches!(
            machine.complete().await,
            Err(PairingError::InvalidTransition { .. })
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_go_back_returns_to_previous_stage() {
        let bridge = Arc::new(FakeBridge::reachable());
        bridge.queue(TokenOutcome::failure(TokenErrorKind::ButtonNotHit));
        bridge.queue(TokenOutcome::failure(TokenErrorKind::TokenNotFound));
        bridge.queue(TokenOutcome::failure(TokenErrorKind::CannotParseResponseBody));
        bridge.queue(TokenOutcome::success("abc123"));
        let (machine, registry) = at_stage_2(bridge).await;

        machine.confirm_button_pressed().await.unwrap();
        assert_eq!(
            machine.go_back().await.unwrap(),
            PairingState::Stage2PressBridgeButton
        );

        assert_eq!(
            machine.confirm_button_pressed().await.unwrap(),
            PairingState::Stage2ErrorNoTokenFromBridge
        );
        assert_eq!(
            machine.go_back().await.unwrap(),
            PairingState::Stage2PressBridgeButton
        );

        assert_eq!(
            machine.confirm_button_pressed().await.unwrap(),
            PairingState::Stage2ErrorCannotParseResponse
        );
        assert_eq!(machine.go_back().await.unwrap(), PairingState::Stage1GetIp);
        assert!(!machine.pending().await.unwrap().has_ip());

        machine.submit_ip("192.168.1.1").await.unwrap();
        assert_eq!(machine.go_back().await.unwrap(), PairingState::Stage1GetIp);
        assert_eq!(
            machine.go_back().await.unwrap(),
            PairingState::NotInitializing
        );
        assert!(machine.pending().await.is_none());

        machine.begin().await.unwrap();
        machine.submit_ip("192.168.1.1").await.unwrap();
        assert_eq!(
            machine.confirm_button_pressed().await.unwrap(),
            PairingState::Stage3AllGoodAndDone
        );
        assert_eq!(
            machine.go_back().await.unwrap(),
            PairingState::NotInitializing
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_submit_is_rejected() {
        let gate = Arc::new(Notify::new());
        let (machine, _) = machine_with(Arc::new(FakeBridge::gated(gate.clone()))).await;
        machine.begin().await.unwrap();

        let first = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.submit_ip("192.168.1.1").await })
        };
        while !machine.is_waiting_for_response() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            machine.submit_ip("192.168.1.2").await,
            Err(PairingError::Busy)
        ));
        assert!(matches!(machine.go_back().await, Err(PairingError::Busy)));

        gate.notify_one();
        assert_eq!(
            first.await.unwrap().unwrap(),
            PairingState::Stage2PressBridgeButton
        );
        assert_eq!(machine.pending().await.unwrap().ip, "192.168.1.1");
        assert!(!machine.is_waiting_for_response());
    }

    #[tokio::test]
    async fn test_cancel_keeps_previous_state() {
        let gate = Arc::new(Notify::new());
        let (machine, _) = machine_with(Arc::new(FakeBridge::gated(gate.clone()))).await;
        machine.begin().await.unwrap();

        let call = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.submit_ip("192.168.1.1").await })
        };
        while !machine.is_waiting_for_response() {
            tokio::task::yield_now().await;
        }

        machine.cancel().await;
        assert!(matches!(call.await.unwrap(), Err(PairingError::Cancelled)));
        assert_eq!(machine.state(), PairingState::Stage1GetIp);

        gate.notify_one();
        assert_eq!(
            machine.submit_ip("192.168.1.1").await.unwrap(),
            PairingState::Stage2PressBridgeButton
        );
    }

    #[tokio::test]
    async fn test_state_changes_are_published() {
        let (machine, _) = machine_with(Arc::new(FakeBridge::reachable())).await;
        let mut rx = machine.subscribe();

        machine.begin().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), PairingState::Stage1GetIp);

        machine.submit_ip("nope").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), PairingState::Stage1ErrorBadIpFormat);
    }

    #[test]
    fn test_state_classification() {
        assert!(PairingState::Stage1ErrorBadIpFormat.is_error());
        assert!(!PairingState::Stage2PressBridgeButton.is_error());
        assert_eq!(PairingState::Stage2ErrorButtonNotPushed.stage(), 2);
        assert_eq!(PairingState::NotInitializing.stage(), 0);
        assert_eq!(
            PairingState::Stage3AllGoodAndDone.to_string(),
            "STAGE_3_ALL_GOOD_AND_DONE"
        );
        assert_eq!(PairingState::for_token_error(TokenErrorKind::None), None);
    }
}
