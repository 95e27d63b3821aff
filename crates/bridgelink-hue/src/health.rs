//! Registry health checks
//!
//! One run walks every registered bridge in turn:
//! 1. No address: inactive, nothing else to check
//! 2. No answer from the bridge: inactive
//! 3. Otherwise active
//! 4. No token: token status stays unresolved
//! 5. Otherwise the token is validated
//!
//! A failing bridge only ends its own sequence; the walk always reaches every
//! entry. Each result is published as soon as it is known.

use crate::api::{ReachabilityChecker, TokenValidator};
use crate::connectivity::ConnectivityProber;
use crate::record::BridgeId;
use crate::registry::{BridgeRegistry, HealthUpdate};
use bridgelink_core::TestStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How far the check got for one bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    NoAddress,
    NoNetwork,
    Unreachable,
    TokenMissing,
    TokenValid,
    TokenRejected,
}

impl CheckOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, CheckOutcome::TokenMissing | CheckOutcome::TokenValid)
    }
}

impl std::fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckOutcome::NoAddress => "no address",
            CheckOutcome::NoNetwork => "no local network",
            CheckOutcome::Unreachable => "unreachable",
            CheckOutcome::TokenMissing => "reachable, not paired",
            CheckOutcome::TokenValid => "reachable, token valid",
            CheckOutcome::TokenRejected => "reachable, token rejected",
        };
        f.write_str(s)
    }
}

/// Result for one bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeHealth {
    pub id: BridgeId,
    pub ip: String,
    pub active: bool,
    pub token_status: TestStatus,
    pub outcome: CheckOutcome,
}

/// Result of one full run
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Good iff at least one bridge is registered and all of them are healthy
    pub status: TestStatus,
    pub bridges: Vec<BridgeHealth>,
    /// Run stopped early through its cancellation token
    pub cancelled: bool,
}

impl HealthReport {
    pub fn no_bridges(&self) -> bool {
        self.bridges.is_empty() && !self.cancelled
    }
}

/// Progress notifications
#[derive(Debug, Clone)]
pub enum HealthEvent {
    Started { total: usize },
    Checked(BridgeHealth),
    Finished { status: TestStatus },
}

/// Re-validates every registered bridge
pub struct HealthChecker {
    reachability: Arc<dyn ReachabilityChecker>,
    validator: Arc<dyn TokenValidator>,
    prober: Arc<dyn ConnectivityProber>,
    registry: Arc<BridgeRegistry>,
    status_tx: watch::Sender<TestStatus>,
    events_tx: broadcast::Sender<HealthEvent>,
    run_lock: Mutex<()>,
}

impl HealthChecker {
    pub fn new(
        reachability: Arc<dyn ReachabilityChecker>,
        validator: Arc<dyn TokenValidator>,
        prober: Arc<dyn ConnectivityProber>,
        registry: Arc<BridgeRegistry>,
    ) -> Self {
        let (status_tx, _) = watch::channel(TestStatus::NotTested);
        let (events_tx, _) = broadcast::channel(64);
        Self {
            reachability,
            validator,
            prober,
            registry,
            status_tx,
            events_tx,
            run_lock: Mutex::new(()),
        }
    }

    /// Overall status of the latest run
    pub fn status(&self) -> TestStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TestStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.events_tx.subscribe()
    }

    /// Check every registered bridge once
    ///
    /// Runs never overlap; a second caller waits for the first to finish.
    pub async fn run(&self, cancel: &CancellationToken) -> HealthReport {
        let _guard = self.run_lock.lock().await;
        self.run_locked(cancel).await
    }

    /// Like [`run`](Self::run), but returns `None` instead of waiting
    pub async fn try_run(&self, cancel: &CancellationToken) -> Option<HealthReport> {
        let _guard = self.run_lock.try_lock().ok()?;
        Some(self.run_locked(cancel).await)
    }

    /// Run checks every `period` until `cancel` fires
    pub fn spawn_periodic(
        self: Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("Health checks every {:?}", period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if self.try_run(&cancel).await.is_none() {
                            debug!("Previous health check still running, skipping");
                        }
                    }
                }
            }

            info!("Health checks stopped");
        })
    }

    async fn run_locked(&self, cancel: &CancellationToken) -> HealthReport {
        let ids = self.registry.ids().await;
        if ids.is_empty() {
            info!("No bridges configured");
            return self.finish(TestStatus::TestBad, Vec::new(), false);
        }

        self.status_tx.send_replace(TestStatus::Testing);
        let _ = self.events_tx.send(HealthEvent::Started { total: ids.len() });

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if cancel.is_cancelled() {
                info!("Health check cancelled");
                return self.finish(TestStatus::NotTested, results, true);
            }
            if let Some(health) = self.check_bridge(&id, cancel).await {
                if cancel.is_cancelled() {
                    info!("Health check cancelled");
                    return self.finish(TestStatus::NotTested, results, true);
                }
                let _ = self.events_tx.send(HealthEvent::Checked(health.clone()));
                results.push(health);
            }
        }

        let healthy = results.iter().all(|h| h.outcome.is_healthy());
        let status = if results.is_empty() {
            TestStatus::TestBad
        } else {
            TestStatus::from_bool(healthy)
        };
        self.finish(status, results, false)
    }

    /// Run the check sequence for one bridge and store the result
    ///
    /// Returns `None` if the bridge disappeared from the registry or moved to
    /// another address while it was being checked.
    async fn check_bridge(
        &self,
        id: &BridgeId,
        cancel: &CancellationToken,
    ) -> Option<BridgeHealth> {
        let record = self.registry.get(id).await?;

        let (outcome, token_status) = if !record.has_ip() {
            (CheckOutcome::NoAddress, TestStatus::NotTested)
        } else if !self.prober.has_route_to(&record.ip) {
            warn!("No local network route to bridge {} at {}", id, record.ip);
            (CheckOutcome::NoNetwork, TestStatus::NotTested)
        } else if !self.reachability.is_reachable(&record.ip, cancel).await {
            (CheckOutcome::Unreachable, TestStatus::NotTested)
        } else if !record.has_token() {
            (CheckOutcome::TokenMissing, TestStatus::NotTested)
        } else if self
            .validator
            .is_token_valid(&record.ip, &record.token, cancel)
            .await
        {
            (CheckOutcome::TokenValid, TestStatus::TestGood)
        } else {
            (CheckOutcome::TokenRejected, TestStatus::TestBad)
        };

        if cancel.is_cancelled() {
            return None;
        }

        let active = !matches!(
            outcome,
            CheckOutcome::NoAddress | CheckOutcome::NoNetwork | CheckOutcome::Unreachable
        );
        let update = HealthUpdate {
            ip: record.ip.clone(),
            active,
            token_status,
        };

        match self.registry.set_health(id, update).await {
            Some(_) => {
                debug!("Bridge {} at {:?}: {}", id, record.ip, outcome);
                Some(BridgeHealth {
                    id: id.clone(),
                    ip: record.ip,
                    active,
                    token_status,
                    outcome,
                })
            }
            None => {
                debug!("Bridge {} removed or moved during health check", id);
                None
            }
        }
    }

    fn finish(
        &self,
        status: TestStatus,
        bridges: Vec<BridgeHealth>,
        cancelled: bool,
    ) -> HealthReport {
        info!(
            "Health check finished: {} ({} bridge(s) checked)",
            status,
            bridges.len()
        );
        self.status_tx.send_replace(status);
        let _ = self.events_tx.send(HealthEvent::Finished { status });
        HealthReport {
            status,
            bridges,
            cancelled,
        }
    }
}
