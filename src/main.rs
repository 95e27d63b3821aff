//! BridgeLink - Local-network companion hub for Hue bridges
//!
//! Pairs with bridges by IP address and keeps checking that paired bridges
//! are reachable and still accept their tokens.

use anyhow::Result;
use bridgelink_core::{ApiScheme, Config};
use bridgelink_hue::{
    BridgeId, BridgeInfo, BridgeRegistry, CredentialStore, FileCredentialStore, HealthChecker,
    HealthEvent, HealthReport, HttpTransport, HueApi, LocalNetworkProber, MemoryCredentialStore,
    PairingMachine, PairingState,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// BridgeLink - Pair with and monitor Hue bridges on the local network
#[derive(Parser, Debug)]
#[command(name = "bridgelink")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the bridge storage file (default: ~/.config/bridgelink/bridges.json)
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    /// Keep credentials in memory only
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Request timeout in milliseconds
    #[arg(long, global = true, default_value = "5000")]
    timeout_ms: u64,

    /// URL scheme for the bridge API
    #[arg(long, global = true, default_value = "http")]
    scheme: String,

    /// Device type reported to the bridge on registration
    #[arg(long, global = true)]
    device_type: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pair with a new bridge
    Pair {
        /// Bridge IP address (prompted for if omitted)
        #[arg(long)]
        ip: Option<String>,
    },
    /// List paired bridges
    List,
    /// Check every paired bridge once
    Check,
    /// Check paired bridges periodically until interrupted
    Watch {
        /// Seconds between checks (default: 60)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Point a paired bridge at a new IP address
    SetIp { id: String, ip: String },
    /// Forget a paired bridge
    Remove { id: String },
}

/// Collaborators shared by every command
struct Hub {
    registry: Arc<BridgeRegistry>,
    api: Arc<HueApi>,
    prober: Arc<LocalNetworkProber>,
}

impl Hub {
    async fn new(args: &Args, config: &Config) -> Result<Self> {
        let store: Arc<dyn CredentialStore> = if args.ephemeral {
            warn!("Using in-memory storage: paired bridges will not be saved");
            Arc::new(MemoryCredentialStore::new())
        } else {
            let path = match &config.storage_path {
                Some(path) => path.clone(),
                None => FileCredentialStore::default_path()
                    .map_err(|e| anyhow::anyhow!("Failed to locate storage: {}", e))?,
            };
            Arc::new(
                FileCredentialStore::with_path(path)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to open bridge storage: {}", e))?,
            )
        };

        let transport = HttpTransport::new(config.request_timeout())
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            registry: Arc::new(BridgeRegistry::load(store).await),
            api: Arc::new(HueApi::new(Arc::new(transport), config.clone())),
            prober: Arc::new(LocalNetworkProber::new()),
        })
    }

    fn pairing(&self) -> PairingMachine {
        PairingMachine::new(
            self.api.clone(),
            self.api.clone(),
            self.prober.clone(),
            self.registry.clone(),
        )
    }

    fn health_checker(&self) -> HealthChecker {
        HealthChecker::new(
            self.api.clone(),
            self.api.clone(),
            self.prober.clone(),
            self.registry.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(log_level.into())
                .add_directive("reqwest=warn".parse()?)
                .add_directive("hyper=warn".parse()?),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("BridgeLink v{}", env!("CARGO_PKG_VERSION"));

    let scheme: ApiScheme = args
        .scheme
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let mut config = Config::new()
        .with_request_timeout(Duration::from_millis(args.timeout_ms))
        .with_storage_path(args.storage.clone())
        .with_scheme(scheme);
    if let Some(device_type) = &args.device_type {
        config = config.with_device_type(device_type.clone());
    }
    if let Command::Watch {
        interval: Some(secs),
    } = &args.command
    {
        config = config.with_health_check_interval(Duration::from_secs(*secs));
    }
    config.validate()?;

    let hub = Hub::new(&args, &config).await?;

    match &args.command {
        Command::Pair { ip } => pair(&hub, ip.clone()).await,
        Command::List => {
            list(&hub).await;
            Ok(())
        }
        Command::Check => {
            let report = hub.health_checker().run(&CancellationToken::new()).await;
            print_report(&hub, &report).await;
            Ok(())
        }
        Command::Watch { .. } => watch(&hub, config.health_check_interval()).await,
        Command::SetIp { id, ip } => {
            let id = parse_id(id)?;
            hub.registry.change_ip(&id, ip).await?;
            println!("Bridge {} now at {}", id, ip);
            Ok(())
        }
        Command::Remove { id } => {
            let id = parse_id(id)?;
            let record = hub.registry.remove(&id).await?;
            println!("Removed {} ({})", record.human_name, record.ip);
            Ok(())
        }
    }
}

/// Walk the pairing session from the terminal
async fn pair(hub: &Hub, mut ip: Option<String>) -> Result<()> {
    let machine = hub.pairing();
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    machine.begin().await?;

    loop {
        let state = machine.state();
        match state {
            PairingState::NotInitializing => {
                println!("Pairing cancelled");
                return Ok(());
            }
            PairingState::Stage1GetIp => {
                let candidate = match ip.take() {
                    Some(candidate) => candidate,
                    None => {
                        match prompt(&mut input, "Bridge IP address (empty to cancel): ").await? {
                            Some(line) if !line.is_empty() => line,
                            _ => {
                                machine.go_back().await?;
                                continue;
                            }
                        }
                    }
                };
                println!("Looking for a bridge at {}...", candidate);
                machine.submit_ip(&candidate).await?;
            }
            PairingState::Stage2PressBridgeButton => {
                println!("{}", state.prompt());
                match prompt(&mut input, "Press Enter when done ('b' to go back): ").await? {
                    None => {
                        machine.go_back().await?;
                        machine.go_back().await?;
                    }
                    Some(line) if line.eq_ignore_ascii_case("b") => {
                        machine.go_back().await?;
                    }
                    Some(_) => {
                        machine.confirm_button_pressed().await?;
                    }
                }
            }
            PairingState::Stage3AllGoodAndDone => {
                let record = machine.complete().await?;
                println!("Paired {} at {} (id {})", record.human_name, record.ip, record.id());
                return Ok(());
            }
            state if state.is_error() => {
                println!("{}", state.prompt());
                match prompt(&mut input, "Press Enter to retry ('b' to go back): ").await? {
                    Some(line) if line.eq_ignore_ascii_case("b") => {
                        machine.go_back().await?;
                    }
                    None => {
                        while !machine.state().is_idle() {
                            machine.go_back().await?;
                        }
                    }
                    Some(_) => {
                        machine.acknowledge_error().await?;
                    }
                }
            }
            state => {
                return Err(anyhow::anyhow!("Unexpected pairing state {}", state));
            }
        }
    }
}

async fn prompt(input: &mut Lines<BufReader<Stdin>>, text: &str) -> Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;
    Ok(input.next_line().await?.map(|line| line.trim().to_string()))
}

async fn list(hub: &Hub) {
    let bridges = hub.registry.snapshot().await;
    if bridges.is_empty() {
        println!("No paired bridges. Run `bridgelink pair` to add one.");
        return;
    }
    for record in &bridges {
        let info = BridgeInfo::from(record);
        println!("{}  {:<24} {:<15} {}", info.id, info.name, info.ip, info.label);
    }
}

async fn print_report(hub: &Hub, report: &HealthReport) {
    if report.no_bridges() {
        println!("No paired bridges.");
        return;
    }
    for health in &report.bridges {
        let name = hub
            .registry
            .get(&health.id)
            .await
            .map(|r| r.human_name)
            .unwrap_or_else(|| health.id.to_string());
        println!("{:<24} {:<15} {}", name, health.ip, health.outcome);
    }
    println!("Overall: {}", report.status);
}

async fn watch(hub: &Hub, interval: Duration) -> Result<()> {
    let checker = Arc::new(hub.health_checker());
    let mut events = checker.subscribe_events();
    let cancel = CancellationToken::new();
    let handle = checker.clone().spawn_periodic(interval, cancel.clone());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping health checks");
                break;
            }
            event = events.recv() => match event {
                Ok(HealthEvent::Checked(health)) => {
                    println!("{:<15} {}", health.ip, health.outcome);
                }
                Ok(HealthEvent::Finished { status }) => {
                    println!("Overall: {}", status);
                }
                Ok(HealthEvent::Started { total }) => {
                    println!("Checking {} bridge(s)...", total);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} health events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    cancel.cancel();
    handle.await?;
    Ok(())
}

fn parse_id(id: &str) -> Result<BridgeId> {
    BridgeId::parse(id).map_err(|e| anyhow::anyhow!("Invalid bridge id {}: {}", id, e))
}
