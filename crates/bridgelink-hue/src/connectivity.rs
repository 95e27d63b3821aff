//! Local network availability

use std::net::{IpAddr, UdpSocket};
use tracing::debug;

/// Reports whether the host can currently talk to its local network
pub trait ConnectivityProber: Send + Sync {
    fn is_local_network_transport_available(&self) -> bool;

    /// Whether traffic to `ip` would leave over a usable interface
    ///
    /// Defaults to the host-wide answer.
    fn has_route_to(&self, ip: &str) -> bool {
        let _ = ip;
        self.is_local_network_transport_available()
    }
}

/// Addresses whose routes stand in for "the local network" when no bridge
/// address is known. Private ranges come first so a LAN without a default
/// gateway still counts.
const DEFAULT_TARGETS: &[&str] = &["192.168.0.1:80", "10.0.0.1:80", "172.16.0.1:80", "8.8.8.8:80"];

/// Prober based on the host's routing table
///
/// Connecting a UDP socket sends nothing; it only asks the OS which local
/// address would carry traffic to a target.
#[derive(Debug, Clone)]
pub struct LocalNetworkProber {
    targets: Vec<String>,
}

impl LocalNetworkProber {
    pub fn new() -> Self {
        Self {
            targets: DEFAULT_TARGETS.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Probe the route to a specific address only
    pub fn with_target(target: impl Into<String>) -> Self {
        Self {
            targets: vec![target.into()],
        }
    }

    /// First usable local address that would carry traffic to a target
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.targets
            .iter()
            .filter_map(|target| route_from(target))
            .find(|ip| is_usable(*ip))
    }
}

impl Default for LocalNetworkProber {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityProber for LocalNetworkProber {
    fn is_local_network_transport_available(&self) -> bool {
        match self.local_ip() {
            Some(_) => true,
            None => {
                debug!("No usable local network route via {:?}", self.targets);
                false
            }
        }
    }

    fn has_route_to(&self, ip: &str) -> bool {
        match route_from(&format!("{}:80", ip)) {
            Some(local) if is_usable(local) => true,
            other => {
                debug!("No usable route to {} (local address {:?})", ip, other);
                false
            }
        }
    }
}

/// Local address the OS would pick for traffic to `target`
fn route_from(target: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(target).ok()?;
    Some(socket.local_addr().ok()?.ip())
}

fn is_usable(ip: IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}
