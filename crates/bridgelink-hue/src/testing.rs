//! Scripted collaborators for unit tests

use crate::connectivity::ConnectivityProber;
use crate::transport::{HttpResponse, Transport, TransportError, TransportResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Canned answer for one request
#[derive(Debug, Clone)]
pub enum Reply {
    Response(HttpResponse),
    Timeout,
}

impl Reply {
    pub fn ok(status: u16, body: &str) -> Self {
        Reply::Response(HttpResponse::new(status, body))
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub method: &'static str,
    pub url: String,
    pub body: Option<String>,
}

/// Transport answering from per-route reply queues
///
/// The last reply queued for a route repeats. Unrouted requests fail to
/// connect.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<(&'static str, String), VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_get(&self, url: &str, reply: Reply) {
        self.push("GET", url, reply);
    }

    pub fn on_post(&self, url: &str, reply: Reply) {
        self.push("POST", url, reply);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, method: &'static str, url: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .entry((method, url.to_string()))
            .or_default()
            .push_back(reply);
    }

    fn answer(
        &self,
        method: &'static str,
        url: &str,
        body: Option<&str>,
        cancel: &CancellationToken,
    ) -> TransportResult<HttpResponse> {
        self.calls.lock().unwrap().push(Call {
            method,
            url: url.to_string(),
            body: body.map(str::to_string),
        });

        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let mut routes = self.routes.lock().unwrap();
        let queue = match routes.get_mut(&(method, url.to_string())) {
            Some(queue) => queue,
            None => return Err(TransportError::Connect(format!("no route to {}", url))),
        };
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };

        match reply {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Timeout) => Err(TransportError::Timeout),
            None => Err(TransportError::Connect(format!("no route to {}", url))),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &str, cancel: &CancellationToken) -> TransportResult<HttpResponse> {
        self.answer("GET", url, None, cancel)
    }

    async fn post(
        &self,
        url: &str,
        body: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<HttpResponse> {
        self.answer("POST", url, Some(body), cancel)
    }
}

/// Prober with a switchable answer
pub struct FixedProber(AtomicBool);

impl FixedProber {
    pub fn new(available: bool) -> Self {
        Self(AtomicBool::new(available))
    }

    pub fn set(&self, available: bool) {
        self.0.store(available, Ordering::SeqCst);
    }
}

impl ConnectivityProber for FixedProber {
    fn is_local_network_transport_available(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Host with routes to a few LAN addresses and no default gateway
pub struct RoutedProber(Vec<String>);

impl RoutedProber {
    pub fn new(routes: &[&str]) -> Self {
        Self(routes.iter().map(|r| r.to_string()).collect())
    }
}

impl ConnectivityProber for RoutedProber {
    fn is_local_network_transport_available(&self) -> bool {
        false
    }

    fn has_route_to(&self, ip: &str) -> bool {
        self.0.iter().any(|r| r == ip)
    }
}
