//! HTTP transport used to reach bridges
//!
//! Every request is bounded by a timeout, never retried, and can be cut short
//! through a [`CancellationToken`]. Failures come back as values.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("HTTP error: {0}")]
    Http(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Status code and body of a completed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, cancel: &CancellationToken) -> TransportResult<HttpResponse>;

    async fn post(
        &self,
        url: &str,
        body: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<HttpResponse>;
}

/// [`Transport`] backed by a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> TransportResult<Self> {
        // Bridges serve self-signed certificates on their https port.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { client })
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> TransportResult<HttpResponse> {
        let send = async {
            let response = request.send().await.map_err(map_reqwest_error)?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(map_reqwest_error)?;
            Ok::<_, TransportError>(HttpResponse { status, body })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = send => result,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, cancel: &CancellationToken) -> TransportResult<HttpResponse> {
        debug!("GET {}", url);
        self.execute(self.client.get(url), cancel).await
    }

    async fn post(
        &self,
        url: &str,
        body: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<HttpResponse> {
        debug!("POST {}", url);
        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string());
        self.execute(request, cancel).await
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Http(e.to_string())
    }
}
