use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;

use crate::config::Target;

/// Classification of one request/response exchange, as coarse as the pacing
/// core needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    /// The server refused the request outright (503 or 429).
    Overloaded,
    /// The exchange timed out: 408, 504, or the transport's own deadline.
    TimedOut,
    /// Connection-level failure (refused, reset, ...).
    TransportError,
    /// Any other status indicates a bug in the simulation.
    Unexpected(u16),
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Issues one request tagged with the tenant and priority and classifies
    /// the outcome once the exchange finishes or times out.
    async fn issue(&self, tenant_id: &str, priority: &str) -> Reply;
}

/// HTTP/1.1 transport. The request timeout passed at construction is the
/// hard deadline for every exchange.
pub struct HttpTransport {
    http: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(target: &Target, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            url: format!("http://{}:{}/", target.address, target.port),
        })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn issue(&self, tenant_id: &str, priority: &str) -> Reply {
        let result = self
            .http
            .get(&self.url)
            .header("tenant-id", tenant_id)
            .header("priority", priority)
            .send()
            .await;

        match result {
            Ok(response) => match response.status() {
                StatusCode::OK => Reply::Ok,
                StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => {
                    Reply::Overloaded
                }
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Reply::TimedOut,
                status => Reply::Unexpected(status.as_u16()),
            },
            Err(e) if e.is_timeout() => Reply::TimedOut,
            Err(_) => Reply::TransportError,
        }
    }
}
