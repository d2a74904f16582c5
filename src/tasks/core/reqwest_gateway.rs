//! Reqwest-based implementation of the `TransportGateway` trait.
//!
//! Provides a thin adapter around `reqwest::Client` that converts between the
//! provider request representation used by the adapters and the concrete
//! transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use super::transport::{
    GatewayResponse, ProviderRequest, RequestBody, TransportError, TransportGateway,
};

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Reqwest-backed gateway shared by every solve issued through a broker.
#[derive(Debug, Clone)]
pub struct ReqwestGateway {
    client: Client,
}

impl ReqwestGateway {
    /// Creates a client with a per-request timeout.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("captcha-broker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| TransportError::Other(err.to_string()))?;

        Ok(Self { client })
    }

    /// Wrap an existing reqwest client, keeping its pool and TLS settings.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn execute(&self, request: &ProviderRequest) -> Result<GatewayResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str())
            .headers(request.headers.clone());

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(fields) => builder.form(fields),
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        log::trace!("{} {} -> {}", request.method, request.url.path(), status);

        Ok(GatewayResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl TransportGateway for ReqwestGateway {
    async fn send(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, TransportError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.execute(request) => result,
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
