//! Transport gateway contract.
//!
//! The lifecycle engine never talks HTTP itself. Adapters describe the call
//! they need as a [`ProviderRequest`], a [`TransportGateway`] performs it, and
//! the raw [`GatewayResponse`] goes back to the adapter for decoding.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Body of an outgoing provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

/// Fully described HTTP call produced by an adapter.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl ProviderRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(url: Url, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Json(body),
        }
    }

    pub fn post_form(url: Url, fields: Vec<(String, String)>) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Form(fields),
        }
    }

    /// Form field lookup, used by tests and logging.
    pub fn form_field(&self, name: &str) -> Option<&str> {
        match &self.body {
            RequestBody::Form(fields) => fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }

    pub fn json_body(&self) -> Option<&serde_json::Value> {
        match &self.body {
            RequestBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Raw response handed back to adapters.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// 5xx replies are treated as network faults rather than provider answers.
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// Network-level failures; never a decoded provider answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("server error (HTTP {0})")]
    Server(u16),
    #[error("request cancelled")]
    Cancelled,
    #[error("http transport error: {0}")]
    Other(String),
}

/// Performs provider HTTP calls. Shared read-only across concurrent solves.
///
/// Implementations should return promptly once `cancel` fires, either with
/// the completed response or [`TransportError::Cancelled`].
#[async_trait]
pub trait TransportGateway: Send + Sync {
    async fn send(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, TransportError>;
}
