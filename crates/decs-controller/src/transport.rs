//! HTTP transport seam
//!
//! Everything that leaves the process goes through [`Transport::send`]. Production code uses
//! [`ReqwestTransport`]; tests swap in `mock::MockTransport`.

use crate::error::{DecsError, Result};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use reqwest::Method;

/// One form-encoded request to the controller or the OAuth2 provider
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub form: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn post(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            form: Vec::new(),
            bearer: None,
            timeout,
        }
    }

    pub fn form(mut self, form: Vec<(String, String)>) -> Self {
        self.form = form;
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Value of a form field, if present
    pub fn param(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Status and raw body of an answered request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
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

/// The request never produced a status line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpReply, TransportError>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(allow_unverified_ssl: bool) -> Result<Self> {
        if allow_unverified_ssl {
            tracing::warn!("TLS certificate verification is disabled for the DECS controller");
        }

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(allow_unverified_ssl)
            .build()
            .map_err(|e| DecsError::InvalidConfig(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpReply, TransportError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(request.timeout)
            .form(&request.form);

        if let Some(token) = &request.bearer {
            builder = builder.header(reqwest::header::AUTHORIZATION, format!("bearer {}", token));
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;

        Ok(HttpReply { status, body })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
