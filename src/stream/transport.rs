//! Network seam for stream sessions.
//!
//! A [`Transport`] opens the streaming request and hands back the response
//! status plus an incremental body. [`HttpTransport`] is the `reqwest`
//! implementation; tests substitute scripted transports.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::retry::FailureClass;

/// Body chunks as they arrive from the network.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Fully prepared stream request.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StreamRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Response head and streaming body.
pub struct TransportResponse {
    pub status: u16,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn new(status: u16, body: BodyStream) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Releases the underlying connection.
    pub fn close(self) {
        debug!(event = "stream_transport_closed", status = self.status);
        drop(self.body);
    }
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Errors raised while opening or reading the stream.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be constructed (bad URL, header, TLS setup).
    #[error("invalid request: {0}")]
    Request(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// The connection was reset or ended mid-body.
    #[error("body read failed: {0}")]
    Body(String),
}

impl TransportError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Request(_) => FailureClass::Fatal,
            Self::Connect(_) | Self::Timeout(_) | Self::Body(_) => FailureClass::Transient,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::Request(err.to_string())
        } else if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Body(err.to_string())
        }
    }
}

/// Opens stream requests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<TransportResponse, TransportError>;
}

/// `reqwest`-backed transport.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    /// Builds a client for long-lived streams.
    ///
    /// No overall request timeout is set; idle reads are bounded by the
    /// session instead. Redirects are not followed, so a 3xx reaches the
    /// session as-is.
    pub fn new(connect_timeout: Duration, tls_verify: bool) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!tls_verify)
            .build()?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &StreamRequest) -> Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|err| TransportError::Request(err.to_string()))?;
        let mut builder = self
            .http
            .request(method, request.url.clone())
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from_reqwest))
            .boxed();

        Ok(TransportResponse::new(status, body))
    }
}
