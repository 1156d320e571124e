//! Host-facing stream client.
//!
//! [`StreamClient`] holds the endpoint, credentials and tuning knobs. Calling
//! [`StreamClient::start`] spawns a background supervisor that keeps one
//! streaming connection alive and returns a [`StreamHandle`] for stopping it
//! and observing connection status.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::{OAuth1Signer, OAuthCredentials, RequestSigner};
use crate::retry::{BackoffConfig, BackoffState, FailureClass};
use crate::stream::frame::DEFAULT_MAX_FRAME_LEN;
use crate::stream::listener::ListenerRegistry;
use crate::stream::proto::{FilterParams, Message, StallWarnings};
use crate::stream::supervisor::{StopReason, StreamStatus, StreamSupervisor};
use crate::stream::transport::{HttpTransport, Transport};

/// Production filter endpoint.
pub const DEFAULT_STREAM_ENDPOINT: &str = "https://stream.twitter.com/1.1/statuses/filter.json";

/// Default connection parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
    /// Longest silence tolerated on an open stream, keep-alives included.
    pub const READ_TIMEOUT: Duration = Duration::from_secs(90);
    pub const USER_AGENT: &'static str = concat!("firehose-sdk/", env!("CARGO_PKG_VERSION"));
    pub const STATUS_CAPACITY: usize = 64;
    pub const MAX_FRAME_LEN: usize = DEFAULT_MAX_FRAME_LEN;
}

#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub tls_verify: bool,
    /// `None` omits the header.
    pub user_agent: Option<String>,
    pub stall_warnings: StallWarnings,
    /// Status updates buffered for [`StreamHandle::recv_status`]. Newer
    /// updates are dropped while the buffer is full.
    pub status_capacity: usize,
    /// Longer frames are dropped without being decoded.
    pub max_frame_len: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            read_timeout: StreamDefaults::READ_TIMEOUT,
            tls_verify: true,
            user_agent: Some(StreamDefaults::USER_AGENT.to_string()),
            stall_warnings: StallWarnings::default(),
            status_capacity: StreamDefaults::STATUS_CAPACITY,
            max_frame_len: StreamDefaults::MAX_FRAME_LEN,
        }
    }
}

/// Everything a session needs to open the stream. Immutable once built.
#[derive(Clone)]
pub struct ConnectionParams {
    pub endpoint: Url,
    pub signer: Arc<dyn RequestSigner>,
    pub filter: FilterParams,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub tls_verify: bool,
    pub user_agent: Option<String>,
    pub stall_warnings: StallWarnings,
    pub max_frame_len: usize,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("endpoint", &self.endpoint.as_str())
            .field("filter", &self.filter)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("tls_verify", &self.tls_verify)
            .field("user_agent", &self.user_agent)
            .field("stall_warnings", &self.stall_warnings)
            .field("max_frame_len", &self.max_frame_len)
            .finish_non_exhaustive()
    }
}

/// Entry point for creating supervised stream connections.
#[derive(Clone)]
pub struct StreamClient {
    signer: Arc<dyn RequestSigner>,
    endpoint_override: Option<String>,
    options: StreamOptions,
    backoff: BackoffConfig,
    transport: Option<Arc<dyn Transport>>,
}

impl StreamClient {
    /// Creates a client that signs requests with `signer`.
    pub fn new(signer: Arc<dyn RequestSigner>) -> Self {
        Self {
            signer,
            endpoint_override: None,
            options: StreamOptions::default(),
            backoff: BackoffConfig::default(),
            transport: None,
        }
    }

    /// Creates a client that signs requests with OAuth 1.0a.
    pub fn with_credentials(credentials: OAuthCredentials) -> Self {
        Self::new(Arc::new(OAuth1Signer::new(credentials)))
    }

    /// Sets an explicit stream endpoint override.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim().to_string());
        self
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces the `reqwest` transport, e.g. with a scripted one in tests.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Spawns a supervised stream that calls `on_message` for every message.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<F>(
        &self,
        filter: FilterParams,
        mut on_message: F,
    ) -> Result<StreamHandle, StreamClientError>
    where
        F: FnMut(&Message) + Send + 'static,
    {
        let listeners = ListenerRegistry::new().with_listener(move |message| {
            on_message(message);
            Ok(())
        });
        self.start_with_listeners(filter, listeners)
    }

    /// Spawns a supervised stream dispatching to every registered listener.
    pub fn start_with_listeners(
        &self,
        filter: FilterParams,
        listeners: ListenerRegistry,
    ) -> Result<StreamHandle, StreamClientError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| StreamClientError::NoRuntime)?;

        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = mpsc::channel(self.options.status_capacity.max(1));
        let supervisor = self
            .supervisor(filter, listeners, cancel.clone())?
            .with_status(status_tx);

        let task = runtime.spawn(supervisor.run());

        Ok(StreamHandle {
            cancel,
            status: status_rx,
            task: Some(task),
        })
    }

    /// Runs a supervised stream on the current task until it stops.
    pub async fn run(
        &self,
        filter: FilterParams,
        listeners: ListenerRegistry,
        cancel: CancellationToken,
    ) -> Result<StopReason, StreamClientError> {
        self.supervisor(filter, listeners, cancel)?.run().await
    }

    fn supervisor(
        &self,
        filter: FilterParams,
        listeners: ListenerRegistry,
        cancel: CancellationToken,
    ) -> Result<StreamSupervisor, StreamClientError> {
        let params = Arc::new(self.connection_params(filter)?);
        let transport: Arc<dyn Transport> = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(HttpTransport::new(
                self.options.connect_timeout,
                self.options.tls_verify,
            )?),
        };

        Ok(StreamSupervisor::new(
            params,
            transport,
            listeners,
            BackoffState::new(self.backoff.clone()),
            cancel,
        ))
    }

    fn connection_params(
        &self,
        filter: FilterParams,
    ) -> Result<ConnectionParams, StreamClientError> {
        Ok(ConnectionParams {
            endpoint: Url::parse(self.endpoint())?,
            signer: Arc::clone(&self.signer),
            filter,
            connect_timeout: self.options.connect_timeout,
            read_timeout: self.options.read_timeout,
            tls_verify: self.options.tls_verify,
            user_agent: self.options.user_agent.clone(),
            stall_warnings: self.options.stall_warnings,
            max_frame_len: self.options.max_frame_len,
        })
    }

    fn endpoint(&self) -> &str {
        self.endpoint_override
            .as_deref()
            .unwrap_or(DEFAULT_STREAM_ENDPOINT)
    }
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.endpoint())
            .field("options", &self.options)
            .field("backoff", &self.backoff)
            .field("custom_transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle to a running stream.
///
/// Dropping the handle stops the stream.
#[derive(Debug)]
pub struct StreamHandle {
    cancel: CancellationToken,
    status: mpsc::Receiver<StreamStatus>,
    task: Option<JoinHandle<Result<StopReason, StreamClientError>>>,
}

impl StreamHandle {
    /// Requests shutdown. Any in-flight connect, read, or backoff sleep is
    /// interrupted. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token that stops the stream when cancelled, for use inside listeners.
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receives the next status update. Returns `None` once the stream has
    /// stopped and every update was consumed.
    pub async fn recv_status(&mut self) -> Option<StreamStatus> {
        self.status.recv().await
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the stream to stop and returns why it stopped.
    pub async fn join(mut self) -> Result<StopReason, StreamClientError> {
        let Some(task) = self.task.take() else {
            return Err(StreamClientError::Worker("stream task already joined".to_string()));
        };
        task.await
            .map_err(|err| StreamClientError::Worker(err.to_string()))?
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Errors produced by the stream client.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// The server rejected the stream (e.g. bad credentials or filter).
    #[error("stream failed permanently{}: {detail}", fmt_status(.status))]
    Fatal { status: Option<u16>, detail: String },

    /// Transient failures outlasted the backoff ceiling.
    #[error("giving up after {class} failures (last wait {last_wait:?}): {detail}")]
    RetriesExhausted {
        class: FailureClass,
        last_wait: Duration,
        detail: String,
    },

    #[error("invalid stream endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// HTTP client could not be constructed.
    #[error("transport setup failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("no tokio runtime available to spawn the stream")]
    NoRuntime,

    /// The background task panicked or was aborted.
    #[error("stream worker failed: {0}")]
    Worker(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    status
        .map(|status| format!(" (http {status})"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use secrecy::SecretString;

    use super::{
        StreamClient, StreamClientError, StreamDefaults, StreamOptions, DEFAULT_STREAM_ENDPOINT,
    };
    use crate::auth::OAuthCredentials;
    use crate::retry::FailureClass;
    use crate::stream::proto::FilterParams;
    use crate::stream::supervisor::StopReason;
    use crate::stream::transport::HttpTransport;

    fn client() -> StreamClient {
        StreamClient::with_credentials(OAuthCredentials::new(
            "ck",
            SecretString::new("cs".to_string()),
            "at",
            SecretString::new("as".to_string()),
        ))
    }

    #[test]
    fn stream_client_uses_production_endpoint_by_default() {
        assert_eq!(client().endpoint(), DEFAULT_STREAM_ENDPOINT);
    }

    #[test]
    fn stream_client_endpoint_override_is_trimmed() {
        let client = client().with_endpoint("  http://127.0.0.1:9000/stream   \n");
        assert_eq!(client.endpoint(), "http://127.0.0.1:9000/stream");
    }

    #[test]
    fn default_options_match_stream_defaults() {
        let options = StreamOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(60));
        assert_eq!(options.read_timeout, Duration::from_secs(90));
        assert!(options.tls_verify);
        assert_eq!(options.user_agent.as_deref(), Some(StreamDefaults::USER_AGENT));
        assert!(StreamDefaults::USER_AGENT.starts_with("firehose-sdk/"));
        assert_eq!(options.status_capacity, StreamDefaults::STATUS_CAPACITY);
        assert_eq!(options.max_frame_len, 1024 * 1024);
    }

    #[test]
    fn connection_params_carry_options_and_filter() {
        let client = client().with_options(StreamOptions {
            read_timeout: Duration::from_secs(5),
            user_agent: None,
            max_frame_len: 4096,
            ..StreamOptions::default()
        });
        let params = client
            .connection_params(FilterParams::track(["rust"]))
            .expect("params");

        assert_eq!(params.endpoint.as_str(), DEFAULT_STREAM_ENDPOINT);
        assert_eq!(params.read_timeout, Duration::from_secs(5));
        assert_eq!(params.user_agent, None);
        assert_eq!(params.max_frame_len, 4096);
        assert_eq!(params.filter.get("track"), Some("rust"));
        assert!(!format!("{params:?}").contains("signer"));
    }

    #[test]
    fn invalid_endpoint_is_reported() {
        let err = client()
            .with_endpoint("not a url")
            .connection_params(FilterParams::new())
            .expect_err("invalid endpoint");
        assert!(matches!(err, StreamClientError::InvalidEndpoint(_)));
    }

    #[test]
    fn start_outside_runtime_fails() {
        let err = client()
            .start(FilterParams::track(["rust"]), |_| {})
            .expect_err("no runtime");
        assert!(matches!(err, StreamClientError::NoRuntime));
    }

    #[test]
    fn error_messages_include_status_and_class() {
        let fatal = StreamClientError::Fatal {
            status: Some(401),
            detail: "http status 401".to_string(),
        };
        assert_eq!(
            fatal.to_string(),
            "stream failed permanently (http 401): http status 401"
        );

        let exhausted = StreamClientError::RetriesExhausted {
            class: FailureClass::Transient,
            last_wait: Duration::from_secs(320),
            detail: "read timed out after 90s".to_string(),
        };
        assert_eq!(
            exhausted.to_string(),
            "giving up after transient failures (last wait 320s): read timed out after 90s"
        );
    }

    #[tokio::test]
    async fn stop_before_first_attempt_reports_cancelled() {
        let transport = Arc::new(HttpTransport::with_client(reqwest::Client::new()));
        let handle = client()
            .with_endpoint("http://127.0.0.1:9/stream")
            .with_transport(transport)
            .start(FilterParams::track(["rust"]), |_| {})
            .expect("start");
        handle.stop();
        let reason = handle.join().await.expect("join");
        assert_eq!(reason, StopReason::Cancelled);
    }
}
