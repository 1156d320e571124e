//! One physical connection attempt against the streaming endpoint.
//!
//! A [`StreamSession`] moves through `Idle → Connecting → Streaming →
//! Closed`. Every suspension point (connect, each chunk read) races the
//! session's cancellation token, and the transport response is released
//! exactly once when the session closes, whatever the exit path.

use std::ops::ControlFlow;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::SignError;
use crate::retry::{with_timeout, FailureClass};
use crate::stream::client::ConnectionParams;
use crate::stream::frame::FrameAssembler;
use crate::stream::proto::{encode_form, Message};
use crate::stream::transport::{StreamRequest, Transport, TransportResponse};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    /// Closed with the failure class, or `None` when the caller closed it
    /// cleanly from the message callback.
    Closed(Option<FailureClass>),
}

/// How a session ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionOutcome {
    pub class: Option<FailureClass>,
    pub detail: String,
    /// HTTP status of the response, when one was received.
    pub status: Option<u16>,
    /// Messages handed to the callback during this session.
    pub messages_delivered: u64,
}

impl SessionOutcome {
    /// `true` when the session reached the data-flowing state.
    pub fn delivered_data(&self) -> bool {
        self.messages_delivered > 0
    }
}

struct Ending {
    class: Option<FailureClass>,
    detail: String,
    status: Option<u16>,
}

impl Ending {
    fn new(class: Option<FailureClass>, detail: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            class,
            detail: detail.into(),
            status,
        }
    }

    fn cancelled(detail: &str, status: Option<u16>) -> Self {
        Self::new(Some(FailureClass::Cancelled), detail, status)
    }
}

/// Single-use connection attempt.
pub struct StreamSession<'a> {
    params: &'a ConnectionParams,
    transport: &'a dyn Transport,
    cancel: CancellationToken,
    state: SessionState,
    assembler: FrameAssembler,
    messages_delivered: u64,
}

impl<'a> StreamSession<'a> {
    pub fn new(
        params: &'a ConnectionParams,
        transport: &'a dyn Transport,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            params,
            transport,
            cancel,
            state: SessionState::Idle,
            assembler: FrameAssembler::with_max_frame_len(params.max_frame_len),
            messages_delivered: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connects, streams, and hands every decoded message to `on_message`
    /// before reading the next chunk.
    ///
    /// Returning [`ControlFlow::Break`] from the callback closes the session
    /// cleanly (outcome class `None`).
    pub async fn run<F>(mut self, mut on_message: F) -> SessionOutcome
    where
        F: FnMut(Message) -> ControlFlow<()>,
    {
        let mut response = None;
        let ending = self.drive(&mut response, &mut on_message).await;

        if let Some(response) = response.take() {
            response.close();
        }
        self.assembler.reset();
        self.transition(SessionState::Closed(ending.class));

        SessionOutcome {
            class: ending.class,
            detail: ending.detail,
            status: ending.status,
            messages_delivered: self.messages_delivered,
        }
    }

    async fn drive<F>(
        &mut self,
        slot: &mut Option<TransportResponse>,
        on_message: &mut F,
    ) -> Ending
    where
        F: FnMut(Message) -> ControlFlow<()>,
    {
        if self.cancel.is_cancelled() {
            return Ending::cancelled("cancelled before connecting", None);
        }
        self.transition(SessionState::Connecting);

        let request = match build_request(self.params) {
            Ok(request) => request,
            Err(err) => {
                return Ending::new(
                    Some(FailureClass::Fatal),
                    format!("failed to sign request: {err}"),
                    None,
                )
            }
        };
        debug!(event = "stream_connecting", url = %request.url);

        let connect_timeout = self.params.connect_timeout;
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Ending::cancelled("cancelled while connecting", None);
            }
            opened = with_timeout(connect_timeout, self.transport.open(&request)) => opened,
        };
        let response = match opened {
            Err(_) => {
                return Ending::new(
                    Some(FailureClass::Transient),
                    format!("connect timed out after {}s", connect_timeout.as_secs_f64()),
                    None,
                )
            }
            Ok(Err(err)) => return Ending::new(Some(err.class()), err.to_string(), None),
            Ok(Ok(response)) => slot.insert(response),
        };

        let status = response.status;
        let read_timeout = self.params.read_timeout;

        if !response.is_success() {
            let class = classify_status(status);
            let body = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Ending::cancelled("cancelled while reading error body", Some(status));
                }
                next = with_timeout(read_timeout, response.body.next()) => next,
            };
            let detail = match body {
                Ok(Some(Ok(chunk))) if !chunk.is_empty() => {
                    format!("http status {status}: {}", summarize_error_body(&chunk))
                }
                _ => format!("http status {status}"),
            };
            return Ending::new(Some(class), detail, Some(status));
        }

        self.transition(SessionState::Streaming);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Ending::cancelled("cancelled while streaming", Some(status));
                }
                next = with_timeout(read_timeout, response.body.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Ending::new(
                        Some(FailureClass::Transient),
                        format!("read timed out after {}s", read_timeout.as_secs_f64()),
                        Some(status),
                    )
                }
                Ok(None) => {
                    return Ending::new(
                        Some(FailureClass::Transient),
                        "stream ended by server",
                        Some(status),
                    )
                }
                Ok(Some(Err(err))) => {
                    return Ending::new(Some(err.class()), err.to_string(), Some(status))
                }
                Ok(Some(Ok(chunk))) => chunk,
            };
            debug!(event = "stream_chunk", len = chunk.len());

            for message in self.assembler.feed(&chunk) {
                self.messages_delivered += 1;
                if on_message(message).is_break() {
                    return Ending::new(None, "closed by caller", Some(status));
                }
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(event = "stream_session_state", from = ?self.state, to = ?next);
        self.state = next;
    }
}

/// Maps a non-2xx response status to a failure class.
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        420 | 429 => FailureClass::RateLimited,
        500..=599 => FailureClass::Transient,
        _ => FailureClass::Fatal,
    }
}

/// Builds the signed `POST` carrying the filter parameters.
pub fn build_request(params: &ConnectionParams) -> Result<StreamRequest, SignError> {
    let mut filter = params.filter.clone();
    if filter.get("stall_warnings").is_none() && params.stall_warnings.requested() {
        filter = filter.with_param("stall_warnings", "true");
    }
    let body_pairs = filter.to_pairs();

    let mut signed_pairs = body_pairs.clone();
    signed_pairs.extend(
        params
            .endpoint
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned())),
    );
    let mut base_url = params.endpoint.clone();
    base_url.set_query(None);
    base_url.set_fragment(None);

    let authorization = params
        .signer
        .authorization("POST", base_url.as_str(), &signed_pairs)?;

    let mut headers = vec![
        ("Accept-Encoding".to_string(), "identity".to_string()),
        (
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        ),
        ("Authorization".to_string(), authorization),
    ];
    if let Some(user_agent) = params.user_agent.as_deref() {
        headers.push(("User-Agent".to_string(), user_agent.to_string()));
    }

    Ok(StreamRequest {
        method: "POST".to_string(),
        url: params.endpoint.clone(),
        headers,
        body: encode_form(&body_pairs),
    })
}

fn summarize_error_body(body: &[u8]) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorEntry {
        #[serde(default)]
        message: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        errors: Vec<ErrorEntry>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
        let first = parsed.errors.into_iter().find_map(|entry| entry.message);
        if let Some(message) = first.or(parsed.error).or(parsed.message) {
            return message;
        }
    }

    String::from_utf8_lossy(body)
        .trim()
        .chars()
        .take(ERROR_BODY_SNIPPET_LEN)
        .collect()
}
