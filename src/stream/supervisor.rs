//! Reconnect loop around [`StreamSession`].
//!
//! The supervisor owns the backoff state and the listener registry for one
//! logical stream. It runs sessions back to back, classifies how each one
//! ended, and either sleeps (cancellably) before the next attempt or stops.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::retry::{sleep_cancellable, BackoffDecision, BackoffState, FailureClass};
use crate::stream::client::{ConnectionParams, StreamClientError};
use crate::stream::listener::{ListenerFailure, ListenerRegistry};
use crate::stream::proto::{ControlMarker, Message};
use crate::stream::session::{SessionOutcome, StreamSession};
use crate::stream::transport::Transport;

/// Lifecycle updates produced while a stream is supervised.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamStatus {
    /// A connection attempt is starting. `attempt` counts from 1.
    Connecting { attempt: u32 },
    /// The first message of the current session arrived.
    Connected,
    /// A session ended with a retryable failure.
    Disconnected { class: FailureClass, detail: String },
    /// The next attempt starts after `wait`.
    Reconnecting { class: FailureClass, wait: Duration },
    ListenerFailed(ListenerFailure),
}

/// Why a supervised stream stopped without an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// The stop signal fired.
    Cancelled,
    /// The message callback closed the stream.
    Closed,
}

pub struct StreamSupervisor {
    params: Arc<ConnectionParams>,
    transport: Arc<dyn Transport>,
    listeners: ListenerRegistry,
    backoff: BackoffState,
    cancel: CancellationToken,
    status_tx: Option<mpsc::Sender<StreamStatus>>,
}

impl StreamSupervisor {
    pub fn new(
        params: Arc<ConnectionParams>,
        transport: Arc<dyn Transport>,
        listeners: ListenerRegistry,
        backoff: BackoffState,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            params,
            transport,
            listeners,
            backoff,
            cancel,
            status_tx: None,
        }
    }

    /// Publishes [`StreamStatus`] updates to `status_tx`.
    ///
    /// Updates are dropped while the channel is full; the stream never waits
    /// on a slow status reader.
    pub fn with_status(mut self, status_tx: mpsc::Sender<StreamStatus>) -> Self {
        self.status_tx = Some(status_tx);
        self
    }

    /// Runs sessions until the stream is stopped, closed, or fails for good.
    pub async fn run(mut self) -> Result<StopReason, StreamClientError> {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!(event = "stream_stopped", attempt);
                return Ok(StopReason::Cancelled);
            }

            attempt = attempt.saturating_add(1);
            emit(&self.status_tx, StreamStatus::Connecting { attempt });

            let outcome = self.run_session().await;
            if outcome.delivered_data() {
                self.backoff.reset();
            }

            let class = match outcome.class {
                Some(class) => class,
                None if self.cancel.is_cancelled() => {
                    info!(event = "stream_stopped", attempt);
                    return Ok(StopReason::Cancelled);
                }
                None => {
                    info!(event = "stream_closed", attempt);
                    return Ok(StopReason::Closed);
                }
            };

            match class {
                FailureClass::Cancelled => {
                    info!(event = "stream_stopped", attempt);
                    return Ok(StopReason::Cancelled);
                }
                FailureClass::Fatal => return Err(fatal(outcome)),
                FailureClass::RateLimited | FailureClass::Transient => {}
            }

            emit(
                &self.status_tx,
                StreamStatus::Disconnected {
                    class,
                    detail: outcome.detail.clone(),
                },
            );

            match self.backoff.on_failure(class) {
                BackoffDecision::Retry(wait) => {
                    warn!(
                        event = "stream_reconnect_scheduled",
                        attempt,
                        class = %class,
                        wait_ms = wait.as_millis() as u64,
                        detail = %outcome.detail
                    );
                    emit(&self.status_tx, StreamStatus::Reconnecting { class, wait });
                    if !sleep_cancellable(wait, &self.cancel).await {
                        info!(event = "stream_stopped", attempt);
                        return Ok(StopReason::Cancelled);
                    }
                }
                BackoffDecision::GiveUp { last_wait } => {
                    error!(
                        event = "stream_retries_exhausted",
                        attempt,
                        class = %class,
                        last_wait_ms = last_wait.as_millis() as u64,
                        detail = %outcome.detail
                    );
                    return Err(StreamClientError::RetriesExhausted {
                        class,
                        last_wait,
                        detail: outcome.detail,
                    });
                }
                BackoffDecision::Stop => return Err(fatal(outcome)),
            }
        }
    }

    async fn run_session(&mut self) -> SessionOutcome {
        let Self {
            params,
            transport,
            listeners,
            cancel,
            status_tx,
            ..
        } = self;
        let mut connected = false;

        let session = StreamSession::new(&**params, &**transport, cancel.clone());
        let outcome = session
            .run(|message| {
                if !connected {
                    connected = true;
                    info!(event = "stream_connected");
                    emit(status_tx, StreamStatus::Connected);
                }

                log_control_marker(&message);

                for failure in listeners.dispatch(&message) {
                    warn!(
                        event = "stream_listener_failed",
                        listener = failure.listener,
                        kind = ?failure.kind,
                        detail = %failure.detail
                    );
                    emit(status_tx, StreamStatus::ListenerFailed(failure));
                }

                if cancel.is_cancelled() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await;

        debug!(
            event = "stream_session_ended",
            class = ?outcome.class,
            status = outcome.status,
            messages = outcome.messages_delivered,
            detail = %outcome.detail
        );
        outcome
    }
}

fn fatal(outcome: SessionOutcome) -> StreamClientError {
    error!(
        event = "stream_fatal",
        status = outcome.status,
        detail = %outcome.detail
    );
    StreamClientError::Fatal {
        status: outcome.status,
        detail: outcome.detail,
    }
}

fn emit(status_tx: &Option<mpsc::Sender<StreamStatus>>, status: StreamStatus) {
    let Some(tx) = status_tx else {
        return;
    };
    if let Err(mpsc::error::TrySendError::Full(status)) = tx.try_send(status) {
        debug!(event = "stream_status_dropped", status = ?status);
    }
}

fn log_control_marker(message: &Message) {
    if !tracing::enabled!(tracing::Level::WARN) {
        return;
    }
    match message.control() {
        Some(ControlMarker::Warning(warning)) => {
            warn!(event = "stream_stall_warning", warning = %warning);
        }
        Some(ControlMarker::Disconnect(notice)) => {
            error!(event = "stream_disconnect_notice", notice = %notice);
        }
        None => {}
    }
}
