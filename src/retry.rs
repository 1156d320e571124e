//! Reconnect backoff and cancellable timing utilities.
//!
//! The backoff policy is a pure function of the failure class and the wait
//! previously applied for that class. [`BackoffState`] carries those previous
//! waits across sessions for a single supervisor.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Classified reason a stream session ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FailureClass {
    /// Server asked the client to slow down (HTTP 420/429).
    RateLimited,
    /// Timeouts, resets, premature end-of-stream, and 5xx responses.
    Transient,
    /// Non-retryable client-side error such as 401 or 400.
    Fatal,
    /// Caller requested the stream to stop.
    Cancelled,
}

impl FailureClass {
    /// Returns `true` for classes that the supervisor retries.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Default backoff parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackoffDefaults;

impl BackoffDefaults {
    pub const RATE_LIMIT_INITIAL_WAIT: Duration = Duration::from_secs(60);
    pub const TRANSIENT_INITIAL_WAIT: Duration = Duration::from_secs(5);
    pub const TRANSIENT_MAX_WAIT: Duration = Duration::from_secs(320);
}

/// Reconnect wait parameters, one set per retryable failure class.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackoffConfig {
    /// First wait after a rate-limit response.
    pub rate_limit_initial_wait: Duration,
    /// Optional clamp for rate-limit waits. `None` lets waits grow without
    /// bound; rate limiting never gives up either way.
    pub rate_limit_max_wait: Option<Duration>,
    /// First wait after a transient failure.
    pub transient_initial_wait: Duration,
    /// Largest transient wait. Doubling past it gives up.
    pub transient_max_wait: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rate_limit_initial_wait: BackoffDefaults::RATE_LIMIT_INITIAL_WAIT,
            rate_limit_max_wait: None,
            transient_initial_wait: BackoffDefaults::TRANSIENT_INITIAL_WAIT,
            transient_max_wait: BackoffDefaults::TRANSIENT_MAX_WAIT,
        }
    }
}

/// What the supervisor should do after a failed session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackoffDecision {
    /// Sleep for the given duration and reconnect.
    Retry(Duration),
    /// The transient ceiling was exceeded. `last_wait` is the final wait that
    /// was applied before giving up.
    GiveUp { last_wait: Duration },
    /// Do not retry at all (fatal or cancelled).
    Stop,
}

impl BackoffConfig {
    /// Computes the next wait for `class` given the previous wait applied for
    /// the same class, if any.
    pub fn next_wait(&self, class: FailureClass, previous: Option<Duration>) -> BackoffDecision {
        match class {
            FailureClass::RateLimited => {
                let wait = match previous {
                    None => self.rate_limit_initial_wait,
                    Some(previous) => previous.saturating_mul(2),
                };
                let wait = match self.rate_limit_max_wait {
                    Some(max) => wait.min(max),
                    None => wait,
                };
                BackoffDecision::Retry(wait)
            }
            FailureClass::Transient => match previous {
                None => BackoffDecision::Retry(self.transient_initial_wait),
                Some(previous) => {
                    let wait = previous.saturating_mul(2);
                    if wait > self.transient_max_wait {
                        BackoffDecision::GiveUp {
                            last_wait: previous,
                        }
                    } else {
                        BackoffDecision::Retry(wait)
                    }
                }
            },
            FailureClass::Fatal | FailureClass::Cancelled => BackoffDecision::Stop,
        }
    }
}

/// Per-class wait bookkeeping that survives across sessions.
#[derive(Clone, Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    rate_limited: Option<Duration>,
    transient: Option<Duration>,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            rate_limited: None,
            transient: None,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Returns the last wait recorded for `class`.
    pub fn current(&self, class: FailureClass) -> Option<Duration> {
        match class {
            FailureClass::RateLimited => self.rate_limited,
            FailureClass::Transient => self.transient,
            FailureClass::Fatal | FailureClass::Cancelled => None,
        }
    }

    /// Applies the policy for a failure and records the resulting wait.
    pub fn on_failure(&mut self, class: FailureClass) -> BackoffDecision {
        let decision = self.config.next_wait(class, self.current(class));
        if let BackoffDecision::Retry(wait) = decision {
            match class {
                FailureClass::RateLimited => self.rate_limited = Some(wait),
                FailureClass::Transient => self.transient = Some(wait),
                FailureClass::Fatal | FailureClass::Cancelled => {}
            }
        }
        decision
    }

    /// Forgets every recorded wait. Called once a session has delivered data.
    pub fn reset(&mut self) {
        if self.rate_limited.is_some() || self.transient.is_some() {
            debug!(event = "backoff_reset");
        }
        self.rate_limited = None;
        self.transient = None;
    }
}

/// Sleeps for `wait` unless `cancel` fires first.
///
/// Returns `true` when the full wait elapsed and `false` when cancelled.
pub async fn sleep_cancellable(wait: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{
        sleep_cancellable, BackoffConfig, BackoffDecision, BackoffState, FailureClass,
    };

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn transient_waits_double_until_ceiling_then_give_up() {
        let mut state = BackoffState::new(BackoffConfig::default());
        let waits: Vec<BackoffDecision> = (0..8)
            .map(|_| state.on_failure(FailureClass::Transient))
            .collect();

        assert_eq!(
            waits,
            vec![
                BackoffDecision::Retry(secs(5)),
                BackoffDecision::Retry(secs(10)),
                BackoffDecision::Retry(secs(20)),
                BackoffDecision::Retry(secs(40)),
                BackoffDecision::Retry(secs(80)),
                BackoffDecision::Retry(secs(160)),
                BackoffDecision::Retry(secs(320)),
                BackoffDecision::GiveUp {
                    last_wait: secs(320)
                },
            ]
        );
    }

    #[test]
    fn rate_limit_waits_double_without_bound() {
        let mut state = BackoffState::new(BackoffConfig::default());
        let mut expected = secs(60);
        for _ in 0..20 {
            assert_eq!(
                state.on_failure(FailureClass::RateLimited),
                BackoffDecision::Retry(expected)
            );
            expected = expected.saturating_mul(2);
        }
    }

    #[test]
    fn rate_limit_clamps_when_ceiling_configured() {
        let config = BackoffConfig {
            rate_limit_max_wait: Some(secs(100)),
            ..BackoffConfig::default()
        };
        assert_eq!(
            config.next_wait(FailureClass::RateLimited, Some(secs(60))),
            BackoffDecision::Retry(secs(100))
        );
        assert_eq!(
            config.next_wait(FailureClass::RateLimited, Some(secs(100))),
            BackoffDecision::Retry(secs(100))
        );
    }

    #[test]
    fn fatal_and_cancelled_never_wait() {
        let config = BackoffConfig::default();
        assert_eq!(
            config.next_wait(FailureClass::Fatal, None),
            BackoffDecision::Stop
        );
        assert_eq!(
            config.next_wait(FailureClass::Cancelled, Some(secs(5))),
            BackoffDecision::Stop
        );
    }

    #[test]
    fn classes_track_waits_independently() {
        let mut state = BackoffState::new(BackoffConfig::default());
        state.on_failure(FailureClass::Transient);
        state.on_failure(FailureClass::Transient);

        assert_eq!(
            state.on_failure(FailureClass::RateLimited),
            BackoffDecision::Retry(secs(60))
        );
        assert_eq!(state.current(FailureClass::Transient), Some(secs(10)));
    }

    #[test]
    fn reset_clears_every_class() {
        let mut state = BackoffState::new(BackoffConfig::default());
        state.on_failure(FailureClass::Transient);
        state.on_failure(FailureClass::RateLimited);
        state.reset();

        assert_eq!(state.current(FailureClass::Transient), None);
        assert_eq!(state.current(FailureClass::RateLimited), None);
        assert_eq!(
            state.on_failure(FailureClass::Transient),
            BackoffDecision::Retry(secs(5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_returns_false_when_cancelled_midway() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let started = tokio::time::Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        assert!(!sleep_cancellable(secs(60), &cancel).await);
        assert!(started.elapsed() < secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_when_not_cancelled() {
        let cancel = CancellationToken::new();
        assert!(sleep_cancellable(Duration::from_millis(10), &cancel).await);
    }
}
