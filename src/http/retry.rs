//! Retry-and-failover loop shared by every higher-level fetcher.
//!
//! A fetch attempt reports what happened as an [`Attempt`]: a value, a
//! request to retry on the same proxy, a request to move to the next proxy,
//! or a fatal error. Transfer errors are mapped the same way by
//! [`classify_error`]. [`with_failover`] walks the session's proxies, giving
//! each one up to [`RetryPolicy::retries_per_proxy`] attempts, and fails with
//! [`FetchError::Exhausted`] once every proxy has been used up.
//!
//! # Example
//!
//! ```no_run
//! use muxfetch::http::{with_failover, Attempt, Engine, RetryPolicy, Session, SessionConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = Session::new(Engine::new()?, SessionConfig::default());
//! let policy = RetryPolicy::default();
//! let url = "https://example.com/";
//! let body = with_failover(&mut session, &policy, url, |client| async move {
//!     let response = client.get(url).await?;
//!     if !response.is_ok() {
//!         return Ok(Attempt::Rotate(format!("status {}", response.status)));
//!     }
//!     Ok(Attempt::Done(response.body))
//! })
//! .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::DEFAULT_RETRY_COUNT;
use super::error::{FetchError, HttpError};
use super::session::{Client, Session};

/// Outcome of one fetch attempt as judged by the caller.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The attempt produced the wanted value.
    Done(T),
    /// Recoverable on the same proxy (partial page, wrong content type).
    Retry(String),
    /// Give up on this proxy (ban page, bad status on the primary request).
    Rotate(String),
    /// Stop without further attempts.
    Fatal(FetchError),
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Try again through the same proxy.
    RetrySameProxy,
    /// Skip the remaining retries and move to the next proxy.
    RotateProxy,
    /// Propagate immediately.
    Fatal,
}

/// Classifies a transfer error for the failover loop.
///
/// | Error | Type |
/// |-------|------|
/// | Transport | RotateProxy |
/// | Proxy | RotateProxy |
/// | ResponseTooLarge | RotateProxy |
/// | AlreadyPerforming | Fatal |
/// | Setup | Fatal |
/// | Engine | RotateProxy |
/// | Abandoned | RotateProxy |
#[instrument]
pub fn classify_error(error: &HttpError) -> FailureType {
    match error {
        HttpError::Transport { .. }
        | HttpError::Proxy { .. }
        | HttpError::ResponseTooLarge { .. } => FailureType::RotateProxy,

        HttpError::AlreadyPerforming { .. } | HttpError::Setup { .. } => FailureType::Fatal,

        HttpError::Engine { .. } | HttpError::Abandoned { .. } => {
            warn!(%error, "unexpected transfer failure, rotating proxy");
            FailureType::RotateProxy
        }
    }
}

/// Budget and pacing of the failover loop.
///
/// # Default Values
///
/// - `retries_per_proxy`: 5
/// - `retry_delay`: none
/// - `wait_on_cycle`: none (the session's cycle wait is used by
///   [`RetryPolicy::for_session`])
/// - `deadline`: none
/// - `too_large_is_fatal`: false
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    retries_per_proxy: u32,
    retry_delay: Duration,
    wait_on_cycle: Option<Duration>,
    deadline: Option<Duration>,
    too_large_is_fatal: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries_per_proxy: DEFAULT_RETRY_COUNT,
            retry_delay: Duration::ZERO,
            wait_on_cycle: None,
            deadline: None,
            too_large_is_fatal: false,
        }
    }
}

impl RetryPolicy {
    /// Default policy pausing for the session's cycle wait after each full
    /// pass over its proxies.
    #[must_use]
    pub fn for_session(session: &Session) -> Self {
        Self {
            wait_on_cycle: Some(session.cycle_wait()),
            ..Self::default()
        }
    }

    /// Attempts per proxy (at least 1).
    #[must_use]
    pub fn with_retries_per_proxy(mut self, retries: u32) -> Self {
        self.retries_per_proxy = retries.max(1);
        self
    }

    /// Pause between attempts on the same proxy. Up to half of it again is
    /// added as jitter.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Pause after a full pass over the proxy list.
    #[must_use]
    pub fn with_wait_on_cycle(mut self, wait: Option<Duration>) -> Self {
        self.wait_on_cycle = wait;
        self
    }

    /// Overall time limit for the whole loop.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Treat oversized responses as fatal for the URL instead of rotating.
    #[must_use]
    pub fn with_too_large_fatal(mut self, fatal: bool) -> Self {
        self.too_large_is_fatal = fatal;
        self
    }

    /// Attempts each proxy gets.
    #[must_use]
    pub fn retries_per_proxy(&self) -> u32 {
        self.retries_per_proxy
    }

    /// Overall time limit, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Classifies `error` under this policy.
    #[must_use]
    pub fn classify(&self, error: &HttpError) -> FailureType {
        if self.too_large_is_fatal && matches!(error, HttpError::ResponseTooLarge { .. }) {
            return FailureType::Fatal;
        }
        classify_error(error)
    }

    fn pause(&self) -> Duration {
        if self.retry_delay.is_zero() {
            return Duration::ZERO;
        }
        let base_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
        self.retry_delay + Duration::from_millis(jitter_ms)
    }
}

/// Runs `attempt` across the session's proxies until it succeeds, fails
/// fatally or the budget runs out.
///
/// Each proxy gets up to `retries_per_proxy` attempts. After a proxy is
/// given up on, the session rotates. A wraparound after the last proxy
/// does not sleep here; the cycle wait is deferred to the next loop run on
/// the same session (or a clone of it).
///
/// # Errors
///
/// - [`FetchError::Exhausted`] once every proxy used up its budget
/// - [`FetchError::DeadlineExceeded`] if the policy deadline passes
/// - [`FetchError::Fatal`] or the attempt's own fatal error otherwise
#[instrument(skip(session, policy, attempt), fields(proxies = session.proxies().len()))]
pub async fn with_failover<T, F, Fut>(
    session: &mut Session,
    policy: &RetryPolicy,
    url: &str,
    mut attempt: F,
) -> Result<T, FetchError>
where
    F: FnMut(Client) -> Fut,
    Fut: Future<Output = Result<Attempt<T>, HttpError>>,
{
    session.serve_deferred_wait().await;
    let started = Instant::now();
    let ways = session.ways_out().len();
    let mut attempts: u32 = 0;

    for way in 0..ways {
        let client = session.client();
        for retry in 1..=policy.retries_per_proxy {
            if let Some(deadline) = policy.deadline {
                if started.elapsed() >= deadline {
                    return Err(FetchError::DeadlineExceeded {
                        url: url.to_string(),
                        attempts,
                    });
                }
            }
            attempts += 1;

            let failure = match attempt(client.clone()).await {
                Ok(Attempt::Done(value)) => return Ok(value),
                Ok(Attempt::Fatal(error)) => return Err(error),
                Ok(Attempt::Retry(reason)) => {
                    debug!(proxy = ?client.proxy(), retry, %reason, "retrying on same proxy");
                    FailureType::RetrySameProxy
                }
                Ok(Attempt::Rotate(reason)) => {
                    debug!(proxy = ?client.proxy(), retry, %reason, "giving up on proxy");
                    FailureType::RotateProxy
                }
                Err(error) => {
                    let failure = policy.classify(&error);
                    debug!(proxy = ?client.proxy(), retry, %error, ?failure, "attempt failed");
                    if failure == FailureType::Fatal {
                        return Err(FetchError::Fatal(error));
                    }
                    failure
                }
            };

            if failure == FailureType::RotateProxy {
                break;
            }
            if retry < policy.retries_per_proxy {
                let pause = policy.pause();
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }

        if way + 1 < ways {
            session.rotate_past(&client, policy.wait_on_cycle).await;
        } else if session.rotate_past(&client, None).await {
            session.defer_cycle_wait(policy.wait_on_cycle);
        }
    }

    warn!(url, attempts, "all proxies exhausted");
    Err(FetchError::exhausted(url, attempts))
}
