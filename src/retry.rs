//! Reconnect backoff and error classification
//!
//! Connections retry forever: a download stalls rather than fails when a
//! server goes away, so the backoff has no attempt limit, only a delay cap.
//! Delay growth uses the configured multiplier (golden ratio by default, a
//! gentler curve than doubling) with optional jitter so a pool's connections
//! do not reconnect in lockstep after a server restart.
//!
//! # Example
//!
//! ```
//! use nzb_dl::RetryConfig;
//! use nzb_dl::retry::Backoff;
//! use std::time::Duration;
//!
//! let config = RetryConfig {
//!     initial_delay_ms: 500,
//!     max_delay_ms: 8_000,
//!     backoff_multiplier: 1.618,
//!     jitter: false,
//! };
//! let mut backoff = Backoff::new(&config);
//!
//! assert_eq!(backoff.next_delay(), Duration::from_millis(500));
//! assert!(backoff.next_delay() > Duration::from_millis(500));
//!
//! // A successful exchange returns the curve to its starting point
//! backoff.reset();
//! assert_eq!(backoff.next_delay(), Duration::from_millis(500));
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, NntpError};
use rand::Rng;
use std::time::Duration;

/// Classify an error as transient (reconnect and retry) or permanent.
///
/// Transient failures (timeouts, resets, the server kicking an idle session)
/// return `true`; authoritative verdicts (bad credentials, a missing article)
/// return `false`.
///
/// # Examples
///
/// ```
/// use nzb_dl::retry::IsRetryable;
///
/// #[derive(Debug)]
/// enum FetchError {
///     Timeout,
///     BadCredentials,
/// }
///
/// impl IsRetryable for FetchError {
///     fn is_retryable(&self) -> bool {
///         matches!(self, FetchError::Timeout)
///     }
/// }
///
/// assert!(FetchError::Timeout.is_retryable());
/// assert!(!FetchError::BadCredentials.is_retryable());
/// ```
pub trait IsRetryable {
    /// True when the operation should be retried after a backoff delay
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for NntpError {
    fn is_retryable(&self) -> bool {
        match self {
            // The server is reachable in principle; keep trying
            NntpError::ConnectFailed { .. }
            | NntpError::Timeout { .. }
            | NntpError::SessionTimeout
            | NntpError::Disconnected => true,
            NntpError::Io(e) => io_is_transient(e),
            // 400 is the server closing an idle or overloaded session
            NntpError::UnexpectedResponse { code, .. } => *code == 400,
            // Authoritative verdicts about credentials or the article itself
            NntpError::ModeRejected { .. }
            | NntpError::AuthRejected { .. }
            | NntpError::GroupUnavailable { .. }
            | NntpError::ArticleMissing { .. } => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Nntp(e) => e.is_retryable(),
            Error::Io(e) => io_is_transient(e),
            _ => false,
        }
    }
}

fn io_is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted
    )
}

/// Growing reconnect delay for one connection.
///
/// `next_delay` returns the current delay and advances it; `reset` is called
/// after any successful exchange so a single blip costs one short wait, not
/// the accumulated maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    current: Duration,
}

impl Backoff {
    /// Build from the retry section of the configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - Initial delay, cap, growth multiplier, and jitter switch
    pub fn new(config: &RetryConfig) -> Self {
        let initial = Duration::from_millis(config.initial_delay_ms);
        Self {
            initial,
            max: Duration::from_millis(config.max_delay_ms),
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
            current: initial,
        }
    }

    /// The delay to sleep before the next attempt; grows on each call.
    ///
    /// Growth is capped at the configured maximum. With jitter enabled the
    /// returned value varies by up to ±25% around the undecorated delay.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let grown = Duration::from_secs_f64(base.as_secs_f64() * self.multiplier);
        self.current = grown.min(self.max);
        if self.jitter { jittered(base) } else { base }
    }

    /// Return to the initial delay after a successful exchange
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Apply up to ±25% uniform jitter
fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
