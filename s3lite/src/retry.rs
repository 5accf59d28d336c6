//! When and how often a failed request is tried again.
//!
//! The policy is an explicit value handed to the client rather than something baked into the
//! transport, so tests can swap in a schedule without delays and callers can change what counts
//! as retryable.  The actual waiting is done by the `again` crate.
use crate::{signing::PayloadHash, S3Error};
use http::Method;
use std::{fmt, time::Duration};

/// How the delay between attempts grows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Start at `initial` and double on each retry, never exceeding `max`
    Exponential { initial: Duration, max: Duration },

    /// Wait the same amount before every retry
    Fixed(Duration),
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    backoff: Backoff,
    jitter: bool,
    retryable: fn(&S3Error) -> bool,
}

impl RetryPolicy {
    /// Exponential backoff starting at `initial`, with the default retry count and delay cap
    pub fn exponential(initial: Duration) -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential {
                initial,
                max: Duration::from_secs(5),
            },
            jitter: true,
            retryable: S3Error::is_transient,
        }
    }

    /// Retry immediately, without waiting between attempts
    pub fn no_backoff() -> Self {
        Self {
            backoff: Backoff::Fixed(Duration::ZERO),
            jitter: false,
            ..Self::default()
        }
    }

    /// Never retry anything
    pub fn never() -> Self {
        Self::default().with_max_retries(0)
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Cap the delay of an exponential schedule.  No effect on a fixed schedule.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        if let Backoff::Exponential { max, .. } = &mut self.backoff {
            *max = max_delay;
        }
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the predicate that decides which errors are worth retrying
    pub fn with_retryable(mut self, retryable: fn(&S3Error) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn is_retryable(&self, err: &S3Error) -> bool {
        (self.retryable)(err)
    }

    /// The `again` schedule that implements this policy
    pub(crate) fn schedule(&self) -> again::RetryPolicy {
        let policy = match self.backoff {
            Backoff::Exponential { initial, max } => {
                again::RetryPolicy::exponential(initial).with_max_delay(max)
            }
            Backoff::Fixed(delay) => again::RetryPolicy::fixed(delay),
        };

        policy
            .with_max_retries(self.max_retries)
            .with_jitter(self.jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

/// Whether sending a request more than once is harmless.
///
/// GET, HEAD and DELETE always are.  A PUT is only if its body is covered by the signature;
/// with `UNSIGNED-PAYLOAD` there's no guarantee a resend carries the same bytes.  Anything else,
/// POST in particular, is sent at most once.
pub fn is_idempotent(method: &Method, payload: &PayloadHash) -> bool {
    match *method {
        Method::GET | Method::HEAD | Method::DELETE => true,
        Method::PUT => matches!(payload, PayloadHash::Sha256(_)),
        _ => false,
    }
}
