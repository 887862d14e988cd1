//! Backoff policy shared by the three remote-facing stages.
//!
//! Segment reads, analyzer calls and chunk sends each turn their own error
//! type into a [`FailureType`] and ask a [`RetryPolicy`] what to do next. The
//! policy only knows about attempt counts and delays; deciding that a
//! throttled upload means "quota is gone, stop the batch" is left to the
//! uploader, which checks for [`FailureType::RateLimited`] before asking.
//!
//! ```
//! use std::time::Duration;
//! use mediarelay_core::retry::{FailureType, RetryDecision, RetryPolicy};
//!
//! let segments = RetryPolicy::new(3, Duration::from_millis(250), Duration::from_secs(4), 2.0)
//!     .with_jitter(Duration::ZERO);
//!
//! assert_eq!(
//!     segments.should_retry(FailureType::Transient, 1),
//!     RetryDecision::Retry { delay: Duration::from_millis(250), attempt: 2 },
//! );
//! assert!(matches!(
//!     segments.should_retry(FailureType::Transient, 3),
//!     RetryDecision::DoNotRetry { .. }
//! ));
//! ```

use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, instrument, warn};

/// Attempts per segment, chunk or analyzer call unless configured otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

/// Longest server-advertised wait we are willing to honour.
const RETRY_AFTER_CEILING: Duration = Duration::from_secs(60 * 60);

/// How a failed remote call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Dropped connection, timeout, 5xx. Worth another attempt.
    Transient,
    /// The remote understood and refused; repeating the call changes nothing.
    Permanent,
    /// Missing or refused credentials.
    NeedsAuth,
    /// Throttled, either by status 429 or a quota signature in the body.
    RateLimited,
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then make attempt number `attempt`.
    Retry { delay: Duration, attempt: u32 },
    /// Give up; `reason` ends up in the stage's error or log line.
    DoNotRetry { reason: String },
}

/// Attempt budget plus exponential backoff.
///
/// The wait before attempt `n + 1` is `base_delay * multiplier^(n - 1)` plus
/// up to `max_jitter` of random slack, so concurrent segment workers do not
/// hammer the source in lockstep. The sum never exceeds `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first try and is clamped to at least one.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }

    /// Default backoff with a different attempt budget.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Replaces the jitter ceiling. `Duration::ZERO` makes delays deterministic.
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Upper bound on computed backoff; analyzers also compare `Retry-After` to it.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Decides what follows failed attempt number `attempt` (1-based).
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        let refusal = match failure_type {
            FailureType::Permanent => Some("remote refused the request"),
            FailureType::NeedsAuth => Some("credentials missing or rejected"),
            FailureType::Transient | FailureType::RateLimited => None,
        };
        if let Some(reason) = refusal {
            return RetryDecision::DoNotRetry {
                reason: reason.to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, "attempt budget spent");
            return RetryDecision::DoNotRetry {
                reason: format!("gave up after {} attempts", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(attempt, delay_ms = delay.as_millis(), "backing off");
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Backoff after failed attempt `attempt`, jitter included and capped.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let steps = f64::from(attempt.saturating_sub(1));
        let grown = self.base_delay.as_millis() as f64 * f64::from(self.backoff_multiplier).powf(steps);
        let capped = grown.min(self.max_delay.as_millis() as f64);
        (Duration::from_millis(capped as u64) + self.jitter()).min(self.max_delay)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn jitter(&self) -> Duration {
        match self.max_jitter.as_millis() as u64 {
            0 => Duration::ZERO,
            ceiling => Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling)),
        }
    }
}

/// Maps a response status onto a [`FailureType`].
///
/// 408 is the one 4xx worth repeating. Anything outside 4xx/5xx that reaches
/// here is unexpected and treated as permanent.
#[must_use]
pub fn classify_http_status(status: u16) -> FailureType {
    match status {
        401 | 403 => FailureType::NeedsAuth,
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

/// Reads a `Retry-After` value, either delta-seconds or an HTTP-date.
///
/// Waits longer than an hour are clamped. Negative numbers, dates already in
/// the past and anything unparseable give `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let value = header_value.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        let wait = Duration::from_secs(seconds);
        if wait > RETRY_AFTER_CEILING {
            warn!(seconds, "Retry-After clamped to one hour");
            return Some(RETRY_AFTER_CEILING);
        }
        return Some(wait);
    }

    match httpdate::parse_http_date(value) {
        Ok(when) => when
            .duration_since(SystemTime::now())
            .ok()
            .map(|wait| wait.min(RETRY_AFTER_CEILING)),
        Err(_) => {
            debug!(value, "ignoring Retry-After");
            None
        }
    }
}
