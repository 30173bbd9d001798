use std::time::Duration;

use crate::error::matches_fatal_patterns;
use crate::provider::{ProviderError, ProviderErrorKind};

/// Retry classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Fatal,
}

/// Whether to schedule another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry,
    Abandon,
}

/// Classify a provider failure for retry purposes.
///
/// Network/timeout-class errors and rate limits are retryable; permission
/// and authentication rejections are fatal, as is anything unclassified.
pub const fn classify(err: &ProviderError) -> Classification {
    match err.kind {
        ProviderErrorKind::Timeout | ProviderErrorKind::Network | ProviderErrorKind::RateLimited => {
            Classification::Retryable
        }
        ProviderErrorKind::AccessDenied | ProviderErrorKind::AuthRevoked | ProviderErrorKind::Other => {
            Classification::Fatal
        }
    }
}

/// Classify, then promote to fatal when the message matches a configured
/// pattern (operator knob for provider errors that present as transient but
/// never recover).
pub fn classify_with_patterns(err: &ProviderError, fatal_patterns: &[String]) -> Classification {
    match classify(err) {
        Classification::Retryable if matches_fatal_patterns(&err.message, fatal_patterns) => {
            Classification::Fatal
        }
        other => other,
    }
}

/// Decide whether another attempt may follow, given how many attempts have
/// already been made: retry while `attempts_made < max_attempts` and the
/// failure is retryable.
pub const fn decide(
    attempts_made: u32,
    max_attempts: u32,
    classification: Classification,
) -> Decision {
    match classification {
        Classification::Retryable if attempts_made < max_attempts => Decision::Retry,
        Classification::Retryable | Classification::Fatal => Decision::Abandon,
    }
}

/// Wait before login attempt `attempt` (0-based): linearly increasing from
/// the base. Fetch retries deliberately carry no backoff — the transport is
/// cooperative-yielding between attempts; only logins pace themselves.
pub const fn login_backoff(base: Duration, attempt: u32) -> Duration {
    Duration::from_secs(base.as_secs() + attempt as u64)
}

/// Wait before the next login attempt after a rate-limited response: the
/// provider-supplied reset time when known, the linear backoff otherwise.
pub fn rate_limit_wait(reset: Option<Duration>, base: Duration, attempt: u32) -> Duration {
    reset.unwrap_or_else(|| login_backoff(base, attempt))
}
