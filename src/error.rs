use std::fmt;

use crate::provider::{ArtifactId, OwnerId, ProviderError, ProviderErrorKind};

/// Errors from mirror jobs and account passes.
///
/// The variant determines retry behavior:
/// - `Provider` → retryable (transient provider/network errors)
/// - `Auth` / `Unknown` → non-retryable
/// - `AlreadyStored` / `LockConflict` → not failures at all; callers treat
///   them as "someone else did (or is doing) the work"
#[derive(Debug)]
pub enum MirrorError {
    /// Transient provider failure (network, timeout, rate limit).
    Provider(ProviderError),
    /// Authentication permanently rejected; the account gets disabled.
    Auth(String),
    /// The tag for this (artifact, version) already exists.
    AlreadyStored(String),
    /// Another pass holds the fetch lock for this (owner, artifact).
    LockConflict { owner: OwnerId, artifact: ArtifactId },
    /// Unexpected failure; logged with context, never aborts sibling work.
    Unknown(anyhow::Error),
}

impl MirrorError {
    /// Whether the retry policy may schedule another attempt for this error.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(err) => matches!(
                err.kind,
                ProviderErrorKind::Timeout
                    | ProviderErrorKind::Network
                    | ProviderErrorKind::RateLimited
            ),
            Self::Auth(_) | Self::AlreadyStored(_) | Self::LockConflict { .. } | Self::Unknown(_) => {
                false
            }
        }
    }
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider(err) => write!(f, "{err}"),
            Self::Auth(msg) => write!(f, "authentication rejected: {msg}"),
            Self::AlreadyStored(tag) => write!(f, "already stored: {tag}"),
            Self::LockConflict { owner, artifact } => {
                write!(f, "lock conflict: owner {owner} artifact {artifact} is in flight")
            }
            Self::Unknown(err) => write!(f, "unexpected error: {err}"),
        }
    }
}

impl std::error::Error for MirrorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Provider(err) => Some(err),
            Self::Unknown(err) => Some(err.as_ref()),
            Self::Auth(_) | Self::AlreadyStored(_) | Self::LockConflict { .. } => None,
        }
    }
}

impl From<anyhow::Error> for MirrorError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unknown(err)
    }
}

impl From<ProviderError> for MirrorError {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

/// Check if an error message matches any of the given regex patterns.
///
/// Used by the retry policy to promote transient provider errors to fatal
/// when the message matches a configured pattern.
pub fn matches_fatal_patterns(error_message: &str, patterns: &[String]) -> bool {
    for pattern in patterns {
        if let Ok(re) = regex::Regex::new(pattern) {
            if re.is_match(error_message) {
                return true;
            }
        } else {
            // Invalid regex — skip silently.
        }
    }
    false
}
