use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an owner (the entity grouping artifacts).
pub type OwnerId = u32;
/// Identifier of an artifact within an owner.
pub type ArtifactId = u32;

/// Owner kinds eligible for mirroring. Anything else is ignored entirely.
pub const ELIGIBLE_KINDS: &[&str] = &["game", "dlc", "application"];

/// Outcome of a session login or relogin attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginStatus {
    Ok,
    RateLimited,
    InvalidCredentials,
    NeedTwoFactor,
    AccountDisabled,
    Unknown,
}

impl LoginStatus {
    /// Whether this status permanently rejects the credentials.
    ///
    /// A permanent rejection disables the account; interactive recovery
    /// (password reset, 2FA enrollment) is outside this process.
    pub const fn is_permanent_rejection(self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials | Self::NeedTwoFactor | Self::AccountDisabled
        )
    }
}

impl fmt::Display for LoginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::RateLimited => "rate limited",
            Self::InvalidCredentials => "invalid credentials",
            Self::NeedTwoFactor => "two-factor required",
            Self::AccountDisabled => "account disabled",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Failure class reported by the provider, consumed by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The call exceeded its deadline.
    Timeout,
    /// Connection-level failure (reset, refused, DNS).
    Network,
    /// The provider asked us to back off.
    RateLimited,
    /// The account is not entitled to this content.
    AccessDenied,
    /// The session is no longer valid.
    AuthRevoked,
    /// Anything the provider did not classify.
    Other,
}

/// A failure from any provider-facing collaborator call.
#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// Human-readable provider error code, e.g. `"AccessDenied"`.
    pub code: String,
    pub message: String,
    /// Provider-supplied wait before the next attempt, on rate limits.
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, "Timeout", message)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Owner metadata from the bulk product-info collaborator.
#[derive(Debug, Clone, Default)]
pub struct OwnerInfo {
    /// Owner kind tag, matched case-insensitively against [`ELIGIBLE_KINDS`].
    pub kind: String,
    /// Artifact id → current public version id, where one is listed.
    pub artifacts: BTreeMap<ArtifactId, Option<String>>,
}

impl OwnerInfo {
    pub fn is_eligible(&self) -> bool {
        let kind = self.kind.to_lowercase();
        ELIGIBLE_KINDS.contains(&kind.as_str())
    }

    /// Whether at least one artifact has a publicly listed version.
    pub fn has_public_artifact(&self) -> bool {
        self.artifacts.values().any(Option::is_some)
    }
}

/// A fetched version payload, pre-decryption-of-content (the payload listing
/// itself is already readable; `key` unlocks the content chunks downstream).
#[derive(Debug, Clone)]
pub struct FetchedVersion {
    /// Serialized payload: a JSON array of entries (see `normalize`).
    pub payload: Vec<u8>,
    /// Hex decryption key for the artifact's content chunks.
    pub key: String,
    /// Version creation time as reported by the provider.
    pub created_at: DateTime<Utc>,
}

/// Credential/session collaborator. Login, re-login, and interactive flows
/// live behind this boundary; the core only consumes the status code.
#[async_trait]
pub trait Session: Send + Sync {
    /// Resume a cached session for `account`, if one exists.
    async fn relogin(&self, account: &str) -> LoginStatus;

    /// Fresh credentialed login.
    async fn login(&self, account: &str, secret: &str) -> LoginStatus;

    /// Provider-supplied reset wait after a rate-limited login, if known.
    fn rate_limit_reset(&self) -> Option<Duration> {
        None
    }
}

/// Bulk product-info collaborator.
#[async_trait]
pub trait ProductInfo: Send + Sync {
    /// Owner ids the logged-in account is entitled to fetch.
    async fn entitled_owners(&self, account: &str) -> Result<Vec<OwnerId>, ProviderError>;

    /// Owner → kind/artifact/public-version info for the given owners.
    async fn owner_info(
        &self,
        owners: &[OwnerId],
    ) -> Result<BTreeMap<OwnerId, OwnerInfo>, ProviderError>;
}

/// Artifact-fetch transport collaborator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Obtain a download token for a specific version.
    async fn version_token(
        &self,
        owner: OwnerId,
        artifact: ArtifactId,
        gid: &str,
    ) -> Result<String, ProviderError>;

    /// Fetch the payload bytes and decryption key for a version.
    async fn fetch_version(
        &self,
        owner: OwnerId,
        artifact: ArtifactId,
        gid: &str,
        token: &str,
    ) -> Result<FetchedVersion, ProviderError>;
}
