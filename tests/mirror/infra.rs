//! Shared test infrastructure: temp archive setup, provider fakes, and
//! config builders.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use manifest_mirror::config::MirrorConfig;
use manifest_mirror::normalize::FileEntry;
use manifest_mirror::provider::{
    ArtifactId, FetchedVersion, LoginStatus, OwnerId, OwnerInfo, ProductInfo, ProviderError,
    ProviderErrorKind, Session, Transport,
};

pub fn temp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()))
}

/// Archive config rooted in a fresh temp directory: no pushing, no
/// throttling, fast flushes.
pub fn test_config(root: &Path) -> MirrorConfig {
    MirrorConfig {
        archive_root: root.to_path_buf(),
        base_branch: "base".to_string(),
        pool_size: 4,
        max_in_flight: 8,
        retry_limit: 3,
        update_interval_secs: 0,
        login_base_wait_secs: 0,
        remove_old: false,
        check_changes: false,
        push: false,
        flush_interval_secs: 1,
        owner_filter: Default::default(),
        account_filter: Default::default(),
        default_author: None,
        fatal_patterns: Vec::new(),
        merge_dir: None,
        health_file: None,
        health_port: None,
    }
}

/// Give commits in the archive a deterministic identity.
pub fn configure_git_identity(root: &Path) {
    for args in [
        ["config", "user.name", "test"],
        ["config", "user.email", "test@test"],
    ] {
        std::process::Command::new("git")
            .args(args)
            .current_dir(root)
            .output()
            .expect("git config");
    }
}

/// Write the credentials document the session layer owns.
pub async fn write_credentials(state_dir: &Path, accounts: &[(&str, &str)]) -> Result<()> {
    let map: BTreeMap<String, String> = accounts
        .iter()
        .map(|(name, secret)| (name.to_string(), secret.to_string()))
        .collect();
    tokio::fs::create_dir_all(state_dir).await?;
    tokio::fs::write(state_dir.join("accounts.json"), serde_json::to_vec_pretty(&map)?).await?;
    Ok(())
}

/// Session fake that accepts every login.
pub struct AcceptingSession;

#[async_trait]
impl Session for AcceptingSession {
    async fn relogin(&self, _account: &str) -> LoginStatus {
        LoginStatus::Ok
    }

    async fn login(&self, _account: &str, _secret: &str) -> LoginStatus {
        LoginStatus::Ok
    }
}

/// Mutable provider catalog: per-account entitlements and per-owner info,
/// adjustable between runs to simulate the provider publishing new versions.
#[derive(Default)]
pub struct Catalog {
    entitlements: Mutex<BTreeMap<String, Vec<OwnerId>>>,
    owners: Mutex<BTreeMap<OwnerId, OwnerInfo>>,
}

impl Catalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entitle(&self, account: &str, owners: &[OwnerId]) {
        self.entitlements
            .lock()
            .expect("entitlements lock")
            .insert(account.to_string(), owners.to_vec());
    }

    pub fn set_owner(&self, owner: OwnerId, kind: &str, artifacts: &[(ArtifactId, &str)]) {
        let info = OwnerInfo {
            kind: kind.to_string(),
            artifacts: artifacts
                .iter()
                .map(|(id, gid)| (*id, Some((*gid).to_string())))
                .collect(),
        };
        self.owners.lock().expect("owners lock").insert(owner, info);
    }

    pub fn set_version(&self, owner: OwnerId, artifact: ArtifactId, gid: &str) {
        let mut owners = self.owners.lock().expect("owners lock");
        if let Some(info) = owners.get_mut(&owner) {
            info.artifacts.insert(artifact, Some(gid.to_string()));
        }
    }
}

#[async_trait]
impl ProductInfo for Catalog {
    async fn entitled_owners(&self, account: &str) -> Result<Vec<OwnerId>, ProviderError> {
        Ok(self
            .entitlements
            .lock()
            .expect("entitlements lock")
            .get(account)
            .cloned()
            .unwrap_or_default())
    }

    async fn owner_info(
        &self,
        owners: &[OwnerId],
    ) -> Result<BTreeMap<OwnerId, OwnerInfo>, ProviderError> {
        let catalog = self.owners.lock().expect("owners lock");
        Ok(owners
            .iter()
            .filter_map(|owner| catalog.get(owner).map(|info| (*owner, info.clone())))
            .collect())
    }
}

/// Transport fake serving deterministic payloads, with a failure budget for
/// exercising retries.
pub struct PayloadTransport {
    created_at: DateTime<Utc>,
    failures: Mutex<Vec<ProviderError>>,
    pub fetches: Mutex<Vec<(ArtifactId, String)>>,
}

impl PayloadTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created_at: Utc::now(),
            failures: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
        })
    }

    pub fn with_failures(failures: Vec<ProviderError>) -> Arc<Self> {
        Arc::new(Self {
            created_at: Utc::now(),
            failures: Mutex::new(failures),
            fetches: Mutex::new(Vec::new()),
        })
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().expect("fetches lock").len()
    }

    pub fn network_error() -> ProviderError {
        ProviderError::new(ProviderErrorKind::Network, "Network", "connection reset")
    }
}

#[async_trait]
impl Transport for PayloadTransport {
    async fn version_token(
        &self,
        _owner: OwnerId,
        artifact: ArtifactId,
        gid: &str,
    ) -> Result<String, ProviderError> {
        Ok(format!("token-{artifact}-{gid}"))
    }

    async fn fetch_version(
        &self,
        _owner: OwnerId,
        artifact: ArtifactId,
        gid: &str,
        _token: &str,
    ) -> Result<FetchedVersion, ProviderError> {
        self.fetches
            .lock()
            .expect("fetches lock")
            .push((artifact, gid.to_string()));

        let mut failures = self.failures.lock().expect("failures lock");
        if !failures.is_empty() {
            return Err(failures.remove(0));
        }
        drop(failures);

        // Unsorted, padded entries so runs exercise normalization.
        let entries = vec![
            FileEntry {
                path: format!("Data/{artifact}-{gid}.bin\0\0"),
                size: 32,
                chunks: Vec::new(),
            },
            FileEntry {
                path: "assets/readme.txt".to_string(),
                size: 5,
                chunks: Vec::new(),
            },
        ];
        let payload = serde_json::to_vec(&entries)
            .map_err(|e| ProviderError::new(ProviderErrorKind::Other, "Encode", e.to_string()))?;
        Ok(FetchedVersion {
            payload,
            key: "cd".repeat(32),
            created_at: self.created_at,
        })
    }
}
