use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::lock_table::LockTable;
use crate::provider::{ArtifactId, LoginStatus, OwnerId};

/// Per-account mirror state. Persisted in `account_state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Disabling is one-way; re-enable by editing the persisted document.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Epoch seconds of the last completed pass. 0 = never.
    #[serde(default)]
    pub last_update: i64,
    /// Owner ids observed to belong to this account.
    #[serde(default)]
    pub owners: BTreeSet<OwnerId>,
    /// Last login/pass status, for diagnostics.
    #[serde(default)]
    pub status: Option<LoginStatus>,
}

const fn default_enabled() -> bool {
    true
}

impl Default for AccountRecord {
    fn default() -> Self {
        Self {
            enabled: true,
            last_update: 0,
            owners: BTreeSet::new(),
            status: None,
        }
    }
}

/// Everything mutated from concurrent job completions.
///
/// Lives behind the single mutex in [`SharedState`]; critical sections are
/// map mutations only, never I/O.
#[derive(Debug, Default)]
pub struct RegistryInner {
    pub locks: LockTable,
    pub accounts: BTreeMap<String, AccountRecord>,
    /// Artifact id → last recorded public version id.
    pub versions: BTreeMap<ArtifactId, String>,
}

/// The one mutual-exclusion domain for lock table, account records, and the
/// recorded-version registry.
#[derive(Debug, Default)]
pub struct SharedState {
    inner: Mutex<RegistryInner>,
}

impl SharedState {
    pub fn new(accounts: BTreeMap<String, AccountRecord>, versions: BTreeMap<ArtifactId, String>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                locks: LockTable::default(),
                accounts,
                versions,
            }),
        }
    }

    /// Run `f` with the registry locked. Keep the closure small: map reads
    /// and writes only.
    pub fn with<R>(&self, f: impl FnOnce(&mut RegistryInner) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Create the account record on first observation.
    pub fn ensure_account(&self, account: &str) -> AccountRecord {
        self.with(|reg| reg.accounts.entry(account.to_string()).or_default().clone())
    }

    /// One-way disable, recording the status that caused it.
    pub fn disable_account(&self, account: &str, status: LoginStatus) {
        self.with(|reg| {
            let record = reg.accounts.entry(account.to_string()).or_default();
            record.enabled = false;
            record.status = Some(status);
        });
    }

    /// Record that `owner` belongs to `account`.
    pub fn record_owner(&self, account: &str, owner: OwnerId) {
        self.with(|reg| {
            reg.accounts.entry(account.to_string()).or_default().owners.insert(owner);
        });
    }

    /// Record the latest fetched version id for an artifact.
    pub fn set_version(&self, artifact: ArtifactId, gid: &str) {
        self.with(|reg| {
            reg.versions.insert(artifact, gid.to_string());
        });
    }

    pub fn recorded_version(&self, artifact: ArtifactId) -> Option<String> {
        self.with(|reg| reg.versions.get(&artifact).cloned())
    }
}

/// The persisted key-value documents under `<root>/state/`.
///
/// Re-read at process start, flushed periodically while passes run and once
/// at shutdown. All plain JSON objects.
#[derive(Debug, Clone)]
pub struct StateFiles {
    dir: PathBuf,
}

const ACCOUNTS_FILE: &str = "accounts.json";
const ACCOUNT_STATE_FILE: &str = "account_state.json";
const VERSIONS_FILE: &str = "versions.json";

impl StateFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Credential document: account name → opaque secret reference. Owned by
    /// the session layer; read-only here.
    pub async fn load_credentials(&self) -> Result<BTreeMap<String, String>> {
        read_document(&self.dir.join(ACCOUNTS_FILE)).await
    }

    pub async fn load_account_state(&self) -> Result<BTreeMap<String, AccountRecord>> {
        read_document(&self.dir.join(ACCOUNT_STATE_FILE)).await
    }

    pub async fn load_versions(&self) -> Result<BTreeMap<ArtifactId, String>> {
        // JSON object keys are strings; artifact ids are stored stringly.
        let raw: BTreeMap<String, String> = read_document(&self.dir.join(VERSIONS_FILE)).await?;
        let mut versions = BTreeMap::new();
        for (key, gid) in raw {
            match key.parse::<ArtifactId>() {
                Ok(artifact) => {
                    versions.insert(artifact, gid);
                }
                Err(_) => warn!(key, "ignoring non-numeric artifact id in versions document"),
            }
        }
        Ok(versions)
    }

    /// Flush account records and the version registry.
    pub async fn flush(&self, state: &SharedState) -> Result<()> {
        let (accounts, versions) = state.with(|reg| {
            let versions: BTreeMap<String, String> = reg
                .versions
                .iter()
                .map(|(artifact, gid)| (artifact.to_string(), gid.clone()))
                .collect();
            (reg.accounts.clone(), versions)
        });

        write_document(&self.dir.join(ACCOUNT_STATE_FILE), &accounts).await?;
        write_document(&self.dir.join(VERSIONS_FILE), &versions).await?;
        Ok(())
    }
}

async fn read_document<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

async fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating state dir {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(value).context("serializing state document")?;
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state_dir() -> PathBuf {
        std::env::temp_dir().join(format!("mm-state-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn ensure_account_creates_enabled_record_once() {
        let state = SharedState::default();
        let record = state.ensure_account("alice");
        assert!(record.enabled);
        assert_eq!(record.last_update, 0);

        state.record_owner("alice", 100);
        let record = state.ensure_account("alice");
        assert!(record.owners.contains(&100));
    }

    #[test]
    fn disable_is_recorded_with_status() {
        let state = SharedState::default();
        state.ensure_account("bob");
        state.disable_account("bob", LoginStatus::InvalidCredentials);

        let record = state.ensure_account("bob");
        assert!(!record.enabled);
        assert_eq!(record.status, Some(LoginStatus::InvalidCredentials));
    }

    #[test]
    fn version_registry_round_trip() {
        let state = SharedState::default();
        assert_eq!(state.recorded_version(1), None);
        state.set_version(1, "v1");
        assert_eq!(state.recorded_version(1), Some("v1".to_string()));
        state.set_version(1, "v2");
        assert_eq!(state.recorded_version(1), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn missing_documents_load_as_empty() -> Result<()> {
        let files = StateFiles::new(temp_state_dir());
        assert!(files.load_credentials().await?.is_empty());
        assert!(files.load_account_state().await?.is_empty());
        assert!(files.load_versions().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn flush_and_reload_round_trip() -> Result<()> {
        let dir = temp_state_dir();
        let files = StateFiles::new(&dir);

        let state = SharedState::default();
        state.ensure_account("alice");
        state.record_owner("alice", 100);
        state.set_version(1, "v1");
        files.flush(&state).await?;

        let accounts = files.load_account_state().await?;
        assert!(accounts["alice"].owners.contains(&100));
        let versions = files.load_versions().await?;
        assert_eq!(versions.get(&1).map(String::as_str), Some("v1"));

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[tokio::test]
    async fn non_numeric_version_keys_are_ignored() -> Result<()> {
        let dir = temp_state_dir();
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(VERSIONS_FILE), r#"{"1": "v1", "not-a-number": "v2"}"#)?;

        let files = StateFiles::new(&dir);
        let versions = files.load_versions().await?;
        assert_eq!(versions.len(), 1);
        assert_eq!(versions.get(&1).map(String::as_str), Some("v1"));

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[tokio::test]
    async fn account_record_defaults_tolerate_sparse_documents() -> Result<()> {
        let dir = temp_state_dir();
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(ACCOUNT_STATE_FILE), r#"{"carol": {}}"#)?;

        let files = StateFiles::new(&dir);
        let accounts = files.load_account_state().await?;
        assert!(accounts["carol"].enabled);
        assert_eq!(accounts["carol"].last_update, 0);

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }
}
