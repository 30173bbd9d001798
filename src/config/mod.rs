pub mod tuning;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::provider::OwnerId;
use crate::store::CommitAuthor;

/// Configuration for the mirror process, read from environment variables.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Archive repository root. Controlled by `MIRROR_ROOT` (default `./archive`).
    pub archive_root: PathBuf,
    /// Branch owner branches start from. Controlled by `MIRROR_BASE_BRANCH`
    /// (default `base`).
    pub base_branch: String,

    // Concurrency & retry
    /// Concurrent account passes. Controlled by `MIRROR_POOL_SIZE` (default 8).
    pub pool_size: usize,
    /// Concurrent fetch jobs across the whole run, to respect provider-side
    /// rate limits. Controlled by `MIRROR_MAX_IN_FLIGHT` (default 32).
    pub max_in_flight: usize,
    /// Attempt ceiling for fetches, logins, and info calls.
    /// Controlled by `MIRROR_RETRY_LIMIT` (default 3).
    pub retry_limit: u32,
    /// Minimum interval between refresh passes for one account, seconds.
    /// Controlled by `MIRROR_UPDATE_INTERVAL_SECS` (default 86400).
    pub update_interval_secs: u64,
    /// Base wait for login pacing, seconds.
    /// Controlled by `MIRROR_LOGIN_BASE_WAIT_SECS` (default 1).
    pub login_base_wait_secs: u64,

    // Behavior toggles
    /// Remove stale same-artifact blob files when committing a new version.
    /// Controlled by `MIRROR_REMOVE_OLD` (default false).
    pub remove_old: bool,
    /// Run change detection first and only pass due accounts.
    /// Controlled by `MIRROR_CHECK_CHANGES` (default false).
    pub check_changes: bool,
    /// Push new branches/tags to origin after the run.
    /// Controlled by `MIRROR_PUSH` (default true).
    pub push: bool,
    /// Flush interval for persisted state while passes run, seconds.
    /// Controlled by `MIRROR_FLUSH_INTERVAL_SECS` (default 1).
    pub flush_interval_secs: u64,

    // Manual override targeting
    /// Restrict the run to these owner ids. `MIRROR_OWNERS`, comma-separated.
    pub owner_filter: BTreeSet<OwnerId>,
    /// Restrict the run to these accounts. `MIRROR_ACCOUNTS`, comma-separated.
    pub account_filter: BTreeSet<String>,

    /// Default commit author for adopted external versions.
    /// `MIRROR_AUTHOR_NAME` / `MIRROR_AUTHOR_EMAIL`.
    pub default_author: Option<CommitAuthor>,
    /// Messages matching these patterns make a transient provider error
    /// fatal. `MIRROR_FATAL_PATTERNS`, a JSON array of regexes.
    pub fatal_patterns: Vec<String>,
    /// Directory of externally proposed versions to merge before the run,
    /// one subdirectory per owner id. `MIRROR_MERGE_DIR`.
    pub merge_dir: Option<PathBuf>,

    // Health check
    pub health_file: Option<String>,
    pub health_port: Option<u16>,
}

impl MirrorConfig {
    /// Read configuration from environment variables.
    pub fn from_env() -> Result<Self, String> {
        let default_author = std::env::var("MIRROR_AUTHOR_NAME").ok().map(|name| CommitAuthor {
            name,
            email: std::env::var("MIRROR_AUTHOR_EMAIL").ok(),
        });

        Ok(Self {
            archive_root: PathBuf::from(
                std::env::var("MIRROR_ROOT").unwrap_or_else(|_| "./archive".to_string()),
            ),
            base_branch: std::env::var("MIRROR_BASE_BRANCH")
                .unwrap_or_else(|_| "base".to_string()),
            pool_size: tuning::parse_env_usize("MIRROR_POOL_SIZE", 8)?,
            max_in_flight: tuning::parse_env_usize("MIRROR_MAX_IN_FLIGHT", 32)?,
            retry_limit: tuning::parse_env_u32("MIRROR_RETRY_LIMIT", 3)?,
            update_interval_secs: tuning::parse_env_u64("MIRROR_UPDATE_INTERVAL_SECS", 86_400)?,
            login_base_wait_secs: tuning::parse_env_u64("MIRROR_LOGIN_BASE_WAIT_SECS", 1)?,
            remove_old: tuning::parse_env_bool("MIRROR_REMOVE_OLD", false),
            check_changes: tuning::parse_env_bool("MIRROR_CHECK_CHANGES", false),
            push: tuning::parse_env_bool("MIRROR_PUSH", true),
            flush_interval_secs: tuning::parse_env_u64("MIRROR_FLUSH_INTERVAL_SECS", 1)?,
            owner_filter: tuning::parse_env_list("MIRROR_OWNERS")?.into_iter().collect(),
            account_filter: tuning::parse_env_list::<String>("MIRROR_ACCOUNTS")?
                .into_iter()
                .collect(),
            default_author,
            fatal_patterns: tuning::parse_env_json_strings("MIRROR_FATAL_PATTERNS")?,
            merge_dir: std::env::var("MIRROR_MERGE_DIR").ok().map(PathBuf::from),
            health_file: std::env::var("HEALTH_FILE").ok(),
            health_port: tuning::parse_optional_env_u16("HEALTH_PORT")?,
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.archive_root.join("state")
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn login_base_wait(&self) -> Duration {
        Duration::from_secs(self.login_base_wait_secs)
    }
}
