use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::change;
use crate::config::MirrorConfig;
use crate::provider::{OwnerId, ProductInfo, Session, Transport};
use crate::scheduler::{RunSummary, Scheduler, SchedulerOptions};
use crate::state::{SharedState, StateFiles};
use crate::store::{ArtifactStore, GitRepo, MergeOutcome};

/// An opened mirror archive: repository, store, and loaded state.
///
/// Refresh passes need the provider collaborators and run through [`Mirror::run`];
/// provider-independent operations (merge, publication, state flush) run
/// through [`Mirror::run_maintenance`].
pub struct Mirror {
    config: MirrorConfig,
    state: Arc<SharedState>,
    files: StateFiles,
    store: Arc<ArtifactStore>,
    shutdown: Arc<AtomicBool>,
}

impl Mirror {
    /// Open (initializing if needed) the archive repository and load the
    /// persisted state documents.
    pub async fn open(config: MirrorConfig) -> Result<Self> {
        let repo = GitRepo::new(&config.archive_root);
        repo.ensure_initialized(&config.base_branch)
            .await
            .context("initializing archive repository")?;
        let store = ArtifactStore::new(
            repo,
            &config.base_branch,
            config.remove_old,
            config.default_author.clone(),
        );

        let files = StateFiles::new(config.state_dir());
        let accounts = files.load_account_state().await?;
        let versions = files.load_versions().await?;
        info!(
            accounts = accounts.len(),
            versions = versions.len(),
            root = %config.archive_root.display(),
            "archive opened"
        );

        Ok(Self {
            config,
            state: Arc::new(SharedState::new(accounts, versions)),
            files,
            store: Arc::new(store),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag observed by passes and jobs; set it to wind the run down.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Full refresh run: optional merge of external proposals, account
    /// selection (change detection or manual override), scheduled passes
    /// with periodic state flushes, and final publication.
    pub async fn run(
        &self,
        session: Arc<dyn Session>,
        info: Arc<dyn ProductInfo>,
        transport: Arc<dyn Transport>,
    ) -> Result<RunSummary> {
        if let Some(dir) = self.config.merge_dir.clone() {
            self.merge_external(&dir).await?;
        }

        let credentials = self.files.load_credentials().await?;
        let selected = self.select_accounts(credentials, info.as_ref()).await?;
        if selected.is_empty() {
            info!("no accounts selected for this run");
        }

        let scheduler = Scheduler::new(
            Arc::clone(&self.state),
            Arc::clone(&self.store),
            session,
            info,
            transport,
            self.scheduler_options(),
            Arc::clone(&self.shutdown),
        );

        let flush_task = self.spawn_flush_loop();
        let summary = scheduler.run(&selected).await;
        flush_task.abort();
        self.files.flush(&self.state).await?;

        if self.config.push {
            self.store.push_pending().await?;
        }
        Ok(summary)
    }

    /// Provider-independent operations only: merge proposals, flush state,
    /// publish pending refs.
    pub async fn run_maintenance(&self) -> Result<()> {
        if let Some(dir) = self.config.merge_dir.clone() {
            self.merge_external(&dir).await?;
        }
        self.files.flush(&self.state).await?;
        if self.config.push {
            self.store.push_pending().await?;
        }
        info!("maintenance run complete");
        Ok(())
    }

    /// Merge externally proposed versions from `dir`, one subdirectory per
    /// owner id. Adopted versions update the recorded-version registry.
    pub async fn merge_external(&self, dir: &Path) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("reading merge dir {}", dir.display()))?;

        let mut adopted = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(owner) = name.parse::<OwnerId>() else {
                continue;
            };

            let candidates = self.store.scan_candidates(&entry.path()).await?;
            if candidates.is_empty() {
                continue;
            }
            info!(owner, candidates = candidates.len(), "merging proposed versions");
            let outcomes = self.store.merge(owner, candidates).await?;
            for outcome in outcomes {
                if let MergeOutcome::Adopted { artifact, gid, .. } = outcome {
                    self.state.set_version(artifact, &gid);
                    adopted += 1;
                }
            }
        }
        info!(adopted, "merge pass complete");
        Ok(adopted)
    }

    /// Decide which credentialed accounts run a pass: a manual override
    /// (account or owner lists) wins outright; otherwise change detection
    /// narrows the set when enabled; otherwise everyone runs (the throttle
    /// still gates each pass).
    async fn select_accounts(
        &self,
        mut credentials: BTreeMap<String, String>,
        info: &dyn ProductInfo,
    ) -> Result<BTreeMap<String, String>> {
        if !self.config.account_filter.is_empty() {
            credentials.retain(|name, _| self.config.account_filter.contains(name));
            return Ok(credentials);
        }

        if !self.config.owner_filter.is_empty() {
            // Selecting owners implies selecting every account known to own one.
            let owning: std::collections::BTreeSet<String> = self.state.with(|reg| {
                reg.accounts
                    .iter()
                    .filter(|(_, record)| {
                        record.enabled
                            && record.owners.iter().any(|o| self.config.owner_filter.contains(o))
                    })
                    .map(|(name, _)| name.clone())
                    .collect()
            });
            credentials.retain(|name, _| owning.contains(name));
            return Ok(credentials);
        }

        if self.config.check_changes {
            let names = credentials.keys().cloned().collect();
            let report =
                change::detect(info, &self.state, &names, self.config.retry_limit).await?;
            credentials.retain(|name, _| report.due_accounts.contains(name));
        }
        Ok(credentials)
    }

    fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            pool_size: self.config.pool_size,
            max_in_flight: self.config.max_in_flight,
            max_attempts: self.config.retry_limit,
            min_interval: self.config.update_interval(),
            login_base_wait: self.config.login_base_wait(),
            owner_filter: self.config.owner_filter.clone(),
            account_filter: self.config.account_filter.clone(),
            fatal_patterns: Arc::new(self.config.fatal_patterns.clone()),
        }
    }

    /// Flush the persisted documents on an interval while passes run.
    fn spawn_flush_loop(&self) -> tokio::task::JoinHandle<()> {
        let files = self.files.clone();
        let state = Arc::clone(&self.state);
        let interval = Duration::from_secs(self.config.flush_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = files.flush(&state).await {
                    warn!(error = %format!("{err:#}"), "periodic state flush failed");
                }
            }
        })
    }
}
