pub mod job;

pub use job::{FetchJob, JobContext, JobOutcome};

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::provider::{
    ArtifactId, LoginStatus, OwnerId, OwnerInfo, ProductInfo, ProviderError, Session, Transport,
};
use crate::retry::{Decision, classify, decide, login_backoff, rate_limit_wait};
use crate::state::SharedState;
use crate::store::ArtifactStore;
use crate::throttle;

/// Deadline for login and entitlement/info calls within a pass.
pub const PROVIDER_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Tuning and targeting knobs for a run, derived from config.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Concurrent account passes.
    pub pool_size: usize,
    /// Concurrent fetch jobs across the whole run, all accounts included.
    pub max_in_flight: usize,
    /// Attempt ceiling for fetches, logins, and info calls.
    pub max_attempts: u32,
    /// Minimum interval between passes for one account.
    pub min_interval: Duration,
    /// Base wait for login pacing.
    pub login_base_wait: Duration,
    /// When non-empty, only these owners are considered.
    pub owner_filter: BTreeSet<OwnerId>,
    /// When non-empty, only these accounts run a pass.
    pub account_filter: BTreeSet<String>,
    /// Messages matching these patterns make a transient error fatal.
    pub fatal_patterns: Arc<Vec<String>>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            pool_size: 8,
            max_in_flight: 32,
            max_attempts: 3,
            min_interval: Duration::from_secs(86_400),
            login_base_wait: Duration::from_secs(1),
            owner_filter: BTreeSet::new(),
            account_filter: BTreeSet::new(),
            fatal_patterns: Arc::new(Vec::new()),
        }
    }
}

/// Why a pass ended without scheduling work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassStats),
    /// Refresh interval has not elapsed.
    NotDue,
    Disabled,
    /// Excluded by the account filter.
    Filtered,
    LoginFailed(LoginStatus),
    /// Entitlement enumeration yielded no eligible owners; account disabled.
    NoOwners,
    /// Entitlement or info call failed past the retry ceiling.
    ProviderFailed,
    Interrupted,
}

/// Per-pass job accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub scheduled: usize,
    pub succeeded: usize,
    pub already_stored: usize,
    pub retry_exhausted: usize,
    pub fatal: usize,
    pub abandoned: usize,
}

/// Whole-run accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passes: usize,
    pub completed: usize,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
}

/// Bounded-concurrency engine driving account passes and fetch jobs.
///
/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<SharedState>,
    store: Arc<ArtifactStore>,
    session: Arc<dyn Session>,
    info: Arc<dyn ProductInfo>,
    transport: Arc<dyn Transport>,
    options: Arc<SchedulerOptions>,
    pass_slots: Arc<Semaphore>,
    job_slots: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
}

enum LoginFlow {
    Success,
    /// Credentials permanently rejected; the account gets disabled.
    Rejected(LoginStatus),
    /// Attempts exhausted on transient statuses; the account stays enabled.
    Exhausted(LoginStatus),
}

impl Scheduler {
    pub fn new(
        state: Arc<SharedState>,
        store: Arc<ArtifactStore>,
        session: Arc<dyn Session>,
        info: Arc<dyn ProductInfo>,
        transport: Arc<dyn Transport>,
        options: SchedulerOptions,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let pass_slots = Arc::new(Semaphore::new(options.pool_size.max(1)));
        let job_slots = Arc::new(Semaphore::new(options.max_in_flight.max(1)));
        Self {
            state,
            store,
            session,
            info,
            transport,
            options: Arc::new(options),
            pass_slots,
            job_slots,
            shutdown,
        }
    }

    /// Run one pass per credentialed account, bounded by the pass pool.
    /// A single account's failure never aborts the others.
    pub async fn run(&self, credentials: &BTreeMap<String, String>) -> RunSummary {
        // Tag listings from the previous pass may be stale by now.
        self.store.invalidate_caches();

        let run_id = uuid::Uuid::new_v4();
        info!(%run_id, accounts = credentials.len(), "mirror run starting");

        let mut handles = Vec::new();
        for (account, secret) in credentials {
            let sched = self.clone();
            let account = account.clone();
            let secret = secret.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = sched.pass_slots.clone().acquire_owned().await else {
                    return PassOutcome::Interrupted;
                };
                if sched.shutdown.load(Ordering::Relaxed) {
                    return PassOutcome::Interrupted;
                }
                sched.run_pass(&account, &secret).await
            }));
        }

        let mut summary = RunSummary {
            passes: handles.len(),
            ..RunSummary::default()
        };
        for handle in futures::future::join_all(handles).await {
            match handle {
                Ok(PassOutcome::Completed(stats)) => {
                    summary.completed += 1;
                    summary.jobs_succeeded += stats.succeeded + stats.already_stored;
                    summary.jobs_failed += stats.retry_exhausted + stats.fatal;
                }
                Ok(_) => {}
                Err(err) => {
                    // A panicked pass is contained like any other failure.
                    error!(error = %err, "account pass task failed");
                }
            }
        }

        info!(
            %run_id,
            passes = summary.passes,
            completed = summary.completed,
            jobs_succeeded = summary.jobs_succeeded,
            jobs_failed = summary.jobs_failed,
            "mirror run finished"
        );
        summary
    }

    /// One full scheduling cycle for a single account.
    pub async fn run_pass(&self, account: &str, secret: &str) -> PassOutcome {
        if !self.options.account_filter.is_empty() && !self.options.account_filter.contains(account)
        {
            debug!(account, "account filtered out of this run");
            return PassOutcome::Filtered;
        }

        let record = self.state.ensure_account(account);
        if !record.enabled {
            warn!(account, "account is disabled");
            return PassOutcome::Disabled;
        }
        let now = Utc::now().timestamp();
        if !throttle::is_due(&record, now, self.options.min_interval) {
            let wait = throttle::due_in(&record, now, self.options.min_interval);
            info!(account, wait_secs = wait, "account not due yet");
            return PassOutcome::NotDue;
        }

        match self.login(account, secret).await {
            LoginFlow::Success => {}
            LoginFlow::Rejected(status) => {
                warn!(account, %status, "credentials rejected, disabling account");
                self.state.disable_account(account, status);
                return PassOutcome::LoginFailed(status);
            }
            LoginFlow::Exhausted(status) => {
                error!(account, %status, "login attempts exhausted");
                self.state.with(|reg| {
                    reg.accounts.entry(account.to_string()).or_default().status = Some(status);
                });
                return PassOutcome::LoginFailed(status);
            }
        }

        let owners = match self
            .provider_call(|| self.info.entitled_owners(account))
            .await
        {
            Ok(owners) => owners,
            Err(err) => {
                error!(account, error = %err, "failed to enumerate entitled owners");
                return PassOutcome::ProviderFailed;
            }
        };
        if owners.is_empty() {
            warn!(account, "no eligible owners, disabling account");
            self.state.disable_account(account, LoginStatus::Ok);
            return PassOutcome::NoOwners;
        }
        info!(account, owners = owners.len(), "entitled owners enumerated");

        let infos = match self.provider_call(|| self.info.owner_info(&owners)).await {
            Ok(infos) => infos,
            Err(err) => {
                error!(account, error = %err, "failed to get owner info");
                return PassOutcome::ProviderFailed;
            }
        };

        let stats = self.schedule_owners(account, infos).await;
        PassOutcome::Completed(stats)
    }

    /// Lock eligible owners, schedule fetch jobs for versions not yet
    /// stored, join them, and advance the account timestamp when no
    /// candidate was lost to cross-pass lock contention.
    async fn schedule_owners(
        &self,
        account: &str,
        infos: BTreeMap<OwnerId, OwnerInfo>,
    ) -> PassStats {
        let mut stats = PassStats::default();
        let mut skipped_locked = false;
        let mut handles = Vec::new();

        'owners: for (owner, owner_info) in infos {
            if !self.options.owner_filter.is_empty() && !self.options.owner_filter.contains(&owner)
            {
                continue;
            }
            if !owner_info.is_eligible() {
                debug!(owner, kind = %owner_info.kind, "owner kind not eligible");
                continue;
            }
            if !owner_info.has_public_artifact() {
                continue;
            }

            // Reserve every artifact in one step so partial-owner races stay
            // visible to other passes.
            let artifact_ids: Vec<_> = owner_info.artifacts.keys().copied().collect();
            let locked = self
                .state
                .with(|reg| reg.locks.lock_owner(owner, artifact_ids.iter().copied()));
            if !locked {
                debug!(owner, "owner locked by another pass, skipping");
                skipped_locked = true;
                continue;
            }
            debug!(owner, "owner locked");
            self.state.record_owner(account, owner);

            // Artifacts without a public version hold no work; release them
            // right away so only real candidates keep the owner locked.
            let mut candidates = Vec::new();
            for (artifact, public) in &owner_info.artifacts {
                match public {
                    Some(gid) => candidates.push((*artifact, gid.clone())),
                    None => self.release(owner, *artifact),
                }
            }

            for (idx, (artifact, gid)) in candidates.iter().enumerate() {
                let (artifact, gid) = (*artifact, gid.clone());

                if self.shutdown.load(Ordering::Relaxed) {
                    for (rest, _) in &candidates[idx..] {
                        self.release(owner, *rest);
                    }
                    continue 'owners;
                }

                match self.store.exists(artifact, &gid).await {
                    Ok(true) => {
                        info!(artifact, gid = %gid, "already got the version");
                        self.release(owner, artifact);
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        // The put's own tag check is the backstop.
                        warn!(artifact, error = %format!("{err:#}"), "existence check failed");
                    }
                }

                stats.scheduled += 1;
                let ctx = JobContext {
                    transport: Arc::clone(&self.transport),
                    store: Arc::clone(&self.store),
                    state: Arc::clone(&self.state),
                    account: account.to_string(),
                    max_attempts: self.options.max_attempts,
                    fatal_patterns: Arc::clone(&self.options.fatal_patterns),
                    shutdown: Arc::clone(&self.shutdown),
                };
                let slots = Arc::clone(&self.job_slots);
                let fetch = FetchJob { owner, artifact, gid };
                handles.push(tokio::spawn(async move {
                    // Excess candidates wait for a slot; they are never dropped.
                    let Ok(_permit) = slots.acquire_owned().await else {
                        return job::abandon(&ctx, &fetch);
                    };
                    job::run(&ctx, &fetch).await
                }));
            }
        }

        for handle in futures::future::join_all(handles).await {
            match handle {
                Ok(JobOutcome::Succeeded) => stats.succeeded += 1,
                Ok(JobOutcome::AlreadyStored) => stats.already_stored += 1,
                Ok(JobOutcome::RetryExhausted { .. }) => stats.retry_exhausted += 1,
                Ok(JobOutcome::Fatal { .. }) => stats.fatal += 1,
                Ok(JobOutcome::Abandoned) => stats.abandoned += 1,
                Err(err) => {
                    error!(account, error = %err, "fetch job task failed");
                    stats.fatal += 1;
                }
            }
        }

        let interrupted = self.shutdown.load(Ordering::Relaxed);
        if !skipped_locked && !interrupted {
            self.state.with(|reg| {
                let record = reg.accounts.entry(account.to_string()).or_default();
                record.last_update = Utc::now().timestamp();
                record.status = Some(LoginStatus::Ok);
            });
        } else {
            debug!(
                account,
                skipped_locked, interrupted, "pass incomplete, not advancing account timestamp"
            );
        }

        info!(
            account,
            scheduled = stats.scheduled,
            succeeded = stats.succeeded,
            already_stored = stats.already_stored,
            retry_exhausted = stats.retry_exhausted,
            fatal = stats.fatal,
            "account pass finished"
        );
        stats
    }

    fn release(&self, owner: OwnerId, artifact: ArtifactId) {
        let owner_unlocked = self.state.with(|reg| reg.locks.unlock(owner, artifact));
        if owner_unlocked {
            debug!(owner, "owner unlocked");
        }
    }

    /// Relogin, then fresh logins with linearly increasing waits. Rate
    /// limits sleep until the provider-supplied reset when one is known.
    async fn login(&self, account: &str, secret: &str) -> LoginFlow {
        info!(account, "logging in");
        let base = self.options.login_base_wait;

        match tokio::time::timeout(PROVIDER_CALL_TIMEOUT, self.session.relogin(account)).await {
            Ok(LoginStatus::Ok) => {
                info!(account, "session resumed");
                return LoginFlow::Success;
            }
            Ok(LoginStatus::RateLimited) => {
                let wait = rate_limit_wait(self.session.rate_limit_reset(), base, 0);
                warn!(account, wait_secs = wait.as_secs(), "relogin rate limited");
                tokio::time::sleep(wait).await;
            }
            Ok(status) => {
                debug!(account, %status, "relogin failed, logging in fresh");
            }
            Err(_) => {
                warn!(account, "relogin timed out, logging in fresh");
            }
        }

        let mut last_status = LoginStatus::Unknown;
        for attempt in 0..self.options.max_attempts {
            let result =
                tokio::time::timeout(PROVIDER_CALL_TIMEOUT, self.session.login(account, secret))
                    .await;
            match result {
                Ok(LoginStatus::Ok) => {
                    info!(account, "login successful");
                    return LoginFlow::Success;
                }
                Ok(status) if status.is_permanent_rejection() => {
                    return LoginFlow::Rejected(status);
                }
                Ok(LoginStatus::RateLimited) => {
                    last_status = LoginStatus::RateLimited;
                    let wait = rate_limit_wait(self.session.rate_limit_reset(), base, attempt);
                    warn!(account, attempt, wait_secs = wait.as_secs(), "login rate limited");
                    tokio::time::sleep(wait).await;
                }
                Ok(status) => {
                    last_status = status;
                    let wait = login_backoff(base, attempt);
                    warn!(account, attempt, %status, wait_secs = wait.as_secs(), "login failed");
                    tokio::time::sleep(wait).await;
                }
                Err(_) => {
                    last_status = LoginStatus::Unknown;
                    let wait = login_backoff(base, attempt);
                    warn!(account, attempt, wait_secs = wait.as_secs(), "login timed out");
                    tokio::time::sleep(wait).await;
                }
            }
        }
        LoginFlow::Exhausted(last_status)
    }

    /// Run a provider call with the standard deadline, retrying transient
    /// failures up to the attempt ceiling.
    async fn provider_call<T, F, Fut>(&self, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = match tokio::time::timeout(PROVIDER_CALL_TIMEOUT, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout("provider call exceeded deadline")),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) => match decide(attempts, self.options.max_attempts, classify(&err)) {
                    Decision::Retry => {
                        debug!(attempt = attempts, error = %err, "transient provider failure, retrying");
                    }
                    Decision::Abandon => return Err(err),
                },
            }
        }
    }
}
