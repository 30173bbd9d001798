use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, trace, warn};

use crate::error::MirrorError;
use crate::normalize::ManifestBlob;
use crate::provider::{ArtifactId, OwnerId, Transport};
use crate::retry::{Classification, Decision, classify_with_patterns, decide};
use crate::state::SharedState;
use crate::store::{ArtifactStore, PutOutcome};

/// One fetch job for a (owner, artifact, version) triple. Ephemeral; never
/// persisted.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub owner: OwnerId,
    pub artifact: ArtifactId,
    pub gid: String,
}

/// Terminal state of a job.
///
/// The lifecycle is pending → running → terminal; a transient failure loops
/// back to pending while attempts remain, with `attempt` counting the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Fetched (or adopted from disk) and committed.
    Succeeded,
    /// The version's tag already existed; nothing to do.
    AlreadyStored,
    /// Transient failures used up every attempt. Terminal, reported like a
    /// fatal failure.
    RetryExhausted { code: String },
    /// Non-retryable failure.
    Fatal { reason: String },
    /// The run was interrupted; no further attempts were made.
    Abandoned,
}

/// Everything a job needs, shared across all jobs of a run.
pub struct JobContext {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<ArtifactStore>,
    pub state: Arc<SharedState>,
    pub account: String,
    pub max_attempts: u32,
    pub fatal_patterns: Arc<Vec<String>>,
    pub shutdown: Arc<AtomicBool>,
}

/// Release a job's reservation without running it. Used when the run is
/// torn down before the job got a concurrency slot.
pub fn abandon(ctx: &JobContext, job: &FetchJob) -> JobOutcome {
    let owner_unlocked = ctx.state.with(|reg| reg.locks.unlock(job.owner, job.artifact));
    if owner_unlocked {
        debug!(owner = job.owner, "owner unlocked");
    }
    JobOutcome::Abandoned
}

/// Run a fetch job to completion and release its lock.
///
/// The lock release, ownership recording, and (on success) version-registry
/// update happen in one critical section, whatever the outcome — a failed
/// fetch must never leave the artifact reserved.
pub async fn run(ctx: &JobContext, job: &FetchJob) -> JobOutcome {
    let outcome = fetch_and_store(ctx, job).await;

    let record_version = matches!(outcome, JobOutcome::Succeeded | JobOutcome::AlreadyStored);
    let owner_unlocked = ctx.state.with(|reg| {
        if record_version {
            reg.versions.insert(job.artifact, job.gid.clone());
        }
        reg.accounts
            .entry(ctx.account.clone())
            .or_default()
            .owners
            .insert(job.owner);
        reg.locks.unlock(job.owner, job.artifact)
    });
    if owner_unlocked {
        debug!(owner = job.owner, "owner unlocked");
    }

    match &outcome {
        JobOutcome::Succeeded => {
            info!(owner = job.owner, artifact = job.artifact, gid = %job.gid, "version mirrored");
        }
        JobOutcome::AlreadyStored => {
            debug!(owner = job.owner, artifact = job.artifact, gid = %job.gid, "already mirrored");
        }
        JobOutcome::RetryExhausted { code } => {
            warn!(
                owner = job.owner,
                artifact = job.artifact,
                gid = %job.gid,
                code,
                "fetch abandoned after exhausting attempts"
            );
        }
        JobOutcome::Fatal { reason } => {
            error!(
                owner = job.owner,
                artifact = job.artifact,
                gid = %job.gid,
                reason,
                "fetch failed"
            );
        }
        JobOutcome::Abandoned => {
            debug!(owner = job.owner, artifact = job.artifact, gid = %job.gid, "fetch abandoned");
        }
    }
    outcome
}

async fn fetch_and_store(ctx: &JobContext, job: &FetchJob) -> JobOutcome {
    // Fast path: the blob file may already sit on the owner branch (e.g. a
    // pass interrupted between commit and tag) — adopt it instead of
    // refetching.
    match ctx.store.adopt_existing(job.owner, job.artifact, &job.gid).await {
        Ok(Some(PutOutcome::Stored { .. })) => return JobOutcome::Succeeded,
        Ok(Some(PutOutcome::AlreadyStored)) => return JobOutcome::AlreadyStored,
        Ok(None) => {}
        Err(err) => {
            warn!(
                owner = job.owner,
                artifact = job.artifact,
                error = %format!("{err:#}"),
                "adopt-existing check failed, fetching fresh"
            );
        }
    }

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        trace!(owner = job.owner, artifact = job.artifact, attempt = attempts, "fetch attempt");
        match attempt_once(ctx, job).await {
            Ok(PutOutcome::Stored { .. }) => return JobOutcome::Succeeded,
            Ok(PutOutcome::AlreadyStored) => return JobOutcome::AlreadyStored,
            Err(err) => {
                let classification = match &err {
                    MirrorError::Provider(provider_err) => {
                        classify_with_patterns(provider_err, &ctx.fatal_patterns)
                    }
                    _ => Classification::Fatal,
                };
                match decide(attempts, ctx.max_attempts, classification) {
                    Decision::Retry => {
                        if ctx.shutdown.load(Ordering::Relaxed) {
                            return JobOutcome::Abandoned;
                        }
                        debug!(
                            owner = job.owner,
                            artifact = job.artifact,
                            attempt = attempts,
                            error = %err,
                            "transient fetch failure, retrying"
                        );
                        // No backoff of our own between fetch attempts; honor
                        // a provider-supplied reset wait, otherwise just yield
                        // so sibling jobs make progress.
                        if let MirrorError::Provider(provider_err) = &err {
                            if let Some(wait) = provider_err.retry_after {
                                tokio::time::sleep(wait).await;
                            }
                        }
                        tokio::task::yield_now().await;
                    }
                    Decision::Abandon => {
                        return match classification {
                            Classification::Retryable => JobOutcome::RetryExhausted {
                                code: match &err {
                                    MirrorError::Provider(provider_err) => {
                                        provider_err.code.clone()
                                    }
                                    _ => "Unknown".to_string(),
                                },
                            },
                            Classification::Fatal => JobOutcome::Fatal { reason: err.to_string() },
                        };
                    }
                }
            }
        }
    }
}

/// One fetch attempt: token, payload, normalize, commit.
async fn attempt_once(ctx: &JobContext, job: &FetchJob) -> Result<PutOutcome, MirrorError> {
    let token = ctx
        .transport
        .version_token(job.owner, job.artifact, &job.gid)
        .await?;
    let fetched = ctx
        .transport
        .fetch_version(job.owner, job.artifact, &job.gid, &token)
        .await?;

    let entries = ManifestBlob::parse_entries(&fetched.payload)?;
    let blob =
        ManifestBlob::build(job.owner, job.artifact, &job.gid, fetched.created_at, entries)?;
    Ok(ctx.store.put(&blob, &fetched.key).await?)
}
