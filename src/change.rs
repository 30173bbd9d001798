use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::provider::{ArtifactId, OwnerId, OwnerInfo, ProductInfo, ProviderError};
use crate::retry::{Decision, classify, decide};
use crate::state::SharedState;

/// Bulk product-info sweeps batch this many owners per call.
pub const INFO_BATCH_SIZE: usize = 300;
/// Deadline per bulk-info call; exceeding it is a retryable timeout.
pub const INFO_TIMEOUT: Duration = Duration::from_secs(60);

/// Which owners changed since the last recorded snapshot, and which
/// accounts therefore need a refresh pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChangeReport {
    pub due_owners: BTreeSet<OwnerId>,
    pub due_accounts: BTreeSet<String>,
}

/// Compare a bulk provider snapshot against the recorded version registry.
///
/// An owner is due when any of its artifacts' current public version id
/// differs from the recorded one. Due accounts are the union of enabled
/// accounts owning a due owner and accounts never seen in state at all.
pub async fn detect(
    info: &dyn ProductInfo,
    state: &SharedState,
    credential_names: &BTreeSet<String>,
    max_attempts: u32,
) -> Result<ChangeReport> {
    let (owner_sets, recorded) = state.with(|reg| {
        let owner_sets: BTreeMap<String, BTreeSet<OwnerId>> = reg
            .accounts
            .iter()
            .filter(|(_, record)| record.enabled)
            .map(|(name, record)| (name.clone(), record.owners.clone()))
            .collect();
        (owner_sets, reg.versions.clone())
    });

    let all_owners: Vec<OwnerId> = owner_sets
        .values()
        .flatten()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let snapshot = bulk_snapshot(info, &all_owners, max_attempts).await;
    info!(owners = all_owners.len(), snapshot = snapshot.len(), "change sweep acquired");

    let mut due_owners = BTreeSet::new();
    for (owner, owner_info) in &snapshot {
        if owner_is_due(owner_info, &recorded) {
            due_owners.insert(*owner);
        }
    }

    let mut due_accounts = BTreeSet::new();
    for (account, owners) in &owner_sets {
        if owners.iter().any(|owner| due_owners.contains(owner)) {
            due_accounts.insert(account.clone());
        }
    }
    // Never-seen accounts are always due on first run.
    let known: BTreeSet<String> = state.with(|reg| reg.accounts.keys().cloned().collect());
    for name in credential_names {
        if !known.contains(name) {
            due_accounts.insert(name.clone());
        }
    }

    info!(
        due_owners = due_owners.len(),
        due_accounts = due_accounts.len(),
        "change detection complete"
    );
    Ok(ChangeReport { due_owners, due_accounts })
}

/// An owner is due when any artifact's current public version differs from
/// the recorded one. Artifacts never recorded don't mark the owner due —
/// they are picked up when the owning account's pass runs anyway.
fn owner_is_due(info: &OwnerInfo, recorded: &BTreeMap<ArtifactId, String>) -> bool {
    info.artifacts.iter().any(|(artifact, public)| {
        match (public, recorded.get(artifact)) {
            (Some(gid), Some(known)) => gid != known,
            _ => false,
        }
    })
}

/// Fetch owner info in batches, retrying each batch on transient failures
/// up to the attempt ceiling. A batch that exhausts its attempts is dropped
/// from the snapshot (its owners simply aren't reported due this sweep).
async fn bulk_snapshot(
    info: &dyn ProductInfo,
    owners: &[OwnerId],
    max_attempts: u32,
) -> BTreeMap<OwnerId, OwnerInfo> {
    let mut snapshot = BTreeMap::new();
    for batch in owners.chunks(INFO_BATCH_SIZE) {
        match fetch_batch(info, batch, max_attempts).await {
            Ok(infos) => snapshot.extend(infos),
            Err(err) => {
                warn!(batch = batch.len(), error = %err, "dropping owner-info batch");
            }
        }
    }
    snapshot
}

async fn fetch_batch(
    info: &dyn ProductInfo,
    batch: &[OwnerId],
    max_attempts: u32,
) -> Result<BTreeMap<OwnerId, OwnerInfo>, ProviderError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let result = match tokio::time::timeout(INFO_TIMEOUT, info.owner_info(batch)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout("bulk owner info call exceeded deadline")),
        };
        match result {
            Ok(infos) => return Ok(infos),
            Err(err) => {
                let classification = classify(&err);
                match decide(attempts, max_attempts, classification) {
                    Decision::Retry => {
                        debug!(attempt = attempts, error = %err, "retrying owner-info batch");
                    }
                    Decision::Abandon => return Err(err),
                }
            }
        }
    }
}
