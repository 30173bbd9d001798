use std::collections::{BTreeMap, BTreeSet};

use crate::provider::{ArtifactId, OwnerId};

/// In-memory map of owners with fetch work in flight.
///
/// An owner is locked iff its entry is non-empty; the entry is removed the
/// instant its last artifact is released, which pollers observe as "owner
/// unlocked". This is plain data — mutual exclusion comes from the shared
/// state mutex in [`crate::state`], which owns the table.
#[derive(Debug, Default)]
pub struct LockTable {
    in_flight: BTreeMap<OwnerId, BTreeSet<ArtifactId>>,
}

impl LockTable {
    pub fn is_locked(&self, owner: OwnerId) -> bool {
        self.in_flight.contains_key(&owner)
    }

    /// Reserve every artifact of an owner in one step.
    ///
    /// Returns `false` without touching the table if the owner is already
    /// locked — the caller must skip the owner, not queue behind it.
    pub fn lock_owner(
        &mut self,
        owner: OwnerId,
        artifacts: impl IntoIterator<Item = ArtifactId>,
    ) -> bool {
        if self.is_locked(owner) {
            return false;
        }
        let set: BTreeSet<ArtifactId> = artifacts.into_iter().collect();
        if set.is_empty() {
            return true;
        }
        self.in_flight.insert(owner, set);
        true
    }

    /// Add a single artifact to `owner`'s in-flight set.
    ///
    /// Returns `false` if the artifact is already a member.
    pub fn try_lock(&mut self, owner: OwnerId, artifact: ArtifactId) -> bool {
        self.in_flight.entry(owner).or_default().insert(artifact)
    }

    /// Release an artifact; returns `true` if this unlocked the owner.
    pub fn unlock(&mut self, owner: OwnerId, artifact: ArtifactId) -> bool {
        let Some(set) = self.in_flight.get_mut(&owner) else {
            return false;
        };
        set.remove(&artifact);
        if set.is_empty() {
            self.in_flight.remove(&owner);
            return true;
        }
        false
    }

    /// Owners currently holding at least one in-flight artifact.
    pub fn locked_owners(&self) -> Vec<OwnerId> {
        self.in_flight.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_excludes_duplicates_until_unlocked() {
        let mut table = LockTable::default();
        assert!(table.try_lock(100, 1));
        assert!(!table.try_lock(100, 1));
        assert!(table.try_lock(100, 2));

        table.unlock(100, 1);
        assert!(table.try_lock(100, 1));
    }

    #[test]
    fn owner_unlocks_when_last_artifact_releases() {
        let mut table = LockTable::default();
        assert!(table.lock_owner(100, [1, 2]));
        assert!(table.is_locked(100));

        assert!(!table.unlock(100, 1));
        assert!(table.is_locked(100));

        assert!(table.unlock(100, 2));
        assert!(!table.is_locked(100));
        assert!(table.is_empty());
    }

    #[test]
    fn lock_owner_refuses_locked_owner() {
        let mut table = LockTable::default();
        assert!(table.lock_owner(100, [1]));
        assert!(!table.lock_owner(100, [2]));
        // The losing caller must not have altered the winner's reservation.
        assert!(!table.try_lock(100, 1));
        assert!(table.try_lock(100, 2));
    }

    #[test]
    fn lock_owner_with_no_artifacts_leaves_owner_unlocked() {
        let mut table = LockTable::default();
        assert!(table.lock_owner(100, []));
        assert!(!table.is_locked(100));
    }

    #[test]
    fn unlock_of_unknown_owner_is_a_no_op() {
        let mut table = LockTable::default();
        assert!(!table.unlock(999, 1));
    }

    #[test]
    fn locked_owners_reports_only_live_entries() {
        let mut table = LockTable::default();
        table.lock_owner(100, [1]);
        table.lock_owner(200, [5]);
        assert_eq!(table.locked_owners(), vec![100, 200]);

        table.unlock(100, 1);
        assert_eq!(table.locked_owners(), vec![200]);
    }
}
