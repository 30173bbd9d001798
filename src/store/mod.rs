pub mod git;

pub use git::{AUTHOR_WALK_LIMIT, CommitAuthor, CommitOutcome, GitRepo, TagOutcome};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::normalize::{ManifestBlob, blob_file_name, version_tag};
use crate::provider::{ArtifactId, OwnerId};

/// Per-owner decryption key registry file, kept in the owner worktree.
const KEYS_FILE: &str = "keys.json";

/// Result of a `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Stored { commit: String },
    /// The tag already existed; callers treat this as success.
    AlreadyStored,
}

/// Result of merging one externally proposed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Adopted {
        artifact: ArtifactId,
        gid: String,
        /// Version id the adoption displaced, if one was recorded.
        superseded: Option<String>,
    },
    /// A different version is recorded and wins under the merge rule.
    KeptExisting { artifact: ArtifactId, gid: String },
    /// The candidate is already the recorded version.
    Unchanged { artifact: ArtifactId },
}

/// An externally proposed version for `merge`.
#[derive(Debug, Clone)]
pub struct CandidateVersion {
    pub blob: ManifestBlob,
    pub key: String,
    pub author: Option<CommitAuthor>,
}

/// Version-addressed, append-only store of fetched manifest versions.
///
/// Backed by one git repository: a branch (and worktree) per owner, one blob
/// file per (artifact, version), and a repo-global tag per stored version as
/// the idempotency marker. Tag listings are cached per run; the cache is
/// invalidated at the start of each full pass.
#[derive(Debug)]
pub struct ArtifactStore {
    repo: GitRepo,
    base_branch: String,
    remove_old: bool,
    default_author: Option<CommitAuthor>,
    tags: Mutex<Option<BTreeSet<String>>>,
    remote_heads: Mutex<Option<BTreeMap<String, String>>>,
    /// Serializes repository mutations (worktree add, stage, commit, tag).
    /// Concurrent jobs would otherwise race on git's own lock files.
    mutate: tokio::sync::Mutex<()>,
}

impl ArtifactStore {
    pub fn new(
        repo: GitRepo,
        base_branch: impl Into<String>,
        remove_old: bool,
        default_author: Option<CommitAuthor>,
    ) -> Self {
        Self {
            repo,
            base_branch: base_branch.into(),
            remove_old,
            default_author,
            tags: Mutex::new(None),
            remote_heads: Mutex::new(None),
            mutate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    pub fn owner_dir(&self, owner: OwnerId) -> PathBuf {
        self.repo.root().join("owners").join(owner.to_string())
    }

    /// Drop the per-run listing caches. Called at the start of each pass.
    pub fn invalidate_caches(&self) {
        *lock(&self.tags) = None;
        *lock(&self.remote_heads) = None;
    }

    /// Whether a tag for this exact (artifact, version) is present locally
    /// or was observed on the last remote tag-listing refresh.
    pub async fn exists(&self, artifact: ArtifactId, gid: &str) -> Result<bool> {
        let tag = version_tag(artifact, gid);
        if let Some(found) = lock(&self.tags).as_ref().map(|set| set.contains(&tag)) {
            return Ok(found);
        }
        self.refresh_tags().await?;
        Ok(lock(&self.tags).as_ref().is_some_and(|set| set.contains(&tag)))
    }

    async fn refresh_tags(&self) -> Result<()> {
        let mut all = self.repo.list_remote_tags().await?;
        all.extend(self.repo.list_local_tags().await?);
        debug!(tags = all.len(), "refreshed tag listing");
        *lock(&self.tags) = Some(all);
        Ok(())
    }

    async fn cached_remote_heads(&self) -> Result<BTreeMap<String, String>> {
        if let Some(heads) = lock(&self.remote_heads).as_ref() {
            return Ok(heads.clone());
        }
        let heads = self.repo.list_remote_heads().await?;
        *lock(&self.remote_heads) = Some(heads.clone());
        Ok(heads)
    }

    fn note_tag(&self, tag: String) {
        if let Some(set) = lock(&self.tags).as_mut() {
            set.insert(tag);
        }
    }

    fn forget_tag(&self, tag: &str) {
        if let Some(set) = lock(&self.tags).as_mut() {
            set.remove(tag);
        }
    }

    /// Make sure the owner's branch is checked out as a worktree and return
    /// its path.
    pub async fn ensure_owner(&self, owner: OwnerId) -> Result<PathBuf> {
        let _guard = self.mutate.lock().await;
        self.ensure_owner_locked(owner).await
    }

    async fn ensure_owner_locked(&self, owner: OwnerId) -> Result<PathBuf> {
        let dir = self.owner_dir(owner);
        let heads = self.cached_remote_heads().await?;
        self.repo
            .ensure_worktree(&owner.to_string(), &dir, &self.base_branch, &heads)
            .await
            .with_context(|| format!("attaching worktree for owner {owner}"))?;
        Ok(dir)
    }

    /// Commit a fetched version into the owner's branch and tag it.
    ///
    /// Idempotent: an existing tag (pre-checked or discovered at tag
    /// creation) yields `AlreadyStored`, never an error.
    pub async fn put(&self, blob: &ManifestBlob, key: &str) -> Result<PutOutcome> {
        self.put_with_author(blob, key, None, false, &[]).await
    }

    async fn put_with_author(
        &self,
        blob: &ManifestBlob,
        key: &str,
        author: Option<&CommitAuthor>,
        overwrite_key: bool,
        extra_remove: &[String],
    ) -> Result<PutOutcome> {
        let owner = blob.metadata.owner;
        let artifact = blob.metadata.artifact;
        let gid = &blob.metadata.gid;
        let tag = blob.tag();

        if self.exists(artifact, gid).await? {
            return Ok(PutOutcome::AlreadyStored);
        }

        let _guard = self.mutate.lock().await;
        let dir = self.ensure_owner_locked(owner).await?;
        let file = blob_file_name(artifact, gid);
        tokio::fs::write(dir.join(&file), blob.to_vec()?)
            .await
            .with_context(|| format!("writing {file}"))?;

        let mut add = vec![file.clone()];
        if update_key_registry(&dir, artifact, key, overwrite_key).await? {
            add.push(KEYS_FILE.to_string());
        }

        let mut remove = extra_remove.to_vec();
        if self.remove_old {
            remove.extend(stale_blob_files(&dir, artifact, gid).await?);
        }

        let author = author.or(self.default_author.as_ref());
        let outcome = self
            .repo
            .commit_and_tag(&dir, &add, &remove, &tag, &format!("Update artifact: {tag}"), author)
            .await?;

        self.note_tag(tag.clone());
        match outcome {
            CommitOutcome::Committed { commit } => {
                info!(owner, artifact, gid = %gid, tag = %tag, "stored version");
                Ok(PutOutcome::Stored { commit })
            }
            CommitOutcome::TagExists => {
                debug!(owner, artifact, gid = %gid, "tag appeared concurrently, treating as stored");
                Ok(PutOutcome::AlreadyStored)
            }
        }
    }

    /// Fast path for a blob file already present in the owner worktree:
    /// resolve the commit that introduced it and tag that commit instead of
    /// refetching. An orphaned file with no commit is deleted so the caller
    /// fetches fresh.
    pub async fn adopt_existing(
        &self,
        owner: OwnerId,
        artifact: ArtifactId,
        gid: &str,
    ) -> Result<Option<PutOutcome>> {
        let _guard = self.mutate.lock().await;
        let dir = self.ensure_owner_locked(owner).await?;
        let file = blob_file_name(artifact, gid);
        if !dir.join(&file).exists() {
            return Ok(None);
        }

        let branch = owner.to_string();
        match self.repo.file_commit(&dir, &branch, &file).await? {
            Some(commit) => {
                let tag = version_tag(artifact, gid);
                let outcome = self.repo.create_tag(&dir, &tag, Some(&commit)).await?;
                self.note_tag(tag);
                debug!(owner, artifact, gid, %commit, "adopted version already on branch");
                Ok(Some(match outcome {
                    TagOutcome::Created => PutOutcome::Stored { commit },
                    TagOutcome::Exists => PutOutcome::AlreadyStored,
                }))
            }
            None => {
                warn!(owner, artifact, gid, "removing orphaned blob file with no commit");
                tokio::fs::remove_file(dir.join(&file))
                    .await
                    .with_context(|| format!("removing orphaned {file}"))?;
                Ok(None)
            }
        }
    }

    /// Merge externally proposed versions into `owner`'s branch.
    ///
    /// A candidate with no recorded version for its artifact is adopted
    /// outright. A differing candidate is adopted only if its creation
    /// timestamp is strictly earlier than the recorded version's — the
    /// version that was live first is authoritative. Adoption deletes the
    /// superseded blob and tag and updates the key registry entry.
    pub async fn merge(
        &self,
        owner: OwnerId,
        candidates: Vec<CandidateVersion>,
    ) -> Result<Vec<MergeOutcome>> {
        let dir = self.ensure_owner(owner).await?;
        let mut outcomes = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let artifact = candidate.blob.metadata.artifact;
            let gid = candidate.blob.metadata.gid.clone();

            let existing = recorded_blob(&dir, artifact).await?;
            let outcome = match existing {
                None => {
                    self.adopt_candidate(owner, &candidate, None).await?;
                    MergeOutcome::Adopted { artifact, gid, superseded: None }
                }
                Some(existing) if existing.metadata.gid == gid => MergeOutcome::Unchanged { artifact },
                Some(existing) => {
                    if candidate.blob.metadata.created_at < existing.metadata.created_at {
                        self.adopt_candidate(owner, &candidate, Some(&existing)).await?;
                        MergeOutcome::Adopted {
                            artifact,
                            gid,
                            superseded: Some(existing.metadata.gid),
                        }
                    } else {
                        MergeOutcome::KeptExisting { artifact, gid: existing.metadata.gid }
                    }
                }
            };
            debug!(owner, artifact, ?outcome, "merge candidate resolved");
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn adopt_candidate(
        &self,
        owner: OwnerId,
        candidate: &CandidateVersion,
        superseded: Option<&ManifestBlob>,
    ) -> Result<()> {
        let artifact = candidate.blob.metadata.artifact;

        // Rebuild the blob under this owner so metadata matches the branch
        // it now lives on.
        let mut blob = candidate.blob.clone();
        blob.metadata.owner = owner;

        // The superseded blob is removed as part of the adoption commit so
        // the branch never carries both versions.
        let mut remove = Vec::new();
        if let Some(old) = superseded {
            let old_tag = version_tag(artifact, &old.metadata.gid);
            {
                let _guard = self.mutate.lock().await;
                self.repo.delete_tag(&old_tag).await?;
            }
            self.forget_tag(&old_tag);
            remove.push(blob_file_name(artifact, &old.metadata.gid));
        }

        let outcome = self
            .put_with_author(&blob, &candidate.key, candidate.author.as_ref(), true, &remove)
            .await?;
        if outcome == PutOutcome::AlreadyStored {
            debug!(owner, artifact, gid = %blob.metadata.gid, "candidate was already stored");
        }
        Ok(())
    }

    /// Parse a directory of proposed versions (blob files + key registry)
    /// into merge candidates. Files without a usable key are skipped.
    /// Authorship comes from the commit that introduced the file in the
    /// candidate checkout, when it is one; bot authors are discarded.
    pub async fn scan_candidates(&self, dir: &Path) -> Result<Vec<CandidateVersion>> {
        let keys = read_key_registry(dir).await?;
        let candidate_repo = GitRepo::new(dir);
        let mut candidates = Vec::new();

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("reading candidate dir {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("manifest") {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let blob = match ManifestBlob::from_slice(&bytes) {
                Ok(blob) => blob,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unparseable candidate");
                    continue;
                }
            };

            let artifact = blob.metadata.artifact;
            let Some(key) = keys.get(&artifact.to_string()).filter(|k| k.len() == 64) else {
                warn!(artifact, path = %path.display(), "skipping candidate without a usable key");
                continue;
            };

            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let author = match candidate_repo.introducing_author(dir, &file_name).await {
                Ok(author) => author.filter(|a| !a.name.ends_with("[bot]")),
                Err(_) => None, // not a git checkout; no authorship to carry
            };

            candidates.push(CandidateVersion {
                blob,
                key: key.clone(),
                author,
            });
        }
        Ok(candidates)
    }

    /// Push owner branches and tags missing from (or stale on) the remote.
    /// Failed pushes are retried once; remaining failures are reported.
    pub async fn push_pending(&self) -> Result<PushSummary> {
        let remote_heads = self.repo.list_remote_heads().await?;
        let remote_tags = self.repo.list_remote_tags().await?;
        let base_root = self.repo.root_commit(&self.base_branch).await?;

        let mut pending: Vec<String> = Vec::new();
        let mut branches = 0usize;
        for branch in self.repo.local_branches().await? {
            if branch.parse::<OwnerId>().is_err() {
                continue;
            }
            let head = self.repo.branch_head(&branch).await?;
            // An owner branch still at the base root commit has no content.
            if head.as_deref() == Some(base_root.as_str()) {
                continue;
            }
            if remote_heads.get(&branch) != head.as_ref() {
                pending.push(branch);
                branches += 1;
            }
        }

        let mut tags = 0usize;
        for tag in self.repo.list_local_tags().await? {
            if !remote_tags.contains(&tag) {
                pending.push(tag);
                tags += 1;
            }
        }

        let mut failed = Vec::new();
        for refname in &pending {
            if let Err(err) = self.repo.push_ref(refname).await {
                warn!(refname, error = %err, "push failed, will retry once");
                failed.push(refname.clone());
            }
        }
        let mut still_failed = Vec::new();
        for refname in failed {
            if let Err(err) = self.repo.push_ref(&refname).await {
                warn!(refname = %refname, error = %err, "push failed again");
                still_failed.push(refname);
            }
        }

        info!(branches, tags, failed = still_failed.len(), "push pass complete");
        Ok(PushSummary { branches, tags, failed: still_failed })
    }
}

/// Outcome of a `push_pending` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSummary {
    pub branches: usize,
    pub tags: usize,
    pub failed: Vec<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn read_key_registry(dir: &Path) -> Result<BTreeMap<String, String>> {
    let path = dir.join(KEYS_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Insert (or, for merges, replace) the key registry entry for an artifact.
/// Returns whether the file changed. Plain `put` never overwrites an
/// existing entry — first key recorded wins.
async fn update_key_registry(
    dir: &Path,
    artifact: ArtifactId,
    key: &str,
    overwrite: bool,
) -> Result<bool> {
    let mut keys = read_key_registry(dir).await?;
    let entry = artifact.to_string();
    let changed = match keys.get(&entry) {
        Some(existing) if !overwrite || existing == key => false,
        _ => {
            keys.insert(entry, key.to_string());
            true
        }
    };
    if changed {
        let bytes = serde_json::to_vec_pretty(&keys).context("serializing key registry")?;
        tokio::fs::write(dir.join(KEYS_FILE), bytes)
            .await
            .context("writing key registry")?;
    }
    Ok(changed)
}

/// Other blob files for the same artifact (different version), as candidates
/// for removal when `remove_old` is set.
async fn stale_blob_files(dir: &Path, artifact: ArtifactId, gid: &str) -> Result<Vec<String>> {
    let keep = blob_file_name(artifact, gid);
    let prefix = format!("{artifact}_");
    let mut stale = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(".manifest") && name != keep {
            stale.push(name);
        }
    }
    Ok(stale)
}

/// The currently recorded blob for an artifact in an owner worktree, if any.
async fn recorded_blob(dir: &Path, artifact: ArtifactId) -> Result<Option<ManifestBlob>> {
    let prefix = format!("{artifact}_");
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || !name.ends_with(".manifest") {
            continue;
        }
        let bytes = tokio::fs::read(entry.path())
            .await
            .with_context(|| format!("reading {name}"))?;
        match ManifestBlob::from_slice(&bytes) {
            Ok(blob) if blob.metadata.artifact == artifact => return Ok(Some(blob)),
            Ok(_) => continue, // prefix collision, e.g. artifact 1 vs 10
            Err(err) => {
                warn!(name, error = %err, "unparseable stored blob, ignoring");
            }
        }
    }
    Ok(None)
}

/// Timestamp helper for tests and merge fixtures.
#[cfg(test)]
pub(crate) fn at(secs: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
