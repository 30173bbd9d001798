use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Commit authorship attached to adopted external versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: Option<String>,
}

/// Result of an atomic tag creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    Created,
    /// The tag already existed — a concurrent (or earlier) writer won.
    Exists,
}

/// Result of committing staged files and tagging the commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { commit: String },
    /// Tag creation lost the race; the commit (if any) stays on the branch.
    TagExists,
}

/// Version-control collaborator over the `git` CLI.
///
/// One repository at `root`; each owner gets a branch named after its id,
/// checked out as a worktree. Tags are repo-global and provide the atomic
/// existence check for stored versions.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

/// Bound on the introducing-author history walk. Git history is acyclic,
/// but owner branches can grow one commit per version for years.
pub const AUTHOR_WALK_LIMIT: usize = 10_000;

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Initialize the repository if `root` is not one yet, and make sure the
    /// base branch exists at the root commit. Idempotent.
    pub async fn ensure_initialized(&self, base_branch: &str) -> Result<()> {
        if !self.root.join(".git").exists() {
            tokio::fs::create_dir_all(&self.root)
                .await
                .with_context(|| format!("creating archive root {}", self.root.display()))?;
            self.run(&self.root, &["init", "-b", "main"]).await?;
            self.run(
                &self.root,
                &[
                    "-c",
                    "user.name=manifest-mirror",
                    "-c",
                    "user.email=manifest-mirror@localhost",
                    "commit",
                    "--allow-empty",
                    "-m",
                    "init archive",
                ],
            )
            .await?;
            info!(root = %self.root.display(), "initialized archive repository");
        }

        if !self.has_branch(base_branch).await? {
            let root_commit = self.root_commit("HEAD").await?;
            self.run(&self.root, &["branch", base_branch, &root_commit]).await?;
            debug!(branch = base_branch, commit = %root_commit, "created base branch");
        }
        Ok(())
    }

    pub async fn has_branch(&self, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{name}");
        let output = self
            .output(&self.root, &["show-ref", "--verify", "--quiet", &refname])
            .await?;
        Ok(output.status.success())
    }

    /// First root commit reachable from `refname`.
    pub async fn root_commit(&self, refname: &str) -> Result<String> {
        let out = self
            .run(&self.root, &["rev-list", "--max-parents=0", refname])
            .await?;
        out.lines()
            .next()
            .map(str::to_string)
            .with_context(|| format!("no root commit reachable from {refname}"))
    }

    /// Registered worktrees: branch name → checkout path.
    pub async fn worktrees(&self) -> Result<BTreeMap<String, PathBuf>> {
        let out = self.run(&self.root, &["worktree", "list", "--porcelain"]).await?;
        let mut map = BTreeMap::new();
        let mut current_path: Option<PathBuf> = None;
        for line in out.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                if let Some(path) = current_path.take() {
                    map.insert(branch.to_string(), path);
                }
            }
        }
        Ok(map)
    }

    /// Make sure `branch` is checked out as a worktree at `path`.
    ///
    /// Creation order mirrors how owner branches come into being: an
    /// existing remote branch is fetched and continued; otherwise the branch
    /// starts from `base`. Idempotent when the worktree is already attached.
    pub async fn ensure_worktree(
        &self,
        branch: &str,
        path: &Path,
        base: &str,
        remote_heads: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.worktrees().await?.contains_key(branch) {
            return Ok(());
        }

        let path_str = path.to_string_lossy().into_owned();
        if self.has_branch(branch).await? {
            self.run(&self.root, &["worktree", "add", &path_str, branch]).await?;
        } else if remote_heads.contains_key(branch) {
            let tracking = format!("origin_{branch}");
            if !self.has_branch(&tracking).await? {
                let refspec = format!("{branch}:{tracking}");
                self.run(&self.root, &["fetch", "origin", &refspec]).await?;
            }
            self.run(&self.root, &["worktree", "add", "-b", branch, &path_str, &tracking])
                .await?;
        } else {
            self.run(&self.root, &["worktree", "add", "-b", branch, &path_str, base])
                .await?;
        }
        debug!(branch, path = %path.display(), "attached worktree");
        Ok(())
    }

    /// Remote branch heads: name → commit. Empty (with a warning) when no
    /// remote is configured — local-only archives are valid.
    pub async fn list_remote_heads(&self) -> Result<BTreeMap<String, String>> {
        let output = self
            .output(&self.root, &["ls-remote", "--heads", "origin"])
            .await?;
        if !output.status.success() {
            warn!("ls-remote --heads failed (no origin remote?), assuming no remote branches");
            return Ok(BTreeMap::new());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut heads = BTreeMap::new();
        for line in stdout.lines() {
            if let Some((sha, refname)) = line.split_once('\t') {
                if let Some(name) = refname.strip_prefix("refs/heads/") {
                    heads.insert(name.to_string(), sha.to_string());
                }
            }
        }
        Ok(heads)
    }

    /// Remote tag names. Empty (with a warning) when no remote is configured.
    pub async fn list_remote_tags(&self) -> Result<BTreeSet<String>> {
        let output = self
            .output(&self.root, &["ls-remote", "--tags", "origin"])
            .await?;
        if !output.status.success() {
            warn!("ls-remote --tags failed (no origin remote?), assuming no remote tags");
            return Ok(BTreeSet::new());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut tags = BTreeSet::new();
        for line in stdout.lines() {
            if let Some((_, refname)) = line.split_once('\t') {
                if let Some(name) = refname.strip_prefix("refs/tags/") {
                    // Skip peeled entries for annotated tags.
                    if let Some(plain) = name.strip_suffix("^{}") {
                        tags.insert(plain.to_string());
                    } else {
                        tags.insert(name.to_string());
                    }
                }
            }
        }
        Ok(tags)
    }

    pub async fn list_local_tags(&self) -> Result<BTreeSet<String>> {
        let out = self.run(&self.root, &["tag", "--list"]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub async fn local_branches(&self) -> Result<Vec<String>> {
        let out = self
            .run(
                &self.root,
                &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
            )
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub async fn branch_head(&self, branch: &str) -> Result<Option<String>> {
        let refname = format!("refs/heads/{branch}");
        let output = self
            .output(&self.root, &["rev-parse", "--verify", "--quiet", &refname])
            .await?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Create `tag`, optionally at an explicit commit. Tag creation is the
    /// atomic idempotency point: losing the race reports `Exists`.
    pub async fn create_tag(
        &self,
        cwd: &Path,
        tag: &str,
        target: Option<&str>,
    ) -> Result<TagOutcome> {
        let mut args = vec!["tag", tag];
        if let Some(commit) = target {
            args.push(commit);
        }
        let output = self.output(cwd, &args).await?;
        if output.status.success() {
            return Ok(TagOutcome::Created);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists") {
            return Ok(TagOutcome::Exists);
        }
        anyhow::bail!("git tag {tag} failed: {}", stderr.trim());
    }

    /// Stage removals and additions in `worktree`, commit with `message`,
    /// and tag the commit. When nothing is staged (content already on the
    /// branch) the branch head is tagged instead of creating an empty commit.
    pub async fn commit_and_tag(
        &self,
        worktree: &Path,
        add: &[String],
        remove: &[String],
        tag: &str,
        message: &str,
        author: Option<&CommitAuthor>,
    ) -> Result<CommitOutcome> {
        if !remove.is_empty() {
            let mut args = vec!["rm", "-q", "--ignore-unmatch", "--"];
            args.extend(remove.iter().map(String::as_str));
            self.run(worktree, &args).await?;
        }
        if !add.is_empty() {
            let mut args = vec!["add", "--"];
            args.extend(add.iter().map(String::as_str));
            self.run(worktree, &args).await?;
        }

        let mut args: Vec<String> = Vec::new();
        if let Some(author) = author {
            args.push("-c".into());
            args.push(format!("user.name={}", author.name));
            if let Some(email) = &author.email {
                args.push("-c".into());
                args.push(format!("user.email={email}"));
            }
        }
        args.extend(["commit".into(), "-m".into(), message.into()]);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.output(worktree, &arg_refs).await?;

        let commit = if output.status.success() {
            self.run(worktree, &["rev-parse", "HEAD"]).await?
        } else {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
                // Content already committed on the branch; just tag the head.
                self.run(worktree, &["rev-parse", "HEAD"]).await?
            } else {
                anyhow::bail!("git commit failed: {}{}", stdout.trim(), stderr.trim());
            }
        };

        match self.create_tag(worktree, tag, Some(&commit)).await? {
            TagOutcome::Created => Ok(CommitOutcome::Committed { commit }),
            TagOutcome::Exists => Ok(CommitOutcome::TagExists),
        }
    }

    /// Delete a tag if it exists.
    pub async fn delete_tag(&self, tag: &str) -> Result<()> {
        let output = self.output(&self.root, &["tag", "-d", tag]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("not found") {
                anyhow::bail!("git tag -d {tag} failed: {}", stderr.trim());
            }
        }
        Ok(())
    }

    /// Latest commit on `branch` that touched `file`, if any.
    pub async fn file_commit(
        &self,
        worktree: &Path,
        branch: &str,
        file: &str,
    ) -> Result<Option<String>> {
        let output = self
            .output(worktree, &["rev-list", "-1", branch, "--", file])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git rev-list failed for {file}: {}", stderr.trim());
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!sha.is_empty()).then_some(sha))
    }

    /// Author of the commit that introduced `file`: a bounded first-parent
    /// traversal from the worktree head, oldest matching commit wins.
    pub async fn introducing_author(
        &self,
        worktree: &Path,
        file: &str,
    ) -> Result<Option<CommitAuthor>> {
        let limit = AUTHOR_WALK_LIMIT.to_string();
        let out = self
            .run(
                worktree,
                &["rev-list", "--first-parent", "-n", &limit, "HEAD", "--", file],
            )
            .await?;
        let Some(oldest) = out.lines().last().filter(|line| !line.is_empty()) else {
            return Ok(None);
        };
        let formatted = self
            .run(worktree, &["show", "-s", "--format=%an%x00%ae", oldest])
            .await?;
        let mut parts = formatted.splitn(2, '\0');
        let name = parts.next().unwrap_or_default().trim().to_string();
        if name.is_empty() {
            return Ok(None);
        }
        let email = parts
            .next()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());
        Ok(Some(CommitAuthor { name, email }))
    }

    pub async fn push_ref(&self, refname: &str) -> Result<()> {
        self.run(&self.root, &["push", "origin", refname]).await?;
        Ok(())
    }

    /// Run git and return trimmed stdout; a non-zero exit is an error.
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let output = self.output(cwd, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn output(&self, cwd: &Path, args: &[&str]) -> Result<std::process::Output> {
        tokio::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .with_context(|| format!("running git {}", args.join(" ")))
    }
}
