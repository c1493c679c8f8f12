//! Git fetcher for cloning repositories and exporting commit snapshots.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use chrono::DateTime;

use super::RepoSpec;
use crate::fetch::{FetchedTree, VersionControl};
use crate::fs::{PathLock, is_process_alive};
use crate::ledger::RevisionInfo;

const GIT_ENV_OVERRIDES: [&str; 4] = [
    "GIT_DIR",
    "GIT_WORK_TREE",
    "GIT_INDEX_FILE",
    "GIT_COMMON_DIR",
];

/// Bare clones share refs across environments of a project; fetches into the
/// same clone are serialized by this lock.
const REPO_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Fetches git repositories into a bare-clone cache and exports commits.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    state_dir: PathBuf,
}

impl GitFetcher {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    /// Ensure git version is 2.17+ (required for `worktree prune` on removed trees).
    pub fn ensure_git_version() -> anyhow::Result<()> {
        let output = Self::git()
            .arg("--version")
            .output()
            .context("Failed to invoke git --version")?;
        if !output.status.success() {
            anyhow::bail!("Failed to run git --version");
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout
            .split_whitespace()
            .nth(2)
            .ok_or_else(|| anyhow::anyhow!("Unexpected git version output: {}", stdout))?;
        let mut parts = version.split('.');
        let major: u32 = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("Invalid git version: {}", version))?
            .parse()?;
        let minor: u32 = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("Invalid git version: {}", version))?
            .parse()?;
        if major > 2 || (major == 2 && minor >= 17) {
            return Ok(());
        }
        anyhow::bail!("Git 2.17+ is required. Please upgrade git.");
    }

    /// Snapshot directory of a commit.
    pub fn snapshot_dir(&self, commit: &str) -> PathBuf {
        self.state_dir.join("cache").join("trees").join(commit)
    }

    /// Fetch `revision` (or the tip of `default_branch`) and export it.
    pub fn fetch_revision(
        &self,
        spec: &RepoSpec,
        revision: Option<&str>,
        default_branch: &str,
    ) -> anyhow::Result<FetchedTree> {
        Self::ensure_git_version()?;

        let bare_dir = spec.bare_repo_dir(&self.state_dir);
        let lock = PathLock::new(bare_dir.with_extension("lock"));
        let _guard = lock
            .acquire_within("git fetch", REPO_LOCK_TIMEOUT)
            .with_context(|| format!("Failed to lock git cache for {}", spec.url))?;

        self.ensure_bare_repo(spec, &bare_dir)?;
        let reference = revision.unwrap_or(default_branch);
        let commit = self.resolve_commit(&bare_dir, reference)?;
        let tree = self.export_commit(&bare_dir, &commit)?;
        let mut info = Self::commit_info(&bare_dir, &commit)?;
        info.requested = revision.map(str::to_string);

        tracing::debug!(repo = %spec.url, reference, commit = %commit, "fetched revision");
        Ok(FetchedTree {
            tree,
            revision: info,
        })
    }

    /// Clone the bare repository, or refresh its branches and tags.
    fn ensure_bare_repo(&self, spec: &RepoSpec, bare_dir: &Path) -> anyhow::Result<()> {
        if bare_dir.exists() {
            return Self::run_git(
                Some(bare_dir),
                &[
                    "fetch",
                    "--prune",
                    "origin",
                    "+refs/heads/*:refs/heads/*",
                    "+refs/tags/*:refs/tags/*",
                ],
            )
            .with_context(|| format!("Failed to update repository {}", spec.url));
        }

        std::fs::create_dir_all(
            bare_dir
                .parent()
                .ok_or_else(|| anyhow::anyhow!("Bare repo directory has no parent"))?,
        )
        .with_context(|| {
            format!(
                "Failed to create git cache directory: {}",
                bare_dir.display()
            )
        })?;

        Self::run_git(
            None,
            &[
                "clone",
                "--bare",
                &spec.url,
                bare_dir
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("Invalid bare repo dir"))?,
            ],
        )
        .with_context(|| format!("Failed to clone repository {}", spec.url))
    }

    /// Resolve a branch, tag or commit to a full SHA, fetching it if unknown.
    fn resolve_commit(&self, bare_dir: &Path, reference: &str) -> anyhow::Result<String> {
        if let Ok(commit) = Self::git_rev_parse(bare_dir, &format!("{}^{{commit}}", reference)) {
            return Ok(commit);
        }
        Self::run_git(Some(bare_dir), &["fetch", "origin", reference])
            .with_context(|| format!("Unknown revision '{}'", reference))?;
        Self::git_rev_parse(bare_dir, "FETCH_HEAD^{commit}")
            .with_context(|| format!("Unknown revision '{}'", reference))
    }

    /// Export a commit into the snapshot cache. Existing snapshots are reused.
    fn export_commit(&self, bare_dir: &Path, commit: &str) -> anyhow::Result<PathBuf> {
        let snapshot = self.snapshot_dir(commit);
        if snapshot.is_dir() {
            return Ok(snapshot);
        }

        let worktree_dir = self.unique_temp_worktree_dir()?;
        Self::run_git(
            Some(bare_dir),
            &[
                "worktree",
                "add",
                "--detach",
                worktree_dir
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("Invalid worktree dir"))?,
                commit,
            ],
        )?;

        // Detach the checkout from the repository, then move it into the cache.
        let result = (|| -> anyhow::Result<()> {
            std::fs::remove_file(worktree_dir.join(".git")).with_context(|| {
                format!("Failed to detach worktree: {}", worktree_dir.display())
            })?;
            let parent = snapshot
                .parent()
                .ok_or_else(|| anyhow::anyhow!("Snapshot directory has no parent"))?;
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create snapshot cache: {}", parent.display())
            })?;
            std::fs::rename(&worktree_dir, &snapshot).with_context(|| {
                format!("Failed to store snapshot: {}", snapshot.display())
            })
        })();

        if result.is_err() {
            let _ = std::fs::remove_dir_all(&worktree_dir);
        }
        Self::run_git(Some(bare_dir), &["worktree", "prune"])?;
        result.map(|()| snapshot)
    }

    fn commit_info(bare_dir: &Path, commit: &str) -> anyhow::Result<RevisionInfo> {
        let repo = git2::Repository::open_bare(bare_dir)
            .with_context(|| format!("Failed to open repository: {}", bare_dir.display()))?;
        let oid = git2::Oid::from_str(commit)?;
        let found = repo
            .find_commit(oid)
            .with_context(|| format!("Commit {} not found", commit))?;
        let author = found.author();
        let author = match (author.name(), author.email()) {
            (Some(name), Some(email)) => format!("{} <{}>", name, email),
            (Some(name), None) => name.to_string(),
            (None, Some(email)) => email.to_string(),
            (None, None) => String::new(),
        };

        Ok(RevisionInfo {
            requested: None,
            commit: commit.to_string(),
            message: found.summary().unwrap_or_default().to_string(),
            author,
            committed_at: DateTime::from_timestamp(found.time().seconds(), 0),
        })
    }

    /// Create a unique temporary worktree directory.
    fn unique_temp_worktree_dir(&self) -> anyhow::Result<PathBuf> {
        let worktree_base = self.state_dir.join("worktrees");
        std::fs::create_dir_all(&worktree_base).with_context(|| {
            format!(
                "Failed to create worktrees directory: {}",
                worktree_base.display()
            )
        })?;
        Self::clean_stale_worktrees(&worktree_base)?;

        for attempt in 0..100 {
            let thread_id = format!("{:?}", std::thread::current().id());
            let name = format!("{}.{}.{}", std::process::id(), thread_id, attempt);
            let candidate = worktree_base.join(name);
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        anyhow::bail!(
            "Failed to allocate a temp worktree directory in {}",
            worktree_base.display()
        );
    }

    /// Remove worktrees left behind by dead processes.
    fn clean_stale_worktrees(base: &Path) -> anyhow::Result<()> {
        let current_pid = std::process::id();
        for entry in std::fs::read_dir(base)? {
            let entry = entry?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if let Some(pid_str) = name_str.split('.').next()
                && let Ok(pid) = pid_str.parse::<u32>()
                && pid != current_pid
                && !is_process_alive(pid)
            {
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
        Ok(())
    }

    fn git() -> Command {
        let mut cmd = Command::new("git");
        for key in GIT_ENV_OVERRIDES {
            cmd.env_remove(key);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    /// Run a git command.
    fn run_git(cwd: Option<&Path>, args: &[&str]) -> anyhow::Result<()> {
        let mut cmd = Self::git();
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .with_context(|| format!("Failed to run git {:?}", args))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Git command failed {:?}: {}", args, stderr.trim());
        }
        Ok(())
    }

    /// Run git rev-parse and return the result.
    fn git_rev_parse(cwd: &Path, rev: &str) -> anyhow::Result<String> {
        let output = Self::git()
            .args(["rev-parse", "--verify", "--quiet", rev])
            .current_dir(cwd)
            .output()
            .with_context(|| format!("Failed to run git rev-parse {}", rev))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git rev-parse {} failed: {}", rev, stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl VersionControl for GitFetcher {
    fn fetch(
        &self,
        remote: &str,
        revision: Option<&str>,
        default_branch: &str,
    ) -> anyhow::Result<FetchedTree> {
        let spec = RepoSpec::parse(remote)?;
        self.fetch_revision(&spec, revision, default_branch)
    }
}
