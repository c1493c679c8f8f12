//! Repository locator types.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A source repository, as registered for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
    /// Clone URL or local path (e.g., "git@github.com:org/app.git")
    pub url: String,
}

impl RepoSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Parse a repository locator.
    ///
    /// Supports formats:
    /// - `git:https://github.com/org/repo`
    /// - `github:org/repo`
    /// - plain URLs, scp-style `user@host:path` and local paths
    pub fn parse(source: &str) -> anyhow::Result<Self> {
        let raw = source.trim();
        let raw = raw.strip_prefix("git:").unwrap_or(raw);
        if raw.is_empty() {
            anyhow::bail!("Repository locator is empty");
        }
        if let Some(shorthand) = raw.strip_prefix("github:") {
            let shorthand = shorthand.trim_end_matches(".git");
            if shorthand.split('/').filter(|s| !s.is_empty()).count() != 2 {
                anyhow::bail!("GitHub shorthand must be 'github:org/repo', got '{}'", source);
            }
            return Ok(Self::new(format!("https://github.com/{}.git", shorthand)));
        }
        if raw.contains("://") {
            url::Url::parse(raw)
                .map_err(|e| anyhow::anyhow!("Invalid repository URL '{}': {}", raw, e))?;
        }
        Ok(Self::new(raw))
    }

    /// Compute the bare repo directory path for this repository.
    pub fn bare_repo_dir(&self, state_dir: &Path) -> PathBuf {
        let hash = blake3::hash(self.url.as_bytes()).to_hex().to_string();
        state_dir.join("git").join(format!("{}.git", hash))
    }
}
