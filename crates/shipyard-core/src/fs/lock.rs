//! Cross-process advisory locks backed by exclusively-created lock files.
//!
//! A lock is a file created with `O_EXCL`; its body records the holder. The
//! file is removed when the guard drops. A process that dies while holding a
//! lock leaves the file behind; such locks are only reclaimed explicitly via
//! [`PathLock::reclaim_if_stale`].

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Recorded owner of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub token: String,
    pub purpose: String,
    pub acquired_at: DateTime<Utc>,
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid {} ({}) since {}",
            self.pid,
            self.purpose,
            self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

#[derive(Debug, Clone)]
pub struct PathLock {
    path: PathBuf,
}

impl PathLock {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock without waiting.
    ///
    /// Returns `Ok(Err(holder))` when another holder owns it.
    pub fn try_acquire(&self, purpose: &str) -> anyhow::Result<Result<PathLockGuard, LockHolder>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {}", parent.display()))?;
        }

        let holder = LockHolder {
            pid: std::process::id(),
            token: ulid::Ulid::new().to_string(),
            purpose: purpose.to_string(),
            acquired_at: Utc::now(),
        };

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let body = serde_json::to_vec(&holder).context("Failed to serialize lock holder")?;
                file.write_all(&body)
                    .and_then(|_| file.sync_all())
                    .with_context(|| format!("Failed to write lock file: {}", self.path.display()))?;
                Ok(Ok(PathLockGuard {
                    path: self.path.clone(),
                    token: holder.token,
                }))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Ok(Err(self.holder()?.unwrap_or_else(|| unknown_holder(purpose))))
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("Failed to create lock file: {}", self.path.display()))),
        }
    }

    /// Take the lock, polling until `timeout` elapses.
    ///
    /// Blocks the calling thread; async callers run it on the blocking pool.
    pub fn acquire_within(&self, purpose: &str, timeout: Duration) -> anyhow::Result<PathLockGuard> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.try_acquire(purpose)? {
                Ok(guard) => return Ok(guard),
                Err(holder) => {
                    if std::time::Instant::now() >= deadline {
                        anyhow::bail!(
                            "Timed out waiting for lock {} held by {}",
                            self.path.display(),
                            holder
                        );
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        }
    }

    /// Current holder, if the lock file exists and is readable.
    pub fn holder(&self) -> anyhow::Result<Option<LockHolder>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("Failed to read lock file: {}", self.path.display()))),
        }
    }

    /// Age of the lock file, measured from its modification time.
    pub fn age(&self) -> anyhow::Result<Option<Duration>> {
        match fs::metadata(&self.path) {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .with_context(|| format!("Failed to stat lock: {}", self.path.display()))?;
                Ok(Some(
                    SystemTime::now()
                        .duration_since(modified)
                        .unwrap_or_default(),
                ))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("Failed to stat lock: {}", self.path.display()))),
        }
    }

    /// Remove the lock if it is older than `stale_after` or its holder process is gone.
    ///
    /// Returns the reclaimed holder, or `None` when there was nothing to reclaim.
    pub fn reclaim_if_stale(&self, stale_after: Duration) -> anyhow::Result<Option<LockHolder>> {
        let Some(age) = self.age()? else {
            return Ok(None);
        };
        let holder = self.holder()?;
        let holder_gone = holder
            .as_ref()
            .map(|h| h.pid != std::process::id() && !is_process_alive(h.pid))
            .unwrap_or(false);

        if age < stale_after && !holder_gone {
            return Ok(None);
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("Failed to remove stale lock: {}", self.path.display())));
            }
        }
        tracing::warn!(lock = %self.path.display(), age_secs = age.as_secs(), "reclaimed stale lock");
        Ok(Some(holder.unwrap_or_else(|| unknown_holder("unknown"))))
    }
}

fn unknown_holder(purpose: &str) -> LockHolder {
    LockHolder {
        pid: 0,
        token: String::new(),
        purpose: purpose.to_string(),
        acquired_at: DateTime::<Utc>::UNIX_EPOCH,
    }
}

/// Releases the lock on drop, unless it was reclaimed by someone else.
#[derive(Debug)]
pub struct PathLockGuard {
    path: PathBuf,
    token: String,
}

impl PathLockGuard {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        let still_ours = fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockHolder>(&bytes).ok())
            .map(|holder| holder.token == self.token)
            .unwrap_or(false);
        if still_ours {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Check if a process is likely alive (conservative check).
pub(crate) fn is_process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}", pid)).exists()
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ps")
            .args(["-p", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(true)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = pid;
        true
    }
}
