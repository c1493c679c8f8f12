//! Release directory materialization and atomic file primitives.

use anyhow::Context;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::LinkMode;

#[derive(Debug, Clone)]
pub struct MaterializeReport {
    /// Mode actually used (auto resolves to hardlink or copy).
    pub mode: LinkMode,
}

/// Materialize `src_dir` into a new directory at `dst_dir`.
///
/// The destination must not exist: release directories are never rewritten.
/// The tree is assembled in a hidden sibling and renamed into place, so a
/// crash leaves either nothing or a complete directory at `dst_dir`.
pub fn materialize_tree(
    src_dir: &Path,
    dst_dir: &Path,
    mode: LinkMode,
) -> anyhow::Result<MaterializeReport> {
    let meta = fs::metadata(src_dir)
        .with_context(|| format!("Failed to stat snapshot: {}", src_dir.display()))?;
    if !meta.is_dir() {
        anyhow::bail!("Snapshot is not a directory: {}", src_dir.display());
    }
    if dst_dir.exists() {
        anyhow::bail!("Release directory already exists: {}", dst_dir.display());
    }
    let parent = dst_dir
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Release path has no parent: {}", dst_dir.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create releases directory: {}", parent.display()))?;

    let used = match mode {
        LinkMode::Copy => {
            build_then_rename(dst_dir, |tmp| copy_tree(src_dir, tmp))?;
            LinkMode::Copy
        }
        LinkMode::Hardlink => {
            build_then_rename(dst_dir, |tmp| {
                hardlink_tree(src_dir, tmp)
                    .with_context(|| format!("Failed to hardlink tree from {}", src_dir.display()))
            })?;
            LinkMode::Hardlink
        }
        LinkMode::Auto => {
            let linked = build_then_rename(dst_dir, |tmp| {
                hardlink_tree(src_dir, tmp)
                    .with_context(|| format!("Failed to hardlink tree from {}", src_dir.display()))
            });
            match linked {
                Ok(()) => LinkMode::Hardlink,
                Err(err) if is_cross_device_link_error(&err) => {
                    tracing::debug!(src = %src_dir.display(), "hardlink crossed devices, copying");
                    build_then_rename(dst_dir, |tmp| copy_tree(src_dir, tmp))?;
                    LinkMode::Copy
                }
                Err(err) => return Err(err),
            }
        }
    };

    Ok(MaterializeReport { mode: used })
}

fn build_then_rename(
    dst_dir: &Path,
    build: impl FnOnce(&Path) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let tmp_dir = unique_temp_path(dst_dir)?;
    fs::create_dir_all(&tmp_dir)
        .with_context(|| format!("Failed to create temp directory: {}", tmp_dir.display()))?;

    if let Err(err) = build(&tmp_dir) {
        let _ = fs::remove_dir_all(&tmp_dir);
        return Err(err);
    }

    fs::rename(&tmp_dir, dst_dir).with_context(|| {
        format!(
            "Failed to move {} into {}",
            tmp_dir.display(),
            dst_dir.display()
        )
    })
}

/// Point `link` at `target`, replacing any previous link atomically.
pub fn swap_symlink(target: &Path, link: &Path) -> anyhow::Result<()> {
    let tmp = unique_temp_path(link)?;
    create_dir_symlink(target, &tmp)
        .with_context(|| format!("Failed to create symlink {}", tmp.display()))?;
    if let Err(err) = fs::rename(&tmp, link) {
        let _ = fs::remove_file(&tmp);
        return Err(anyhow::Error::new(err)
            .context(format!("Failed to swap symlink {}", link.display())));
    }
    Ok(())
}

/// Write `bytes` to `path` via temp file, fsync and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let tmp = unique_temp_path(path)?;
    let result = (|| -> anyhow::Result<()> {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to rename {} to {}", tmp.display(), path.display()))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn unique_temp_path(dst: &Path) -> anyhow::Result<PathBuf> {
    let parent = dst
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Path has no parent: {}", dst.display()))?;
    let base = dst
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Path has no filename: {}", dst.display()))?;

    let thread = format!("{:?}", std::thread::current().id())
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>();
    for attempt in 0u32..1000 {
        let name = format!(
            ".{}.tmp.{}.{}.{}",
            base.to_string_lossy(),
            std::process::id(),
            thread,
            attempt
        );
        let candidate = parent.join(name);
        if fs::symlink_metadata(&candidate).is_err() {
            return Ok(candidate);
        }
    }

    anyhow::bail!("Failed to allocate a unique temp path for {}", dst.display());
}

fn copy_tree(src: &Path, dst: &Path) -> anyhow::Result<()> {
    for entry in
        fs::read_dir(src).with_context(|| format!("Failed to read dir: {}", src.display()))?
    {
        let entry = entry.with_context(|| format!("Failed to read dir entry: {}", src.display()))?;
        let ty = entry
            .file_type()
            .with_context(|| format!("Failed to stat dir entry: {}", entry.path().display()))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());

        if ty.is_dir() {
            fs::create_dir_all(&to)
                .with_context(|| format!("Failed to create directory: {}", to.display()))?;
            copy_tree(&from, &to)?;
        } else if ty.is_symlink() {
            let target = fs::read_link(&from)
                .with_context(|| format!("Failed to read link: {}", from.display()))?;
            create_file_symlink(&target, &to)
                .with_context(|| format!("Failed to recreate link: {}", to.display()))?;
        } else if ty.is_file() {
            fs::copy(&from, &to).with_context(|| {
                format!("Failed to copy {} to {}", from.display(), to.display())
            })?;
        } else {
            anyhow::bail!("Unsupported filesystem entry type at {}", from.display());
        }
    }
    Ok(())
}

fn hardlink_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let from = entry.path();
        let to = dst.join(entry.file_name());

        if ty.is_dir() {
            fs::create_dir_all(&to)?;
            hardlink_tree(&from, &to)?;
        } else if ty.is_symlink() {
            create_file_symlink(&fs::read_link(&from)?, &to)?;
        } else if ty.is_file() {
            fs::hard_link(&from, &to)?;
        } else {
            return Err(std::io::Error::other(format!(
                "Unsupported filesystem entry type at {}",
                from.display()
            )));
        }
    }
    Ok(())
}

fn is_cross_device_link_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::raw_os_error)
            .is_some_and(is_cross_device_code)
    })
}

#[cfg(unix)]
fn is_cross_device_code(code: i32) -> bool {
    const EXDEV: i32 = 18;
    code == EXDEV
}

#[cfg(not(unix))]
fn is_cross_device_code(code: i32) -> bool {
    const ERROR_NOT_SAME_DEVICE: i32 = 17;
    code == ERROR_NOT_SAME_DEVICE
}

#[cfg(unix)]
fn create_dir_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_dir_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(unix)]
fn create_file_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_file_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
