//! Deterministic content hashing for release trees and dependency manifests.
//!
//! A release's tree hash is recorded in the ledger when it is materialized so
//! that a later rollback can detect a release directory that was modified in
//! place.

use anyhow::Context;
use std::fs;
use std::path::Path;

const DIR_MARKER: u8 = 0xFF;
const FILE_MARKER: u8 = 0x00;
const LINK_MARKER: u8 = 0x01;

/// Compute a blake3 hash over a directory tree.
///
/// Entries are visited in lexicographic order. Each entry contributes its
/// relative path, a type marker and then either the file content or the
/// symlink target. Symlinks are never followed.
pub fn hash_tree(path: &Path) -> anyhow::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hash_dir(&mut hasher, path, "")?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash an ordered list of optional inputs (missing files hash as absent).
///
/// Used to fingerprint a runtime's declared dependency set.
pub fn hash_inputs(parts: &[(&str, Option<&[u8]>)]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (label, content) in parts {
        hasher.update(label.as_bytes());
        match content {
            Some(bytes) => {
                hasher.update(&[FILE_MARKER]);
                hasher.update(&(bytes.len() as u64).to_le_bytes());
                hasher.update(bytes);
            }
            None => {
                hasher.update(&[DIR_MARKER]);
            }
        }
    }
    hasher.finalize().to_hex().to_string()
}

fn hash_dir(hasher: &mut blake3::Hasher, dir: &Path, base: &str) -> anyhow::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read directory entries: {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let rel_path = if base.is_empty() {
            name.to_string_lossy().to_string()
        } else {
            format!("{}/{}", base, name.to_string_lossy())
        };

        let ty = entry
            .file_type()
            .with_context(|| format!("Failed to stat: {}", entry.path().display()))?;

        hasher.update(rel_path.as_bytes());
        if ty.is_dir() {
            hasher.update(&[DIR_MARKER]);
            hash_dir(hasher, &entry.path(), &rel_path)?;
        } else if ty.is_symlink() {
            hasher.update(&[LINK_MARKER]);
            let target = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read link: {}", entry.path().display()))?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if ty.is_file() {
            hasher.update(&[FILE_MARKER]);
            let content = fs::read(entry.path())
                .with_context(|| format!("Failed to read file: {}", entry.path().display()))?;
            hasher.update(&content);
        } else {
            anyhow::bail!("Unsupported filesystem entry type: {}", entry.path().display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create_dir_all should succeed in test temp dirs");
        }
        fs::write(path, content).expect("write should succeed in test temp dirs");
    }

    #[test]
    fn identical_trees_hash_identically() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        for root in [a.path(), b.path()] {
            write_file(&root.join("app.py"), "print('hi')");
            write_file(&root.join("src/settings.py"), "DEBUG = False");
        }

        assert_eq!(hash_tree(a.path()).unwrap(), hash_tree(b.path()).unwrap());
    }

    #[test]
    fn content_change_changes_hash() {
        let tmp = TempDir::new().unwrap();
        write_file(&tmp.path().join("app.py"), "v1");
        let before = hash_tree(tmp.path()).unwrap();

        write_file(&tmp.path().join("app.py"), "v2");
        let after = hash_tree(tmp.path()).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn moving_content_between_files_changes_hash() {
        let a = TempDir::new().unwrap();
        write_file(&a.path().join("a.txt"), "xy");
        write_file(&a.path().join("b.txt"), "");

        let b = TempDir::new().unwrap();
        write_file(&b.path().join("a.txt"), "x");
        write_file(&b.path().join("b.txt"), "y");

        assert_ne!(hash_tree(a.path()).unwrap(), hash_tree(b.path()).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_hash_by_target_without_following() {
        let tmp = TempDir::new().unwrap();
        write_file(&tmp.path().join("real.txt"), "data");
        std::os::unix::fs::symlink("real.txt", tmp.path().join("link")).unwrap();

        let hash = hash_tree(tmp.path()).unwrap();
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn absent_input_differs_from_empty_input() {
        let absent = hash_inputs(&[("requirements.txt", None)]);
        let empty = hash_inputs(&[("requirements.txt", Some(b"".as_slice()))]);
        assert_ne!(absent, empty);
    }
}
