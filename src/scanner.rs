use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    error::Result,
    manifest::Manifest,
    model::{FileRecord, ScanResult},
    transport::RemoteTransport,
};

/// Names ignored on the local side (spec.md §4.2): editor/OS scratch
/// files, partial-download markers, and anything beginning with a dot.
const IGNORED_EXACT: &[&str] = &[
    "desktop.ini",
    "Thumbs.db",
    ".DS_Store",
    "$RECYCLE.BIN",
    "System Volume Information",
];

const IGNORED_SUFFIXES: &[&str] = &[
    ".tmp", ".temp", ".swp", ".swo", "~", ".partial", ".crdownload", ".part",
];

pub type CancelFlag = Arc<AtomicBool>;

fn is_cancelled(cancel: &CancelFlag) -> bool {
    cancel.load(Ordering::Relaxed)
}

fn is_ignored(name: &str) -> bool {
    if name.starts_with('.') {
        return true;
    }
    if IGNORED_EXACT.iter().any(|ignored| *ignored == name) {
        return true;
    }
    IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn to_forward_slashes(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walks a local tree. Symlinks, directory entries, and ignored names are
/// skipped; non-access errors on individual entries are logged and
/// skipped rather than failing the whole scan (spec.md §4.2).
///
/// Generalized from the teacher's `FsLocalStore::collect` (`sync.rs`).
pub fn scan_local(root: &Path, cancel: &CancelFlag) -> Result<ScanResult> {
    let mut files = BTreeMap::new();
    walk_local(root, Path::new(""), &mut files, cancel);
    Ok(ScanResult::new(files))
}

fn walk_local(
    root: &Path,
    rel: &Path,
    out: &mut BTreeMap<String, FileRecord>,
    cancel: &CancelFlag,
) {
    if is_cancelled(cancel) {
        return;
    }

    let dir = if rel.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    };

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "failed to read directory, skipping");
            return;
        }
    };

    for entry in entries {
        if is_cancelled(cancel) {
            return;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "failed to read directory entry, skipping");
                continue;
            }
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        if is_ignored(&name) {
            continue;
        }

        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "failed to stat entry, skipping");
                continue;
            }
        };

        if file_type.is_symlink() {
            continue;
        }

        let child_rel = rel.join(&name);

        if file_type.is_dir() {
            walk_local(root, &child_rel, out, cancel);
            continue;
        }

        if !file_type.is_file() {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "failed to read metadata, skipping");
                continue;
            }
        };

        let modified = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

        let path = to_forward_slashes(&child_rel);
        out.insert(
            path.clone(),
            FileRecord {
                path,
                size: metadata.len(),
                modified: FileRecord::truncate_modified(modified),
                hash: None,
            },
        );
    }
}

const MANIFEST_SUBPATH: &str = ".anemone/manifest.json";

/// Prefers a precomputed manifest at `<root>/.anemone/manifest.json`;
/// falls back to a recursive live listing on parse error, missing file,
/// or an empty manifest (spec.md §4.2).
pub fn scan_remote(
    transport: &dyn RemoteTransport,
    root: &Path,
    cancel: &CancelFlag,
) -> Result<ScanResult> {
    if let Some(result) = try_manifest(transport, root) {
        debug!("remote scan served from manifest");
        return Ok(result);
    }

    let mut files = BTreeMap::new();
    walk_remote(transport, root, Path::new(""), &mut files, cancel)?;
    Ok(ScanResult::new(files))
}

fn try_manifest(transport: &dyn RemoteTransport, root: &Path) -> Option<ScanResult> {
    let manifest_path = root.join(MANIFEST_SUBPATH);
    let bytes = transport.read(&manifest_path).ok()?;
    let manifest: Manifest = serde_json::from_slice(&bytes).ok()?;
    if manifest.files.is_empty() {
        return None;
    }

    let files = manifest
        .files
        .into_iter()
        .map(|entry| {
            let path = entry.path.replace('\\', "/");
            (
                path.clone(),
                FileRecord {
                    path,
                    size: entry.size,
                    modified: FileRecord::truncate_modified(
                        std::time::SystemTime::UNIX_EPOCH
                            + std::time::Duration::from_secs(entry.mtime),
                    ),
                    hash: entry.hash,
                },
            )
        })
        .collect();

    Some(ScanResult::new(files))
}

fn walk_remote(
    transport: &dyn RemoteTransport,
    root: &Path,
    rel: &Path,
    out: &mut BTreeMap<String, FileRecord>,
    cancel: &CancelFlag,
) -> Result<()> {
    if is_cancelled(cancel) {
        return Ok(());
    }

    let dir = if rel.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    };

    let entries = match transport.list(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "failed to list remote directory, skipping");
            return Ok(());
        }
    };

    for entry in entries {
        if is_cancelled(cancel) {
            return Ok(());
        }
        if is_ignored(&entry.name) {
            continue;
        }

        let child_rel = rel.join(&entry.name);

        if entry.is_dir {
            walk_remote(transport, root, &child_rel, out, cancel)?;
            continue;
        }

        let path = to_forward_slashes(&child_rel);
        out.insert(
            path.clone(),
            FileRecord {
                path,
                size: entry.size,
                modified: FileRecord::truncate_modified(entry.mtime),
                hash: None,
            },
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn scan_local_skips_ignored_and_hidden_names() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), b"a").unwrap();
        fs::write(dir.path().join(".hidden"), b"b").unwrap();
        fs::write(dir.path().join("cache.tmp"), b"c").unwrap();
        fs::write(dir.path().join("Thumbs.db"), b"d").unwrap();

        let result = scan_local(dir.path(), &CancelFlag::default()).unwrap();
        assert_eq!(result.files.len(), 1);
        assert!(result.files.contains_key("keep.txt"));
    }

    #[test]
    fn scan_local_recurses_into_subdirectories() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/inner.txt"), b"x").unwrap();

        let result = scan_local(dir.path(), &CancelFlag::default()).unwrap();
        assert!(result.files.contains_key("nested/inner.txt"));
    }

    #[test]
    fn scan_remote_falls_back_to_listing_without_manifest() {
        let transport = InMemoryTransport::default();
        transport.seed("a.txt", b"one".to_vec(), std::time::SystemTime::now());
        transport.seed("b.txt", b"two".to_vec(), std::time::SystemTime::now());

        let result = scan_remote(&transport, Path::new(""), &CancelFlag::default()).unwrap();
        assert_eq!(result.files.len(), 2);
    }

    #[test]
    fn scan_remote_prefers_manifest_when_present() {
        let transport = InMemoryTransport::default();
        let manifest = br#"{"files":[{"path":"x.txt","size":5,"mtime":1700000000}]}"#;
        transport.seed(
            ".anemone/manifest.json",
            manifest.to_vec(),
            std::time::SystemTime::now(),
        );
        transport.seed("x.txt", b"wrong".to_vec(), std::time::SystemTime::now());
        transport.seed("y.txt", b"extra".to_vec(), std::time::SystemTime::now());

        let result = scan_remote(&transport, Path::new(""), &CancelFlag::default()).unwrap();
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files["x.txt"].size, 5);
    }
}
