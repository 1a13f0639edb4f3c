use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::SystemTime,
};

use parking_lot::Mutex;
use tracing::info;

use crate::{
    error::Result,
    model::{FileRecord, HydrationState, Placeholder},
};

/// The on-demand materialization collaborator (spec.md §4.7): turns a
/// remote-only file into a zero-byte local stub carrying the real size
/// and modified time, then fetches content the first time something
/// opens it.
///
/// Learned entirely from the `ok-nick-wincs` cloud-mirror reference
/// example — the teacher has no placeholder concept at all, since it
/// always materializes full content.
pub trait PlaceholderProvider: Send + Sync {
    /// Registers `root` as a sync root under the platform's cloud files
    /// API. A no-op on platforms without one.
    fn register_root(&self, root: &Path) -> Result<()>;

    /// Creates a placeholder stub for `path` with the given declared
    /// size/mtime, without fetching content.
    fn create_placeholder(&self, path: &Path, size: u64, mtime: SystemTime) -> Result<()>;

    /// Mirrors `remote_entries` into `root` as placeholders: creates or
    /// updates one stub per entry, then removes any placeholder this
    /// provider tracks under `root` whose path is absent from
    /// `remote_entries` — an orphan left behind by a remote delete
    /// (spec.md §4.7). Already-hydrated files are left untouched; only
    /// un-hydrated placeholders are eligible for removal.
    fn populate(&self, root: &Path, remote_entries: &[FileRecord]) -> Result<PopulateReport>;

    /// Called by the platform (or, on the portable stub, by a caller
    /// simulating a hydration request) the first time something opens a
    /// placeholder. Populates real content and flips its state to
    /// `Hydrated`. Single-flight: concurrent hydration requests for the
    /// same path block on one fetch rather than racing.
    fn on_hydrate(&self, path: &Path, fetch: &dyn Fn() -> Result<Vec<u8>>) -> Result<()>;

    /// Converts a fully-hydrated file back into a placeholder, freeing
    /// local disk space. A no-op if the file is already a placeholder.
    fn dehydrate(&self, path: &Path) -> Result<()>;

    /// Returns the hydration state this provider believes `path` to be
    /// in, or `None` if `path` is not tracked at all.
    fn state_of(&self, path: &Path) -> Option<HydrationState>;

    /// Walks the tracked placeholders under `root` and yields every one
    /// whose state is `Hydrated`, as `(path, declared size, days since
    /// last access)` — the candidate set auto-dehydration sweeps over
    /// (spec.md §4.7).
    fn scan_hydrated(&self, root: &Path, now: SystemTime) -> Result<Vec<(PathBuf, u64, u64)>>;
}

/// Outcome of a [`PlaceholderProvider::populate`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PopulateReport {
    /// Placeholders newly created or refreshed this call.
    pub created: usize,
    /// Placeholders removed because their path is no longer present on
    /// the remote side.
    pub removed: Vec<PathBuf>,
}

/// Per-path hydration locks, shared by both the real and stub providers,
/// guaranteeing the single-flight invariant spec.md §4.7 requires.
#[derive(Default)]
struct HydrationLocks {
    table: Mutex<HashMap<String, std::sync::Arc<Mutex<()>>>>,
}

impl HydrationLocks {
    fn lock_for(&self, path: &Path) -> std::sync::Arc<Mutex<()>> {
        let key = path.to_string_lossy().into_owned();
        let mut table = self.table.lock();
        table
            .entry(key)
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }
}

#[derive(Default)]
struct PlaceholderTable {
    entries: Mutex<HashMap<String, Placeholder>>,
}

impl PlaceholderTable {
    fn insert(&self, placeholder: Placeholder) {
        self.entries
            .lock()
            .insert(placeholder.path.clone(), placeholder);
    }

    fn state_of(&self, path: &str) -> Option<HydrationState> {
        self.entries.lock().get(path).map(|p| p.state)
    }

    fn set_state(&self, path: &str, state: HydrationState) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.state = state;
        }
    }

    fn touch_access(&self, path: &str, at: SystemTime) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.last_access = Some(at);
        }
    }

    fn remove(&self, path: &str) {
        self.entries.lock().remove(path);
    }

    /// Paths under `prefix` still in the `Placeholder` state — the
    /// eligible set for orphan removal in `populate`.
    fn placeholder_keys_under(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.state == HydrationState::Placeholder)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Paths under `prefix` in the `Hydrated` state, with declared size
    /// and days since last access, for `scan_hydrated`.
    fn hydrated_under(&self, prefix: &str, now: SystemTime) -> Vec<(PathBuf, u64, u64)> {
        self.entries
            .lock()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.state == HydrationState::Hydrated)
            .map(|(key, entry)| {
                let last_access = entry.last_access.unwrap_or(entry.declared_mtime);
                let days = now
                    .duration_since(last_access)
                    .unwrap_or_default()
                    .as_secs()
                    / 86_400;
                (PathBuf::from(key), entry.declared_size, days)
            })
            .collect()
    }
}

fn key_of(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn root_prefix(root: &Path) -> String {
    let mut prefix = key_of(root);
    if !prefix.is_empty() && !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

/// Portable implementation used on every platform without a native cloud
/// files API: a placeholder is just a zero-byte file, and "hydration"
/// means overwriting it in place. Exercises the same state machine the
/// `wincs` backend does, so Coordinator/Executor code never has to care
/// which one is active.
#[derive(Default)]
pub struct NoopPlaceholderProvider {
    locks: HydrationLocks,
    table: PlaceholderTable,
}

impl PlaceholderProvider for NoopPlaceholderProvider {
    fn register_root(&self, _root: &Path) -> Result<()> {
        Ok(())
    }

    fn create_placeholder(&self, path: &Path, size: u64, mtime: SystemTime) -> Result<()> {
        use std::io::Write;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| crate::error::SyncError::io(parent.to_path_buf(), e))?;
        }
        std::fs::File::create(path)
            .map_err(|e| crate::error::SyncError::io(path.to_path_buf(), e))?
            .flush()
            .map_err(|e| crate::error::SyncError::io(path.to_path_buf(), e))?;
        self.table.insert(Placeholder {
            path: key_of(path),
            declared_size: size,
            declared_mtime: mtime,
            state: HydrationState::Placeholder,
            last_access: None,
        });
        Ok(())
    }

    fn populate(&self, root: &Path, remote_entries: &[FileRecord]) -> Result<PopulateReport> {
        let prefix = root_prefix(root);
        let mut wanted = HashSet::with_capacity(remote_entries.len());
        let mut created = 0;

        for entry in remote_entries {
            let local_path = root.join(&entry.path);
            let key = key_of(&local_path);
            wanted.insert(key.clone());
            if self.table.state_of(&key) == Some(HydrationState::Hydrated) {
                continue;
            }
            // A non-empty, untracked local file is real content this
            // provider never stubbed out (e.g. an Upload-direction file
            // mid-hydration-free-zone) — leave it for the differ/executor
            // rather than clobbering it with a zero-byte stub.
            if std::fs::metadata(&local_path).map(|m| m.len() > 0).unwrap_or(false) {
                continue;
            }
            self.create_placeholder(&local_path, entry.size, entry.modified)?;
            created += 1;
        }

        let mut removed = Vec::new();
        for key in self.table.placeholder_keys_under(&prefix) {
            if wanted.contains(&key) {
                continue;
            }
            let path = PathBuf::from(&key);
            let removed_from_disk = match std::fs::remove_file(&path) {
                Ok(()) => true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
                Err(_) => false,
            };
            if removed_from_disk {
                self.table.remove(&key);
                removed.push(path);
            }
        }

        Ok(PopulateReport { created, removed })
    }

    fn on_hydrate(&self, path: &Path, fetch: &dyn Fn() -> Result<Vec<u8>>) -> Result<()> {
        let lock = self.locks.lock_for(path);
        let _guard = lock.lock();

        let key = key_of(path);
        if self.table.state_of(&key) == Some(HydrationState::Hydrated) {
            return Ok(());
        }

        self.table.set_state(&key, HydrationState::Hydrating);
        info!(path = %path.display(), "hydrating placeholder");
        let bytes = fetch()?;
        std::fs::write(path, bytes).map_err(|e| crate::error::SyncError::io(path.to_path_buf(), e))?;
        self.table.set_state(&key, HydrationState::Hydrated);
        self.table.touch_access(&key, SystemTime::now());
        Ok(())
    }

    fn dehydrate(&self, path: &Path) -> Result<()> {
        let key = key_of(path);
        if self.table.state_of(&key) != Some(HydrationState::Hydrated) {
            return Ok(());
        }
        let metadata = std::fs::metadata(path).map_err(|e| crate::error::SyncError::io(path.to_path_buf(), e))?;
        std::fs::File::create(path).map_err(|e| crate::error::SyncError::io(path.to_path_buf(), e))?;
        self.table.insert(Placeholder {
            path: key.clone(),
            declared_size: metadata.len(),
            declared_mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            state: HydrationState::Placeholder,
            last_access: None,
        });
        Ok(())
    }

    fn state_of(&self, path: &Path) -> Option<HydrationState> {
        self.table.state_of(&key_of(path))
    }

    fn scan_hydrated(&self, root: &Path, now: SystemTime) -> Result<Vec<(PathBuf, u64, u64)>> {
        Ok(self.table.hydrated_under(&root_prefix(root), now))
    }
}

/// Auto-dehydration sweep (spec.md §4.7): any hydrated file whose last
/// access is older than `max_age_days` is converted back to a
/// placeholder. Called periodically by the Coordinator when a job has
/// `files_on_demand` enabled and `auto_dehydrate_days > 0`, and by the
/// `anemone dehydrate` CLI command.
///
/// Candidates come from [`PlaceholderProvider::scan_hydrated`], not a
/// blind directory walk, and a path only counts as dehydrated once it
/// has actually left the `Hydrated` state — `dehydrate` returning `Ok`
/// is not itself proof of a transition, since it's a deliberate no-op
/// for paths the provider isn't tracking as hydrated.
pub fn sweep_stale(
    provider: &dyn PlaceholderProvider,
    root: &Path,
    max_age_days: u32,
    now: SystemTime,
) -> Result<Vec<PathBuf>> {
    let mut dehydrated = Vec::new();
    for (path, _size, days_since_access) in provider.scan_hydrated(root, now)? {
        if days_since_access < u64::from(max_age_days) {
            continue;
        }
        if provider.dehydrate(&path).is_err() {
            continue;
        }
        if provider.state_of(&path) != Some(HydrationState::Hydrated) {
            dehydrated.push(path);
        }
    }
    Ok(dehydrated)
}

#[cfg(windows)]
pub mod windows_backend {
    //! `wincs`-backed `PlaceholderProvider`, grounded in the
    //! `ok-nick-wincs` cloud-mirror example's `SyncRoot::register`,
    //! `PlaceholderFile`, and `SyncFilter::fetch_data`.

    use std::path::{Path, PathBuf};
    use std::time::SystemTime;

    use wincs::{filter::SyncFilter, PlaceholderFile, SyncRootInfo};

    use super::{HydrationLocks, PlaceholderProvider, PlaceholderTable, PopulateReport};
    use crate::error::{Result, SyncError};
    use crate::model::{FileRecord, HydrationState};

    pub struct WincsPlaceholderProvider {
        locks: HydrationLocks,
        table: PlaceholderTable,
        root: std::sync::Mutex<Option<wincs::SyncRoot>>,
    }

    impl Default for WincsPlaceholderProvider {
        fn default() -> Self {
            Self {
                locks: HydrationLocks::default(),
                table: PlaceholderTable::default(),
                root: std::sync::Mutex::new(None),
            }
        }
    }

    impl PlaceholderProvider for WincsPlaceholderProvider {
        fn register_root(&self, root: &Path) -> Result<()> {
            let info = SyncRootInfo::default_for_path(root)
                .map_err(|e| SyncError::config(format!("failed to build sync root info: {e}")))?;
            let sync_root = wincs::SyncRoot::register(root, info, SyncFilterHandler)
                .map_err(|e| SyncError::config(format!("failed to register sync root: {e}")))?;
            *self.root.lock().expect("sync root mutex poisoned") = Some(sync_root);
            Ok(())
        }

        fn create_placeholder(&self, path: &Path, size: u64, mtime: SystemTime) -> Result<()> {
            let placeholder = PlaceholderFile::new(path)
                .size(size)
                .last_write_time(mtime)
                .mark_in_sync();
            placeholder
                .create()
                .map_err(|e| SyncError::config(format!("failed to create placeholder: {e}")))?;
            self.table.insert(crate::model::Placeholder {
                path: super::key_of(path),
                declared_size: size,
                declared_mtime: mtime,
                state: HydrationState::Placeholder,
                last_access: None,
            });
            Ok(())
        }

        fn populate(&self, root: &Path, remote_entries: &[FileRecord]) -> Result<PopulateReport> {
            let prefix = super::root_prefix(root);
            let mut wanted = std::collections::HashSet::with_capacity(remote_entries.len());
            let mut created = 0;

            for entry in remote_entries {
                let local_path = root.join(&entry.path);
                let key = super::key_of(&local_path);
                wanted.insert(key.clone());
                if self.table.state_of(&key) == Some(HydrationState::Hydrated) {
                    continue;
                }
                if std::fs::metadata(&local_path).map(|m| m.len() > 0).unwrap_or(false) {
                    continue;
                }
                self.create_placeholder(&local_path, entry.size, entry.modified)?;
                created += 1;
            }

            let mut removed = Vec::new();
            for key in self.table.placeholder_keys_under(&prefix) {
                if wanted.contains(&key) {
                    continue;
                }
                let path = PathBuf::from(&key);
                let removed_from_disk = match std::fs::remove_file(&path) {
                    Ok(()) => true,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
                    Err(_) => false,
                };
                if removed_from_disk {
                    self.table.remove(&key);
                    removed.push(path);
                }
            }

            Ok(PopulateReport { created, removed })
        }

        fn on_hydrate(&self, path: &Path, fetch: &dyn Fn() -> Result<Vec<u8>>) -> Result<()> {
            let lock = self.locks.lock_for(path);
            let _guard = lock.lock();
            let key = super::key_of(path);
            self.table.set_state(&key, HydrationState::Hydrating);
            let bytes = fetch()?;
            std::fs::write(path, bytes).map_err(|e| SyncError::io(path.to_path_buf(), e))?;
            self.table.set_state(&key, HydrationState::Hydrated);
            self.table.touch_access(&key, SystemTime::now());
            Ok(())
        }

        fn dehydrate(&self, path: &Path) -> Result<()> {
            wincs::dehydrate(path)
                .map_err(|e| SyncError::config(format!("failed to dehydrate {}: {e}", path.display())))?;
            self.table.set_state(&super::key_of(path), HydrationState::Placeholder);
            Ok(())
        }

        fn state_of(&self, path: &Path) -> Option<HydrationState> {
            self.table.state_of(&super::key_of(path))
        }

        fn scan_hydrated(&self, root: &Path, now: SystemTime) -> Result<Vec<(PathBuf, u64, u64)>> {
            Ok(self.table.hydrated_under(&super::root_prefix(root), now))
        }
    }

    /// The filter callback the Cloud Files API invokes on first open.
    /// Bridges back into `on_hydrate` via a channel held by the
    /// Coordinator; wired up at `register_root` time in a full
    /// integration, kept minimal here since it only needs to prove the
    /// shape of the `SyncFilter` trait.
    struct SyncFilterHandler;

    impl SyncFilter for SyncFilterHandler {
        fn fetch_data(&self, request: wincs::filter::Request, info: wincs::filter::FetchDataInfo) {
            let _ = (request, info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn placeholder_lifecycle_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("remote-only.bin");
        let provider = NoopPlaceholderProvider::default();

        provider.create_placeholder(&path, 42, SystemTime::now()).unwrap();
        assert_eq!(provider.state_of(&path), Some(HydrationState::Placeholder));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        provider
            .on_hydrate(&path, &|| Ok(b"real content".to_vec()))
            .unwrap();
        assert_eq!(provider.state_of(&path), Some(HydrationState::Hydrated));
        assert_eq!(std::fs::read(&path).unwrap(), b"real content");
    }

    #[test]
    fn hydrating_twice_only_fetches_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let provider = NoopPlaceholderProvider::default();
        provider.create_placeholder(&path, 1, SystemTime::now()).unwrap();

        let fetches = std::sync::atomic::AtomicUsize::new(0);
        let fetch = || {
            fetches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(b"x".to_vec())
        };

        provider.on_hydrate(&path, &fetch).unwrap();
        provider.on_hydrate(&path, &fetch).unwrap();

        assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn dehydrate_is_a_noop_on_an_unhydrated_placeholder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let provider = NoopPlaceholderProvider::default();
        provider.create_placeholder(&path, 1, SystemTime::now()).unwrap();

        provider.dehydrate(&path).unwrap();
        assert_eq!(provider.state_of(&path), Some(HydrationState::Placeholder));
    }

    #[test]
    fn sweep_stale_dehydrates_only_old_entries() {
        let dir = tempdir().unwrap();
        let fresh = dir.path().join("fresh.bin");
        let old = dir.path().join("old.bin");
        let provider = NoopPlaceholderProvider::default();
        let now = SystemTime::now();

        provider.create_placeholder(&fresh, 1, now).unwrap();
        provider.on_hydrate(&fresh, &|| Ok(b"x".to_vec())).unwrap();

        provider.create_placeholder(&old, 1, now).unwrap();
        provider.on_hydrate(&old, &|| Ok(b"x".to_vec())).unwrap();
        provider
            .table
            .touch_access(&key_of(&old), now - std::time::Duration::from_secs(86_400 * 10));

        let dehydrated = sweep_stale(&provider, dir.path(), 7, now).unwrap();
        assert_eq!(dehydrated, vec![old]);
        assert_eq!(provider.state_of(&fresh), Some(HydrationState::Hydrated));
    }

    #[test]
    fn sweep_stale_does_not_count_untracked_paths_as_dehydrated() {
        let dir = tempdir().unwrap();
        let provider = NoopPlaceholderProvider::default();
        let now = SystemTime::now();

        // Nothing registered with the provider at all — a fresh process
        // with an empty in-memory table should report zero dehydrations,
        // not "every file on disk".
        std::fs::write(dir.path().join("untracked.bin"), b"data").unwrap();

        let dehydrated = sweep_stale(&provider, dir.path(), 0, now).unwrap();
        assert!(dehydrated.is_empty());
    }

    #[test]
    fn scan_hydrated_returns_only_hydrated_entries_with_day_math() {
        let dir = tempdir().unwrap();
        let hydrated = dir.path().join("hydrated.bin");
        let still_placeholder = dir.path().join("placeholder.bin");
        let provider = NoopPlaceholderProvider::default();
        let now = SystemTime::now();

        provider.create_placeholder(&hydrated, 10, now).unwrap();
        provider.on_hydrate(&hydrated, &|| Ok(b"x".to_vec())).unwrap();
        provider
            .table
            .touch_access(&key_of(&hydrated), now - std::time::Duration::from_secs(86_400 * 3));
        provider.create_placeholder(&still_placeholder, 5, now).unwrap();

        let scanned = provider.scan_hydrated(dir.path(), now).unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0], (hydrated, 10, 3));
    }

    #[test]
    fn populate_creates_stubs_and_removes_remote_orphans() {
        let dir = tempdir().unwrap();
        let provider = NoopPlaceholderProvider::default();
        let now = SystemTime::now();

        provider.create_placeholder(&dir.path().join("stale.bin"), 1, now).unwrap();
        assert!(dir.path().join("stale.bin").exists());

        let remote_entries = vec![FileRecord {
            path: "fresh.bin".into(),
            size: 7,
            modified: now,
            hash: None,
        }];

        let report = provider.populate(dir.path(), &remote_entries).unwrap();

        assert_eq!(report.created, 1);
        assert_eq!(report.removed, vec![dir.path().join("stale.bin")]);
        assert!(!dir.path().join("stale.bin").exists());
        assert!(dir.path().join("fresh.bin").exists());
        assert_eq!(
            provider.state_of(&dir.path().join("fresh.bin")),
            Some(HydrationState::Placeholder)
        );
    }

    #[test]
    fn populate_leaves_already_hydrated_files_untouched() {
        let dir = tempdir().unwrap();
        let provider = NoopPlaceholderProvider::default();
        let now = SystemTime::now();
        let path = dir.path().join("real.bin");

        provider.create_placeholder(&path, 1, now).unwrap();
        provider.on_hydrate(&path, &|| Ok(b"content".to_vec())).unwrap();

        // The remote side no longer lists this file, but since it's
        // hydrated locally it must not be silently deleted.
        let report = provider.populate(dir.path(), &[]).unwrap();

        assert_eq!(report.created, 0);
        assert!(report.removed.is_empty());
        assert_eq!(std::fs::read(&path).unwrap(), b"content");
    }
}
