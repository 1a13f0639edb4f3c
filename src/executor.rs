use std::{
    collections::HashMap,
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::atomic::Ordering,
    time::Instant,
};

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    error::{Result, SyncError},
    model::{Operation, PerFileError, SyncPlan, SyncResult},
    progress::{ProgressEvent, ProgressSink},
    scanner::CancelFlag,
    transport::RemoteTransport,
};

const DOWNLOAD_TEMP_SUFFIX: &str = ".anemone-downloading";
const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Bounded worker pool that executes a `SyncPlan` phase by phase
/// (spec.md §4.5). Generalized from the teacher's `task_queue.rs`
/// `Lazy<TaskQueue>` singleton: same fixed-thread-count, channel-fed
/// design, but owned by whoever calls `execute` instead of living behind
/// a process-wide static.
pub struct Executor {
    threads: usize,
}

impl Default for Executor {
    fn default() -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            threads: available.clamp(2, 8),
        }
    }
}

impl Executor {
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// The worker-pool width this instance was built with.
    pub fn thread_count(&self) -> usize {
        self.threads
    }

    /// Runs every phase of `plan` in order (deletes, then transfers, then
    /// finalize), in parallel within each phase, serialized per parent
    /// directory so two operations never race on the same `mkdir`/rename.
    pub fn execute(
        &self,
        plan: &SyncPlan,
        local_root: &Path,
        remote_root: &Path,
        transport: &dyn RemoteTransport,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> SyncResult {
        let start = Instant::now();
        let state = RunState::default();
        let locks = ParentLocks::default();

        for phase_ops in plan.phases() {
            if phase_ops.is_empty() {
                continue;
            }
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            self.run_phase(&phase_ops, local_root, remote_root, transport, progress, cancel, &state, &locks);
        }

        let attempted = state.attempted.load(Ordering::Relaxed);
        let mut result = state.into_result();
        result.duration = start.elapsed();
        let failures = result.errors.len();
        let successes = attempted.saturating_sub(failures);
        result.status = Some(if cancel.load(Ordering::Relaxed) {
            crate::model::RunPhase::Cancelled
        } else if failures == 0 {
            crate::model::RunPhase::Complete
        } else if successes == 0 && attempted > 0 {
            crate::model::RunPhase::Failed
        } else {
            crate::model::RunPhase::Partial
        });
        result
    }

    fn run_phase(
        &self,
        ops: &[&Operation],
        local_root: &Path,
        remote_root: &Path,
        transport: &dyn RemoteTransport,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
        state: &RunState,
        locks: &ParentLocks,
    ) {
        let (tx, rx) = unbounded::<&Operation>();
        for op in ops {
            tx.send(op).expect("phase channel receiver dropped early");
        }
        drop(tx);

        let worker_count = self.threads.min(ops.len()).max(1);
        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                let rx = rx.clone();
                scope.spawn(|| {
                    while let Ok(op) = rx.recv() {
                        if cancel.load(Ordering::Relaxed) {
                            break;
                        }
                        let _guard = locks.lock_for(parent_key(op.path()));
                        apply(op, local_root, remote_root, transport, progress, cancel, state);
                    }
                });
            }
        });
    }
}

fn parent_key(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

#[derive(Default)]
struct ParentLocks {
    table: Mutex<HashMap<String, std::sync::Arc<Mutex<()>>>>,
}

impl ParentLocks {
    fn lock_for(&self, key: String) -> parking_lot::ArcMutexGuard<parking_lot::RawMutex, ()> {
        let mutex = {
            let mut table = self.table.lock();
            table.entry(key).or_insert_with(|| std::sync::Arc::new(Mutex::new(()))).clone()
        };
        mutex.lock_arc()
    }
}

#[derive(Default)]
struct RunState {
    uploaded: std::sync::atomic::AtomicUsize,
    downloaded: std::sync::atomic::AtomicUsize,
    deleted: std::sync::atomic::AtomicUsize,
    skipped: std::sync::atomic::AtomicUsize,
    conflicts: std::sync::atomic::AtomicUsize,
    bytes_transferred: std::sync::atomic::AtomicU64,
    errors: Mutex<Vec<PerFileError>>,
    attempted: std::sync::atomic::AtomicUsize,
}

impl RunState {
    fn into_result(self) -> SyncResult {
        SyncResult {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            errors: self.errors.into_inner(),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            duration: Default::default(),
            status: None,
        }
    }

    fn record_error(&self, path: &str, err: &SyncError) {
        self.errors.lock().push(PerFileError {
            path: path.to_string(),
            kind: format!("{:?}", err.kind()),
            message: err.to_string(),
        });
    }
}

fn apply(
    op: &Operation,
    local_root: &Path,
    remote_root: &Path,
    transport: &dyn RemoteTransport,
    progress: &dyn ProgressSink,
    cancel: &CancelFlag,
    state: &RunState,
) {
    let path = op.path().to_string();
    progress.on_event(ProgressEvent::Started { path: path.clone() });

    if !matches!(op, Operation::Skip { .. } | Operation::Conflict(_)) {
        state.attempted.fetch_add(1, Ordering::Relaxed);
    }

    let outcome = match op {
        Operation::Upload(rel) => upload(rel, local_root, remote_root, transport),
        Operation::Download(rel) => {
            download(rel, rel, local_root, remote_root, transport, progress, cancel)
        }
        Operation::DeleteLocal(rel) => delete_local(rel, local_root),
        Operation::DeleteRemote(rel) => delete_remote(rel, remote_root, transport),
        Operation::KeepBoth { path: rel, suffix } => {
            let dest_rel = sibling(rel, suffix);
            download(rel, &dest_rel, local_root, remote_root, transport, progress, cancel)
        }
        Operation::Skip { .. } => {
            state.skipped.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Operation::Conflict(rel) => {
            warn!(path = %rel, "conflict left for manual resolution");
            state.conflicts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    };

    match outcome {
        Ok(()) => {
            count_success(op, state);
            progress.on_event(ProgressEvent::Finished { path });
        }
        Err(err) => {
            warn!(path = %path, error = %err, "operation failed");
            state.record_error(&path, &err);
            progress.on_event(ProgressEvent::Failed {
                path,
                message: err.to_string(),
            });
        }
    }
}

fn count_success(op: &Operation, state: &RunState) {
    match op {
        Operation::Upload(_) => {
            state.uploaded.fetch_add(1, Ordering::Relaxed);
        }
        Operation::Download(_) | Operation::KeepBoth { .. } => {
            state.downloaded.fetch_add(1, Ordering::Relaxed);
        }
        Operation::DeleteLocal(_) | Operation::DeleteRemote(_) => {
            state.deleted.fetch_add(1, Ordering::Relaxed);
        }
        Operation::Skip { .. } | Operation::Conflict(_) => {}
    }
}

fn sibling(path: &str, filename: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/{filename}"),
        None => filename.to_string(),
    }
}

fn upload(rel: &str, local_root: &Path, remote_root: &Path, transport: &dyn RemoteTransport) -> Result<()> {
    let src = local_root.join(rel);
    let dst = remote_root.join(rel);
    transport.write_atomic(&src, &dst)
}

fn delete_local(rel: &str, local_root: &Path) -> Result<()> {
    let path = local_root.join(rel);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SyncError::io(path, err)),
    }
}

fn delete_remote(rel: &str, remote_root: &Path, transport: &dyn RemoteTransport) -> Result<()> {
    transport.delete(&remote_root.join(rel))
}

/// Streams `src_rel` from the remote into `dest_rel` under `local_root`,
/// writing to a `.anemone-downloading` sibling first and renaming over
/// the destination only once the whole stream has landed — the mirror
/// image of `RemoteTransport::write_atomic` (spec.md §4.5). Checked at
/// chunk boundaries so a mid-transfer cancellation does not leave a
/// multi-gigabyte write running to completion.
fn download(
    src_rel: &str,
    dest_rel: &str,
    local_root: &Path,
    remote_root: &Path,
    transport: &dyn RemoteTransport,
    progress: &dyn ProgressSink,
    cancel: &CancelFlag,
) -> Result<()> {
    let remote_path = remote_root.join(src_rel);
    let local_path = local_root.join(dest_rel);
    let temp_path = append_suffix(&local_path, DOWNLOAD_TEMP_SUFFIX);

    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent).map_err(|err| SyncError::io(parent.to_path_buf(), err))?;
    }

    let mut reader = transport.open(&remote_path)?;
    let write_result = (|| -> Result<()> {
        let mut temp_file =
            fs::File::create(&temp_path).map_err(|err| SyncError::io(temp_path.clone(), err))?;
        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(SyncError::Cancelled);
            }
            let read = reader
                .read(&mut buf)
                .map_err(|err| SyncError::io(remote_path.clone(), err))?;
            if read == 0 {
                break;
            }
            temp_file
                .write_all(&buf[..read])
                .map_err(|err| SyncError::io(temp_path.clone(), err))?;
            progress.on_event(ProgressEvent::BytesTransferred {
                path: src_rel.to_string(),
                bytes: read as u64,
            });
        }
        temp_file
            .sync_all()
            .map_err(|err| SyncError::io(temp_path.clone(), err))
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    match fs::remove_file(&local_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            let _ = fs::remove_file(&temp_path);
            return Err(SyncError::io(local_path, err));
        }
    }

    fs::rename(&temp_path, &local_path).map_err(|err| {
        let _ = fs::remove_file(&temp_path);
        SyncError::io(local_path.clone(), err)
    })
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    match path.parent() {
        Some(parent) if parent.as_os_str().len() > 0 => parent.join(name),
        _ => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SkipReason;
    use crate::progress::NullProgress;
    use crate::transport::InMemoryTransport;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn cancel_flag() -> CancelFlag {
        Arc::new(std::sync::atomic::AtomicBool::new(false))
    }

    #[test]
    fn uploads_land_on_the_remote_fake() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello world").unwrap();

        let mut plan = SyncPlan::default();
        plan.push(Operation::Upload("a.txt".into()));

        let transport = InMemoryTransport::default();
        let executor = Executor::with_threads(2);
        let result = executor.execute(
            &plan,
            dir.path(),
            Path::new(""),
            &transport,
            &NullProgress,
            &cancel_flag(),
        );

        assert_eq!(result.uploaded, 1);
        assert!(result.errors.is_empty());
        assert_eq!(transport.read(Path::new("a.txt")).unwrap(), b"hello world");
    }

    #[test]
    fn downloads_write_atomically_to_local_root() {
        let dir = tempdir().unwrap();
        let transport = InMemoryTransport::default();
        transport.seed("nested/b.txt", b"payload".to_vec(), std::time::SystemTime::now());

        let mut plan = SyncPlan::default();
        plan.push(Operation::Download("nested/b.txt".into()));

        let executor = Executor::with_threads(2);
        let result = executor.execute(
            &plan,
            dir.path(),
            Path::new(""),
            &transport,
            &NullProgress,
            &cancel_flag(),
        );

        assert_eq!(result.downloaded, 1);
        let written = fs::read(dir.path().join("nested/b.txt")).unwrap();
        assert_eq!(written, b"payload");
        assert!(!dir.path().join("nested/b.txt.anemone-downloading").exists());
    }

    #[test]
    fn keep_both_writes_the_server_variant_without_touching_the_original() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("x.bin"), b"local-copy").unwrap();
        let transport = InMemoryTransport::default();
        transport.seed("x.bin", b"remote-copy".to_vec(), std::time::SystemTime::now());

        let mut plan = SyncPlan::default();
        plan.push(Operation::KeepBoth {
            path: "x.bin".into(),
            suffix: "x.server.bin".into(),
        });
        plan.push(Operation::Skip {
            path: "x.bin".into(),
            reason: SkipReason::KeepBothOriginal,
        });

        let executor = Executor::with_threads(2);
        let result = executor.execute(
            &plan,
            dir.path(),
            Path::new(""),
            &transport,
            &NullProgress,
            &cancel_flag(),
        );

        assert_eq!(result.downloaded, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(fs::read(dir.path().join("x.bin")).unwrap(), b"local-copy");
        assert_eq!(fs::read(dir.path().join("x.server.bin")).unwrap(), b"remote-copy");
    }

    #[test]
    fn delete_local_is_idempotent_when_already_gone() {
        let dir = tempdir().unwrap();
        let mut plan = SyncPlan::default();
        plan.push(Operation::DeleteLocal("missing.txt".into()));

        let transport = InMemoryTransport::default();
        let executor = Executor::with_threads(2);
        let result = executor.execute(
            &plan,
            dir.path(),
            Path::new(""),
            &transport,
            &NullProgress,
            &cancel_flag(),
        );

        assert!(result.errors.is_empty());
        assert_eq!(result.deleted, 1);
    }

    #[test]
    fn a_failed_operation_is_attributed_and_does_not_abort_the_phase() {
        let dir = tempdir().unwrap();
        let mut plan = SyncPlan::default();
        plan.push(Operation::Upload("missing-source.txt".into()));
        plan.push(Operation::DeleteLocal("also-missing.txt".into()));

        let transport = InMemoryTransport::default();
        let executor = Executor::with_threads(2);
        let result = executor.execute(
            &plan,
            dir.path(),
            Path::new(""),
            &transport,
            &NullProgress,
            &cancel_flag(),
        );

        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, "missing-source.txt");
        assert_eq!(result.deleted, 1);
        assert_eq!(result.status, Some(crate::model::RunPhase::Partial));
    }
}
