use std::{
    collections::HashSet,
    sync::{atomic::AtomicBool, Arc},
    time::Instant,
};

use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    config::JobStore,
    credentials::{CredentialStore, Credentials},
    differ,
    error::{Result, SyncError},
    executor::Executor,
    hasher::Hasher,
    model::{HydrationState, Job, JobId, Operation, RunPhase, ScanResult, SyncPlan, SyncResult},
    placeholder::PlaceholderProvider,
    scanner::{self, CancelFlag},
    transport::{RemoteTransport, SmbTransport},
    watcher::{SyncWatcher, DEFAULT_SUPPRESSION},
};

/// What triggered this run, surfaced in logs and available to a future
/// history view (spec.md §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunRequest {
    Manual,
    Scheduled,
    Realtime,
}

/// Ties every collaborator together behind the
/// Scanning → Detecting → Executing → Finalizing state machine spec.md
/// §4.6 describes, including the run-slot mutex that makes
/// `AlreadyRunning` possible and the baseline bookkeeping that makes
/// delete-detection safe.
///
/// Generalized from the teacher's `plan_jobs_with_progress`/
/// `execute_jobs_with_progress` free functions in `sync.rs`: those
/// re-planned a session from scratch on every call with no run-slot or
/// baseline concept, since the teacher's bidirectional differ never
/// deletes. This adds both, plus the full phase state machine.
pub struct Coordinator {
    jobs: Arc<dyn JobStore>,
    credentials: Arc<dyn CredentialStore>,
    placeholders: Arc<dyn PlaceholderProvider>,
    watcher: Arc<dyn SyncWatcher>,
    executor: Executor,
    hasher: Hasher,
    running: Mutex<HashSet<JobId>>,
}

impl Coordinator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        credentials: Arc<dyn CredentialStore>,
        placeholders: Arc<dyn PlaceholderProvider>,
        watcher: Arc<dyn SyncWatcher>,
    ) -> Self {
        Self {
            jobs,
            credentials,
            placeholders,
            watcher,
            executor: Executor::default(),
            hasher: Hasher::default(),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// As [`Coordinator::new`], but sizes the Executor's worker pool and
    /// the Hasher's read buffer from a persisted [`crate::config::AppConfig`]
    /// instead of their built-in defaults.
    pub fn with_config(
        jobs: Arc<dyn JobStore>,
        credentials: Arc<dyn CredentialStore>,
        placeholders: Arc<dyn PlaceholderProvider>,
        watcher: Arc<dyn SyncWatcher>,
        config: &crate::config::AppConfig,
    ) -> Self {
        let executor = if config.worker_pool_width == 0 {
            Executor::default()
        } else {
            Executor::with_threads(config.worker_pool_width)
        };
        Self {
            jobs,
            credentials,
            placeholders,
            watcher,
            executor,
            hasher: Hasher::with_buffer_size(config.hash_buffer_size),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Runs one job to completion. Returns `SyncError::Conflict`-free
    /// results even when individual files conflict — conflicts are
    /// counted in `SyncResult`, not raised as an error; the only error
    /// this returns is a structural one (can't connect, job already
    /// running, etc).
    #[instrument(skip(self, job), fields(job_id = job.id, job_name = %job.name))]
    pub fn sync(&self, job: &mut Job, request: RunRequest) -> Result<SyncResult> {
        self.claim_run_slot(job.id)?;
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let result = self.run(job, request, &cancel);
        self.release_run_slot(job.id);
        result
    }

    /// Cooperative cancellation: flips the shared flag the Scanner and
    /// Executor poll between entries/operations. Takes effect at the
    /// next safe boundary, not instantly.
    pub fn request_cancel(&self, cancel: &CancelFlag) {
        cancel.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    fn claim_run_slot(&self, job_id: JobId) -> Result<()> {
        let mut running = self.running.lock();
        if !running.insert(job_id) {
            return Err(SyncError::config(format!(
                "job {job_id} is already running"
            )));
        }
        Ok(())
    }

    fn release_run_slot(&self, job_id: JobId) {
        self.running.lock().remove(&job_id);
    }

    fn run(&self, job: &mut Job, request: RunRequest, cancel: &CancelFlag) -> Result<SyncResult> {
        let start = Instant::now();
        info!(?request, "starting sync run");

        job.validate()?;

        self.watcher.suppress(job.id, DEFAULT_SUPPRESSION);

        let credentials = self
            .credentials
            .load(&job.remote.host)?
            .ok_or_else(|| SyncError::auth(job.remote.host.clone(), "no stored credentials for host"))?;

        let mut transport = SmbTransport::new(job.remote.clone(), credentials);
        transport.connect()?;
        let run_outcome = self.run_phases(job, &transport, cancel);
        let _ = transport.disconnect();

        self.watcher.suppress(job.id, DEFAULT_SUPPRESSION);

        let mut result = run_outcome?;
        result.duration = start.elapsed();
        job.last_run = Some(std::time::SystemTime::now());
        let _ = self.jobs.save_job(job);

        info!(
            uploaded = result.uploaded,
            downloaded = result.downloaded,
            deleted = result.deleted,
            conflicts = result.conflicts,
            errors = result.errors.len(),
            status = ?result.status,
            "sync run finished"
        );
        Ok(result)
    }

    fn run_phases(
        &self,
        job: &mut Job,
        transport: &dyn RemoteTransport,
        cancel: &CancelFlag,
    ) -> Result<SyncResult> {
        // Phase: Scanning.
        let remote_root = job.remote.root();
        let local = scanner::scan_local(&job.local_root, cancel)?;
        let remote = scanner::scan_remote(transport, &remote_root, cancel)?;
        if cancel.load(std::sync::atomic::Ordering::Relaxed) {
            return Ok(cancelled_result());
        }

        // Phase: Detecting. Deletes only fire once a baseline exists —
        // spec.md §8's no-data-loss-on-first-sync property.
        let baseline = if job.flags.first_sync_done {
            self.jobs.load_baseline(job.id)?
        } else {
            None
        };
        let hashed_local = self.hash_conflicts(&job.local_root, &local, &remote, baseline.as_ref())?;
        let plan = differ::diff(
            &hashed_local,
            &remote,
            job.mode,
            job.conflict_policy,
            baseline.as_ref(),
        );

        if cancel.load(std::sync::atomic::Ordering::Relaxed) {
            return Ok(cancelled_result());
        }

        // Files-on-demand: remote-only files become zero-byte
        // placeholders instead of full downloads (spec.md §4.7). The
        // placeholder provider fetches real content lazily on first
        // open, so these operations are pulled out of the plan before
        // the Executor ever sees them.
        let mut plan = plan;
        let placeholders_created = self.materialize_placeholders(job, &mut plan, &remote);

        // Phase: Executing.
        let mut result = self.executor.execute(
            &plan,
            &job.local_root,
            &remote_root,
            transport,
            &crate::progress::NullProgress,
            cancel,
        );
        result.downloaded += placeholders_created;

        // Phase: Finalizing. A completed (or partially completed) run
        // still advances the baseline and first-sync flag — a partial
        // failure shouldn't force every untouched file to be re-examined
        // for deletion next time.
        if !matches!(result.status, Some(RunPhase::Cancelled)) {
            let post_run_local = scanner::scan_local(&job.local_root, cancel)?;
            self.jobs.save_baseline(job.id, &post_run_local)?;
            if !job.flags.first_sync_done {
                job.flags.first_sync_done = true;
            }
        }

        Ok(result)
    }

    /// Mirrors the remote tree into placeholders for a `files_on_demand`
    /// job (spec.md §4.7) via a single [`PlaceholderProvider::populate`]
    /// call, then pulls any `Download` operation the provider actually
    /// stubbed out of the plan. `populate` also removes orphaned
    /// placeholders whose remote file has vanished, so deleted remote
    /// files stop appearing as local stubs without waiting on a
    /// baseline-gated `DeleteLocal`. `KeepBoth` downloads are left
    /// alone — a file a user explicitly chose to keep both copies of is
    /// one they're about to look at.
    fn materialize_placeholders(&self, job: &Job, plan: &mut SyncPlan, remote: &ScanResult) -> usize {
        if !job.flags.files_on_demand {
            return 0;
        }

        let remote_entries: Vec<_> = remote.files.values().cloned().collect();
        let report = match self.placeholders.populate(&job.local_root, &remote_entries) {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "failed to populate placeholders, falling back to full downloads");
                return 0;
            }
        };
        if !report.removed.is_empty() {
            info!(
                count = report.removed.len(),
                "removed orphaned placeholders for files deleted on the remote"
            );
        }

        let mut remaining = Vec::with_capacity(plan.operations.len());
        let mut materialized = 0;
        for op in plan.operations.drain(..) {
            let Operation::Download(path) = &op else {
                remaining.push(op);
                continue;
            };
            let local_path = job.local_root.join(path);
            if self.placeholders.state_of(&local_path) == Some(HydrationState::Placeholder) {
                materialized += 1;
                plan.counters.downloads = plan.counters.downloads.saturating_sub(1);
            } else {
                remaining.push(op);
            }
        }
        plan.operations = remaining;
        materialized
    }

    /// Computes content hashes only for paths that need the hash-based
    /// equality/conflict tie-break (spec.md §4.4): both sides present,
    /// and the cheap size+mtime test already failed. Hashing every file
    /// on every run would make large trees prohibitively slow.
    fn hash_conflicts(
        &self,
        local_root: &std::path::Path,
        local: &ScanResult,
        remote: &ScanResult,
        _baseline: Option<&ScanResult>,
    ) -> Result<ScanResult> {
        let mut hashed = local.clone();
        for (path, record) in hashed.files.iter_mut() {
            let Some(remote_record) = remote.files.get(path) else {
                continue;
            };
            let size_matches = record.size == remote_record.size;
            let skew = if record.modified > remote_record.modified {
                record.modified.duration_since(remote_record.modified).unwrap_or_default()
            } else {
                remote_record.modified.duration_since(record.modified).unwrap_or_default()
            };
            if size_matches && skew <= std::time::Duration::from_secs(2) {
                continue;
            }
            match self.hasher.hash_file(&local_root.join(path)) {
                Ok((_, hash)) => record.hash = Some(hash),
                Err(err) => {
                    warn!(path = %path, error = %err, "failed to hash file for conflict resolution, leaving unhashed");
                }
            }
        }
        Ok(hashed)
    }
}

fn cancelled_result() -> SyncResult {
    SyncResult {
        status: Some(RunPhase::Cancelled),
        ..Default::default()
    }
}
