use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};

pub type JobId = u64;

/// A job's persistent configuration: the pairing of a local root and a
/// remote SMB endpoint, plus the policies that govern how they reconcile.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub local_root: PathBuf,
    pub remote: RemoteEndpoint,
    pub mode: SyncMode,
    pub conflict_policy: ConflictPolicy,
    pub trigger: TriggerMode,
    pub flags: JobFlags,
    /// 0 = auto-dehydration disabled.
    pub auto_dehydrate_days: u32,
    pub last_run: Option<SystemTime>,
    pub next_run: Option<SystemTime>,
}

impl Job {
    pub fn validate(&self) -> Result<(), crate::error::SyncError> {
        if self.local_root.as_os_str().is_empty() {
            return Err(crate::error::SyncError::config(
                "job local_root must not be empty",
            ));
        }
        if self.remote.host.is_empty() || self.remote.share.is_empty() {
            return Err(crate::error::SyncError::config(
                "job remote endpoint must specify host and share",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub host: String,
    pub share: String,
    #[serde(default)]
    pub subpath: Option<PathBuf>,
    #[serde(default = "default_smb_port")]
    pub port: u16,
}

fn default_smb_port() -> u16 {
    445
}

impl RemoteEndpoint {
    /// The remote root, relative to the share, that scans and transfers
    /// operate under.
    pub fn root(&self) -> PathBuf {
        self.subpath.clone().unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    Mirror,
    Upload,
    Download,
    MirrorPriority,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    Recent,
    Local,
    Remote,
    KeepBoth,
    Ask,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    Manual,
    Interval(IntervalMinutes),
    Realtime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalMinutes {
    Five,
    Fifteen,
    Thirty,
    Sixty,
}

impl IntervalMinutes {
    pub fn as_duration(self) -> Duration {
        let minutes = match self {
            IntervalMinutes::Five => 5,
            IntervalMinutes::Fifteen => 15,
            IntervalMinutes::Thirty => 30,
            IntervalMinutes::Sixty => 60,
        };
        Duration::from_secs(minutes * 60)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFlags {
    pub enabled: bool,
    pub sync_on_startup: bool,
    pub files_on_demand: bool,
    pub first_sync_done: bool,
    pub trust_source: bool,
}

impl Default for JobFlags {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_on_startup: false,
            files_on_demand: false,
            first_sync_done: false,
            trust_source: false,
        }
    }
}

/// A scanned file. Relative paths always use forward slashes and never
/// include the scan root (spec.md §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    /// UTC, millisecond-truncated, for stable cross-scan comparison.
    pub modified: SystemTime,
    pub hash: Option<String>,
}

impl FileRecord {
    pub fn truncate_modified(modified: SystemTime) -> SystemTime {
        let since_epoch = modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let millis = since_epoch.as_millis() as u64;
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanResult {
    pub files: BTreeMap<String, FileRecord>,
    pub scanned_at: SystemTime,
}

impl ScanResult {
    pub fn new(files: BTreeMap<String, FileRecord>) -> Self {
        Self {
            files,
            scanned_at: SystemTime::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Upload(String),
    Download(String),
    DeleteLocal(String),
    DeleteRemote(String),
    KeepBoth { path: String, suffix: String },
    Skip { path: String, reason: SkipReason },
    Conflict(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    Equal,
    ConflictTie,
    KeepBothOriginal,
}

impl Operation {
    /// Ordering phase: deletes first, transfers next, finalize last
    /// (spec.md §4.4). `Skip`/`Conflict` carry no ordering weight since
    /// they never touch the filesystem.
    pub fn phase(&self) -> u8 {
        match self {
            Operation::DeleteLocal(_) | Operation::DeleteRemote(_) => 0,
            Operation::Upload(_) | Operation::Download(_) | Operation::KeepBoth { .. } => 1,
            Operation::Skip { .. } | Operation::Conflict(_) => 2,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Operation::Upload(path)
            | Operation::Download(path)
            | Operation::DeleteLocal(path)
            | Operation::DeleteRemote(path)
            | Operation::Conflict(path) => path,
            Operation::KeepBoth { path, .. } => path,
            Operation::Skip { path, .. } => path,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlanCounters {
    pub uploads: usize,
    pub downloads: usize,
    pub deletes: usize,
    pub skips: usize,
    pub conflicts: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncPlan {
    pub operations: Vec<Operation>,
    pub counters: PlanCounters,
}

impl SyncPlan {
    pub fn push(&mut self, operation: Operation) {
        match &operation {
            Operation::Upload(_) => self.counters.uploads += 1,
            Operation::Download(_) => self.counters.downloads += 1,
            Operation::DeleteLocal(_) | Operation::DeleteRemote(_) => self.counters.deletes += 1,
            Operation::KeepBoth { .. } => self.counters.downloads += 1,
            Operation::Skip { .. } => self.counters.skips += 1,
            Operation::Conflict(_) => self.counters.conflicts += 1,
        }
        self.operations.push(operation);
    }

    /// Operations grouped and ordered by phase (0 deletes, 1 transfers,
    /// 2 finalize), each group internally unordered.
    pub fn phases(&self) -> [Vec<&Operation>; 3] {
        let mut phases: [Vec<&Operation>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for operation in &self.operations {
            phases[operation.phase() as usize].push(operation);
        }
        phases
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Scanning,
    Detecting,
    Executing,
    Finalizing,
    Complete,
    Partial,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunPhase::Complete | RunPhase::Partial | RunPhase::Failed | RunPhase::Cancelled
        )
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PerFileError {
    pub path: String,
    pub kind: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncResult {
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub errors: Vec<PerFileError>,
    pub bytes_transferred: u64,
    pub duration: Duration,
    pub status: Option<RunPhase>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HydrationState {
    Placeholder,
    Hydrating,
    Hydrated,
}

#[derive(Clone, Debug)]
pub struct Placeholder {
    pub path: String,
    pub declared_size: u64,
    pub declared_mtime: SystemTime,
    pub state: HydrationState,
    pub last_access: Option<SystemTime>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Manifest {
    pub files: Vec<ManifestEntry>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub mtime: u64,
    #[serde(default)]
    pub hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_counts_operations_by_kind() {
        let mut plan = SyncPlan::default();
        plan.push(Operation::Upload("a.txt".into()));
        plan.push(Operation::Download("b.txt".into()));
        plan.push(Operation::Skip {
            path: "c.txt".into(),
            reason: SkipReason::Equal,
        });

        assert_eq!(plan.counters.uploads, 1);
        assert_eq!(plan.counters.downloads, 1);
        assert_eq!(plan.counters.skips, 1);
    }

    #[test]
    fn phases_group_deletes_before_transfers_before_finalize() {
        let mut plan = SyncPlan::default();
        plan.push(Operation::Upload("new.txt".into()));
        plan.push(Operation::DeleteRemote("old.txt".into()));

        let phases = plan.phases();
        assert_eq!(phases[0].len(), 1);
        assert!(matches!(phases[0][0], Operation::DeleteRemote(_)));
        assert_eq!(phases[1].len(), 1);
        assert!(matches!(phases[1][0], Operation::Upload(_)));
    }
}
