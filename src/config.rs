use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SyncError},
    model::{ConflictPolicy, Job, JobId, ScanResult},
};

const CONFIG_DIR_NAME: &str = "anemone-sync";
const JOBS_FILE_NAME: &str = "jobs.json";

/// Process-wide settings, independent of any one job (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_true")]
    pub confirm_destructive: bool,
    #[serde(default)]
    pub limit_bandwidth: bool,
    #[serde(default = "default_bandwidth")]
    pub bandwidth_mbps: u32,
    /// Executor worker-pool width; 0 means "derive from
    /// `available_parallelism()`" the way [`crate::executor::Executor`]'s
    /// own `Default` impl already does.
    #[serde(default)]
    pub worker_pool_width: usize,
    /// Buffer size, in bytes, [`crate::hasher::Hasher`] reads in per
    /// chunk.
    #[serde(default = "default_hash_buffer_size")]
    pub hash_buffer_size: usize,
    /// Conflict policy a newly-created job is seeded with; has no effect
    /// on a job already carrying its own `conflict_policy`.
    #[serde(default = "default_conflict_policy")]
    pub default_conflict_policy: ConflictPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            confirm_destructive: true,
            limit_bandwidth: false,
            bandwidth_mbps: 200,
            worker_pool_width: 0,
            hash_buffer_size: default_hash_buffer_size(),
            default_conflict_policy: default_conflict_policy(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bandwidth() -> u32 {
    200
}

fn default_hash_buffer_size() -> usize {
    4 * 1024 * 1024
}

fn default_conflict_policy() -> ConflictPolicy {
    ConflictPolicy::Recent
}

/// The persistence collaborator spec.md §6 names as an external
/// surface: jobs, their baselines, and app-wide config. The real
/// database the production system uses can implement this trait
/// directly; `JsonJobStore` below is the reference implementation this
/// crate ships with.
///
/// Generalized from the teacher's `config.rs` free functions
/// (`load_state`/`save_state`) into a trait so callers aren't locked
/// into one backing store.
pub trait JobStore: Send + Sync {
    fn load_jobs(&self) -> Result<Vec<Job>>;
    fn save_job(&self, job: &Job) -> Result<()>;
    fn delete_job(&self, id: JobId) -> Result<()>;

    fn load_baseline(&self, id: JobId) -> Result<Option<ScanResult>>;
    fn save_baseline(&self, id: JobId, baseline: &ScanResult) -> Result<()>;

    fn load_config(&self) -> Result<AppConfig>;
    fn save_config(&self, config: &AppConfig) -> Result<()>;
}

#[derive(Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    config: AppConfigOrDefault,
    #[serde(default)]
    jobs: Vec<Job>,
    #[serde(default)]
    baselines: std::collections::HashMap<JobId, ScanResult>,
}

#[derive(Serialize, Deserialize)]
struct AppConfigOrDefault(AppConfig);

impl Default for AppConfigOrDefault {
    fn default() -> Self {
        Self(AppConfig::default())
    }
}

/// JSON-file-backed `JobStore`, rooted at the platform config directory
/// — same `dirs::config_dir` lookup the teacher's `config_path` used,
/// generalized from a single settings blob into a jobs-plus-baselines
/// document.
pub struct JsonJobStore {
    path: PathBuf,
    lock: std::sync::Mutex<()>,
}

impl JsonJobStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: std::sync::Mutex::new(()),
        }
    }

    /// The default location: `<config_dir>/anemone-sync/jobs.json`.
    pub fn at_default_location() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| SyncError::config("no config directory available on this platform"))?;
        Ok(Self::new(dir.join(CONFIG_DIR_NAME).join(JOBS_FILE_NAME)))
    }

    fn read(&self) -> Result<PersistedState> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|err| SyncError::config(format!("corrupt job store at {}: {err}", self.path.display()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(err) => Err(SyncError::io(self.path.clone(), err)),
        }
    }

    fn write(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::io(parent.to_path_buf(), err))?;
        }
        let contents = serde_json::to_string_pretty(state)
            .map_err(|err| SyncError::config(format!("failed to serialize job store: {err}")))?;
        fs::write(&self.path, contents).map_err(|err| SyncError::io(self.path.clone(), err))
    }
}

impl JobStore for JsonJobStore {
    fn load_jobs(&self) -> Result<Vec<Job>> {
        let _guard = self.lock.lock().expect("job store mutex poisoned");
        Ok(self.read()?.jobs)
    }

    fn save_job(&self, job: &Job) -> Result<()> {
        let _guard = self.lock.lock().expect("job store mutex poisoned");
        let mut state = self.read()?;
        if let Some(existing) = state.jobs.iter_mut().find(|j| j.id == job.id) {
            *existing = job.clone();
        } else {
            state.jobs.push(job.clone());
        }
        self.write(&state)
    }

    fn delete_job(&self, id: JobId) -> Result<()> {
        let _guard = self.lock.lock().expect("job store mutex poisoned");
        let mut state = self.read()?;
        state.jobs.retain(|job| job.id != id);
        state.baselines.remove(&id);
        self.write(&state)
    }

    fn load_baseline(&self, id: JobId) -> Result<Option<ScanResult>> {
        let _guard = self.lock.lock().expect("job store mutex poisoned");
        Ok(self.read()?.baselines.get(&id).cloned())
    }

    fn save_baseline(&self, id: JobId, baseline: &ScanResult) -> Result<()> {
        let _guard = self.lock.lock().expect("job store mutex poisoned");
        let mut state = self.read()?;
        state.baselines.insert(id, baseline.clone());
        self.write(&state)
    }

    fn load_config(&self) -> Result<AppConfig> {
        let _guard = self.lock.lock().expect("job store mutex poisoned");
        Ok(self.read()?.config.0)
    }

    fn save_config(&self, config: &AppConfig) -> Result<()> {
        let _guard = self.lock.lock().expect("job store mutex poisoned");
        let mut state = self.read()?;
        state.config = AppConfigOrDefault(config.clone());
        self.write(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConflictPolicy, JobFlags, RemoteEndpoint, SyncMode, TriggerMode};
    use tempfile::tempdir;

    fn sample_job(id: JobId) -> Job {
        Job {
            id,
            name: "test job".into(),
            local_root: "/tmp/a".into(),
            remote: RemoteEndpoint {
                host: "fileserver".into(),
                share: "share".into(),
                subpath: None,
                port: 445,
            },
            mode: SyncMode::Mirror,
            conflict_policy: ConflictPolicy::Recent,
            trigger: TriggerMode::Manual,
            flags: JobFlags::default(),
            auto_dehydrate_days: 0,
            last_run: None,
            next_run: None,
        }
    }

    #[test]
    fn jobs_round_trip_through_the_json_file() {
        let dir = tempdir().unwrap();
        let store = JsonJobStore::new(dir.path().join("jobs.json"));

        store.save_job(&sample_job(1)).unwrap();
        store.save_job(&sample_job(2)).unwrap();

        let jobs = store.load_jobs().unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn deleting_a_job_also_drops_its_baseline() {
        let dir = tempdir().unwrap();
        let store = JsonJobStore::new(dir.path().join("jobs.json"));
        store.save_job(&sample_job(1)).unwrap();
        store.save_baseline(1, &ScanResult::empty()).unwrap();

        store.delete_job(1).unwrap();

        assert!(store.load_jobs().unwrap().is_empty());
        assert!(store.load_baseline(1).unwrap().is_none());
    }

    #[test]
    fn missing_file_yields_empty_defaults_rather_than_an_error() {
        let dir = tempdir().unwrap();
        let store = JsonJobStore::new(dir.path().join("does-not-exist.json"));
        assert!(store.load_jobs().unwrap().is_empty());
        let config = store.load_config().unwrap();
        assert_eq!(config.bandwidth_mbps, 200);
        assert_eq!(config.worker_pool_width, 0);
        assert_eq!(config.hash_buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.default_conflict_policy, ConflictPolicy::Recent);
    }

    #[test]
    fn app_config_round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let store = JsonJobStore::new(dir.path().join("jobs.json"));

        let mut config = AppConfig::default();
        config.worker_pool_width = 6;
        config.hash_buffer_size = 1024 * 1024;
        config.default_conflict_policy = ConflictPolicy::KeepBoth;
        store.save_config(&config).unwrap();

        let loaded = store.load_config().unwrap();
        assert_eq!(loaded.worker_pool_width, 6);
        assert_eq!(loaded.hash_buffer_size, 1024 * 1024);
        assert_eq!(loaded.default_conflict_policy, ConflictPolicy::KeepBoth);
    }
}
