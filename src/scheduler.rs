use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    model::{Job, JobId, TriggerMode},
    watcher::SyncWatcher,
};

/// Decides *when* `Coordinator::sync` runs for a job; the `sync` call
/// itself stays an external entry point the scheduler merely drives.
/// Scheduling is listed as an external collaborator in spec.md §4.6 — the
/// core defines the trait and the two trigger modes (`Manual`,
/// `Interval`) that don't need a live OS notification, plus wiring for
/// `Realtime` through the [`SyncWatcher`] the Coordinator already owns.
///
/// Generalized from the teacher's global `static TASK_QUEUE`/
/// `static COMMAND_TX` singletons (spec.md §9 Design Notes): this is an
/// owned service the application root constructs once, not a
/// process-wide `Lazy`.
pub trait Scheduler: Send + Sync {
    /// Registers `job` for scheduling under its own `trigger` mode,
    /// replacing any previous registration for the same id.
    fn schedule(&self, job: &Job);

    /// Drops `job_id` from the schedule entirely (job disabled or
    /// deleted).
    fn unschedule(&self, job_id: JobId);

    /// Returns the job ids whose `Interval` trigger is due to run as of
    /// `now`, given each job's stored `next_run`. Does not mutate any
    /// stored state — the caller advances `next_run` after a successful
    /// run via [`Scheduler::record_run`].
    fn due(&self, now: SystemTime) -> Vec<JobId>;

    /// Records that `job_id` just ran at `now`, advancing its next
    /// `Interval` due time. A no-op for `Manual`/`Realtime` jobs.
    fn record_run(&self, job_id: JobId, now: SystemTime);
}

struct ScheduledJob {
    trigger: TriggerMode,
    next_due: Option<SystemTime>,
}

/// Reference scheduler: `Interval` jobs are tracked by due time and
/// surfaced through [`Scheduler::due`] for a caller's own timer loop to
/// poll; `Realtime` jobs are handed to the shared [`SyncWatcher`] so a
/// local filesystem change enqueues them instead. `Manual` jobs are
/// tracked only so `unschedule` has something to remove.
///
/// Matches the teacher's `watcher.rs` ownership style: constructed once
/// by the application root (here, alongside the `Coordinator`) and held
/// behind an `Arc`, not reached for through a global.
pub struct IntervalScheduler {
    watcher: Arc<dyn SyncWatcher>,
    jobs: Mutex<HashMap<JobId, ScheduledJob>>,
}

impl IntervalScheduler {
    pub fn new(watcher: Arc<dyn SyncWatcher>) -> Self {
        Self {
            watcher,
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Scheduler for IntervalScheduler {
    fn schedule(&self, job: &Job) {
        match job.trigger {
            TriggerMode::Manual => {
                self.jobs.lock().insert(
                    job.id,
                    ScheduledJob {
                        trigger: job.trigger,
                        next_due: None,
                    },
                );
            }
            TriggerMode::Interval(interval) => {
                let next_due = job
                    .last_run
                    .map(|last| last + interval.as_duration())
                    .unwrap_or_else(SystemTime::now);
                self.jobs.lock().insert(
                    job.id,
                    ScheduledJob {
                        trigger: job.trigger,
                        next_due: Some(next_due),
                    },
                );
            }
            TriggerMode::Realtime => {
                self.jobs.lock().insert(
                    job.id,
                    ScheduledJob {
                        trigger: job.trigger,
                        next_due: None,
                    },
                );
                if let Err(err) = self.watcher.watch(job.id, vec![job.local_root.clone()]) {
                    debug!(job_id = job.id, error = %err, "failed to start realtime watch");
                }
            }
        }
    }

    fn unschedule(&self, job_id: JobId) {
        self.jobs.lock().remove(&job_id);
        self.watcher.unwatch(job_id);
    }

    fn due(&self, now: SystemTime) -> Vec<JobId> {
        self.jobs
            .lock()
            .iter()
            .filter_map(|(id, scheduled)| match scheduled.next_due {
                Some(due) if due <= now => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn record_run(&self, job_id: JobId, now: SystemTime) {
        let mut jobs = self.jobs.lock();
        let Some(scheduled) = jobs.get_mut(&job_id) else {
            return;
        };
        if let TriggerMode::Interval(interval) = scheduled.trigger {
            scheduled.next_due = Some(now + interval.as_duration());
        }
    }
}

/// Used by the CLI and by tests: every job is `Manual`-only, `due`
/// never returns anything, and nothing is watched. Satisfies the trait
/// without pulling in a timer loop for callers that only ever trigger
/// syncs explicitly.
#[derive(Default)]
pub struct ManualScheduler;

impl Scheduler for ManualScheduler {
    fn schedule(&self, _job: &Job) {}
    fn unschedule(&self, _job_id: JobId) {}
    fn due(&self, _now: SystemTime) -> Vec<JobId> {
        Vec::new()
    }
    fn record_run(&self, _job_id: JobId, _now: SystemTime) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::NotifyWatcher;
    use std::path::PathBuf;

    fn job_with_trigger(id: JobId, trigger: TriggerMode) -> Job {
        Job {
            id,
            name: "job".into(),
            local_root: PathBuf::from("/tmp/job"),
            remote: crate::model::RemoteEndpoint {
                host: "h".into(),
                share: "s".into(),
                subpath: None,
                port: 445,
            },
            mode: crate::model::SyncMode::Mirror,
            conflict_policy: crate::model::ConflictPolicy::Recent,
            trigger,
            flags: crate::model::JobFlags::default(),
            auto_dehydrate_days: 0,
            last_run: None,
            next_run: None,
        }
    }

    #[test]
    fn manual_scheduler_never_reports_anything_due() {
        let scheduler = ManualScheduler;
        scheduler.schedule(&job_with_trigger(1, TriggerMode::Manual));
        assert!(scheduler.due(SystemTime::now() + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn interval_job_becomes_due_only_after_the_interval_elapses() {
        let watcher: Arc<dyn SyncWatcher> = Arc::new(NotifyWatcher::default());
        let scheduler = IntervalScheduler::new(watcher);
        let now = SystemTime::now();
        let mut job = job_with_trigger(1, TriggerMode::Interval(crate::model::IntervalMinutes::Five));
        job.last_run = Some(now);
        scheduler.schedule(&job);

        assert!(scheduler.due(now + Duration::from_secs(60)).is_empty());
        assert_eq!(scheduler.due(now + Duration::from_secs(5 * 60 + 1)), vec![1]);
    }

    #[test]
    fn record_run_advances_the_next_due_time() {
        let watcher: Arc<dyn SyncWatcher> = Arc::new(NotifyWatcher::default());
        let scheduler = IntervalScheduler::new(watcher);
        let now = SystemTime::now();
        let mut job = job_with_trigger(1, TriggerMode::Interval(crate::model::IntervalMinutes::Five));
        job.last_run = Some(now);
        scheduler.schedule(&job);

        scheduler.record_run(1, now + Duration::from_secs(5 * 60 + 1));
        assert!(scheduler
            .due(now + Duration::from_secs(5 * 60 + 2))
            .is_empty());
        assert_eq!(
            scheduler.due(now + Duration::from_secs(10 * 60 + 2)),
            vec![1]
        );
    }

    #[test]
    fn unschedule_removes_the_job() {
        let watcher: Arc<dyn SyncWatcher> = Arc::new(NotifyWatcher::default());
        let scheduler = IntervalScheduler::new(watcher);
        let mut job = job_with_trigger(1, TriggerMode::Interval(crate::model::IntervalMinutes::Five));
        job.last_run = Some(SystemTime::now() - Duration::from_secs(3600));
        scheduler.schedule(&job);
        scheduler.unschedule(1);
        assert!(scheduler.due(SystemTime::now()).is_empty());
    }
}
