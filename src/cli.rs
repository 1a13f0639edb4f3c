use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::{
    config::JobStore,
    coordinator::{Coordinator, RunRequest},
    error::exit_code_for,
    model::JobId,
    placeholder::{sweep_stale, PlaceholderProvider},
};

/// Bidirectional SMB directory sync.
#[derive(Parser)]
#[command(name = "anemone", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Lists configured jobs.
    ListJobs,
    /// Runs one job immediately.
    Sync {
        job_id: JobId,
    },
    /// Runs every enabled job immediately.
    SyncAll,
    /// Converts hydrated files back into placeholders for one job.
    Dehydrate {
        job_id: JobId,
        /// Only touch files whose last access is older than this many days.
        #[arg(long, default_value_t = 0)]
        days: u32,
    },
}

/// Executes a parsed [`Cli`] invocation and returns the process exit
/// code (spec.md §6: 0 success, 1 config/not-found, 2 everything else).
/// Generalized from the `wykurz-rcp` reference manifest's clap-derive
/// multi-subcommand shape — the teacher has no CLI at all, being a GUI
/// application end to end.
pub fn run(
    cli: Cli,
    jobs: &Arc<dyn JobStore>,
    coordinator: &Coordinator,
    placeholders: &Arc<dyn PlaceholderProvider>,
) -> i32 {
    match cli.command {
        Command::ListJobs => list_jobs(jobs),
        Command::Sync { job_id } => run_one(jobs, coordinator, job_id),
        Command::SyncAll => run_all(jobs, coordinator),
        Command::Dehydrate { job_id, days } => dehydrate(jobs, placeholders, job_id, days),
    }
}

fn list_jobs(jobs: &Arc<dyn JobStore>) -> i32 {
    match jobs.load_jobs() {
        Ok(jobs) => {
            for job in jobs {
                println!(
                    "{:>4}  {:<24} {} -> {}\\{}  [{:?} / {:?}]",
                    job.id, job.name, job.local_root.display(), job.remote.host, job.remote.share, job.mode, job.conflict_policy
                );
            }
            0
        }
        Err(err) => {
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}

fn run_one(jobs: &Arc<dyn JobStore>, coordinator: &Coordinator, job_id: JobId) -> i32 {
    let Some(mut job) = find_job(jobs, job_id) else {
        eprintln!("error: no job with id {job_id}");
        return 1;
    };

    match coordinator.sync(&mut job, RunRequest::Manual) {
        Ok(result) => {
            println!(
                "uploaded {} downloaded {} deleted {} skipped {} conflicts {} errors {}",
                result.uploaded, result.downloaded, result.deleted, result.skipped, result.conflicts, result.errors.len()
            );
            for error in &result.errors {
                eprintln!("  {}: {} ({})", error.path, error.message, error.kind);
            }
            if result.errors.is_empty() { 0 } else { 2 }
        }
        Err(err) => {
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}

fn run_all(jobs: &Arc<dyn JobStore>, coordinator: &Coordinator) -> i32 {
    let all_jobs = match jobs.load_jobs() {
        Ok(jobs) => jobs,
        Err(err) => {
            eprintln!("error: {err}");
            return exit_code_for(&err);
        }
    };

    let mut worst = 0;
    for mut job in all_jobs.into_iter().filter(|job| job.flags.enabled) {
        match coordinator.sync(&mut job, RunRequest::Manual) {
            Ok(result) if result.errors.is_empty() => {
                println!("{}: ok", job.name);
            }
            Ok(result) => {
                println!("{}: {} errors", job.name, result.errors.len());
                worst = worst.max(2);
            }
            Err(err) => {
                eprintln!("{}: {err}", job.name);
                worst = worst.max(exit_code_for(&err));
            }
        }
    }
    worst
}

fn dehydrate(
    jobs: &Arc<dyn JobStore>,
    placeholders: &Arc<dyn PlaceholderProvider>,
    job_id: JobId,
    days: u32,
) -> i32 {
    let Some(job) = find_job(jobs, job_id) else {
        eprintln!("error: no job with id {job_id}");
        return 1;
    };

    match sweep_stale(placeholders.as_ref(), &job.local_root, days, std::time::SystemTime::now()) {
        Ok(dehydrated) => {
            println!("dehydrated {} files", dehydrated.len());
            0
        }
        Err(err) => {
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}

fn find_job(jobs: &Arc<dyn JobStore>, job_id: JobId) -> Option<crate::model::Job> {
    jobs.load_jobs().ok()?.into_iter().find(|job| job.id == job_id)
}
