use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use anemone_sync_core::{
    cli::{self, Cli},
    config::{JobStore, JsonJobStore},
    coordinator::Coordinator,
    credentials::{CredentialStore, KeyringCredentialStore},
    placeholder::{NoopPlaceholderProvider, PlaceholderProvider},
    scheduler::{ManualScheduler, Scheduler},
    watcher::NotifyWatcher,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let jobs: Arc<dyn JobStore> = match JsonJobStore::at_default_location() {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("failed to open job store: {err}");
            std::process::exit(1);
        }
    };
    let credentials: Arc<dyn CredentialStore> = Arc::new(KeyringCredentialStore);
    let placeholders: Arc<dyn PlaceholderProvider> = Arc::new(NoopPlaceholderProvider::default());
    let watcher = Arc::new(NotifyWatcher::default());
    let app_config = jobs.load_config().unwrap_or_default();

    let coordinator = Coordinator::with_config(
        jobs.clone(),
        credentials,
        placeholders.clone(),
        watcher,
        &app_config,
    );

    // The CLI only ever triggers runs explicitly (`sync`, `sync-all`), so
    // it needs no interval timer loop — `ManualScheduler` is the trigger
    // dispatch the real daemon's scheduler (an external collaborator,
    // spec.md §4.6) would otherwise drive `Coordinator::sync` through.
    let scheduler: Arc<dyn Scheduler> = Arc::new(ManualScheduler);
    if let Ok(loaded_jobs) = jobs.load_jobs() {
        for job in &loaded_jobs {
            scheduler.schedule(job);
        }
    }

    let code = cli::run(cli, &jobs, &coordinator, &placeholders);
    std::process::exit(code);
}
