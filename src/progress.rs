use std::{
    io::Write,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Emitted as the Executor works through a plan (spec.md §4.5): callers
/// (the CLI, a future GUI collaborator) render these however they like.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    Started { path: String },
    BytesTransferred { path: String, bytes: u64 },
    Finished { path: String },
    Failed { path: String, message: String },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Discards every event. Used by tests and by callers that only care
/// about the final `SyncResult`.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_event(&self, _event: ProgressEvent) {}
}

/// A single overwritten `\r` line on stdout, generalized from the
/// teacher's `TaskProgress::percent()` bar — no indicatif-style crate,
/// just `print!` and a carriage return, matching the teacher's texture.
pub struct ConsoleProgress {
    total: usize,
    done: AtomicUsize,
}

impl ConsoleProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            done: AtomicUsize::new(0),
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Finished { path } | ProgressEvent::Failed { path, .. } => {
                let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
                print!("\r[{done}/{}] {path}                    ", self.total);
                let _ = std::io::stdout().flush();
            }
            _ => {}
        }
    }
}
