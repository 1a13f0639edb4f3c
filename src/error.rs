use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for the synchronization core. Callers match on
/// [`SyncError::kind`] rather than the variant itself — the kind is the
/// stable contract, the message is for humans.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error talking to {host}: {message}")]
    Network { host: String, message: String },

    #[error("authentication failed for {host}: {message}")]
    Auth { host: String, message: String },

    #[error("not found: {path}")]
    NotFound { path: PathBuf },

    #[error("unresolved conflict at {path}")]
    Conflict { path: PathBuf },

    #[error("cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid job configuration: {message}")]
    Config { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Auth,
    NotFound,
    Conflict,
    Cancelled,
    Io,
    Config,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network { .. } => ErrorKind::Network,
            SyncError::Auth { .. } => ErrorKind::Auth,
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::Conflict { .. } => ErrorKind::Conflict,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Io { .. } => ErrorKind::Io,
            SyncError::Config { .. } => ErrorKind::Config,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        SyncError::NotFound { path: path.into() }
    }

    pub fn network(host: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Network {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn auth(host: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Auth {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Config {
            message: message.into(),
        }
    }

    /// A server-closed socket is downgraded from `Network` to an
    /// informational condition when it matches one of the known
    /// graceful-teardown patterns (spec.md §4.1).
    pub fn is_benign_disconnect(message: &str) -> bool {
        const PATTERNS: [&str; 3] = [
            "closed network connection",
            "connection reset by peer",
            "broken pipe",
        ];
        PATTERNS.iter().any(|pattern| message.contains(pattern))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Exit codes for the CLI front-end (spec.md §6).
pub fn exit_code_for(err: &SyncError) -> i32 {
    match err.kind() {
        ErrorKind::Config | ErrorKind::NotFound => 1,
        _ => 2,
    }
}
