//! Error types for repository-scoped sync operations
//!
//! Everything that can go wrong while pulling or committing a single
//! repository is a [`SyncError`]. These errors are always reported at the
//! repository granularity; they never abort sibling repositories or the
//! daemon. Only [`DiscoveryError`] at startup is fatal.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a [`SyncError`], used for logging and summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The path is not a usable repository
    Open,
    /// Fetch or push failed (transport, authentication, rejection)
    Network,
    /// The remote tracking branch is missing
    RefResolution,
    /// Checkout, staging or ref update failed
    WorkingTree,
    /// Commit creation failed
    Commit,
    /// A changed path could not be mapped to a repository
    Resolution,
    /// The operation exceeded the configured deadline
    Timeout,
    /// The worker task panicked or was cancelled
    Task,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Open => "open",
            ErrorKind::Network => "network",
            ErrorKind::RefResolution => "ref_resolution",
            ErrorKind::WorkingTree => "working_tree",
            ErrorKind::Commit => "commit",
            ErrorKind::Resolution => "resolution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Task => "task",
        }
    }
}

/// Errors from a single repository's pull or commit pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    #[error("failed to open repository at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("{path} is a bare repository")]
    Bare { path: PathBuf },

    #[error("remote '{remote}' not found: {source}")]
    RemoteNotFound {
        remote: String,
        #[source]
        source: git2::Error,
    },

    #[error("failed to fetch from '{remote}': {source}")]
    Fetch {
        remote: String,
        #[source]
        source: git2::Error,
    },

    #[error("failed to push to '{remote}': {source}")]
    Push {
        remote: String,
        #[source]
        source: git2::Error,
    },

    #[error("push to '{remote}' rejected: {message}")]
    PushRejected { remote: String, message: String },

    #[error("tracking ref {name} not found: {source}")]
    RefResolution {
        name: String,
        #[source]
        source: git2::Error,
    },

    #[error("merge analysis failed: {0}")]
    Analysis(#[source] git2::Error),

    #[error("failed to {operation}: {source}")]
    WorkingTree {
        operation: &'static str,
        #[source]
        source: git2::Error,
    },

    #[error("failed to create commit: {0}")]
    Commit(#[source] git2::Error),

    #[error("no repository owns {0}")]
    NotInRepository(PathBuf),

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("worker task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub(crate) fn working_tree(operation: &'static str) -> impl FnOnce(git2::Error) -> Self {
        move |source| SyncError::WorkingTree { operation, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Open { .. } | SyncError::Bare { .. } => ErrorKind::Open,
            SyncError::RemoteNotFound { .. }
            | SyncError::Fetch { .. }
            | SyncError::Push { .. }
            | SyncError::PushRejected { .. } => ErrorKind::Network,
            SyncError::RefResolution { .. } => ErrorKind::RefResolution,
            SyncError::Analysis(_) | SyncError::WorkingTree { .. } => ErrorKind::WorkingTree,
            SyncError::Commit(_) => ErrorKind::Commit,
            SyncError::NotInRepository(_) => ErrorKind::Resolution,
            SyncError::TimedOut(_) => ErrorKind::Timeout,
            SyncError::Task(_) => ErrorKind::Task,
        }
    }
}

/// Errors while locating repositories under the root directory.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("root directory {0} does not exist or is not a directory")]
    InvalidRoot(PathBuf),

    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
