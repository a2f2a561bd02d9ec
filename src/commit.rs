//! Commit pipeline - turns a changed file into a pushed commit
//!
//! A change is mapped to the repository that owns it, then that repository
//! is staged, committed and pushed while holding its lock. Runs for
//! different repositories may overlap; runs for the same repository never
//! overlap each other or a pull.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Local};
use tracing::debug;

use crate::error::SyncError;
use crate::git::{Credentials, GitBackend, Identity};
use crate::locks::RepoLocks;
use crate::repository::{CommitStatus, RepositoryHandle};

/// What a pipeline run did to one repository
#[derive(Debug)]
pub struct CommitReport {
    pub repository: PathBuf,
    pub status: CommitStatus,
}

/// Message for an automatic commit made at `now`
pub fn commit_message(prefix: &str, now: DateTime<Local>) -> String {
    format!("{} {}", prefix, now.format("%Y-%m-%d %H:%M:%S"))
}

pub struct CommitPipeline {
    git: Arc<dyn GitBackend>,
    locks: RepoLocks,
    credentials: Arc<Credentials>,
    author: Identity,
    message_prefix: String,
    roots: RwLock<BTreeSet<PathBuf>>,
}

impl CommitPipeline {
    pub fn new(
        git: Arc<dyn GitBackend>,
        locks: RepoLocks,
        credentials: Arc<Credentials>,
        author: Identity,
        message_prefix: impl Into<String>,
    ) -> Self {
        Self {
            git,
            locks,
            credentials,
            author,
            message_prefix: message_prefix.into(),
            roots: RwLock::new(BTreeSet::new()),
        }
    }

    /// Make repository roots known for owner resolution.
    pub fn register_roots<I>(&self, roots: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut known = self.roots.write().unwrap_or_else(PoisonError::into_inner);
        known.extend(roots);
    }

    /// Forget repository roots that no longer exist.
    pub fn unregister_roots(&self, roots: &[PathBuf]) {
        let mut known = self.roots.write().unwrap_or_else(PoisonError::into_inner);
        for root in roots {
            known.remove(root);
        }
    }

    /// Repository that owns `path`.
    ///
    /// The deepest registered root among the path's ancestors wins. Paths
    /// under no registered root fall back to the nearest ancestor holding a
    /// `.git` directory.
    pub fn resolve_repository(&self, path: &Path) -> Result<PathBuf, SyncError> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|_| SyncError::NotInRepository(path.to_path_buf()))?
                .join(path)
        };
        let path = path_clean::clean(&path);

        {
            let known = self.roots.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(root) = path.ancestors().find(|ancestor| known.contains(*ancestor)) {
                return Ok(root.to_path_buf());
            }
        }

        let found = path
            .ancestors()
            .find(|ancestor| ancestor.join(".git").is_dir())
            .map(Path::to_path_buf);
        found.ok_or(SyncError::NotInRepository(path))
    }

    /// Commit and push whatever changed in the repository owning `path`.
    pub async fn on_change(&self, path: &Path) -> Result<CommitReport, SyncError> {
        let repository = self.resolve_repository(path)?;
        debug!("{} belongs to {}", path.display(), repository.display());
        self.commit_repository(repository).await
    }

    /// Run the pipeline for a repository root directly.
    pub async fn commit_repository(&self, repository: PathBuf) -> Result<CommitReport, SyncError> {
        let guard = self.locks.acquire(&repository).await;

        let git = self.git.clone();
        let credentials = self.credentials.clone();
        let author = self.author.clone();
        let prefix = self.message_prefix.clone();

        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let handle = RepositoryHandle::open(&repository, credentials, git.as_ref())?;
            let message = commit_message(&prefix, Local::now());
            let status = handle.commit_changes(git.as_ref(), &author, &message)?;
            Ok(CommitReport { repository, status })
        });

        task.await.map_err(|e| SyncError::Task(e.to_string()))?
    }
}
