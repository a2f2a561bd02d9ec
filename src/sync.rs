//! Pull coordinator - runs one pull per repository concurrently
//!
//! Each handle gets its own unit of work. A unit takes the repository lock,
//! runs the blocking pull on the blocking pool and reports exactly one
//! [`PullOutcome`]. Failures stay inside their outcome; nothing a single
//! repository does can cancel or delay its siblings.

use crate::error::SyncError;
use crate::git::GitBackend;
use crate::locks::RepoLocks;
use crate::repository::{BadPath, OpenedRepositories, PullStatus, RepositoryHandle};
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Result of pulling one repository
#[derive(Debug)]
pub struct PullOutcome {
    pub repository: PathBuf,
    pub result: Result<PullStatus, SyncError>,
}

/// Results from a complete pull pass
#[derive(Debug)]
pub struct PullSummary {
    pub total_repositories: usize,
    pub up_to_date: usize,
    pub fast_forwarded: usize,
    pub diverged: usize,
    pub failed: usize,
    pub bad_paths: Vec<PathBuf>,
    pub duration: Duration,
    pub outcomes: Vec<PullOutcome>,
}

impl PullSummary {
    /// Compile a summary from the outcomes of one pass
    pub fn compile(outcomes: Vec<PullOutcome>, bad_paths: &[BadPath], duration: Duration) -> Self {
        let mut summary = Self {
            total_repositories: outcomes.len(),
            up_to_date: 0,
            fast_forwarded: 0,
            diverged: 0,
            failed: 0,
            bad_paths: bad_paths.iter().map(|bad| bad.path.clone()).collect(),
            duration,
            outcomes: Vec::new(),
        };

        for outcome in &outcomes {
            match &outcome.result {
                Ok(PullStatus::UpToDate { .. }) => summary.up_to_date += 1,
                Ok(PullStatus::FastForwarded { .. }) => summary.fast_forwarded += 1,
                Ok(PullStatus::Diverged { .. }) => summary.diverged += 1,
                Err(_) => summary.failed += 1,
            }
        }

        summary.outcomes = outcomes;
        summary
    }

    /// Report every failure and the totals through tracing
    pub fn log(&self) {
        for outcome in &self.outcomes {
            if let Err(e) = &outcome.result {
                error!(
                    path = %outcome.repository.display(),
                    kind = e.kind().as_str(),
                    "Pull failed: {}", e
                );
            }
        }

        for path in &self.bad_paths {
            warn!("Not a usable repository: {}", path.display());
        }

        info!(
            "Pull pass completed in {:.2}s: {} repos, {} up to date, {} fast-forwarded, {} diverged, {} failed, {} bad paths",
            self.duration.as_secs_f64(),
            self.total_repositories,
            self.up_to_date,
            self.fast_forwarded,
            self.diverged,
            self.failed,
            self.bad_paths.len()
        );
    }
}

/// Fans pulls out across repositories and gathers their outcomes
#[derive(Clone)]
pub struct PullCoordinator {
    git: Arc<dyn GitBackend>,
    locks: RepoLocks,
    max_parallel: usize,
    timeout: Option<Duration>,
}

impl PullCoordinator {
    /// `max_parallel == 0` runs every repository at once.
    pub fn new(
        git: Arc<dyn GitBackend>,
        locks: RepoLocks,
        max_parallel: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            git,
            locks,
            max_parallel,
            timeout,
        }
    }

    /// Pull every handle and return one outcome per handle, in completion order.
    pub async fn pull_all(&self, handles: Vec<RepositoryHandle>) -> Vec<PullOutcome> {
        let parallel = match self.max_parallel {
            0 => handles.len().max(1),
            n => n,
        };

        info!(
            "Pulling {} repositories with concurrency {}",
            handles.len(),
            parallel
        );

        // Create a semaphore to control concurrency
        let semaphore = Arc::new(Semaphore::new(parallel));
        let mut futures = FuturesUnordered::new();

        for handle in handles {
            let semaphore = semaphore.clone();
            let coordinator = self.clone();

            futures.push(async move {
                // The semaphore is never closed
                let _permit = semaphore.acquire_owned().await.ok();
                let repository = handle.path.clone();
                let result = coordinator.pull_one(handle).await;
                PullOutcome { repository, result }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(outcome) = futures.next().await {
            debug!("Pull finished: {:?}", outcome);
            outcomes.push(outcome);
        }

        outcomes
    }

    /// Run one pass over everything that opened and summarize it
    pub async fn pull_pass(&self, opened: &OpenedRepositories) -> PullSummary {
        let start_time = Instant::now();
        let outcomes = self.pull_all(opened.handles.clone()).await;
        PullSummary::compile(outcomes, &opened.bad_paths, start_time.elapsed())
    }

    /// Pull one repository under its lock.
    ///
    /// On timeout the blocking work keeps running and keeps the lock until it
    /// finishes, so a late pull can never overlap a commit.
    pub async fn pull_one(&self, handle: RepositoryHandle) -> Result<PullStatus, SyncError> {
        let guard = self.locks.acquire(&handle.path).await;
        let git = self.git.clone();

        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            handle.pull(git.as_ref())
        });

        let joined = match self.timeout {
            Some(deadline) => match timeout(deadline, task).await {
                Ok(joined) => joined,
                Err(_) => return Err(SyncError::TimedOut(deadline)),
            },
            None => task.await,
        };

        joined.map_err(|e| SyncError::Task(e.to_string()))?
    }
}
