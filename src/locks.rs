//! Per-repository exclusive access
//!
//! Every mutating sequence on a working tree (pull, commit) holds that
//! repository's lock for its whole duration. Different repositories never
//! contend. Guards are owned so they can move into blocking tasks and stay
//! held until the git work actually finishes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard proving exclusive access to one repository
pub type RepoGuard = OwnedMutexGuard<()>;

/// Lock table keyed by repository path
#[derive(Debug, Clone, Default)]
pub struct RepoLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until the repository at `path` is free and take it.
    pub async fn acquire(&self, path: &Path) -> RepoGuard {
        self.entry(path).lock_owned().await
    }

    /// Take the repository at `path` if nobody holds it.
    pub fn try_acquire(&self, path: &Path) -> Option<RepoGuard> {
        self.entry(path).try_lock_owned().ok()
    }

    /// Drop the entry for `path` unless someone holds or waits on it.
    pub fn forget(&self, path: &Path) {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = table
            .get(path)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            table.remove(path);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
