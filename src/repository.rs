//! Repository handles and the per-repository pull and commit sequences
//!
//! A [`RepositoryHandle`] is a capability object: it names a working tree,
//! its remote and credentials, and drives a [`GitBackend`] through the
//! fetch, analyze, fast-forward sequence ([`RepositoryHandle::pull`]) or the
//! stage, commit, push sequence ([`RepositoryHandle::commit_changes`]). It
//! caches nothing; every call reads the current state from disk.
//!
//! Neither sequence locks anything. Callers hold the repository's entry in
//! [`RepoLocks`](crate::locks::RepoLocks) for the whole call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::Oid;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::git::{Credentials, GitBackend, Identity, MergeAnalysis};

/// Remote every repository syncs with
pub const REMOTE_NAME: &str = "origin";

/// The only branch that is pulled, committed to and pushed
pub const TRACKING_BRANCH: &str = "master";

/// One local git working tree plus the credentials for its remote
#[derive(Debug, Clone)]
pub struct RepositoryHandle {
    pub path: PathBuf,
    pub remote_name: String,
    pub tracking_branch: String,
    pub credentials: Arc<Credentials>,
}

/// Result of a pull that completed without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    /// Local history already contains the remote tip. `ahead` counts local
    /// commits the remote does not have yet.
    UpToDate { ahead: usize },
    /// The working tree, branch and `HEAD` now match the remote tip
    FastForwarded { from: Option<Oid>, to: Oid },
    /// Both sides have unique commits; nothing was changed
    Diverged { local: Oid, remote: Oid },
}

/// Result of a commit attempt that completed without error
#[derive(Debug)]
pub enum CommitStatus {
    /// The staged tree matches `HEAD`; no commit was created and nothing pushed
    Unchanged,
    /// A commit was created. The push outcome is reported separately because
    /// a failed push never rolls the commit back.
    Committed {
        commit: Oid,
        parent: Option<Oid>,
        push: Result<(), SyncError>,
    },
}

impl RepositoryHandle {
    /// Open the repository at `path`, verifying it has a working tree.
    pub fn open(
        path: &Path,
        credentials: Arc<Credentials>,
        git: &dyn GitBackend,
    ) -> Result<Self, SyncError> {
        git.open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            remote_name: REMOTE_NAME.to_string(),
            tracking_branch: TRACKING_BRANCH.to_string(),
            credentials,
        })
    }

    /// Full name of the local branch, e.g. `refs/heads/master`
    pub fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.tracking_branch)
    }

    /// Full name of the remote tracking ref, e.g. `refs/remotes/origin/master`
    pub fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote_name, self.tracking_branch)
    }

    /// Fetch from the remote and fast-forward when possible.
    ///
    /// Any fetch, resolution or checkout failure is returned as is; there are
    /// no retries. Diverged histories are reported, never merged.
    pub fn pull(&self, git: &dyn GitBackend) -> Result<PullStatus, SyncError> {
        git.fetch(self)?;
        let remote = git.resolve_ref(self, &self.tracking_ref())?;

        let Some(head) = git.head(self)? else {
            debug!(path = %self.path.display(), "Unborn branch, checking out {}", remote);
            self.fast_forward(git, None, remote)?;
            return Ok(PullStatus::FastForwarded {
                from: None,
                to: remote,
            });
        };

        match git.merge_analysis(self, remote)? {
            MergeAnalysis::UpToDate => {
                let (ahead, _) = git.ahead_behind(self, head.commit, remote)?;
                if ahead > 0 {
                    warn!(
                        path = %self.path.display(),
                        "{} local commit(s) not on {}", ahead, self.remote_name
                    );
                }
                Ok(PullStatus::UpToDate { ahead })
            }
            MergeAnalysis::FastForward(target) => {
                self.fast_forward(git, Some(head.commit), target)?;
                info!(
                    path = %self.path.display(),
                    "Fast-forwarded {} -> {}", head.commit, target
                );
                Ok(PullStatus::FastForwarded {
                    from: Some(head.commit),
                    to: target,
                })
            }
            MergeAnalysis::Diverged => {
                warn!(
                    path = %self.path.display(),
                    "Local {} and remote {} have diverged, leaving repository untouched",
                    head.commit,
                    remote
                );
                Ok(PullStatus::Diverged {
                    local: head.commit,
                    remote,
                })
            }
        }
    }

    /// Check out `target`, then move the branch and `HEAD` to it.
    ///
    /// Uncommitted edits in the working tree are overwritten. A failure
    /// after the checkout leaves the tree ahead of the branch; the next pull
    /// or commit starts from whatever the branch says.
    pub fn fast_forward(
        &self,
        git: &dyn GitBackend,
        from: Option<Oid>,
        target: Oid,
    ) -> Result<(), SyncError> {
        git.checkout_tree(self, target)?;
        git.update_branch(self, target, from)
    }

    /// Stage everything, commit on top of `HEAD` and push.
    pub fn commit_changes(
        &self,
        git: &dyn GitBackend,
        author: &Identity,
        message: &str,
    ) -> Result<CommitStatus, SyncError> {
        let tree = git.stage_all(self)?;
        let head = git.head(self)?;

        if head.is_some_and(|head| head.tree == tree) {
            debug!(path = %self.path.display(), "Staged tree matches HEAD, nothing to commit");
            return Ok(CommitStatus::Unchanged);
        }

        let parent = head.map(|head| head.commit);
        let commit = git.commit(self, tree, parent, author, message)?;
        info!(path = %self.path.display(), "Committed {}", commit);

        let push = git.push(self);
        match &push {
            Ok(()) => info!(path = %self.path.display(), "Pushed {} to {}", commit, self.remote_name),
            Err(e) => warn!(
                path = %self.path.display(),
                "Commit {} stays local: {}", commit, e
            ),
        }

        Ok(CommitStatus::Committed {
            commit,
            parent,
            push,
        })
    }
}

/// A discovered path that could not be opened as a repository
#[derive(Debug)]
pub struct BadPath {
    pub path: PathBuf,
    pub error: SyncError,
}

/// Handles for every path that opened cleanly, and the paths that did not
#[derive(Debug, Default)]
pub struct OpenedRepositories {
    pub handles: Vec<RepositoryHandle>,
    pub bad_paths: Vec<BadPath>,
}

/// Open every path, excluding the ones that fail instead of aborting.
pub fn open_all(
    paths: &[PathBuf],
    credentials: &Arc<Credentials>,
    git: &dyn GitBackend,
) -> OpenedRepositories {
    let mut opened = OpenedRepositories::default();

    for path in paths {
        match RepositoryHandle::open(path, credentials.clone(), git) {
            Ok(handle) => opened.handles.push(handle),
            Err(error) => {
                warn!("Skipping {}: {}", path.display(), error);
                opened.bad_paths.push(BadPath {
                    path: path.clone(),
                    error,
                });
            }
        }
    }

    opened
}
