//! Git capability layer
//!
//! [`GitBackend`] is the narrow set of git operations the sync engine needs.
//! The engine only relies on the documented semantics of each operation;
//! [`Git2Backend`] implements them on top of libgit2. Every call opens the
//! repository afresh, so a backend holds no per-repository state.

use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{
    Commit, Cred, ErrorCode, FetchOptions, IndexAddOption, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature,
};
use tracing::debug;

use crate::error::SyncError;
use crate::repository::RepositoryHandle;

/// SSH key pair used for fetch and push
#[derive(Clone)]
pub struct Credentials {
    pub public_key: Option<PathBuf>,
    pub private_key: PathBuf,
    pub username: String,
    pub passphrase: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key)
            .field("username", &self.username)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Author and committer identity for automatic commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// The commit `HEAD` currently resolves to, and its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadState {
    pub commit: Oid,
    pub tree: Oid,
}

/// Relationship between local `HEAD` and the fetched remote tip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAnalysis {
    /// Local history already contains the remote tip
    UpToDate,
    /// The remote tip is a strict descendant of local `HEAD`
    FastForward(Oid),
    /// Both sides have commits the other lacks, or anything else non-trivial
    Diverged,
}

/// Git operations the sync engine is built on.
///
/// Implementations may block on disk and network I/O; callers run them on a
/// blocking thread while holding the repository's lock.
#[cfg_attr(test, mockall::automock)]
pub trait GitBackend: Send + Sync {
    /// Check that `path` is a non-bare repository with a working tree.
    fn open(&self, path: &Path) -> Result<(), SyncError>;

    /// Check that the handle's remote is configured.
    fn check_remote(&self, repo: &RepositoryHandle) -> Result<(), SyncError>;

    /// Fetch the configured refspecs of the handle's remote.
    fn fetch(&self, repo: &RepositoryHandle) -> Result<(), SyncError>;

    /// Resolve a full ref name to the commit it points at.
    fn resolve_ref(&self, repo: &RepositoryHandle, name: &str) -> Result<Oid, SyncError>;

    /// Current `HEAD`, or `None` on an unborn branch.
    fn head(&self, repo: &RepositoryHandle) -> Result<Option<HeadState>, SyncError>;

    /// Classify local `HEAD` against `remote_tip`. Read-only.
    fn merge_analysis(
        &self,
        repo: &RepositoryHandle,
        remote_tip: Oid,
    ) -> Result<MergeAnalysis, SyncError>;

    /// Commits reachable from `local` but not `upstream`, and the reverse.
    fn ahead_behind(
        &self,
        repo: &RepositoryHandle,
        local: Oid,
        upstream: Oid,
    ) -> Result<(usize, usize), SyncError>;

    /// Force-checkout the tree of `commit` into the working directory and index.
    fn checkout_tree(&self, repo: &RepositoryHandle, commit: Oid) -> Result<(), SyncError>;

    /// Point the local branch and `HEAD` at `target`.
    ///
    /// When `expected` is given the update only succeeds if the branch still
    /// points there.
    fn update_branch(
        &self,
        repo: &RepositoryHandle,
        target: Oid,
        expected: Option<Oid>,
    ) -> Result<(), SyncError>;

    /// Stage every new, modified and deleted path; return the written tree.
    fn stage_all(&self, repo: &RepositoryHandle) -> Result<Oid, SyncError>;

    /// Create a commit on the local branch and advance the branch to it.
    fn commit(
        &self,
        repo: &RepositoryHandle,
        tree: Oid,
        parent: Option<Oid>,
        author: &Identity,
        message: &str,
    ) -> Result<Oid, SyncError>;

    /// Push the local branch to the same branch on the handle's remote.
    fn push(&self, repo: &RepositoryHandle) -> Result<(), SyncError>;
}

/// [`GitBackend`] backed by libgit2
#[derive(Debug, Default, Clone, Copy)]
pub struct Git2Backend;

impl Git2Backend {
    pub fn new() -> Self {
        Self
    }

    fn repository(path: &Path) -> Result<Repository, SyncError> {
        Repository::open(path).map_err(|source| SyncError::Open {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl GitBackend for Git2Backend {
    fn open(&self, path: &Path) -> Result<(), SyncError> {
        let repo = Self::repository(path)?;
        if repo.is_bare() {
            return Err(SyncError::Bare {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    fn check_remote(&self, handle: &RepositoryHandle) -> Result<(), SyncError> {
        let repo = Self::repository(&handle.path)?;
        let found = repo
            .find_remote(&handle.remote_name)
            .map(|_| ())
            .map_err(|source| SyncError::RemoteNotFound {
                remote: handle.remote_name.clone(),
                source,
            });
        found
    }

    fn fetch(&self, handle: &RepositoryHandle) -> Result<(), SyncError> {
        let repo = Self::repository(&handle.path)?;
        let mut remote =
            repo.find_remote(&handle.remote_name)
                .map_err(|source| SyncError::RemoteNotFound {
                    remote: handle.remote_name.clone(),
                    source,
                })?;

        let mut options = FetchOptions::new();
        options.remote_callbacks(remote_callbacks(&handle.credentials));

        remote
            .fetch(&[] as &[&str], Some(&mut options), None)
            .map_err(|source| SyncError::Fetch {
                remote: handle.remote_name.clone(),
                source,
            })?;

        let stats = remote.stats();
        debug!(
            "Fetched {} objects for {}",
            stats.received_objects(),
            handle.path.display()
        );
        Ok(())
    }

    fn resolve_ref(&self, handle: &RepositoryHandle, name: &str) -> Result<Oid, SyncError> {
        let repo = Self::repository(&handle.path)?;
        repo.refname_to_id(name)
            .map_err(|source| SyncError::RefResolution {
                name: name.to_string(),
                source,
            })
    }

    fn head(&self, handle: &RepositoryHandle) -> Result<Option<HeadState>, SyncError> {
        let repo = Self::repository(&handle.path)?;
        let head_error = |source| SyncError::RefResolution {
            name: "HEAD".to_string(),
            source,
        };

        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                return Ok(None)
            }
            Err(e) => return Err(head_error(e)),
        };
        let commit = head.peel_to_commit().map_err(head_error)?;

        Ok(Some(HeadState {
            commit: commit.id(),
            tree: commit.tree_id(),
        }))
    }

    fn merge_analysis(
        &self,
        handle: &RepositoryHandle,
        remote_tip: Oid,
    ) -> Result<MergeAnalysis, SyncError> {
        let repo = Self::repository(&handle.path)?;
        let annotated = repo
            .find_annotated_commit(remote_tip)
            .map_err(SyncError::Analysis)?;
        let (analysis, _) = repo
            .merge_analysis(&[&annotated])
            .map_err(SyncError::Analysis)?;

        Ok(if analysis.is_up_to_date() {
            MergeAnalysis::UpToDate
        } else if analysis.is_fast_forward() {
            MergeAnalysis::FastForward(remote_tip)
        } else {
            MergeAnalysis::Diverged
        })
    }

    fn ahead_behind(
        &self,
        handle: &RepositoryHandle,
        local: Oid,
        upstream: Oid,
    ) -> Result<(usize, usize), SyncError> {
        let repo = Self::repository(&handle.path)?;
        repo.graph_ahead_behind(local, upstream)
            .map_err(SyncError::Analysis)
    }

    fn checkout_tree(&self, handle: &RepositoryHandle, commit: Oid) -> Result<(), SyncError> {
        let repo = Self::repository(&handle.path)?;
        let commit = repo
            .find_commit(commit)
            .map_err(SyncError::working_tree("find target commit"))?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.checkout_tree(commit.as_object(), Some(&mut checkout))
            .map_err(SyncError::working_tree("check out tree"))
    }

    fn update_branch(
        &self,
        handle: &RepositoryHandle,
        target: Oid,
        expected: Option<Oid>,
    ) -> Result<(), SyncError> {
        let repo = Self::repository(&handle.path)?;
        let branch = handle.branch_ref();
        let message = format!("gistbot: fast-forward to {}", target);

        match expected {
            Some(current) => repo.reference_matching(&branch, target, true, current, &message),
            None => repo.reference(&branch, target, false, &message),
        }
        .map_err(SyncError::working_tree("update branch ref"))?;

        repo.set_head(&branch)
            .map_err(SyncError::working_tree("update HEAD"))
    }

    fn stage_all(&self, handle: &RepositoryHandle) -> Result<Oid, SyncError> {
        let repo = Self::repository(&handle.path)?;
        let mut index = repo
            .index()
            .map_err(SyncError::working_tree("open index"))?;

        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .map_err(SyncError::working_tree("stage changes"))?;
        // add_all never removes entries for files deleted from disk
        index
            .update_all(["*"].iter(), None)
            .map_err(SyncError::working_tree("stage deletions"))?;
        index
            .write()
            .map_err(SyncError::working_tree("write index"))?;

        index
            .write_tree()
            .map_err(SyncError::working_tree("write tree"))
    }

    fn commit(
        &self,
        handle: &RepositoryHandle,
        tree: Oid,
        parent: Option<Oid>,
        author: &Identity,
        message: &str,
    ) -> Result<Oid, SyncError> {
        let repo = Self::repository(&handle.path)?;
        let tree = repo.find_tree(tree).map_err(SyncError::Commit)?;
        let signature =
            Signature::now(&author.name, &author.email).map_err(SyncError::Commit)?;

        let parent = parent
            .map(|oid| repo.find_commit(oid))
            .transpose()
            .map_err(SyncError::Commit)?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();

        // libgit2 refuses to move the branch unless `parent` is still its tip
        repo.commit(
            Some(&handle.branch_ref()),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )
        .map_err(SyncError::Commit)
    }

    fn push(&self, handle: &RepositoryHandle) -> Result<(), SyncError> {
        let repo = Self::repository(&handle.path)?;
        let mut remote =
            repo.find_remote(&handle.remote_name)
                .map_err(|source| SyncError::RemoteNotFound {
                    remote: handle.remote_name.clone(),
                    source,
                })?;

        let branch = handle.branch_ref();
        let refspec = format!("{0}:{0}", branch);
        let rejection: RefCell<Option<String>> = RefCell::new(None);

        {
            let mut callbacks = remote_callbacks(&handle.credentials);
            callbacks.push_update_reference(|_refname, status| {
                if let Some(message) = status {
                    *rejection.borrow_mut() = Some(message.to_string());
                }
                Ok(())
            });

            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);

            if let Err(source) = remote.push(&[refspec.as_str()], Some(&mut options)) {
                if source.code() == ErrorCode::NotFastForward || is_rejection(source.message()) {
                    return Err(SyncError::PushRejected {
                        remote: handle.remote_name.clone(),
                        message: source.message().to_string(),
                    });
                }
                return Err(SyncError::Push {
                    remote: handle.remote_name.clone(),
                    source,
                });
            }
        }

        if let Some(message) = rejection.into_inner() {
            return Err(SyncError::PushRejected {
                remote: handle.remote_name.clone(),
                message,
            });
        }

        debug!("Pushed {} for {}", branch, handle.path.display());
        Ok(())
    }
}

/// Callbacks answering credential requests with the configured key pair.
///
/// The key is offered once per operation; a rejected key fails the operation
/// instead of being offered again.
fn remote_callbacks(credentials: &Credentials) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let mut key_offered = false;

    callbacks.credentials(move |_url, username_from_url, allowed| {
        let username = username_from_url.unwrap_or(credentials.username.as_str());

        if allowed.is_username() {
            return Cred::username(username);
        }

        if allowed.is_ssh_key() && !key_offered {
            key_offered = true;
            return Cred::ssh_key(
                username,
                credentials.public_key.as_deref(),
                &credentials.private_key,
                credentials.passphrase.as_deref(),
            );
        }

        Err(git2::Error::from_str(
            "remote rejected the configured ssh key",
        ))
    });

    callbacks
}

fn is_rejection(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("non-fast-forward")
        || message.contains("non-fastforwardable")
        || message.contains("fetch first")
        || message.contains("rejected")
}
