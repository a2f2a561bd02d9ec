//! gistbot - Two-way synchronization daemon for collections of git repositories
//!
//! gistbot keeps every repository under a root directory in step with its
//! `origin` remote: remote updates are fast-forwarded in, local edits are
//! committed and pushed as soon as they are written.
//!
//! ## Core Features
//!
//! - **Discovery**: Recursive search for repositories under one root directory
//! - **Safe Pulls**: Fetch and fast-forward only, diverged histories are left alone
//! - **Commit On Write**: Filesystem watching with automatic commit and push
//! - **Per-Repository Locking**: Pulls and commits on one repository never overlap
//! - **Configuration Management**: YAML-based configuration with XDG compliance
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`discovery`]: Repository discovery under the root directory
//! - [`git`]: libgit2 operations behind the [`git::GitBackend`] trait
//! - [`repository`]: Per-repository pull and commit logic
//! - [`sync`]: Concurrent pull passes
//! - [`commit`]: Change-to-commit pipeline
//! - [`watcher`]: Filesystem change notifications
//! - [`daemon`]: Long-running daemon wiring everything together

pub mod commit;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod git;
pub mod health;
pub mod locks;
pub mod repository;
pub mod sync;
pub mod watcher;

pub use commit::{CommitPipeline, CommitReport};
pub use config::Config;
pub use daemon::SyncDaemon;
pub use discovery::find_repositories;
pub use error::{DiscoveryError, ErrorKind, SyncError};
pub use git::{Credentials, Git2Backend, GitBackend, Identity};
pub use health::HealthCheck;
pub use locks::RepoLocks;
pub use repository::{open_all, CommitStatus, PullStatus, RepositoryHandle};
pub use sync::{PullCoordinator, PullOutcome, PullSummary};
pub use watcher::{ChangeEvent, ChangeWatcher, PathFilter};
