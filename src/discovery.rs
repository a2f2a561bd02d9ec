//! Repository discovery under the root directory
//!
//! A repository is any directory that directly contains a `.git`
//! subdirectory. The walk never enters `.git` itself and does not follow
//! symlinks, but it does keep descending below a repository so nested
//! repositories are found too.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::DiscoveryError;

const GIT_DIR: &str = ".git";

/// Every repository directory under `root`, sorted, as absolute paths.
pub fn find_repositories(root: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    if !root.is_dir() {
        return Err(DiscoveryError::InvalidRoot(root.to_path_buf()));
    }

    let root = if root.is_absolute() {
        root.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|source| DiscoveryError::ReadDir {
                path: root.to_path_buf(),
                source,
            })?
            .join(root)
    };
    let root = path_clean::clean(&root);

    let mut repositories = Vec::new();
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != OsStr::new(GIT_DIR));

    for entry in walker {
        let entry = entry.map_err(|e| walk_error(&root, e))?;
        if entry.file_type().is_dir() && has_git_dir(entry.path()) {
            repositories.push(entry.into_path());
        }
    }

    debug!(
        "Found {} repositories under {}",
        repositories.len(),
        root.display()
    );
    Ok(repositories)
}

/// `.git` must be a real directory; gitdir files and symlinks do not count.
fn has_git_dir(dir: &Path) -> bool {
    fs::symlink_metadata(dir.join(GIT_DIR))
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false)
}

fn walk_error(root: &Path, error: walkdir::Error) -> DiscoveryError {
    let path = error.path().unwrap_or(root).to_path_buf();
    let message = error.to_string();
    let source = error
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, message));
    DiscoveryError::ReadDir { path, source }
}
