//! Filesystem change notification
//!
//! [`ChangeWatcher`] owns the OS subscription. Raw notifications are turned
//! into [`ChangeEvent`]s on the notifier's own thread: only write
//! notifications survive, and paths inside git control directories or
//! editor swap files are dropped there, so they never reach the commit
//! pipeline. Events and errors travel on separate unbounded channels so a
//! burst of writes can never stall the notifier loop or starve error
//! delivery.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// A file under a watched repository was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Write,
}

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to create filesystem watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("failed to watch {path}: {source}")]
    Add {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("filesystem notification error: {0}")]
    Notify(#[from] notify::Error),
}

/// True for paths inside a `.git*` entry or ending in `.swp`.
pub fn is_reserved_path(path: &Path) -> bool {
    let in_git_dir = path.components().any(|component| match component {
        Component::Normal(name) => name.to_string_lossy().starts_with(".git"),
        _ => false,
    });

    in_git_dir || path.to_string_lossy().ends_with(".swp")
}

/// Reserved paths plus any configured ignore patterns
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    extra: Vec<Regex>,
}

impl PathFilter {
    pub fn new(extra: Vec<Regex>) -> Self {
        Self { extra }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        if is_reserved_path(path) {
            return true;
        }

        let text = path.to_string_lossy();
        self.extra.iter().any(|pattern| pattern.is_match(&text))
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

/// Turn one raw notification into the change events it carries.
pub fn filter_event(filter: &PathFilter, event: &Event) -> Vec<ChangeEvent> {
    if !is_write(&event.kind) {
        return Vec::new();
    }

    event
        .paths
        .iter()
        .filter(|path| !filter.is_ignored(path))
        .map(|path| ChangeEvent {
            path: path.clone(),
            kind: ChangeKind::Write,
        })
        .collect()
}

/// Receiving ends of a [`ChangeWatcher`]
///
/// Both channels close once the watcher is dropped.
#[derive(Debug)]
pub struct ChangeStreams {
    pub events: UnboundedReceiver<ChangeEvent>,
    pub errors: UnboundedReceiver<WatchError>,
}

/// Owned filesystem subscription over a growing set of directories
pub struct ChangeWatcher {
    watcher: RecommendedWatcher,
    mode: RecursiveMode,
    watched: BTreeSet<PathBuf>,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("mode", &self.mode)
            .field("watched", &self.watched)
            .finish()
    }
}

impl ChangeWatcher {
    pub fn new(filter: PathFilter, recursive: bool) -> Result<(Self, ChangeStreams), WatchError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (errors_tx, errors) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(handler(filter, events_tx, errors_tx))
            .map_err(WatchError::Create)?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        Ok((
            Self {
                watcher,
                mode,
                watched: BTreeSet::new(),
            },
            ChangeStreams { events, errors },
        ))
    }

    /// Register every path not already watched.
    ///
    /// Paths that fail to register are returned; the rest stay registered.
    pub fn watch(&mut self, paths: &[PathBuf]) -> Vec<WatchError> {
        let mut failures = Vec::new();

        for path in paths {
            if self.watched.contains(path) {
                continue;
            }

            match self.watcher.watch(path, self.mode) {
                Ok(()) => {
                    debug!("Watching {}", path.display());
                    self.watched.insert(path.clone());
                }
                Err(source) => failures.push(WatchError::Add {
                    path: path.clone(),
                    source,
                }),
            }
        }

        failures
    }

    /// Stop watching `paths`. Directories that are already gone are fine.
    pub fn unwatch(&mut self, paths: &[PathBuf]) {
        for path in paths {
            if self.watched.remove(path) {
                // Removing the directory already dropped the OS watch
                let _ = self.watcher.unwatch(path);
                debug!("Stopped watching {}", path.display());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn watched(&self) -> impl Iterator<Item = &Path> {
        self.watched.iter().map(PathBuf::as_path)
    }

    /// Release the subscription. Pending events already queued stay readable.
    pub fn close(mut self) {
        for path in std::mem::take(&mut self.watched) {
            // The directory may already be gone
            let _ = self.watcher.unwatch(&path);
        }
        info!("Filesystem watcher closed");
    }
}

fn handler(
    filter: PathFilter,
    events: UnboundedSender<ChangeEvent>,
    errors: UnboundedSender<WatchError>,
) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |result| match result {
        Ok(event) => {
            for change in filter_event(&filter, &event) {
                // A closed receiver means the daemon is shutting down
                let _ = events.send(change);
            }
        }
        Err(e) => {
            let _ = errors.send(WatchError::Notify(e));
        }
    }
}
