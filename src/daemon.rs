//! Daemon Infrastructure - long running repository synchronization
//!
//! [`SyncDaemon`] wires discovery, the pull coordinator, the filesystem
//! watcher and the commit pipeline together. `start` discovers and pulls
//! everything once, then hands the watcher streams to a single dispatch
//! loop that commits local edits and runs periodic pull passes. PID file
//! management, signal handling and background mode live here as well.

use crate::commit::{CommitPipeline, CommitReport};
use crate::discovery::find_repositories;
use crate::git::{Credentials, Git2Backend, GitBackend};
use crate::locks::RepoLocks;
use crate::repository::{open_all, CommitStatus};
use crate::sync::{PullCoordinator, PullSummary};
use crate::watcher::{ChangeEvent, ChangeStreams, ChangeWatcher};
use crate::Config;
use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

type SharedWatcher = Arc<Mutex<Option<ChangeWatcher>>>;

/// Daemon state and control
pub struct SyncDaemon {
    config: Arc<Config>,
    git: Arc<dyn GitBackend>,
    credentials: Arc<Credentials>,
    locks: RepoLocks,
    coordinator: PullCoordinator,
    pipeline: Arc<CommitPipeline>,
    shutdown_sender: broadcast::Sender<()>,
    watcher: SharedWatcher,
    dispatch: Option<JoinHandle<()>>,
    pid_file_path: Option<PathBuf>,
}

impl SyncDaemon {
    /// Create a daemon backed by libgit2
    pub fn new(config: Config) -> Result<Self> {
        Self::with_backend(config, Arc::new(Git2Backend::new()))
    }

    pub fn with_backend(config: Config, git: Arc<dyn GitBackend>) -> Result<Self> {
        // Fail on bad patterns or intervals before anything starts
        config.validate().context("Invalid daemon configuration")?;

        let config = Arc::new(config);
        let credentials = Arc::new(config.credentials());
        let locks = RepoLocks::new();

        let coordinator = PullCoordinator::new(
            git.clone(),
            locks.clone(),
            config.sync.max_parallel,
            config.sync_timeout(),
        );
        let pipeline = Arc::new(CommitPipeline::new(
            git.clone(),
            locks.clone(),
            credentials.clone(),
            config.identity(),
            config.commit.message.clone(),
        ));

        let (shutdown_sender, _) = broadcast::channel(1);
        let pid_file_path = config.pid_file();

        Ok(Self {
            config,
            git,
            credentials,
            locks,
            coordinator,
            pipeline,
            shutdown_sender,
            watcher: Arc::new(Mutex::new(None)),
            dispatch: None,
            pid_file_path,
        })
    }

    /// Discover, pull everything once, then start watching and dispatching.
    ///
    /// Returns the summary of the initial pull pass. Only discovery and
    /// watcher creation failures are errors; per-repository problems are
    /// part of the summary.
    pub async fn start(&mut self) -> Result<PullSummary> {
        if self.dispatch.is_some() {
            bail!("Daemon already started");
        }

        let root = self.config.root_path();
        let paths = find_repositories(&root)
            .with_context(|| format!("Failed to discover repositories under {}", root.display()))?;
        info!(
            "Discovered {} repositories under {}",
            paths.len(),
            root.display()
        );

        let git = self.git.clone();
        let credentials = self.credentials.clone();
        let opened = tokio::task::spawn_blocking(move || open_all(&paths, &credentials, git.as_ref()))
            .await
            .context("Repository scan task failed")?;
        let roots: Vec<PathBuf> = opened.handles.iter().map(|h| h.path.clone()).collect();

        let (mut watcher, streams) = ChangeWatcher::new(
            self.config.path_filter()?,
            self.config.watch.recursive,
        )
        .context("Failed to start filesystem watcher")?;
        for failure in watcher.watch(&roots) {
            warn!("{}", failure);
        }
        self.pipeline.register_roots(roots.iter().cloned());

        let summary = self.coordinator.pull_pass(&opened).await;
        summary.log();

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);

        let dispatcher = self.dispatcher(roots.into_iter().collect());
        let shutdown = self.shutdown_sender.subscribe();
        let pull_interval = self.config.pull_interval()?;
        self.dispatch = Some(tokio::spawn(dispatcher.run(streams, shutdown, pull_interval)));

        info!("Daemon started");
        Ok(summary)
    }

    fn dispatcher(&self, repositories: BTreeSet<PathBuf>) -> Dispatcher {
        Dispatcher {
            config: self.config.clone(),
            git: self.git.clone(),
            credentials: self.credentials.clone(),
            locks: self.locks.clone(),
            coordinator: self.coordinator.clone(),
            pipeline: self.pipeline.clone(),
            watcher: self.watcher.clone(),
            repositories,
        }
    }

    /// Release the watcher and tell the dispatch loop to exit.
    ///
    /// In-flight pulls and commits are not interrupted.
    pub fn stop(&mut self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(watcher) = watcher {
            watcher.close();
            // Nobody listening just means the loop already exited
            let _ = self.shutdown_sender.send(());
            info!("Daemon stop requested");
        }
    }

    /// Wait for the dispatch loop to finish its current work and exit.
    pub async fn join(&mut self) {
        if let Some(dispatch) = self.dispatch.take() {
            if let Err(e) = dispatch.await {
                error!("Dispatch loop failed: {}", e);
            }
        }
    }

    /// Run in the foreground until SIGINT or SIGTERM
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting gistbot daemon");

        self.write_pid_file().context("Failed to write PID file")?;

        let result = self.run_until_signal().await;

        self.stop();
        self.join().await;
        self.cleanup().context("Failed to cleanup daemon")?;

        result
    }

    async fn run_until_signal(&mut self) -> Result<()> {
        self.start().await?;
        wait_for_shutdown_signal().await?;
        info!("Shutdown signal received, stopping daemon...");
        Ok(())
    }

    /// Write PID file for daemon process management
    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            // Create parent directories if they don't exist
            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    /// Remove PID file and perform cleanup
    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        info!("Daemon cleanup completed");
        Ok(())
    }
}

impl Drop for SyncDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The single loop consuming watcher output and the pull timer
struct Dispatcher {
    config: Arc<Config>,
    git: Arc<dyn GitBackend>,
    credentials: Arc<Credentials>,
    locks: RepoLocks,
    coordinator: PullCoordinator,
    pipeline: Arc<CommitPipeline>,
    watcher: SharedWatcher,
    repositories: BTreeSet<PathBuf>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut streams: ChangeStreams,
        mut shutdown: broadcast::Receiver<()>,
        pull_interval: Option<Duration>,
    ) {
        let mut ticker = pull_interval.and_then(pull_ticker);

        info!("Dispatch loop started, pull interval: {:?}", pull_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Shutdown signal received in dispatch loop");
                    break;
                }

                event = streams.events.recv() => match event {
                    Some(event) => self.handle_changes(event, &mut streams.events).await,
                    None => {
                        debug!("Watcher closed");
                        break;
                    }
                },

                Some(error) = streams.errors.recv() => {
                    warn!("{}", error);
                }

                _ = next_tick(&mut ticker) => {
                    self.periodic_pass().await;
                }
            }
        }

        info!("Dispatch loop exiting");
    }

    /// Coalesce a burst of events and commit each touched repository once.
    async fn handle_changes(&self, first: ChangeEvent, events: &mut UnboundedReceiver<ChangeEvent>) {
        let debounce = self.config.debounce();
        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
        }

        let mut batch = vec![first];
        while let Ok(event) = events.try_recv() {
            batch.push(event);
        }
        debug!("Handling {} change events", batch.len());

        let mut repositories: Vec<PathBuf> = Vec::new();
        for event in batch {
            match self.pipeline.resolve_repository(&event.path) {
                Ok(repository) => {
                    if !repositories.contains(&repository) {
                        repositories.push(repository);
                    }
                }
                Err(e) => warn!("Ignoring change to {}: {}", event.path.display(), e),
            }
        }

        for repository in repositories {
            let path = repository.clone();
            match self.pipeline.commit_repository(repository).await {
                Ok(report) => log_commit(&report),
                Err(e) => error!(
                    path = %path.display(),
                    kind = e.kind().as_str(),
                    "Commit failed: {}", e
                ),
            }
        }
    }

    /// Rediscover if configured, then pull every known repository.
    async fn periodic_pass(&mut self) {
        let root = self.config.root_path();
        let rediscover = self.config.sync.rediscover;
        let mut candidates = self.repositories.clone();
        let git = self.git.clone();
        let credentials = self.credentials.clone();

        let scan = tokio::task::spawn_blocking(move || {
            if rediscover {
                match find_repositories(&root) {
                    Ok(paths) => candidates.extend(paths),
                    Err(e) => warn!("Rediscovery failed, pulling known repositories only: {}", e),
                }
            }
            let paths: Vec<PathBuf> = candidates.into_iter().filter(|p| p.exists()).collect();
            open_all(&paths, &credentials, git.as_ref())
        })
        .await;

        let opened = match scan {
            Ok(opened) => opened,
            Err(e) => {
                error!("Repository scan failed: {}", e);
                return;
            }
        };

        let new_roots: Vec<PathBuf> = opened
            .handles
            .iter()
            .map(|h| h.path.clone())
            .filter(|path| !self.repositories.contains(path))
            .collect();
        if !new_roots.is_empty() {
            info!("Tracking {} new repositories", new_roots.len());
            self.track(&new_roots);
        }

        let removed: Vec<PathBuf> = self
            .repositories
            .iter()
            .filter(|path| !path.exists())
            .cloned()
            .collect();
        if !removed.is_empty() {
            self.untrack(&removed);
        }

        let summary = self.coordinator.pull_pass(&opened).await;
        summary.log();
    }

    fn track(&mut self, roots: &[PathBuf]) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            for failure in watcher.watch(roots) {
                warn!("{}", failure);
            }
        }

        self.pipeline.register_roots(roots.iter().cloned());
        self.repositories.extend(roots.iter().cloned());
    }

    fn untrack(&mut self, roots: &[PathBuf]) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            watcher.unwatch(roots);
        }

        self.pipeline.unregister_roots(roots);
        for root in roots {
            info!("Repository removed: {}", root.display());
            self.locks.forget(root);
            self.repositories.remove(root);
        }
    }
}

/// Timer for periodic pulls, `None` when the first tick cannot be scheduled
fn pull_ticker(period: Duration) -> Option<Interval> {
    let Some(start) = Instant::now().checked_add(period) else {
        warn!("Pull interval {:?} is too large, periodic pulls disabled", period);
        return None;
    };

    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn log_commit(report: &CommitReport) {
    let path = report.repository.display();
    match &report.status {
        CommitStatus::Unchanged => debug!(path = %path, "No changes to commit"),
        CommitStatus::Committed {
            commit,
            push: Ok(()),
            ..
        } => info!(path = %path, "Committed and pushed {}", commit),
        CommitStatus::Committed {
            commit,
            push: Err(e),
            ..
        } => warn!(
            path = %path,
            kind = e.kind().as_str(),
            "Committed {} but push failed: {}", commit, e
        ),
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT, Ctrl+C)
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for ctrl-c")?;
            debug!("Ctrl+C received");
        }
        _ = terminate.recv() => debug!("SIGTERM received"),
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    debug!("Ctrl+C received");
    Ok(())
}

/// Detach from the terminal (Unix platforms)
///
/// Must run before the tokio runtime is built. Output goes to the configured
/// log file.
#[cfg(unix)]
pub fn daemonize(config: &Config) -> Result<()> {
    use daemonize::Daemonize;

    let working_directory =
        std::env::current_dir().context("Failed to read current directory")?;
    let mut daemonize = Daemonize::new().working_directory(working_directory);

    if !config.daemon.log_file.is_empty() {
        let log_path = PathBuf::from(&config.daemon.log_file);
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }

        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .context("Failed to open log file")?;

        daemonize = daemonize
            .stdout(log_file.try_clone()?)
            .stderr(log_file);
    }

    daemonize.start().context("Failed to daemonize process")?;

    Ok(())
}

fn read_pid(pid_file: &std::path::Path) -> Result<u32> {
    let pid_str = fs::read_to_string(pid_file).context("Failed to read PID file")?;
    pid_str.trim().parse().context("Invalid PID in PID file")
}

/// PID recorded for a running daemon, if any
///
/// A PID file naming a dead process is stale and gets removed.
pub fn running_pid(config: &Config) -> Result<Option<u32>> {
    let Some(pid_file) = config.pid_file() else {
        return Ok(None);
    };

    if !pid_file.exists() {
        return Ok(None);
    }

    let pid = read_pid(&pid_file)?;
    if process_alive(pid) {
        Ok(Some(pid))
    } else {
        let _ = fs::remove_file(&pid_file);
        Ok(None)
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true, // Assume running if we can't check
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Send SIGTERM to a running daemon. Returns false when none is running.
pub fn stop_daemon(config: &Config) -> Result<bool> {
    let Some(pid) = running_pid(config)? else {
        warn!("PID file not found, daemon may not be running");
        return Ok(false);
    };

    terminate(pid)?;
    info!("Shutdown signal sent to daemon process {}", pid);
    Ok(true)
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .context("Failed to send SIGTERM to daemon process")?;
    Ok(())
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<()> {
    bail!("Daemon stop not implemented for this platform (PID {})", pid)
}
