use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gistbot::config::LoggingConfig;
use gistbot::daemon::{running_pid, stop_daemon};
use gistbot::health::CheckResult;
use gistbot::{
    find_repositories, open_all, CommitPipeline, CommitStatus, Config, Git2Backend, GitBackend,
    HealthCheck, PullCoordinator, PullStatus, RepoLocks, SyncDaemon,
};

#[derive(Parser)]
#[command(name = "gistbot")]
#[command(about = "Keeps a directory of git repositories in two-way sync with their remotes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file and create the root directory
    Init {
        /// Directory holding the repositories to sync
        #[arg(short, long, default_value = "~/gists")]
        root_dir: String,
    },

    /// List the repositories found under the root directory
    List,

    /// Pull every repository once and exit
    Pull,

    /// Commit and push the repository containing a path
    Commit {
        /// Any path inside the repository
        path: PathBuf,
    },

    /// Run as daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },

    /// System health check and diagnostics
    Doctor,
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,
}

fn main() -> Result<()> {
    let Cli {
        command,
        config: config_path,
        verbose,
    } = Cli::parse();
    let load = || load_config(config_path.as_deref());

    match command {
        Commands::Init { root_dir } => cmd_init(&root_dir, config_path.as_deref()),
        Commands::List => {
            let config = load()?;
            init_logging(verbose, &config.logging, config.logging.color)?;
            cmd_list(&config)
        }
        Commands::Pull => {
            let config = load()?;
            init_logging(verbose, &config.logging, config.logging.color)?;
            runtime()?.block_on(cmd_pull(&config))
        }
        Commands::Commit { path } => {
            let config = load()?;
            init_logging(verbose, &config.logging, config.logging.color)?;
            runtime()?.block_on(cmd_commit(&config, path))
        }
        Commands::Daemon { daemon_command } => cmd_daemon(daemon_command, verbose, load()?),
        Commands::Doctor => cmd_doctor(&load()?),
    }
}

/// Initialize logging from the configured level and format
///
/// `--verbose` and `RUST_LOG` take precedence over the configured level.
fn init_logging(verbose: bool, logging: &LoggingConfig, ansi: bool) -> Result<()> {
    let default_level = if verbose {
        "debug"
    } else {
        logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .with_context(|| format!("Invalid log level: {}", default_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "full" => registry.with(fmt::layer().with_ansi(ansi)).try_init(),
        "pretty" => registry.with(fmt::layer().pretty().with_ansi(ansi)).try_init(),
        _ => registry
            .with(fmt::layer().compact().with_ansi(ansi))
            .try_init(),
    }
    .context("Failed to initialize logging")?;

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Write the configuration file and create the root directory
fn cmd_init(root_dir: &str, config_path: Option<&std::path::Path>) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };

    let expanded_root_dir = shellexpand::full(root_dir)
        .with_context(|| format!("Failed to expand root directory: {}", root_dir))?;
    std::fs::create_dir_all(expanded_root_dir.as_ref()).with_context(|| {
        format!("Failed to create root directory: {}", expanded_root_dir)
    })?;

    let config = Config {
        root_directory: root_dir.to_string(),
        ..Config::default()
    };

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    config.save(&config_path)?;

    println!("✅ gistbot initialized successfully!");
    println!("   Config: {}", config_path.display());
    println!("   Root directory: {}", expanded_root_dir);
    println!("   Next: clone your gists into the root directory and run 'gistbot daemon start'");

    Ok(())
}

/// List discovered repositories and whether they open cleanly
fn cmd_list(config: &Config) -> Result<()> {
    let root = config.root_path();
    let paths = find_repositories(&root)
        .with_context(|| format!("Failed to discover repositories under {}", root.display()))?;

    let credentials = Arc::new(config.credentials());
    let opened = open_all(&paths, &credentials, &Git2Backend::new());

    println!("Repositories ({}): ", opened.handles.len());
    for handle in &opened.handles {
        println!("  📁 {}", handle.path.display());
    }

    if !opened.bad_paths.is_empty() {
        println!("\nUnusable paths ({}):", opened.bad_paths.len());
        for bad in &opened.bad_paths {
            println!("  ❌ {}: {}", bad.path.display(), bad.error);
        }
    }

    Ok(())
}

/// Pull every repository once
async fn cmd_pull(config: &Config) -> Result<()> {
    let root = config.root_path();
    println!("🔍 Discovering repositories...");
    let paths = find_repositories(&root)
        .with_context(|| format!("Failed to discover repositories under {}", root.display()))?;
    println!("   Found {} repositories", paths.len());

    let git: Arc<dyn GitBackend> = Arc::new(Git2Backend::new());
    let credentials = Arc::new(config.credentials());
    let opened = {
        let git = git.clone();
        tokio::task::spawn_blocking(move || open_all(&paths, &credentials, git.as_ref()))
            .await
            .context("Repository scan task failed")?
    };

    let coordinator = PullCoordinator::new(
        git,
        RepoLocks::new(),
        config.sync.max_parallel,
        config.sync_timeout(),
    );
    let summary = coordinator.pull_pass(&opened).await;

    for outcome in &summary.outcomes {
        let path = outcome.repository.display();
        match &outcome.result {
            Ok(PullStatus::UpToDate { ahead: 0 }) => println!("   ✅ Up to date: {}", path),
            Ok(PullStatus::UpToDate { ahead }) => {
                println!("   ⬆️  Up to date, {} local commits unpushed: {}", ahead, path)
            }
            Ok(PullStatus::FastForwarded { to, .. }) => {
                println!("   🔄 Fast-forwarded to {}: {}", to, path)
            }
            Ok(PullStatus::Diverged { .. }) => {
                println!("   ⚠️  Diverged from remote, left untouched: {}", path)
            }
            Err(e) => println!("   ❌ {}: {}", path, e),
        }
    }

    println!("\n🎉 Pull Complete!");
    println!("   📊 Total repositories: {}", summary.total_repositories);
    println!("   ✅ Up to date: {}", summary.up_to_date);
    println!("   🔄 Fast-forwarded: {}", summary.fast_forwarded);
    println!("   ⚠️  Diverged: {}", summary.diverged);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   ⏭️  Unusable paths: {}", summary.bad_paths.len());
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    Ok(())
}

/// Commit and push the repository owning `path`
async fn cmd_commit(config: &Config, path: PathBuf) -> Result<()> {
    let root = config.root_path();
    let roots = find_repositories(&root)
        .with_context(|| format!("Failed to discover repositories under {}", root.display()))?;

    let pipeline = CommitPipeline::new(
        Arc::new(Git2Backend::new()),
        RepoLocks::new(),
        Arc::new(config.credentials()),
        config.identity(),
        config.commit.message.clone(),
    );
    pipeline.register_roots(roots);

    let report = pipeline
        .on_change(&path)
        .await
        .with_context(|| format!("Failed to commit changes for {}", path.display()))?;

    match report.status {
        CommitStatus::Unchanged => {
            println!("✅ Nothing to commit in {}", report.repository.display())
        }
        CommitStatus::Committed { commit, push, .. } => {
            println!("📝 Committed {} in {}", commit, report.repository.display());
            match push {
                Ok(()) => println!("✅ Pushed to origin"),
                Err(e) => println!("❌ Push failed, commit kept locally: {}", e),
            }
        }
    }

    Ok(())
}

/// Handle daemon commands
fn cmd_daemon(daemon_command: DaemonCommands, verbose: bool, config: Config) -> Result<()> {
    match daemon_command {
        DaemonCommands::Start { foreground } => {
            println!("🚀 Starting gistbot daemon...");

            // Check if daemon is already running
            if let Some(pid) = running_pid(&config)? {
                println!("⚠️  Daemon is already running (PID {})!", pid);
                println!("   Use 'gistbot daemon stop' to stop it first");
                return Ok(());
            }

            if foreground {
                println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
                init_logging(verbose, &config.logging, config.logging.color)?;
            } else {
                #[cfg(unix)]
                {
                    println!("✅ Daemon starting in background");
                    println!("   PID file: {}", config.daemon.pid_file);
                    println!("   Log file: {}", config.daemon.log_file);
                    gistbot::daemon::daemonize(&config)?;
                    init_logging(verbose, &config.logging, false)?;
                }

                #[cfg(not(unix))]
                {
                    println!("❌ Background daemon mode not supported on this platform");
                    println!("   Use --foreground to run in foreground mode");
                    return Ok(());
                }
            }

            info!("Starting gistbot v{}", env!("CARGO_PKG_VERSION"));
            runtime()?.block_on(async move {
                let mut daemon = SyncDaemon::new(config)?;
                daemon.run().await
            })?;
        }

        DaemonCommands::Stop => {
            println!("🛑 Stopping gistbot daemon...");

            if stop_daemon(&config)? {
                println!("✅ Daemon stop signal sent");
            } else {
                println!("⚠️  No daemon appears to be running");
            }
        }

        DaemonCommands::Status => {
            println!("📊 gistbot Daemon Status");

            match running_pid(&config)? {
                Some(pid) => {
                    println!("   🟢 Status: Running (PID {})", pid);
                    println!("   📂 Root directory: {}", config.root_directory);
                    println!("   🔄 Pull interval: {}", config.sync.pull_interval);
                    if !config.daemon.log_file.is_empty() {
                        println!("   📄 Log file: {}", config.daemon.log_file);
                    }
                }
                None => {
                    println!("   🔴 Status: Not running");
                    println!("   💡 Use 'gistbot daemon start' to start the daemon");
                }
            }
        }
    }

    Ok(())
}

/// System health check and diagnostics
fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config);
    print_health_report(&health);
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning {
                "⚠️ "
            } else {
                "✅"
            }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 gistbot System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
