use anyhow::{bail, Context, Result};
use dirs::config_dir;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::git::{Credentials, Identity};
use crate::watcher::PathFilter;

/// Main configuration structure for gistbot
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory holding the repositories to keep in sync
    #[serde(default = "default_root_directory")]
    pub root_directory: String,

    /// SSH key pair used for fetch and push
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Identity recorded on automatic commits
    #[serde(default)]
    pub committer: CommitterConfig,

    /// Commit message settings
    #[serde(default)]
    pub commit: CommitConfig,

    /// Pull pass behavior
    #[serde(default)]
    pub sync: SyncConfig,

    /// Filesystem watch behavior
    #[serde(default)]
    pub watch: WatchConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SSH credentials
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CredentialsConfig {
    /// Public key path (optional, libgit2 derives it when absent)
    #[serde(default = "default_public_key")]
    pub public_key: Option<String>,

    /// Private key path
    #[serde(default = "default_private_key")]
    pub private_key: String,

    /// SSH user when the remote URL carries none
    #[serde(default = "default_username")]
    pub username: String,

    /// Private key passphrase
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Commit author and committer
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommitterConfig {
    #[serde(default = "default_committer_name")]
    pub name: String,

    #[serde(default = "default_committer_email")]
    pub email: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommitConfig {
    /// Message prefix; a local timestamp is appended
    #[serde(default = "default_commit_message")]
    pub message: String,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Maximum concurrent pulls (0 = one per repository)
    #[serde(default)]
    pub max_parallel: usize,

    /// Deadline for a single pull in seconds (0 = none)
    #[serde(default)]
    pub timeout: u64,

    /// Interval between periodic pull passes ("0" disables them)
    #[serde(default = "default_pull_interval")]
    pub pull_interval: String, // "15m"

    /// Re-walk the root directory before every periodic pass
    #[serde(default = "default_true")]
    pub rediscover: bool,
}

/// Watch configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// Watch whole repository trees instead of their top directory only
    #[serde(default)]
    pub recursive: bool,

    /// Quiet period before a burst of writes is committed
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Extra path regexes to ignore, on top of git internals and swap files
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "full", "pretty"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_root_directory() -> String {
    "${HOME}/gists".to_string()
}
fn default_public_key() -> Option<String> {
    Some("${HOME}/.ssh/id_rsa.pub".to_string())
}
fn default_private_key() -> String {
    "${HOME}/.ssh/id_rsa".to_string()
}
fn default_username() -> String {
    "git".to_string()
}
fn default_committer_name() -> String {
    "gistbot".to_string()
}
fn default_committer_email() -> String {
    "gistbot@localhost".to_string()
}
fn default_commit_message() -> String {
    "Committed by gistbot".to_string()
}
fn default_true() -> bool {
    true
}
fn default_pull_interval() -> String {
    "15m".to_string()
}
fn default_debounce_ms() -> u64 {
    250
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/gistbot.pid", runtime_dir)
    } else {
        "/tmp/gistbot.pid".to_string()
    }
}

fn default_log_file() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/gistbot/daemon.log", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/gistbot/daemon.log", home)
    } else {
        "/tmp/gistbot-daemon.log".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            public_key: default_public_key(),
            private_key: default_private_key(),
            username: default_username(),
            passphrase: None,
        }
    }
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            name: default_committer_name(),
            email: default_committer_email(),
        }
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            message: default_commit_message(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel: 0,
            timeout: 0,
            pull_interval: default_pull_interval(),
            rediscover: default_true(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            recursive: false,
            debounce_ms: default_debounce_ms(),
            ignore_patterns: Vec::new(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            // Create config directory if it doesn't exist
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            // Save default config, unexpanded so it stays portable
            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("gistbot").join("config.yml"))
    }

    /// Expand environment variables and `~` in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.root_directory = expand(&self.root_directory, "root_directory")?;
        self.credentials.private_key = expand(&self.credentials.private_key, "private_key")?;
        if let Some(public_key) = &self.credentials.public_key {
            self.credentials.public_key = Some(expand(public_key, "public_key")?);
        }
        self.daemon.pid_file = expand(&self.daemon.pid_file, "pid_file")?;
        self.daemon.log_file = expand(&self.daemon.log_file, "log_file")?;

        Ok(())
    }

    /// Check the settings that only fail at runtime otherwise
    pub fn validate(&self) -> Result<()> {
        if self.root_directory.trim().is_empty() {
            bail!("root_directory must not be empty");
        }

        self.pull_interval().context("Invalid sync.pull_interval")?;
        self.ignore_patterns()?;

        match self.logging.format.as_str() {
            "compact" | "full" | "pretty" => Ok(()),
            other => bail!(
                "Unknown logging.format '{}', expected compact, full or pretty",
                other
            ),
        }
    }

    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.root_directory)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            public_key: self.credentials.public_key.as_ref().map(PathBuf::from),
            private_key: PathBuf::from(&self.credentials.private_key),
            username: self.credentials.username.clone(),
            passphrase: self.credentials.passphrase.clone(),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            name: self.committer.name.clone(),
            email: self.committer.email.clone(),
        }
    }

    /// Interval between periodic pull passes, `None` when disabled
    pub fn pull_interval(&self) -> Result<Option<Duration>> {
        let seconds = parse_duration(&self.sync.pull_interval)?;
        if seconds == 0 {
            return Ok(None);
        }

        let period = Duration::from_secs(seconds);
        if Instant::now().checked_add(period).is_none() {
            bail!("Pull interval of {} seconds is too large", seconds);
        }
        Ok(Some(period))
    }

    /// Deadline for one pull, `None` when disabled
    pub fn sync_timeout(&self) -> Option<Duration> {
        (self.sync.timeout > 0).then(|| Duration::from_secs(self.sync.timeout))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.watch.debounce_ms)
    }

    fn ignore_patterns(&self) -> Result<Vec<Regex>> {
        self.watch
            .ignore_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("Invalid ignore pattern: {}", pattern))
            })
            .collect()
    }

    pub fn path_filter(&self) -> Result<PathFilter> {
        Ok(PathFilter::new(self.ignore_patterns()?))
    }

    pub fn pid_file(&self) -> Option<PathBuf> {
        (!self.daemon.pid_file.is_empty()).then(|| PathBuf::from(&self.daemon.pid_file))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_directory: default_root_directory(),
            credentials: CredentialsConfig::default(),
            committer: CommitterConfig::default(),
            commit: CommitConfig::default(),
            sync: SyncConfig::default(),
            watch: WatchConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn expand(value: &str, field: &str) -> Result<String> {
    Ok(shellexpand::full(value)
        .with_context(|| format!("Failed to expand {} path", field))?
        .into_owned())
}

/// Parse duration strings like "30s", "15m", "1h", "2d" or raw seconds.
pub fn parse_duration(duration_str: &str) -> Result<u64> {
    let duration_str = duration_str.trim().to_lowercase();

    let (value, unit, multiplier) = if let Some(value) = duration_str.strip_suffix('s') {
        (value, "seconds", 1)
    } else if let Some(value) = duration_str.strip_suffix('m') {
        (value, "minutes", 60)
    } else if let Some(value) = duration_str.strip_suffix('h') {
        (value, "hours", 3600)
    } else if let Some(value) = duration_str.strip_suffix('d') {
        (value, "days", 86400)
    } else {
        // Try to parse as raw seconds
        let seconds = duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '1h', '2d'")?;
        return Ok(seconds);
    };

    let value = value
        .parse::<u64>()
        .with_context(|| format!("Invalid {} value", unit))?;
    value
        .checked_mul(multiplier)
        .with_context(|| format!("Duration too large: {}", duration_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    // Helper function to create a temporary config directory
    fn setup_test_config_dir() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("gistbot");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");
        (temp_dir, config_dir)
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.root_directory, "${HOME}/gists");
        assert_eq!(config.credentials.username, "git");
        assert_eq!(config.committer.name, "gistbot");
        assert_eq!(config.committer.email, "gistbot@localhost");
        assert_eq!(config.commit.message, "Committed by gistbot");
        assert_eq!(config.sync.max_parallel, 0);
        assert_eq!(config.sync.timeout, 0);
        assert!(config.sync.rediscover);
        assert!(!config.watch.recursive);
        assert_eq!(config.watch.debounce_ms, 250);
        assert!(config.watch.ignore_patterns.is_empty());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), 30);
        assert_eq!(parse_duration("15m").unwrap(), 900);
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("2d").unwrap(), 172800);
        assert_eq!(parse_duration(" 45 ").unwrap(), 45);
        assert_eq!(parse_duration("1H").unwrap(), 3600);
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_an_error() {
        assert!(parse_duration("999999999999999999d").is_err());
        assert!(parse_duration("18446744073709551615m").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            u64::MAX
        );
    }

    #[test]
    fn test_pull_interval_and_timeout() {
        let mut config = Config::default();
        assert_eq!(
            config.pull_interval().unwrap(),
            Some(Duration::from_secs(900))
        );
        assert_eq!(config.sync_timeout(), None);

        config.sync.pull_interval = "0".to_string();
        config.sync.timeout = 30;
        assert_eq!(config.pull_interval().unwrap(), None);
        assert_eq!(config.sync_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_GISTBOT_HOME", "/test/home");

        let mut config = Config::default();
        config.root_directory = "${TEST_GISTBOT_HOME}/gists".to_string();
        config.credentials.private_key = "${TEST_GISTBOT_HOME}/.ssh/id_ed25519".to_string();
        config.credentials.public_key = None;

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(config.root_directory, "/test/home/gists");
        assert_eq!(config.credentials.private_key, "/test/home/.ssh/id_ed25519");
        assert_eq!(config.credentials.public_key, None);

        env::remove_var("TEST_GISTBOT_HOME");
    }

    #[test]
    #[serial]
    fn test_default_pid_file_uses_runtime_dir() {
        let original = env::var("XDG_RUNTIME_DIR").ok();
        env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");

        assert_eq!(default_pid_file(), "/run/user/1000/gistbot.pid");

        match original {
            Some(value) => env::set_var("XDG_RUNTIME_DIR", value),
            None => env::remove_var("XDG_RUNTIME_DIR"),
        }
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let nonexistent_path = Path::new("/nonexistent/path/config.yml");
        let result = Config::load(nonexistent_path);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let (_temp_dir, config_dir) = setup_test_config_dir();
        let config_path = config_dir.join("config.yml");

        let mut config = Config::default();
        config.root_directory = "/custom/gists".to_string();
        config.committer.name = "Robot".to_string();
        config.sync.max_parallel = 8;
        config.watch.ignore_patterns = vec![r"\.tmp$".to_string()];

        config.save(&config_path).expect("Failed to save config");
        let loaded_config = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded_config.root_directory, "/custom/gists");
        assert_eq!(loaded_config.committer.name, "Robot");
        assert_eq!(loaded_config.sync.max_parallel, 8);
        assert_eq!(loaded_config.watch.ignore_patterns, vec![r"\.tmp$"]);
    }

    #[test]
    fn test_config_default_path_xdg() {
        let default_path = Config::default_config_path().expect("Failed to get default path");
        assert!(default_path.to_string_lossy().contains("gistbot"));
        assert!(default_path.to_string_lossy().ends_with("config.yml"));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
root_directory: "/srv/gists"
credentials:
  public_key: null
  private_key: "/keys/id_ed25519"
  username: "deploy"
committer:
  name: "Gist Bot"
  email: "bot@example.com"
commit:
  message: "Committed by the Gist Bot"
sync:
  max_parallel: 4
  timeout: 60
  pull_interval: "1h"
  rediscover: false
watch:
  recursive: true
  debounce_ms: 0
  ignore_patterns: ["~$"]
logging:
  level: "debug"
  format: "pretty"
  color: false
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.root_directory, "/srv/gists");
        assert_eq!(config.credentials.public_key, None);
        assert_eq!(config.credentials.username, "deploy");
        assert_eq!(config.credentials.passphrase, None);
        assert_eq!(config.committer.email, "bot@example.com");
        assert_eq!(config.commit.message, "Committed by the Gist Bot");
        assert_eq!(config.sync.max_parallel, 4);
        assert_eq!(config.sync_timeout(), Some(Duration::from_secs(60)));
        assert!(!config.sync.rediscover);
        assert!(config.watch.recursive);
        assert_eq!(config.debounce(), Duration::ZERO);
        assert!(!config.logging.color);
        assert!(config.validate().is_ok());

        let credentials = config.credentials();
        assert_eq!(credentials.private_key, PathBuf::from("/keys/id_ed25519"));
        assert!(credentials.public_key.is_none());
        assert_eq!(config.identity().name, "Gist Bot");
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("root_directory: /srv/gists\n").unwrap();

        assert_eq!(config.committer.name, "gistbot");
        assert_eq!(config.sync.pull_interval, "15m");
        assert_eq!(config.logging.format, "compact");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.watch.ignore_patterns = vec!["(unclosed".to_string()];
        assert!(config.validate().is_err());
        assert!(config.path_filter().is_err());

        let mut config = Config::default();
        config.sync.pull_interval = "often".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "json".to_string();
        assert!(config.validate().is_err());

        // Parses, but no deadline that far out can be scheduled
        let mut config = Config::default();
        config.sync.pull_interval = "18446744073709551615".to_string();
        assert!(config.pull_interval().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_path_filter_includes_patterns() {
        let mut config = Config::default();
        config.watch.ignore_patterns = vec![r"\.tmp$".to_string()];

        let filter = config.path_filter().unwrap();
        assert!(filter.is_ignored(Path::new("/gists/r1/scratch.tmp")));
        assert!(filter.is_ignored(Path::new("/gists/r1/.git/index")));
        assert!(!filter.is_ignored(Path::new("/gists/r1/notes.txt")));
    }
}
