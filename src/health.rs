//! System health checks for gistbot
//!
//! This module provides preflight checks to verify the system is properly
//! configured before the daemon starts.

use crate::discovery::find_repositories;
use crate::git::{Git2Backend, GitBackend};
use crate::repository::open_all;
use crate::Config;
use std::path::Path;
use std::sync::Arc;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Root directory status
    pub root_dir: CheckResult,
    /// Private key status
    pub private_key: CheckResult,
    /// Public key status (warning only, libgit2 can do without)
    pub public_key: CheckResult,
    /// Discovered repositories status (warning only)
    pub repositories: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: true,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(config: &Config) -> Self {
        Self::run_with(config, &Git2Backend::new())
    }

    /// Run all health checks, inspecting repositories through `git`
    pub fn run_with(config: &Config, git: &dyn GitBackend) -> Self {
        Self {
            root_dir: Self::check_root_dir(config),
            private_key: Self::check_private_key(config),
            public_key: Self::check_public_key(config),
            repositories: Self::check_repositories(config, git),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.root_dir.passed && self.private_key.passed
        // Public key and repositories are advisory
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Check root directory exists
    fn check_root_dir(config: &Config) -> CheckResult {
        let path = config.root_path();
        if path.is_dir() {
            CheckResult::ok_with_details("Root directory exists", path.display().to_string())
        } else if path.exists() {
            CheckResult::error_with_details(
                "Root directory is not a directory",
                path.display().to_string(),
            )
        } else {
            CheckResult::error_with_details(
                "Root directory does not exist",
                format!("Run: mkdir -p {}", path.display()),
            )
        }
    }

    /// Check the private key can be read
    fn check_private_key(config: &Config) -> CheckResult {
        let path = Path::new(&config.credentials.private_key);
        match std::fs::File::open(path) {
            Ok(_) => CheckResult::ok_with_details("Private key readable", path.display().to_string()),
            Err(e) => CheckResult::error_with_details(
                "Private key not readable",
                format!(
                    "{}: {}\nRun: ssh-keygen -t ed25519 -f {}",
                    path.display(),
                    e,
                    path.display()
                ),
            ),
        }
    }

    /// Check the public key is present (warning only)
    fn check_public_key(config: &Config) -> CheckResult {
        match &config.credentials.public_key {
            None => CheckResult::warning("No public key configured"),
            Some(path) if Path::new(path).is_file() => {
                CheckResult::ok_with_details("Public key found", path.clone())
            }
            Some(path) => CheckResult::warning_with_details(
                "Public key not found",
                format!("{} (libgit2 will try to derive it from the private key)", path),
            ),
        }
    }

    /// Check discovered repositories open with an origin remote (warning only)
    fn check_repositories(config: &Config, git: &dyn GitBackend) -> CheckResult {
        let paths = match find_repositories(&config.root_path()) {
            Ok(paths) => paths,
            Err(e) => {
                return CheckResult::warning_with_details(
                    "Repositories could not be discovered",
                    e.to_string(),
                )
            }
        };

        if paths.is_empty() {
            return CheckResult::warning("No repositories found under root directory");
        }

        let opened = open_all(&paths, &Arc::new(config.credentials()), git);
        let mut problems: Vec<String> = opened
            .bad_paths
            .iter()
            .map(|bad| format!("{}: {}", bad.path.display(), bad.error))
            .collect();
        problems.extend(opened.handles.iter().filter_map(|handle| {
            git.check_remote(handle)
                .err()
                .map(|_| format!("{}: no '{}' remote", handle.path.display(), handle.remote_name))
        }));

        if problems.is_empty() {
            CheckResult::ok(format!("{} repositories ready", paths.len()))
        } else {
            problems.sort();
            CheckResult::warning_with_details(
                format!("{} of {} repositories have problems", problems.len(), paths.len()),
                problems.join("\n"),
            )
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Root Directory", &self.root_dir),
            ("Private Key", &self.private_key),
            ("Public Key", &self.public_key),
            ("Repositories", &self.repositories),
        ]
    }
}
