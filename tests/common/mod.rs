//! Common test utilities and helpers for gistbot tests
//!
//! Every gist gets a bare "remote" repository on disk and a clone under the
//! root directory. Remotes are plain paths, so libgit2 uses its local
//! transport and never asks for credentials.
#![allow(dead_code)]

use git2::{
    Commit, IndexAddOption, Oid, Repository, RepositoryInitOptions, Signature,
};
use gistbot::{Config, Credentials, Identity};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const SEED_FILE: &str = "gist.md";

/// Root directory of clones plus their bare remotes
pub struct GistFixture {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    pub remotes: PathBuf,
    pub elsewhere: PathBuf,
}

impl GistFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("gists");
        let remotes = temp_dir.path().join("remotes");
        let elsewhere = temp_dir.path().join("elsewhere");
        for dir in [&root, &remotes, &elsewhere] {
            std::fs::create_dir_all(dir).expect("Failed to create fixture dir");
        }

        Self {
            temp_dir,
            root,
            remotes,
            elsewhere,
        }
    }

    /// Bare repository with `master` as its default branch and no commits
    pub fn empty_remote(&self, name: &str) -> PathBuf {
        let path = self.remote_path(name);
        let mut options = RepositoryInitOptions::new();
        options.bare(true).initial_head("master");
        Repository::init_opts(&path, &options).expect("Failed to init bare remote");
        path
    }

    /// Create a remote holding one seed commit and clone it into the root.
    pub fn add_gist(&self, name: &str) -> PathBuf {
        let remote = self.empty_remote(name);

        let seed_path = self.temp_dir.path().join("seed").join(name);
        let mut options = RepositoryInitOptions::new();
        options.initial_head("master");
        let seed = Repository::init_opts(&seed_path, &options).expect("Failed to init seed");
        write_file(&seed_path, SEED_FILE, &format!("# {}\n", name));
        commit_all(&seed_path, "Initial commit");
        seed.remote("origin", &url(&remote))
            .expect("Failed to add seed remote");
        push_master(&seed_path);

        let clone = self.root.join(name);
        Repository::clone(&url(&remote), &clone).expect("Failed to clone gist");
        clone
    }

    pub fn remote_path(&self, name: &str) -> PathBuf {
        self.remotes.join(format!("{}.git", name))
    }

    /// A second working copy of a gist, standing in for another machine
    pub fn clone_elsewhere(&self, name: &str) -> PathBuf {
        let target = self.elsewhere.join(name);
        Repository::clone(&url(&self.remote_path(name)), &target)
            .expect("Failed to clone elsewhere");
        target
    }

    /// Daemon configuration pointing at the fixture
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.root_directory = self.root.to_string_lossy().into_owned();
        config.credentials.public_key = None;
        config.credentials.private_key = "/nonexistent/id_ed25519".to_string();
        config.sync.pull_interval = "0".to_string();
        config.watch.debounce_ms = 50;
        config.daemon.pid_file = self
            .temp_dir
            .path()
            .join("gistbot.pid")
            .to_string_lossy()
            .into_owned();
        config.daemon.log_file = self
            .temp_dir
            .path()
            .join("gistbot.log")
            .to_string_lossy()
            .into_owned();
        config
    }

    /// Write the config to a file inside the fixture for CLI runs
    pub fn config_file(&self) -> PathBuf {
        let path = self.temp_dir.path().join("config.yml");
        self.config().save(&path).expect("Failed to write config");
        path
    }
}

fn url(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn credentials() -> Arc<Credentials> {
    Arc::new(Credentials {
        public_key: None,
        private_key: PathBuf::from("/nonexistent/id_ed25519"),
        username: "git".to_string(),
        passphrase: None,
    })
}

pub fn identity() -> Identity {
    Identity {
        name: "gistbot".to_string(),
        email: "gistbot@localhost".to_string(),
    }
}

pub fn write_file(repo: &Path, relative: &str, content: &str) {
    let path = repo.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    std::fs::write(path, content).expect("Failed to write file");
}

pub fn read_file(repo: &Path, relative: &str) -> String {
    std::fs::read_to_string(repo.join(relative)).expect("Failed to read file")
}

/// Stage everything and commit on top of `HEAD` as another author.
pub fn commit_all(path: &Path, message: &str) -> Oid {
    let repo = Repository::open(path).expect("Failed to open repo");
    let mut index = repo.index().expect("Failed to open index");
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .expect("Failed to stage");
    index
        .update_all(["*"].iter(), None)
        .expect("Failed to stage deletions");
    index.write().expect("Failed to write index");
    let tree = repo
        .find_tree(index.write_tree().expect("Failed to write tree"))
        .expect("Failed to find tree");

    let signature = Signature::now("Someone Else", "else@example.com").unwrap();
    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&Commit<'_>> = parent.iter().collect();

    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .expect("Failed to commit")
}

pub fn push_master(path: &Path) {
    let repo = Repository::open(path).expect("Failed to open repo");
    let mut remote = repo.find_remote("origin").expect("Failed to find origin");
    remote
        .push(&["refs/heads/master:refs/heads/master"], None)
        .expect("Failed to push");
}

pub fn head_oid(path: &Path) -> Oid {
    let repo = Repository::open(path).expect("Failed to open repo");
    let head = repo.head().expect("Failed to read HEAD");
    let commit = head.peel_to_commit().expect("HEAD is not a commit");
    commit.id()
}

pub fn branch_oid(path: &Path, name: &str) -> Oid {
    let repo = Repository::open(path).expect("Failed to open repo");
    repo.refname_to_id(name).expect("Failed to resolve ref")
}

pub fn parent_of(path: &Path, commit: Oid) -> Option<Oid> {
    let repo = Repository::open(path).expect("Failed to open repo");
    let commit = repo.find_commit(commit).expect("Failed to find commit");
    commit.parent_ids().next()
}

/// True when `file` exists in the tree of `commit`
pub fn tree_has_file(path: &Path, commit: Oid, file: &str) -> bool {
    let repo = Repository::open(path).expect("Failed to open repo");
    let commit = repo.find_commit(commit).expect("Failed to find commit");
    let tree = commit.tree().expect("Failed to read tree");
    tree.get_path(Path::new(file)).is_ok()
}

/// Poll `check` until it returns true or `timeout` passes
pub fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    check()
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
