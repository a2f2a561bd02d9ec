//! Pull and commit behavior against real repositories and local remotes

mod common;

use assert_matches::assert_matches;
use common::*;
use gistbot::{
    find_repositories, open_all, CommitPipeline, CommitStatus, ErrorKind, Git2Backend,
    GitBackend, PullCoordinator, PullStatus, RepoLocks, RepositoryHandle, SyncError,
};
use std::sync::Arc;

const MASTER: &str = "refs/heads/master";

fn open(path: &std::path::Path) -> RepositoryHandle {
    RepositoryHandle::open(path, credentials(), &Git2Backend::new()).expect("Failed to open")
}

fn pipeline(fixture: &GistFixture) -> CommitPipeline {
    let pipeline = CommitPipeline::new(
        Arc::new(Git2Backend::new()),
        RepoLocks::new(),
        credentials(),
        identity(),
        "Committed by gistbot",
    );
    pipeline.register_roots(find_repositories(&fixture.root).unwrap());
    pipeline
}

#[test]
fn test_pull_up_to_date_keeps_local_edits() {
    let fixture = GistFixture::new();
    let local = fixture.add_gist("r1");
    let before = head_oid(&local);
    write_file(&local, SEED_FILE, "work in progress\n");

    let status = open(&local).pull(&Git2Backend::new()).unwrap();

    assert_eq!(status, PullStatus::UpToDate { ahead: 0 });
    assert_eq!(head_oid(&local), before);
    assert_eq!(read_file(&local, SEED_FILE), "work in progress\n");
}

#[test]
fn test_pull_reports_unpushed_local_commits() {
    let fixture = GistFixture::new();
    let local = fixture.add_gist("r1");
    write_file(&local, "local.txt", "mine\n");
    commit_all(&local, "Local only");

    let status = open(&local).pull(&Git2Backend::new()).unwrap();
    assert_eq!(status, PullStatus::UpToDate { ahead: 1 });
}

#[test]
fn test_pull_fast_forwards_to_remote() {
    let fixture = GistFixture::new();
    let local = fixture.add_gist("r2");
    let before = head_oid(&local);

    let other = fixture.clone_elsewhere("r2");
    write_file(&other, "added.txt", "new file\n");
    std::fs::remove_file(other.join(SEED_FILE)).unwrap();
    let remote_tip = commit_all(&other, "Add one file, drop another");
    push_master(&other);

    let status = open(&local).pull(&Git2Backend::new()).unwrap();

    assert_eq!(
        status,
        PullStatus::FastForwarded {
            from: Some(before),
            to: remote_tip,
        }
    );
    assert_eq!(head_oid(&local), remote_tip);
    assert_eq!(branch_oid(&local, MASTER), remote_tip);
    assert_eq!(read_file(&local, "added.txt"), "new file\n");
    assert!(!local.join(SEED_FILE).exists());

    // A second pull has nothing left to do
    let again = open(&local).pull(&Git2Backend::new()).unwrap();
    assert_eq!(again, PullStatus::UpToDate { ahead: 0 });
}

#[test]
fn test_pull_leaves_diverged_history_alone() {
    let fixture = GistFixture::new();
    let local = fixture.add_gist("r1");

    write_file(&local, "local.txt", "local side\n");
    let local_tip = commit_all(&local, "Local change");

    let other = fixture.clone_elsewhere("r1");
    write_file(&other, "remote.txt", "remote side\n");
    let remote_tip = commit_all(&other, "Remote change");
    push_master(&other);

    let status = open(&local).pull(&Git2Backend::new()).unwrap();

    assert_eq!(
        status,
        PullStatus::Diverged {
            local: local_tip,
            remote: remote_tip,
        }
    );
    assert_eq!(head_oid(&local), local_tip);
    assert!(!local.join("remote.txt").exists());
}

#[tokio::test]
async fn test_pull_pass_reports_every_repository() {
    let fixture = GistFixture::new();
    let healthy = fixture.add_gist("healthy");

    let no_remote = fixture.add_gist("no-remote");
    git2::Repository::open(&no_remote)
        .unwrap()
        .remote_delete("origin")
        .unwrap();

    // Fetching from an empty remote leaves nothing to resolve
    let empty_remote = fixture.empty_remote("empty");
    let fresh = git2::Repository::init(fixture.root.join("fresh")).unwrap();
    fresh
        .remote("origin", &empty_remote.to_string_lossy())
        .unwrap();

    std::fs::create_dir_all(fixture.root.join("broken/.git")).unwrap();

    let paths = find_repositories(&fixture.root).unwrap();
    assert_eq!(paths.len(), 4);

    let git: Arc<dyn GitBackend> = Arc::new(Git2Backend::new());
    let opened = open_all(&paths, &credentials(), git.as_ref());
    assert_eq!(opened.handles.len(), 3);
    assert_eq!(opened.bad_paths.len(), 1);
    assert_eq!(opened.bad_paths[0].path, fixture.root.join("broken"));

    let coordinator = PullCoordinator::new(git, RepoLocks::new(), 0, None);
    let summary = coordinator.pull_pass(&opened).await;

    assert_eq!(summary.total_repositories, 3);
    assert_eq!(summary.outcomes.len(), 3);
    assert_eq!(summary.up_to_date, 1);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.bad_paths, vec![fixture.root.join("broken")]);

    for outcome in &summary.outcomes {
        if outcome.repository == healthy {
            assert_matches!(outcome.result, Ok(PullStatus::UpToDate { ahead: 0 }));
        } else if outcome.repository == no_remote {
            let error = outcome.result.as_ref().unwrap_err();
            assert_matches!(error, SyncError::RemoteNotFound { .. });
            assert_eq!(error.kind(), ErrorKind::Network);
        } else {
            assert_eq!(outcome.repository, fixture.root.join("fresh"));
            let error = outcome.result.as_ref().unwrap_err();
            assert_eq!(error.kind(), ErrorKind::RefResolution);
        }
    }
}

#[tokio::test]
async fn test_change_is_committed_on_top_of_head_and_pushed() {
    let fixture = GistFixture::new();
    let local = fixture.add_gist("r3");
    let before = head_oid(&local);

    write_file(&local, "notes.txt", "a new thought\n");
    let report = pipeline(&fixture)
        .on_change(&local.join("notes.txt"))
        .await
        .unwrap();

    assert_eq!(report.repository, local);
    let commit = match report.status {
        CommitStatus::Committed {
            commit,
            parent,
            push,
        } => {
            assert_eq!(parent, Some(before));
            assert!(push.is_ok());
            commit
        }
        CommitStatus::Unchanged => panic!("Expected a commit"),
    };

    assert_eq!(head_oid(&local), commit);
    assert_eq!(parent_of(&local, commit), Some(before));
    assert_eq!(branch_oid(&fixture.remote_path("r3"), MASTER), commit);
    assert!(tree_has_file(&local, commit, "notes.txt"));

    let repo = git2::Repository::open(&local).unwrap();
    let message = repo.find_commit(commit).unwrap().message().unwrap().to_string();
    assert!(message.starts_with("Committed by gistbot "));
}

#[tokio::test]
async fn test_sequential_changes_chain_commits() {
    let fixture = GistFixture::new();
    let local = fixture.add_gist("r3");
    let pipeline = pipeline(&fixture);

    write_file(&local, "one.txt", "1\n");
    let first = pipeline.on_change(&local.join("one.txt")).await.unwrap();
    let first = match first.status {
        CommitStatus::Committed { commit, .. } => commit,
        CommitStatus::Unchanged => panic!("Expected first commit"),
    };

    write_file(&local, "two.txt", "2\n");
    let second = pipeline.on_change(&local.join("two.txt")).await.unwrap();
    assert_matches!(
        second.status,
        CommitStatus::Committed { parent: Some(parent), push: Ok(()), .. } if parent == first
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_changes_commit_once() {
    let fixture = GistFixture::new();
    let local = fixture.add_gist("r3");
    let pipeline = pipeline(&fixture);

    write_file(&local, "a.txt", "a\n");
    write_file(&local, "b.txt", "b\n");

    let a = local.join("a.txt");
    let b = local.join("b.txt");
    let (first, second) = tokio::join!(pipeline.on_change(&a), pipeline.on_change(&b));

    let statuses = [first.unwrap().status, second.unwrap().status];
    let committed = statuses
        .iter()
        .filter(|status| matches!(status, CommitStatus::Committed { .. }))
        .count();
    let unchanged = statuses
        .iter()
        .filter(|status| matches!(status, CommitStatus::Unchanged))
        .count();

    assert_eq!(committed, 1);
    assert_eq!(unchanged, 1);
    assert_eq!(branch_oid(&fixture.remote_path("r3"), MASTER), head_oid(&local));
}

#[tokio::test]
async fn test_rejected_push_keeps_local_commit() {
    let fixture = GistFixture::new();
    let local = fixture.add_gist("r1");

    let other = fixture.clone_elsewhere("r1");
    write_file(&other, "remote.txt", "got there first\n");
    let remote_tip = commit_all(&other, "Remote change");
    push_master(&other);

    write_file(&local, "local.txt", "too late\n");
    let report = pipeline(&fixture)
        .on_change(&local.join("local.txt"))
        .await
        .unwrap();

    match report.status {
        CommitStatus::Committed { commit, push, .. } => {
            assert_matches!(push, Err(SyncError::PushRejected { .. }));
            assert_eq!(head_oid(&local), commit);
        }
        CommitStatus::Unchanged => panic!("Expected a local commit"),
    }
    assert_eq!(branch_oid(&fixture.remote_path("r1"), MASTER), remote_tip);
}

#[tokio::test]
async fn test_no_changes_means_no_commit() {
    let fixture = GistFixture::new();
    let local = fixture.add_gist("r1");
    let before = head_oid(&local);

    let report = pipeline(&fixture)
        .on_change(&local.join(SEED_FILE))
        .await
        .unwrap();

    assert_matches!(report.status, CommitStatus::Unchanged);
    assert_eq!(head_oid(&local), before);
}

#[tokio::test]
async fn test_deleted_file_is_committed() {
    let fixture = GistFixture::new();
    let local = fixture.add_gist("r1");

    std::fs::remove_file(local.join(SEED_FILE)).unwrap();
    let report = pipeline(&fixture)
        .on_change(&local.join(SEED_FILE))
        .await
        .unwrap();

    let commit = match report.status {
        CommitStatus::Committed { commit, push, .. } => {
            assert!(push.is_ok());
            commit
        }
        CommitStatus::Unchanged => panic!("Expected the deletion to be committed"),
    };
    assert!(!tree_has_file(&local, commit, SEED_FILE));
}

#[tokio::test]
async fn test_fast_forward_then_commit_builds_on_remote() {
    let fixture = GistFixture::new();
    let local = fixture.add_gist("r2");

    let other = fixture.clone_elsewhere("r2");
    write_file(&other, "remote.txt", "from elsewhere\n");
    let remote_tip = commit_all(&other, "Remote change");
    push_master(&other);

    open(&local).pull(&Git2Backend::new()).unwrap();

    // The checkout itself must not look like a local change
    let report = pipeline(&fixture)
        .on_change(&local.join("remote.txt"))
        .await
        .unwrap();
    assert_matches!(report.status, CommitStatus::Unchanged);

    write_file(&local, "local.txt", "and from here\n");
    let report = pipeline(&fixture)
        .on_change(&local.join("local.txt"))
        .await
        .unwrap();
    assert_matches!(
        report.status,
        CommitStatus::Committed { parent: Some(parent), push: Ok(()), .. } if parent == remote_tip
    );
}
