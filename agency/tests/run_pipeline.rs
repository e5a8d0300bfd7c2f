//! End-to-end pipeline tests over real git repositories.
//!
//! Git and the setup shell run for real; tmux is faked by `ScriptedRunner`
//! so no sessions leak onto the host.

use std::fs;
use std::path::Path;

use agency::core::status::Status;
use agency::dirs::Dirs;
use agency::errors::{DETAIL_LOG, ErrorCode};
use agency::io::fs::OsFs;
use agency::io::lock::RepoLock;
use agency::io::store::Store;
use agency::pipeline::{Pipeline, RunFailure, RunSummary};
use agency::runs::Runs;
use agency::service::{RunOptions, RunService};
use agency::test_support::{ScriptedRunner, TestRepo};
use serde_json::Value;

const RUN_ID: &str = "20260110120000-a3f2";

fn run_with(
    repo: &TestRepo,
    data: &Path,
    runner: &ScriptedRunner,
    title: Option<&str>,
) -> Result<RunSummary, RunFailure> {
    let dirs = Dirs::new(data, None);
    let service = RunService::new(runner, &OsFs, &dirs);
    Pipeline::new(service)
        .with_run_id_generator(|| RUN_ID.to_string())
        .run(RunOptions {
            title: title.map(str::to_string),
            repo_path: repo.path().to_path_buf(),
            ..RunOptions::default()
        })
}

fn meta_json(data: &Path, repo_id: &str) -> Value {
    let path = Store::new(&OsFs, data).meta_path(repo_id, RUN_ID);
    serde_json::from_slice(&fs::read(path).expect("read meta")).expect("parse meta")
}

#[test]
fn successful_run_leaves_worktree_meta_and_session() {
    let repo = TestRepo::with_setup("echo setting up $AGENCY_BRANCH");
    let data = tempfile::tempdir().expect("data");
    let runner = ScriptedRunner::new();

    let summary = run_with(&repo, data.path(), &runner, Some("Fix flaky test")).expect("run");

    assert_eq!(summary.run_id, RUN_ID);
    assert_eq!(summary.branch, "agency/fix-flaky-test-a3f2");
    assert_eq!(summary.tmux_session, "agency_20260110120000-a3f2");
    assert!(summary.worktree_path.join(".agency/out").is_dir());
    assert_eq!(repo.current_branch(), "main");

    let meta = meta_json(data.path(), &summary.repo_id);
    for key in [
        "schema_version",
        "run_id",
        "repo_id",
        "title",
        "runner",
        "runner_cmd",
        "parent_branch",
        "branch",
        "worktree_path",
        "created_at",
        "tmux_session_name",
        "setup",
    ] {
        assert!(meta.get(key).is_some(), "meta is missing {key}");
    }
    assert_eq!(meta["parent_branch"], "main");
    assert!(meta.get("flags").is_none());

    let log = fs::read_to_string(summary.setup_log.as_ref().expect("log")).expect("log");
    assert!(log.contains("setting up agency/fix-flaky-test-a3f2"));

    let new_session = &runner.calls_to("tmux")[1];
    assert_eq!(new_session.args[..4], ["new-session", "-d", "-s", "agency_20260110120000-a3f2"]);
}

#[test]
fn lock_is_released_when_a_run_fails() {
    let repo = TestRepo::with_setup("exit 3");
    let data = tempfile::tempdir().expect("data");

    let failure = run_with(&repo, data.path(), &ScriptedRunner::new(), None).expect_err("setup");
    assert_eq!(failure.error.code(), ErrorCode::ScriptFailed);

    let index = Store::new(&OsFs, data.path())
        .load_repo_index()
        .expect("index");
    let repo_id = &index.repos.values().next().expect("indexed").repo_id;
    let lock = RepoLock::new(&OsFs, data.path());
    assert!(!lock.lock_path(repo_id).exists());
    lock.lock(repo_id, "test").expect("lock is free");
}

#[test]
fn setup_failure_keeps_evidence_and_status() {
    let repo = TestRepo::with_setup("echo npm install failed >&2; exit 1");
    let data = tempfile::tempdir().expect("data");
    let runner = ScriptedRunner::new();

    let failure = run_with(&repo, data.path(), &runner, Some("deps")).expect_err("fails");

    assert_eq!(failure.run_id, RUN_ID);
    assert_eq!(failure.step, "run_setup");
    let worktree = failure.worktree_path.clone().expect("worktree evidence");
    assert!(worktree.is_dir());
    let log = failure.log_path.clone().expect("log evidence");
    assert!(fs::read_to_string(&log).expect("log").contains("npm install failed"));
    assert_eq!(failure.error.detail(DETAIL_LOG), Some(log.display().to_string().as_str()));
    assert!(runner.calls_to("tmux").is_empty());

    let dirs = Dirs::new(data.path(), None);
    let view = Runs::new(&OsFs, &runner, &dirs).find(RUN_ID).expect("find");
    assert_eq!(view.status, Status::Failed);
    let meta = view.meta.expect("meta");
    assert!(meta.flags.setup_failed);
    assert!(meta.tmux_session_name.is_none());
}

#[test]
fn tmux_failure_is_recorded_without_session_name() {
    let repo = TestRepo::with_setup("true");
    let data = tempfile::tempdir().expect("data");
    let runner = ScriptedRunner::new().with_tmux_failure();

    let failure = run_with(&repo, data.path(), &runner, None).expect_err("tmux");
    assert_eq!(failure.step, "start_tmux");
    assert_eq!(failure.error.code(), ErrorCode::TmuxFailed);

    let index = Store::new(&OsFs, data.path())
        .load_repo_index()
        .expect("index");
    let repo_id = index.repos.values().next().expect("indexed").repo_id.clone();
    let meta = meta_json(data.path(), &repo_id);
    assert_eq!(meta["flags"]["tmux_failed"], true);
    assert!(meta.get("tmux_session_name").is_none());
}

#[test]
fn missing_tmux_binary_fails_as_tmux_failure() {
    let repo = TestRepo::with_setup("true");
    let data = tempfile::tempdir().expect("data");
    let runner = ScriptedRunner::new().with_tmux_missing();

    let failure = run_with(&repo, data.path(), &runner, None).expect_err("no tmux");
    assert_eq!(failure.step, "start_tmux");
    assert_eq!(failure.error.code(), ErrorCode::TmuxFailed);

    let index = Store::new(&OsFs, data.path())
        .load_repo_index()
        .expect("index");
    let repo_id = index.repos.values().next().expect("indexed").repo_id.clone();
    let meta = meta_json(data.path(), &repo_id);
    assert_eq!(meta["flags"]["tmux_failed"], true);
}

#[test]
fn dirty_repo_fails_before_anything_is_written() {
    let repo = TestRepo::with_setup("true");
    repo.write_file("scratch.txt", "wip");
    let data = tempfile::tempdir().expect("data");

    let failure = run_with(&repo, data.path(), &ScriptedRunner::new(), None).expect_err("dirty");

    assert_eq!(failure.run_id, RUN_ID);
    assert_eq!(failure.step, "check_repo_safe");
    assert_eq!(failure.error.code(), ErrorCode::DirtyParent);
    assert!(failure.worktree_path.is_none());
    assert!(!data.path().join("repos").exists());
}

#[test]
fn missing_agency_json_stops_at_config() {
    let repo = TestRepo::new();
    let data = tempfile::tempdir().expect("data");

    let failure = run_with(&repo, data.path(), &ScriptedRunner::new(), None).expect_err("config");

    assert_eq!(failure.step, "load_agency_config");
    assert_eq!(failure.error.code(), ErrorCode::NoAgencyJson);
    assert!(failure.worktree_path.is_none());
}

#[test]
fn setup_script_sees_agency_environment() {
    let repo = TestRepo::with_setup("env | grep '^AGENCY_' | sort > \"$AGENCY_OUTPUT_DIR/env.txt\"");
    let data = tempfile::tempdir().expect("data");

    let summary = run_with(&repo, data.path(), &ScriptedRunner::new(), Some("env check"))
        .expect("run");

    let env = fs::read_to_string(summary.worktree_path.join(".agency/out/env.txt")).expect("env");
    let root = fs::canonicalize(repo.path()).expect("canonical");
    assert!(env.contains(&format!("AGENCY_RUN_ID={RUN_ID}")));
    assert!(env.contains("AGENCY_TITLE=env check"));
    assert!(env.contains("AGENCY_PARENT_BRANCH=main"));
    assert!(env.contains("AGENCY_RUNNER=claude"));
    assert!(env.contains(&format!("AGENCY_REPO_ROOT={}", root.display())));
    assert!(env.contains(&format!(
        "AGENCY_WORKSPACE_ROOT={}",
        summary.worktree_path.display()
    )));
}
