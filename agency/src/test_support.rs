//! Test-only fixtures: sample records, throwaway git repos and scripted
//! capabilities.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use tempfile::TempDir;

use crate::core::meta::{RunMeta, SCHEMA_VERSION};
use crate::io::fs::{Fs, OsFs};
use crate::io::process::{CmdOutput, CommandRunner, OsRunner, RunOpts};

/// Deterministic meta with only the required fields set.
pub fn sample_meta(run_id: &str) -> RunMeta {
    RunMeta {
        schema_version: SCHEMA_VERSION.to_string(),
        run_id: run_id.to_string(),
        repo_id: "0123456789abcdef".to_string(),
        title: "fix flaky test".to_string(),
        runner: "claude".to_string(),
        runner_cmd: "claude".to_string(),
        parent_branch: "main".to_string(),
        branch: "agency/fix-flaky-test-a3f2".to_string(),
        worktree_path: "/tmp/agency/worktrees/x".to_string(),
        created_at: "2026-01-10T12:00:00Z".to_string(),
        tmux_session_name: None,
        flags: Default::default(),
        setup: None,
        pr_number: None,
        pr_url: None,
        last_push_at: None,
        last_verify_at: None,
        archive: None,
        extra: Default::default(),
    }
}

/// `agency.json` contents with the given setup script and a `claude` runner
/// mapped explicitly (so tests never depend on `PATH`).
pub fn agency_json(setup: &str) -> String {
    serde_json::to_string_pretty(&serde_json::json!({
        "version": 1,
        "defaults": { "parent_branch": "main", "runner": "claude" },
        "scripts": { "setup": setup },
        "runners": { "claude": "claude" }
    }))
    .expect("serialize agency.json")
}

/// Temporary git repository on branch `main` with one commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "-q"]);
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo.git(&["config", "user.email", "agency@example.com"]);
        repo.git(&["config", "user.name", "Agency Test"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        std::fs::write(repo.path().join("README.md"), "# test repo\n").expect("write readme");
        repo.commit_all("initial");
        repo
    }

    /// Repository with `agency.json` (and the given setup script) committed.
    pub fn with_setup(setup: &str) -> Self {
        let repo = Self::new();
        repo.write_agency_json(&agency_json(setup));
        repo.commit_all("add agency.json");
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn current_branch(&self) -> String {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .trim()
            .to_string()
    }

    pub fn write_agency_json(&self, contents: &str) {
        std::fs::write(self.path().join("agency.json"), contents).expect("write agency.json");
    }

    pub fn write_file(&self, rel: &str, contents: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, contents).expect("write file");
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message]);
    }

    pub fn git(&self, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("spawn git");
        assert!(
            out.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).into_owned()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// One invocation observed by [`ScriptedRunner`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// [`CommandRunner`] that records every call, fakes tmux in memory and passes
/// everything else (git, sh) through to the OS.
#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<RecordedCall>>,
    sessions: Mutex<BTreeSet<String>>,
    tmux_fails: bool,
    tmux_missing: bool,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `tmux new-session` exit non-zero.
    pub fn with_tmux_failure(mut self) -> Self {
        self.tmux_fails = true;
        self
    }

    /// Make every tmux invocation fail to spawn, as if tmux were not installed.
    pub fn with_tmux_missing(mut self) -> Self {
        self.tmux_missing = true;
        self
    }

    /// Pretend a session with this name already exists.
    pub fn with_session(self, name: &str) -> Self {
        self.sessions
            .lock()
            .expect("sessions lock")
            .insert(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    pub fn sessions(&self) -> Vec<String> {
        self.sessions
            .lock()
            .expect("sessions lock")
            .iter()
            .cloned()
            .collect()
    }

    fn tmux(&self, args: &[&str]) -> CmdOutput {
        let mut sessions = self.sessions.lock().expect("sessions lock");
        let reply = |code: i32, stdout: String, stderr: &str| CmdOutput {
            exit_code: Some(code),
            stdout: stdout.into_bytes(),
            stderr: stderr.as_bytes().to_vec(),
            ..CmdOutput::default()
        };
        match args {
            ["has-session", "-t", target] => {
                let name = target.trim_start_matches('=');
                if sessions.contains(name) {
                    reply(0, String::new(), "")
                } else {
                    reply(1, String::new(), "can't find session")
                }
            }
            ["new-session", "-d", "-s", name, ..] => {
                if self.tmux_fails {
                    reply(1, String::new(), "server exited unexpectedly")
                } else if !sessions.insert((*name).to_string()) {
                    reply(1, String::new(), "duplicate session")
                } else {
                    reply(0, String::new(), "")
                }
            }
            ["list-sessions", ..] => {
                if sessions.is_empty() {
                    reply(1, String::new(), "no server running")
                } else {
                    let listing: String = sessions.iter().map(|s| format!("{s}\n")).collect();
                    reply(0, listing, "")
                }
            }
            _ => reply(1, String::new(), "unsupported tmux command"),
        }
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, name: &str, args: &[&str], opts: &RunOpts) -> io::Result<CmdOutput> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            program: name.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            cwd: opts.cwd.clone(),
            env: opts.env.clone(),
        });
        if name == "tmux" {
            if self.tmux_missing {
                return Err(io::Error::new(io::ErrorKind::NotFound, "tmux: not found"));
            }
            return Ok(self.tmux(args));
        }
        OsRunner.run(name, args, opts)
    }
}

/// [`Fs`] over the real filesystem with switchable injected faults.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultyFs {
    pub fail_rename: bool,
    pub fail_create_dir: bool,
}

impl FaultyFs {
    fn injected(what: &str) -> io::Error {
        io::Error::other(format!("injected {what} failure"))
    }
}

impl Fs for FaultyFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        OsFs.read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        OsFs.write(path, contents)
    }

    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        OsFs.metadata(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if self.fail_rename {
            return Err(Self::injected("rename"));
        }
        OsFs.rename(from, to)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        OsFs.set_mode(path, mode)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        OsFs.create_dir_all(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        if self.fail_create_dir {
            return Err(Self::injected("create_dir"));
        }
        OsFs.create_dir(path)
    }

    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        OsFs.create_new(path, contents)
    }

    fn create_temp(&self, dir: &Path, prefix: &str) -> io::Result<(PathBuf, File)> {
        OsFs.create_temp(dir, prefix)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        OsFs.remove_file(path)
    }

    fn list_dirs(&self, path: &Path) -> io::Result<Vec<String>> {
        OsFs.list_dirs(path)
    }
}
