//! The six steps that take a run from nothing to a live tmux session.
//!
//! Steps communicate only through [`PipelineState`]. Each either succeeds or
//! returns an error; domain failures are [`AgencyError`]s inside the
//! `anyhow::Error` and reach the caller unchanged.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::identity::{derive_repo_identity, origin_host};
use crate::core::meta::{RunMeta, SCHEMA_VERSION, SetupRecord};
use crate::core::naming::{branch_name, default_title, tmux_session_name};
use crate::core::repo::{RepoObservation, upsert_index_entry, upsert_repo_record};
use crate::dirs::Dirs;
use crate::errors::{AgencyError, DETAIL_LOG, DETAIL_WORKTREE, ErrorCode, err};
use crate::io::config::{CONFIG_FILE, load_agency_config, resolve_runner_cmd};
use crate::io::fs::Fs;
use crate::io::git::Git;
use crate::io::lock::{LockGuard, RepoLock};
use crate::io::process::{CancelToken, CommandRunner, RunOpts};
use crate::io::store::Store;
use crate::io::tmux::Tmux;

/// Upper bound on the setup script's wall-clock time.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Directory inside each worktree reserved for agency.
pub const DOT_AGENCY: &str = ".agency";

/// What the caller asked for.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub title: Option<String>,
    /// Overrides `defaults.runner`.
    pub runner: Option<String>,
    /// Overrides `defaults.parent_branch`.
    pub parent: Option<String>,
    pub attach: bool,
    /// Any directory inside the repository.
    pub repo_path: PathBuf,
}

/// Mutable state shared by the steps of one invocation. Never persisted.
#[derive(Debug, Default)]
pub struct PipelineState {
    pub opts: RunOptions,
    pub run_id: String,

    pub repo_root: PathBuf,
    pub repo_id: String,
    pub repo_key: String,
    pub origin_url: Option<String>,
    pub github_origin: bool,
    pub data_dir: PathBuf,

    pub runner: String,
    pub runner_cmd: String,
    pub setup_script: String,
    pub parent_branch: Option<String>,
    /// Set once the parent branch has been verified to exist.
    pub parent_checked: bool,

    pub title: String,
    pub branch: String,
    pub worktree_path: Option<PathBuf>,
    pub run_dir: Option<PathBuf>,
    pub setup_log: Option<PathBuf>,
    pub tmux_session: Option<String>,

    pub warnings: Vec<String>,
    /// Repo lock, held from the repo check until the state is dropped.
    pub(crate) lock: Option<LockGuard>,
}

impl PipelineState {
    pub fn new(run_id: impl Into<String>, opts: RunOptions) -> Self {
        Self {
            run_id: run_id.into(),
            parent_branch: opts.parent.clone(),
            opts,
            ..Self::default()
        }
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.is_some()
    }

    fn worktree(&self) -> Result<&Path> {
        self.worktree_path
            .as_deref()
            .context("worktree path not set; create_worktree has not run")
    }
}

/// The fixed step sequence, as seen by the pipeline.
pub trait RunSteps {
    fn check_repo_safe(&self, st: &mut PipelineState) -> Result<()>;
    fn load_agency_config(&self, st: &mut PipelineState) -> Result<()>;
    fn create_worktree(&self, st: &mut PipelineState) -> Result<()>;
    fn write_meta(&self, st: &mut PipelineState) -> Result<()>;
    fn run_setup(&self, st: &mut PipelineState) -> Result<()>;
    fn start_tmux(&self, st: &mut PipelineState) -> Result<()>;
}

/// Structured output a setup script may leave in `.agency/out/setup.json`.
#[derive(Debug, Deserialize)]
struct SetupOutput {
    ok: bool,
    #[serde(default)]
    summary: Option<String>,
}

enum SetupOutcome {
    Succeeded,
    TimedOut,
    Failed(String),
}

/// Real step implementations over injected capabilities.
pub struct RunService<'a> {
    runner: &'a dyn CommandRunner,
    fs: &'a dyn Fs,
    dirs: &'a Dirs,
    cancel: Option<CancelToken>,
    setup_timeout: Duration,
    lock_cmd: String,
}

impl<'a> RunService<'a> {
    pub fn new(runner: &'a dyn CommandRunner, fs: &'a dyn Fs, dirs: &'a Dirs) -> Self {
        Self {
            runner,
            fs,
            dirs,
            cancel: None,
            setup_timeout: SETUP_TIMEOUT,
            lock_cmd: "agency run".to_string(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_lock_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.lock_cmd = cmd.into();
        self
    }

    fn store(&self) -> Store<'_> {
        Store::new(self.fs, &self.dirs.data_dir)
    }

    fn ensure_parent_exists(&self, git: &Git<'_>, branch: &str) -> Result<()> {
        if !git.branch_exists(branch)? {
            return Err(err(
                ErrorCode::ParentBranchMissing,
                format!("parent branch '{branch}' does not exist locally"),
            )
            .into());
        }
        Ok(())
    }

    /// Upsert `repo_index.json` and `repo.json`. Callers hold the repo lock.
    fn record_repo(&self, st: &mut PipelineState) -> Result<()> {
        let store = self.store();
        let now = now_rfc3339();

        match store.load_repo_index() {
            Ok(mut index) => {
                upsert_index_entry(&mut index, &st.repo_key, &st.repo_id, &st.repo_root, &now);
                store.save_repo_index(&index)?;
            }
            Err(e) if is_corrupt(&e) => {
                warn!(err = %e, "repo index unreadable, leaving it untouched");
                st.warnings.push(format!("repo index not updated: {e}"));
            }
            Err(e) => return Err(e),
        }

        let existing = match store.load_repo_record(&st.repo_id) {
            Ok(existing) => existing,
            Err(e) if is_corrupt(&e) => {
                warn!(err = %e, "repo record unreadable, leaving it untouched");
                st.warnings.push(format!("repo record not updated: {e}"));
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let observed = RepoObservation {
            repo_key: st.repo_key.clone(),
            repo_id: st.repo_id.clone(),
            repo_root: st.repo_root.clone(),
            agency_json_path: st.repo_root.join(CONFIG_FILE),
            origin_url: st.origin_url.clone(),
            origin_host: st.origin_url.as_deref().and_then(origin_host),
            github_origin: st.github_origin,
        };
        store.save_repo_record(&upsert_repo_record(existing.as_ref(), &observed, &now))
    }

    /// Add `.agency/` to the repository's `info/exclude` (shared by worktrees).
    fn exclude_dot_agency(&self, worktree: &Path) -> Result<()> {
        let common = Git::new(self.runner, worktree).common_dir()?;
        let info = common.join("info");
        self.fs
            .create_dir_all(&info)
            .with_context(|| format!("create {}", info.display()))?;
        let exclude = info.join("exclude");
        let current = match self.fs.read(&exclude) {
            Ok(raw) => String::from_utf8_lossy(&raw).into_owned(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("read {}", exclude.display())),
        };
        let pattern = format!("{DOT_AGENCY}/");
        if current.lines().any(|l| l.trim() == pattern) {
            return Ok(());
        }
        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&pattern);
        updated.push('\n');
        self.fs
            .write(&exclude, updated.as_bytes())
            .with_context(|| format!("write {}", exclude.display()))
    }

    fn setup_env(
        &self,
        st: &PipelineState,
        worktree: &Path,
        log_dir: &Path,
    ) -> BTreeMap<String, String> {
        let dot = worktree.join(DOT_AGENCY);
        let path = |p: &Path| p.display().to_string();
        let mut env = BTreeMap::new();
        env.insert("AGENCY_RUN_ID".to_string(), st.run_id.clone());
        env.insert("AGENCY_TITLE".to_string(), st.title.clone());
        env.insert("AGENCY_REPO_ROOT".to_string(), path(&st.repo_root));
        env.insert("AGENCY_WORKSPACE_ROOT".to_string(), path(worktree));
        env.insert("AGENCY_BRANCH".to_string(), st.branch.clone());
        env.insert(
            "AGENCY_PARENT_BRANCH".to_string(),
            st.parent_branch.clone().unwrap_or_default(),
        );
        let origin_name = if st.origin_url.is_some() { "origin" } else { "" };
        env.insert("AGENCY_ORIGIN_NAME".to_string(), origin_name.to_string());
        env.insert(
            "AGENCY_ORIGIN_URL".to_string(),
            st.origin_url.clone().unwrap_or_default(),
        );
        env.insert("AGENCY_RUNNER".to_string(), st.runner.clone());
        env.insert("AGENCY_DOTAGENCY_DIR".to_string(), path(&dot));
        env.insert("AGENCY_OUTPUT_DIR".to_string(), path(&dot.join("out")));
        env.insert("AGENCY_LOG_DIR".to_string(), path(log_dir));
        env.insert("AGENCY_NONINTERACTIVE".to_string(), "1".to_string());
        env.insert("CI".to_string(), "1".to_string());
        env
    }

    /// Malformed or absent `setup.json` yields `None`.
    fn read_setup_output(&self, worktree: &Path) -> Option<SetupOutput> {
        let path = worktree.join(DOT_AGENCY).join("out").join("setup.json");
        let raw = self.fs.read(&path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(out) => Some(out),
            Err(e) => {
                debug!(path = %path.display(), err = %e, "ignoring malformed setup output");
                None
            }
        }
    }
}

impl RunSteps for RunService<'_> {
    #[instrument(skip_all, fields(run_id = %st.run_id))]
    fn check_repo_safe(&self, st: &mut PipelineState) -> Result<()> {
        let repo_path = &st.opts.repo_path;
        if !self.fs.metadata(repo_path).is_ok_and(|m| m.is_dir()) {
            return Err(err(
                ErrorCode::RepoNotFound,
                format!("{} is not a directory", repo_path.display()),
            )
            .into());
        }
        let lookup = Git::new(self.runner, repo_path);
        let Some(root) = lookup.show_toplevel()? else {
            return Err(err(
                ErrorCode::RepoNotFound,
                format!("{} is not inside a git repository", st.opts.repo_path.display()),
            )
            .into());
        };
        let git = Git::new(self.runner, &root);
        if !git.has_commits()? {
            return Err(err(
                ErrorCode::EmptyRepo,
                "repository has no commits; make an initial commit first",
            )
            .into());
        }
        let changes = git.status_porcelain()?;
        if !changes.is_empty() {
            let listing: Vec<String> = changes
                .iter()
                .take(10)
                .map(|e| format!("{} {}", e.code, e.path))
                .collect();
            return Err(err(
                ErrorCode::DirtyParent,
                format!(
                    "working tree has {} uncommitted change(s):\n{}",
                    changes.len(),
                    listing.join("\n")
                ),
            )
            .into());
        }
        if let Some(parent) = st.parent_branch.clone() {
            self.ensure_parent_exists(&git, &parent)?;
            st.parent_checked = true;
        }

        let origin_url = git.origin_url()?;
        let identity = derive_repo_identity(&root, origin_url.as_deref().unwrap_or(""));
        st.repo_key = identity.repo_key;
        st.repo_id = identity.repo_id;
        st.github_origin = identity.github_flow_available;
        st.origin_url = origin_url;
        st.data_dir = self.dirs.data_dir.clone();
        st.repo_root = root;

        let guard = RepoLock::new(self.fs, &self.dirs.data_dir)
            .lock(&st.repo_id, &self.lock_cmd)
            .map_err(AgencyError::from)?;
        st.lock = Some(guard);
        self.record_repo(st)?;
        debug!(repo_id = %st.repo_id, repo_key = %st.repo_key, "repo checked");
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %st.run_id))]
    fn load_agency_config(&self, st: &mut PipelineState) -> Result<()> {
        let cfg = load_agency_config(self.fs, &st.repo_root)?;
        let runner = st
            .opts
            .runner
            .clone()
            .unwrap_or_else(|| cfg.defaults.runner.clone());
        st.runner_cmd = resolve_runner_cmd(
            &cfg,
            &runner,
            self.dirs.path_var.as_deref(),
            &st.repo_root,
        )?;
        st.runner = runner;
        st.setup_script = cfg.scripts.setup.clone();

        let parent = st
            .parent_branch
            .clone()
            .unwrap_or_else(|| cfg.defaults.parent_branch.clone());
        if !st.parent_checked {
            let git = Git::new(self.runner, &st.repo_root);
            self.ensure_parent_exists(&git, &parent)?;
            st.parent_checked = true;
        }
        st.parent_branch = Some(parent);
        debug!(runner = %st.runner, "config resolved");
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %st.run_id))]
    fn create_worktree(&self, st: &mut PipelineState) -> Result<()> {
        let supplied = st
            .opts
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        st.branch = branch_name(supplied.unwrap_or_default(), &st.run_id);
        st.title = supplied
            .map(str::to_string)
            .unwrap_or_else(|| default_title(&st.run_id));

        let worktree = self.dirs.worktree_path(&st.repo_id, &st.run_id);
        if let Some(parent) = worktree.parent() {
            self.fs
                .create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let base = st.parent_branch.clone().unwrap_or_default();
        Git::new(self.runner, &st.repo_root)
            .worktree_add(&st.branch, &worktree, &base)
            .map_err(|e| {
                AgencyError::new(
                    ErrorCode::WorktreeCreateFailed,
                    format!("could not create worktree for branch {}", st.branch),
                )
                .with_detail(DETAIL_WORKTREE, worktree.display().to_string())
                .with_cause(e)
            })?;
        st.worktree_path = Some(worktree.clone());

        let dot = worktree.join(DOT_AGENCY);
        for dir in [dot.join("out"), dot.join("tmp")] {
            self.fs
                .create_dir_all(&dir)
                .with_context(|| format!("create {}", dir.display()))?;
        }
        if let Err(e) = self.exclude_dot_agency(&worktree) {
            warn!(err = %e, "could not exclude .agency/");
            st.warnings
                .push(format!("could not add {DOT_AGENCY}/ to info/exclude: {e:#}"));
        }
        info!(branch = %st.branch, worktree = %worktree.display(), "worktree created");
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %st.run_id))]
    fn write_meta(&self, st: &mut PipelineState) -> Result<()> {
        let worktree = st.worktree()?.to_path_buf();
        if !self.fs.exists(&worktree) {
            return Err(AgencyError::new(
                ErrorCode::WorktreeMissing,
                format!("worktree {} does not exist", worktree.display()),
            )
            .with_detail(DETAIL_WORKTREE, worktree.display().to_string())
            .into());
        }
        let store = self.store();
        let run_dir = store.ensure_run_dir(&st.repo_id, &st.run_id)?;
        st.run_dir = Some(run_dir);

        let meta = RunMeta {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: st.run_id.clone(),
            repo_id: st.repo_id.clone(),
            title: st.title.clone(),
            runner: st.runner.clone(),
            runner_cmd: st.runner_cmd.clone(),
            parent_branch: st.parent_branch.clone().unwrap_or_default(),
            branch: st.branch.clone(),
            worktree_path: worktree.display().to_string(),
            created_at: now_rfc3339(),
            tmux_session_name: None,
            flags: Default::default(),
            setup: None,
            pr_number: None,
            pr_url: None,
            last_push_at: None,
            last_verify_at: None,
            archive: None,
            extra: Default::default(),
        };
        store.write_meta(&meta)
    }

    #[instrument(skip_all, fields(run_id = %st.run_id))]
    fn run_setup(&self, st: &mut PipelineState) -> Result<()> {
        let worktree = st.worktree()?.to_path_buf();
        let store = self.store();
        let log_path = store.log_path(&st.repo_id, &st.run_id, "setup");
        st.setup_log = Some(log_path.clone());
        let log_dir = log_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let opts = RunOpts {
            cwd: Some(worktree.clone()),
            env: self.setup_env(st, &worktree, &log_dir),
            stdin: Some(Vec::new()),
            timeout: Some(self.setup_timeout),
            output_path: Some(log_path.clone()),
            output_limit_bytes: None,
            cancel: self.cancel.clone(),
        };
        let started = Instant::now();
        let out = self
            .runner
            .run("sh", &["-lc", &st.setup_script], &opts)
            .with_context(|| format!("spawn setup script '{}'", st.setup_script))?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if out.canceled {
            warn!("setup canceled");
            return Err(AgencyError::new(ErrorCode::Canceled, "setup script canceled")
                .with_detail(DETAIL_LOG, log_path.display().to_string())
                .into());
        }

        let output = self.read_setup_output(&worktree);
        let outcome = if out.timed_out {
            SetupOutcome::TimedOut
        } else if out.exit_code != Some(0) {
            SetupOutcome::Failed(match out.exit_code {
                Some(code) => format!("setup script exited with code {code}"),
                None => "setup script was terminated by a signal".to_string(),
            })
        } else if let Some(SetupOutput { ok: false, summary, .. }) = &output {
            SetupOutcome::Failed(format!(
                "setup script reported ok=false{}",
                summary.as_deref().map(|s| format!(": {s}")).unwrap_or_default()
            ))
        } else {
            SetupOutcome::Succeeded
        };

        let record = SetupRecord {
            command: st.setup_script.clone(),
            exit_code: out.exit_code,
            duration_ms,
            timed_out: out.timed_out,
            log_path: log_path.display().to_string(),
            output_ok: output.as_ref().map(|o| o.ok),
            output_summary: output.and_then(|o| o.summary),
        };
        let failed = !matches!(outcome, SetupOutcome::Succeeded);
        store.update_meta(&st.repo_id, &st.run_id, |meta| {
            meta.setup = Some(record);
            if failed {
                meta.flags.setup_failed = true;
            }
        })?;

        let with_evidence = |e: AgencyError| {
            e.with_detail(DETAIL_LOG, log_path.display().to_string())
                .with_detail(DETAIL_WORKTREE, worktree.display().to_string())
        };
        match outcome {
            SetupOutcome::Succeeded => {
                info!(duration_ms, "setup succeeded");
                Ok(())
            }
            SetupOutcome::TimedOut => {
                warn!(timeout_secs = self.setup_timeout.as_secs(), "setup timed out");
                Err(with_evidence(AgencyError::new(
                    ErrorCode::ScriptTimeout,
                    format!(
                        "setup script timed out after {}s",
                        self.setup_timeout.as_secs()
                    ),
                ))
                .into())
            }
            SetupOutcome::Failed(reason) => {
                warn!(%reason, "setup failed");
                Err(with_evidence(AgencyError::new(ErrorCode::ScriptFailed, reason)).into())
            }
        }
    }

    #[instrument(skip_all, fields(run_id = %st.run_id))]
    fn start_tmux(&self, st: &mut PipelineState) -> Result<()> {
        let worktree = st.worktree()?.to_path_buf();
        let name = tmux_session_name(&st.run_id);
        let tmux = Tmux::new(self.runner);
        let started = match tmux.has_session(&name) {
            Ok(true) => {
                return Err(err(
                    ErrorCode::TmuxSessionExists,
                    format!("tmux session {name} already exists"),
                )
                .into());
            }
            Ok(false) => tmux.new_session(&name, &worktree, &st.runner_cmd),
            Err(e) => Err(e),
        };

        let store = self.store();
        if let Err(e) = started {
            store.update_meta(&st.repo_id, &st.run_id, |meta| {
                meta.flags.tmux_failed = true;
            })?;
            return Err(AgencyError::new(
                ErrorCode::TmuxFailed,
                format!("could not start tmux session {name}"),
            )
            .with_detail(DETAIL_WORKTREE, worktree.display().to_string())
            .with_cause(e)
            .into());
        }

        store.update_meta(&st.repo_id, &st.run_id, |meta| {
            meta.tmux_session_name = Some(name.clone());
        })?;
        info!(session = %name, "tmux session started");
        st.tmux_session = Some(name);
        Ok(())
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn is_corrupt(e: &anyhow::Error) -> bool {
    e.downcast_ref::<AgencyError>()
        .is_some_and(|d| d.code() == ErrorCode::StoreCorrupt)
}
