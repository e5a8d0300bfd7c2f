//! Read side for `ls` and `show`: runs from the store plus live snapshots.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::meta::RunMeta;
use crate::core::resolver::resolve_run_id;
use crate::core::status::{Snapshot, Status, derive_status};
use crate::dirs::Dirs;
use crate::errors::AgencyError;
use crate::io::fs::Fs;
use crate::io::process::CommandRunner;
use crate::io::store::{RunEntry, Store};
use crate::io::tmux::Tmux;
use crate::service::DOT_AGENCY;

/// One run as rendered by the listing commands.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub repo_id: String,
    pub run_id: String,
    pub status: Status,
    pub status_label: String,
    pub archived: bool,
    pub tmux_active: bool,
    pub worktree_path: PathBuf,
    pub report_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<RunMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunView {
    pub fn title(&self) -> &str {
        self.meta.as_ref().map_or("", |m| m.title.as_str())
    }
}

/// Lists runs across every repo in the data directory.
pub struct Runs<'a> {
    fs: &'a dyn Fs,
    runner: &'a dyn CommandRunner,
    dirs: &'a Dirs,
}

impl<'a> Runs<'a> {
    pub fn new(fs: &'a dyn Fs, runner: &'a dyn CommandRunner, dirs: &'a Dirs) -> Self {
        Self { fs, runner, dirs }
    }

    /// Every run, newest first.
    pub fn list(&self) -> Result<Vec<RunView>> {
        let entries = Store::new(self.fs, &self.dirs.data_dir).scan_runs()?;
        let sessions = self.live_sessions();
        let mut views: Vec<RunView> = entries
            .into_iter()
            .map(|entry| self.view(entry, &sessions))
            .collect();
        views.sort_by(|a, b| {
            b.run_id
                .cmp(&a.run_id)
                .then_with(|| a.repo_id.cmp(&b.repo_id))
        });
        Ok(views)
    }

    /// Resolve an exact id or unique prefix. Broken runs are resolvable too.
    pub fn find(&self, input: &str) -> Result<RunView> {
        let entries = Store::new(self.fs, &self.dirs.data_dir).scan_runs()?;
        let refs: Vec<_> = entries.iter().map(RunEntry::run_ref).collect();
        let found = resolve_run_id(input, &refs).map_err(AgencyError::from)?;
        let entry = entries
            .into_iter()
            .find(|e| e.repo_id == found.repo_id && e.run_id == found.run_id)
            .ok_or_else(|| anyhow::anyhow!("resolved run {} vanished", found.run_id))?;
        Ok(self.view(entry, &self.live_sessions()))
    }

    fn live_sessions(&self) -> BTreeSet<String> {
        match Tmux::new(self.runner).list_sessions() {
            Ok(sessions) => sessions.into_iter().collect(),
            Err(e) => {
                warn!(err = %e, "could not list tmux sessions");
                BTreeSet::new()
            }
        }
    }

    fn view(&self, entry: RunEntry, sessions: &BTreeSet<String>) -> RunView {
        let worktree_path = entry.meta.as_ref().map_or_else(
            || self.dirs.worktree_path(&entry.repo_id, &entry.run_id),
            |m| PathBuf::from(&m.worktree_path),
        );
        let report = worktree_path.join(DOT_AGENCY).join("report.md");
        let snapshot = Snapshot {
            tmux_active: entry
                .meta
                .as_ref()
                .and_then(|m| m.tmux_session_name.as_ref())
                .is_some_and(|name| sessions.contains(name)),
            worktree_present: self
                .fs
                .metadata(&worktree_path)
                .is_ok_and(|m| m.is_dir()),
            report_bytes: self.fs.metadata(&report).map_or(0, |m| m.len()),
        };
        let derived = derive_status(entry.meta.as_ref(), &snapshot);
        debug!(run_id = %entry.run_id, status = derived.status.label(), "derived status");
        RunView {
            repo_id: entry.repo_id,
            run_id: entry.run_id,
            status: derived.status,
            status_label: derived.display_label(),
            archived: derived.archived,
            tmux_active: snapshot.tmux_active,
            worktree_path,
            report_bytes: snapshot.report_bytes,
            meta: entry.meta,
            error: entry.error,
        }
    }
}
