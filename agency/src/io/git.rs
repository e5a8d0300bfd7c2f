//! Git adapter.
//!
//! Every call goes through the injected [`CommandRunner`] so pipeline tests can
//! observe or script git without a real binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CmdOutput, CommandRunner, RunOpts};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Clone, Copy)]
pub struct Git<'a> {
    runner: &'a dyn CommandRunner,
    workdir: &'a Path,
}

impl<'a> Git<'a> {
    pub fn new(runner: &'a dyn CommandRunner, workdir: &'a Path) -> Self {
        Self { runner, workdir }
    }

    /// Absolute top-level directory, or `None` when `workdir` is not inside a
    /// work tree.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn show_toplevel(&self) -> Result<Option<PathBuf>> {
        let out = self.run(&["rev-parse", "--show-toplevel"])?;
        if !out.success() {
            debug!(stderr = %out.stderr_text().trim(), "not a git work tree");
            return Ok(None);
        }
        let top = out.stdout_text().trim().to_string();
        if top.is_empty() {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(top)))
    }

    /// True once `HEAD` resolves to a commit.
    pub fn has_commits(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        Ok(out.success())
    }

    /// `remote.origin.url`, or `None` when no origin is configured.
    pub fn origin_url(&self) -> Result<Option<String>> {
        let out = self.run(&["config", "--get", "remote.origin.url"])?;
        match out.exit_code {
            Some(0) => {
                let url = out.stdout_text().trim().to_string();
                Ok((!url.is_empty()).then_some(url))
            }
            // git config exits 1 when the key is unset.
            Some(1) => Ok(None),
            _ => Err(anyhow!(
                "git config --get remote.origin.url failed: {}",
                out.stderr_text().trim()
            )),
        }
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        if !entries.is_empty() {
            warn!(changed = entries.len(), "working tree not clean");
        }
        Ok(entries)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{branch}");
        let out = self.run(&["show-ref", "--verify", "--quiet", &refname])?;
        Ok(out.success())
    }

    /// `git worktree add -b <branch> <path> <base>`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add(&self, branch: &str, path: &Path, base: &str) -> Result<()> {
        let path_arg = path.to_string_lossy();
        debug!(base, "adding worktree");
        self.run_checked(&["worktree", "add", "-b", branch, &path_arg, base])?;
        Ok(())
    }

    /// The shared `.git` directory (same for every linked worktree).
    pub fn common_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--git-common-dir"])?;
        let dir = PathBuf::from(out.trim());
        if dir.is_absolute() {
            Ok(dir)
        } else {
            Ok(self.workdir.join(dir))
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_text())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CmdOutput> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_text().trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CmdOutput> {
        self.runner
            .run("git", args, &RunOpts::in_dir(self.workdir))
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
