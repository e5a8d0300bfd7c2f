//! tmux adapter.
//!
//! Sessions are addressed with the `=name` target form so a session name is
//! never matched as a prefix of another.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::process::{CmdOutput, CommandRunner, RunOpts};

#[derive(Clone, Copy)]
pub struct Tmux<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Tmux<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    pub fn has_session(&self, name: &str) -> Result<bool> {
        let target = format!("={name}");
        let out = self.run(&["has-session", "-t", &target])?;
        Ok(out.success())
    }

    /// Start a detached session named `name` running `command` in `cwd`.
    #[instrument(skip_all, fields(session = name))]
    pub fn new_session(&self, name: &str, cwd: &Path, command: &str) -> Result<()> {
        let cwd_arg = cwd.to_string_lossy();
        let out = self.run(&["new-session", "-d", "-s", name, "-c", &cwd_arg, command])?;
        if !out.success() {
            return Err(anyhow!(
                "tmux new-session failed (exit {:?}): {}",
                out.exit_code,
                out.stderr_text().trim()
            ));
        }
        debug!("tmux session started");
        Ok(())
    }

    /// Names of all sessions on the default server. No server means no sessions.
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        let out = self.run(&["list-sessions", "-F", "#{session_name}"])?;
        if !out.success() {
            debug!(stderr = %out.stderr_text().trim(), "no tmux server");
            return Ok(Vec::new());
        }
        Ok(out
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn run(&self, args: &[&str]) -> Result<CmdOutput> {
        self.runner
            .run("tmux", args, &RunOpts::default())
            .with_context(|| format!("spawn tmux {}", args.first().copied().unwrap_or_default()))
    }
}
