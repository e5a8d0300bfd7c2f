//! Invocation-scoped directory and environment configuration.
//!
//! Everything the core would otherwise look up ambiently (data directory,
//! `PATH`) is resolved once here and threaded through explicitly.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "AGENCY_DATA_DIR";

/// Resolved per-invocation configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirs {
    /// Root for `repo_index.json` and `repos/`.
    pub data_dir: PathBuf,
    /// Value of `PATH` used for runner lookup.
    pub path_var: Option<OsString>,
}

impl Dirs {
    pub fn new(data_dir: impl Into<PathBuf>, path_var: Option<OsString>) -> Self {
        Self {
            data_dir: data_dir.into(),
            path_var,
        }
    }

    /// Resolve from the process environment.
    ///
    /// Precedence: `AGENCY_DATA_DIR` > `$XDG_DATA_HOME/agency` >
    /// `$HOME/.local/share/agency`. The result is always absolute.
    pub fn from_env() -> Result<Self> {
        let lookup = |key: &str| std::env::var_os(key).filter(|v| !v.is_empty());
        let cwd = std::env::current_dir().context("resolve current directory")?;
        let data_dir = resolve_data_dir(
            lookup(DATA_DIR_ENV),
            lookup("XDG_DATA_HOME"),
            lookup("HOME"),
            &cwd,
        )?;
        Ok(Self::new(data_dir, lookup("PATH")))
    }

    fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }

    fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.repos_dir().join(repo_id)
    }

    pub fn worktree_path(&self, repo_id: &str, run_id: &str) -> PathBuf {
        self.repo_dir(repo_id).join("worktrees").join(run_id)
    }
}

fn resolve_data_dir(
    explicit: Option<OsString>,
    xdg_data_home: Option<OsString>,
    home: Option<OsString>,
    cwd: &Path,
) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(cwd.join(dir));
    }
    // Relative XDG_DATA_HOME values are invalid and must be ignored.
    if let Some(xdg) = xdg_data_home.map(PathBuf::from).filter(|p| p.is_absolute()) {
        return Ok(xdg.join("agency"));
    }
    let home = home.ok_or_else(|| {
        anyhow!("cannot resolve data dir: set {DATA_DIR_ENV}, XDG_DATA_HOME or HOME")
    })?;
    Ok(cwd.join(home).join(".local/share/agency"))
}
