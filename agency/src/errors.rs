//! Domain error type shared by every agency component.
//!
//! Every failure the CLI can report carries a stable [`ErrorCode`] drawn from a
//! closed set, a human message, an optional cause, and optional structured
//! details (the failing step, evidence paths). Layers pass an [`AgencyError`]
//! through unchanged; foreign errors are wrapped exactly once, by the pipeline,
//! into [`ErrorCode::Internal`].

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Detail key naming the pipeline step an error originated in.
pub const DETAIL_STEP: &str = "step";
/// Detail key for the run's worktree path.
pub const DETAIL_WORKTREE: &str = "worktree_path";
/// Detail key for a log file relevant to the failure.
pub const DETAIL_LOG: &str = "log_path";

/// Closed taxonomy of error codes. The string forms are a stable contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    RepoNotFound,
    EmptyRepo,
    DirtyParent,
    ParentBranchMissing,
    NoAgencyJson,
    InvalidAgencyJson,
    RunnerNotConfigured,
    WorktreeCreateFailed,
    WorktreeMissing,
    RunDirCollision,
    MetaWriteFailed,
    RunNotFound,
    StoreCorrupt,
    ScriptTimeout,
    ScriptFailed,
    Canceled,
    TmuxFailed,
    TmuxSessionExists,
    SessionMissing,
    LockHeld,
    RunIdAmbiguous,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RepoNotFound => "repo-not-found",
            ErrorCode::EmptyRepo => "empty-repo",
            ErrorCode::DirtyParent => "dirty-parent",
            ErrorCode::ParentBranchMissing => "parent-branch-missing",
            ErrorCode::NoAgencyJson => "no-agency-json",
            ErrorCode::InvalidAgencyJson => "invalid-agency-json",
            ErrorCode::RunnerNotConfigured => "runner-not-configured",
            ErrorCode::WorktreeCreateFailed => "worktree-create-failed",
            ErrorCode::WorktreeMissing => "worktree-missing",
            ErrorCode::RunDirCollision => "run-dir-collision",
            ErrorCode::MetaWriteFailed => "meta-write-failed",
            ErrorCode::RunNotFound => "run-not-found",
            ErrorCode::StoreCorrupt => "store-corrupt",
            ErrorCode::ScriptTimeout => "script-timeout",
            ErrorCode::ScriptFailed => "script-failed",
            ErrorCode::Canceled => "canceled",
            ErrorCode::TmuxFailed => "tmux-failed",
            ErrorCode::TmuxSessionExists => "tmux-session-exists",
            ErrorCode::SessionMissing => "session-missing",
            ErrorCode::LockHeld => "lock-held",
            ErrorCode::RunIdAmbiguous => "run-id-ambiguous",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain error: stable code, message, optional cause and details.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct AgencyError {
    code: ErrorCode,
    message: String,
    #[source]
    cause: Option<anyhow::Error>,
    details: BTreeMap<String, String>,
}

impl AgencyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            details: BTreeMap::new(),
        }
    }

    /// Wrap a foreign error raised while executing `step`.
    pub fn internal(step: &str, cause: anyhow::Error) -> Self {
        Self::new(ErrorCode::Internal, format!("{step} failed: {cause:#}"))
            .with_detail(DETAIL_STEP, step)
            .with_cause(cause)
    }

    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_ref()
    }

    pub fn details(&self) -> &BTreeMap<String, String> {
        &self.details
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }
}

/// Shorthand for building an [`AgencyError`] inside `Err(...)`.
pub fn err(code: ErrorCode, message: impl Into<String>) -> AgencyError {
    AgencyError::new(code, message)
}
