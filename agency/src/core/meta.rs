//! Durable run metadata (`meta.json`).
//!
//! Unknown keys are captured into `extra` maps and written back unchanged so a
//! read-modify-write never drops fields added by newer versions or by other
//! commands.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema version written to, and required on, every JSON record.
pub const SCHEMA_VERSION: &str = "1.0";

/// The durable record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub schema_version: String,
    pub run_id: String,
    pub repo_id: String,
    pub title: String,
    pub runner: String,
    pub runner_cmd: String,
    pub parent_branch: String,
    pub branch: String,
    pub worktree_path: String,
    /// RFC3339 UTC.
    pub created_at: String,
    /// Absent until the tmux step has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_session_name: Option<String>,
    #[serde(default, skip_serializing_if = "RunFlags::is_empty")]
    pub flags: RunFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verify_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Independent run flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFlags {
    #[serde(default, skip_serializing_if = "is_false")]
    pub setup_failed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub tmux_failed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub needs_attention: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub abandoned: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunFlags {
    pub fn is_empty(&self) -> bool {
        !self.setup_failed
            && !self.tmux_failed
            && !self.needs_attention
            && !self.abandoned
            && self.extra.is_empty()
    }
}

/// Outcome of the setup script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupRecord {
    pub command: String,
    /// `None` when the process was killed (timeout) or terminated by a signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub log_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}
