//! Per-repo configuration stored in `<repo_root>/agency.json`.
//!
//! Loading is two-phase: JSON Schema validation (Draft 2020-12) of the raw
//! document, then typed parsing plus semantic checks the schema cannot express.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;

use anyhow::{Context, Result};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::errors::{AgencyError, ErrorCode, err};
use crate::io::fs::Fs;

pub const CONFIG_FILE: &str = "agency.json";

const CONFIG_SCHEMA: &str = include_str!("../../schemas/agency_config.schema.json");

/// Runners agency knows how to find on `PATH` without an explicit mapping.
pub const KNOWN_RUNNERS: &[&str] = &["claude", "codex"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgencyConfig {
    pub version: u32,
    pub defaults: Defaults,
    pub scripts: Scripts,
    /// Runner name to shell command.
    #[serde(default)]
    pub runners: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    pub parent_branch: String,
    pub runner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scripts {
    pub setup: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

impl AgencyConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.version != 1 {
            return Err(format!("unsupported version {}", self.version));
        }
        if self.defaults.parent_branch.trim().is_empty() {
            return Err("defaults.parent_branch must not be blank".to_string());
        }
        if self.defaults.runner.trim().is_empty() {
            return Err("defaults.runner must not be blank".to_string());
        }
        if self.scripts.setup.trim().is_empty() {
            return Err("scripts.setup must not be blank".to_string());
        }
        if let Some((name, _)) = self.runners.iter().find(|(_, cmd)| cmd.trim().is_empty()) {
            return Err(format!("runners.{name} must not be blank"));
        }
        Ok(())
    }
}

/// Load and validate `<repo_root>/agency.json`.
///
/// Missing file is `no-agency-json`; unreadable, malformed or invalid content
/// is `invalid-agency-json`.
#[instrument(skip_all, fields(repo_root = %repo_root.display()))]
pub fn load_agency_config(fs: &dyn Fs, repo_root: &Path) -> Result<AgencyConfig> {
    let path = repo_root.join(CONFIG_FILE);
    if !fs.exists(&path) {
        return Err(err(
            ErrorCode::NoAgencyJson,
            format!("{} not found; create it before starting runs", path.display()),
        )
        .into());
    }
    let raw = fs.read(&path).map_err(|e| {
        AgencyError::new(ErrorCode::InvalidAgencyJson, format!("read {}", path.display()))
            .with_cause(e)
    })?;
    let invalid = |detail: String| {
        AgencyError::new(
            ErrorCode::InvalidAgencyJson,
            format!("{}: {detail}", path.display()),
        )
    };

    let doc: Value = serde_json::from_slice(&raw).map_err(|e| invalid(format!("parse: {e}")))?;
    let violations = schema_violations(&doc)?;
    if !violations.is_empty() {
        return Err(invalid(format!(
            "schema validation failed:\n- {}",
            violations.join("\n- ")
        ))
        .into());
    }
    let cfg: AgencyConfig =
        serde_json::from_value(doc).map_err(|e| invalid(format!("parse: {e}")))?;
    cfg.validate().map_err(invalid)?;
    debug!(runner = %cfg.defaults.runner, "loaded agency.json");
    Ok(cfg)
}

fn schema_violations(doc: &Value) -> Result<Vec<String>> {
    let schema: Value = serde_json::from_str(CONFIG_SCHEMA).context("parse config schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile config schema")?;
    Ok(compiled.iter_errors(doc).map(|e| e.to_string()).collect())
}

/// Resolve the command for runner `name`.
///
/// Explicit `runners` mapping wins; known runners fall back to a lookup on
/// `path_var` (relative entries resolve against `cwd`); anything else is
/// `runner-not-configured`.
pub fn resolve_runner_cmd(
    cfg: &AgencyConfig,
    name: &str,
    path_var: Option<&OsStr>,
    cwd: &Path,
) -> std::result::Result<String, AgencyError> {
    if let Some(cmd) = cfg.runners.get(name) {
        return Ok(cmd.clone());
    }
    if KNOWN_RUNNERS.contains(&name) {
        return match which::which_in(name, path_var, cwd) {
            Ok(found) => {
                debug!(runner = name, path = %found.display(), "runner found on PATH");
                Ok(name.to_string())
            }
            Err(e) => Err(err(
                ErrorCode::RunnerNotConfigured,
                format!("runner '{name}' not found on PATH; add runners.{name} to agency.json"),
            )
            .with_cause(e)),
        };
    }
    Err(err(
        ErrorCode::RunnerNotConfigured,
        format!("runner '{name}' has no entry in agency.json runners"),
    ))
}
