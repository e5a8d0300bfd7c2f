//! Repository records (`repo.json`) and the repo index (`repo_index.json`).

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::meta::SCHEMA_VERSION;

/// One record per repository identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRecord {
    pub schema_version: String,
    pub repo_key: String,
    pub repo_id: String,
    pub repo_root_last_seen: String,
    pub agency_json_path: String,
    pub origin_present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_host: Option<String>,
    pub capabilities: RepoCapabilities,
    /// Set on first sight, never changed afterwards.
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCapabilities {
    pub github_origin: bool,
}

/// What was observed about a repository during this invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoObservation {
    pub repo_key: String,
    pub repo_id: String,
    pub repo_root: PathBuf,
    pub agency_json_path: PathBuf,
    pub origin_url: Option<String>,
    pub origin_host: Option<String>,
    pub github_origin: bool,
}

/// Build the record to persist, keeping `created_at` from `existing` if any.
pub fn upsert_repo_record(
    existing: Option<&RepoRecord>,
    observed: &RepoObservation,
    now: &str,
) -> RepoRecord {
    let created_at = existing
        .map(|r| r.created_at.clone())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| now.to_string());
    RepoRecord {
        schema_version: SCHEMA_VERSION.to_string(),
        repo_key: observed.repo_key.clone(),
        repo_id: observed.repo_id.clone(),
        repo_root_last_seen: observed.repo_root.display().to_string(),
        agency_json_path: observed.agency_json_path.display().to_string(),
        origin_present: observed.origin_url.is_some(),
        origin_url: observed.origin_url.clone(),
        origin_host: observed.origin_host.clone(),
        capabilities: RepoCapabilities {
            github_origin: observed.github_origin,
        },
        created_at,
        updated_at: now.to_string(),
    }
}

/// Map of repo key to the local clones seen for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIndex {
    pub schema_version: String,
    #[serde(default)]
    pub repos: BTreeMap<String, RepoIndexEntry>,
}

impl Default for RepoIndex {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            repos: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIndexEntry {
    pub repo_id: String,
    /// Most recently seen first, no duplicates.
    pub paths: Vec<String>,
    pub last_seen_at: String,
}

/// Record that `path` was seen for `repo_key`, moving it to the front.
pub fn upsert_index_entry(
    index: &mut RepoIndex,
    repo_key: &str,
    repo_id: &str,
    path: &Path,
    now: &str,
) {
    let normalized = clean_path(path).display().to_string();
    let entry = index
        .repos
        .entry(repo_key.to_string())
        .or_insert_with(|| RepoIndexEntry {
            repo_id: repo_id.to_string(),
            paths: Vec::new(),
            last_seen_at: now.to_string(),
        });
    entry.repo_id = repo_id.to_string();
    entry.paths.retain(|p| *p != normalized);
    entry.paths.insert(0, normalized);
    entry.last_seen_at = now.to_string();
}

/// Lexically normalize a path: drop `.`, resolve `..`, strip trailing separators.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir | Component::Prefix(_))
                );
                let last_is_parent =
                    matches!(out.components().next_back(), Some(Component::ParentDir));
                if at_root && out.has_root() {
                    continue;
                }
                if at_root || last_is_parent {
                    out.push("..");
                } else {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
