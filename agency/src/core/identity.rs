//! Stable repository identity.
//!
//! The repo key and repo id namespace every on-disk record, so the hashing and
//! truncation rules here are a hard compatibility contract: changing them
//! orphans all existing state.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Number of hex characters kept from `sha256(repo_key)` for the repo id.
pub const REPO_ID_LEN: usize = 16;

static SCP_GITHUB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s/:]+@github\.com:([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+)$")
        .expect("scp github regex")
});

static HTTPS_GITHUB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://github\.com/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)/?$")
        .expect("https github regex")
});

/// Logical identity of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoIdentity {
    /// `github:<owner>/<repo>` or `path:<sha256 hex of the repo root>`.
    pub repo_key: String,
    /// First [`REPO_ID_LEN`] hex characters of `sha256(repo_key)`.
    pub repo_id: String,
    /// True when the origin is a GitHub remote.
    pub github_flow_available: bool,
}

/// Derive the identity for a repository root and its (possibly empty) origin URL.
pub fn derive_repo_identity(abs_repo_root: &Path, origin_url: &str) -> RepoIdentity {
    let (repo_key, github_flow_available) = match parse_github_remote(origin_url) {
        Some((owner, repo)) => (format!("github:{owner}/{repo}"), true),
        None => (
            format!(
                "path:{}",
                sha256_hex(abs_repo_root.as_os_str().as_encoded_bytes())
            ),
            false,
        ),
    };
    let repo_id = repo_id_for_key(&repo_key);
    RepoIdentity {
        repo_key,
        repo_id,
        github_flow_available,
    }
}

pub fn repo_id_for_key(repo_key: &str) -> String {
    let mut digest = sha256_hex(repo_key.as_bytes());
    digest.truncate(REPO_ID_LEN);
    digest
}

/// Parse `user@github.com:owner/repo[.git]` or `https://github.com/owner/repo[.git]`.
pub fn parse_github_remote(url: &str) -> Option<(String, String)> {
    let url = url.trim();
    let caps = SCP_GITHUB
        .captures(url)
        .or_else(|| HTTPS_GITHUB.captures(url))?;
    let owner = caps.get(1)?.as_str();
    let repo = caps.get(2)?.as_str();
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

/// Host component of an scp-like or URL-style remote.
pub fn origin_host(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    let host = if let Some((_, rest)) = url.split_once("://") {
        let authority = rest.split('/').next().unwrap_or_default();
        let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
        authority.split(':').next().unwrap_or_default()
    } else {
        let (before_colon, _) = url.split_once(':')?;
        before_colon.rsplit_once('@').map_or(before_colon, |(_, h)| h)
    };
    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some(host.to_lowercase())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
