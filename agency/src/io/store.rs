//! On-disk store for run meta, repo records and the repo index.
//!
//! Layout under the data directory:
//!
//! ```text
//! repo_index.json
//! repos/<repo_id>/repo.json
//! repos/<repo_id>/runs/<run_id>/meta.json
//! repos/<repo_id>/runs/<run_id>/logs/<name>.log
//! ```
//!
//! All JSON is written through [`write_json_atomic`]. Domain failures surface
//! as [`AgencyError`] inside the returned `anyhow::Error`.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::meta::{RunMeta, SCHEMA_VERSION};
use crate::core::repo::{RepoIndex, RepoRecord};
use crate::core::resolver::RunRef;
use crate::errors::{AgencyError, ErrorCode, err};
use crate::io::atomic::write_json_atomic;
use crate::io::fs::Fs;

pub const REPO_INDEX_FILE: &str = "repo_index.json";
pub const REPO_RECORD_FILE: &str = "repo.json";
pub const META_FILE: &str = "meta.json";

/// A run directory found by [`Store::scan_runs`].
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub repo_id: String,
    pub run_id: String,
    /// `None` when the meta is missing or invalid; see `error`.
    pub meta: Option<RunMeta>,
    pub error: Option<String>,
}

impl RunEntry {
    pub fn is_broken(&self) -> bool {
        self.meta.is_none()
    }

    pub fn run_ref(&self) -> RunRef {
        RunRef {
            repo_id: self.repo_id.clone(),
            run_id: self.run_id.clone(),
            broken: self.is_broken(),
        }
    }
}

#[derive(Clone, Copy)]
pub struct Store<'a> {
    fs: &'a dyn Fs,
    data_dir: &'a Path,
}

impl<'a> Store<'a> {
    pub fn new(fs: &'a dyn Fs, data_dir: &'a Path) -> Self {
        Self { fs, data_dir }
    }

    pub fn repo_index_path(&self) -> PathBuf {
        self.data_dir.join(REPO_INDEX_FILE)
    }

    pub fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.data_dir.join("repos").join(repo_id)
    }

    pub fn repo_record_path(&self, repo_id: &str) -> PathBuf {
        self.repo_dir(repo_id).join(REPO_RECORD_FILE)
    }

    pub fn run_dir(&self, repo_id: &str, run_id: &str) -> PathBuf {
        self.repo_dir(repo_id).join("runs").join(run_id)
    }

    pub fn meta_path(&self, repo_id: &str, run_id: &str) -> PathBuf {
        self.run_dir(repo_id, run_id).join(META_FILE)
    }

    /// `logs/<name>.log` inside the run directory.
    pub fn log_path(&self, repo_id: &str, run_id: &str, name: &str) -> PathBuf {
        self.run_dir(repo_id, run_id)
            .join("logs")
            .join(format!("{name}.log"))
    }

    /// Create `runs/<run_id>/` exclusively, plus `logs/`.
    ///
    /// A pre-existing run directory is `run-dir-collision`, never merged into.
    #[instrument(skip(self))]
    pub fn ensure_run_dir(&self, repo_id: &str, run_id: &str) -> Result<PathBuf> {
        let run_dir = self.run_dir(repo_id, run_id);
        if let Some(runs) = run_dir.parent() {
            self.fs
                .create_dir_all(runs)
                .with_context(|| format!("create {}", runs.display()))?;
        }
        match self.fs.create_dir(&run_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(AgencyError::new(
                    ErrorCode::RunDirCollision,
                    format!("run directory already exists: {}", run_dir.display()),
                )
                .into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("create {}", run_dir.display()));
            }
        }
        let logs = run_dir.join("logs");
        self.fs
            .create_dir(&logs)
            .with_context(|| format!("create {}", logs.display()))?;
        debug!(run_dir = %run_dir.display(), "run directory created");
        Ok(run_dir)
    }

    pub fn write_meta(&self, meta: &RunMeta) -> Result<()> {
        let path = self.meta_path(&meta.repo_id, &meta.run_id);
        write_json_atomic(self.fs, &path, meta).map_err(|e| {
            AgencyError::new(
                ErrorCode::MetaWriteFailed,
                format!("failed to write {}", path.display()),
            )
            .with_cause(e)
            .into()
        })
    }

    /// Read a run's meta. Absent is `run-not-found`; unparseable or an
    /// unsupported schema version is `store-corrupt`.
    pub fn read_meta(&self, repo_id: &str, run_id: &str) -> Result<RunMeta> {
        let path = self.meta_path(repo_id, run_id);
        match self.read_versioned(&path)? {
            Some(meta) => Ok(meta),
            None => Err(err(
                ErrorCode::RunNotFound,
                format!("run {run_id} not found (no {})", path.display()),
            )
            .into()),
        }
    }

    /// Read-modify-write of a run's meta. Unknown fields are preserved.
    #[instrument(skip(self, mutate))]
    pub fn update_meta(
        &self,
        repo_id: &str,
        run_id: &str,
        mutate: impl FnOnce(&mut RunMeta),
    ) -> Result<RunMeta> {
        let mut meta = self.read_meta(repo_id, run_id)?;
        mutate(&mut meta);
        self.write_meta(&meta)?;
        Ok(meta)
    }

    /// Missing index reads as empty.
    pub fn load_repo_index(&self) -> Result<RepoIndex> {
        Ok(self
            .read_versioned(&self.repo_index_path())?
            .unwrap_or_default())
    }

    pub fn save_repo_index(&self, index: &RepoIndex) -> Result<()> {
        let path = self.repo_index_path();
        if let Some(dir) = path.parent() {
            self.fs
                .create_dir_all(dir)
                .with_context(|| format!("create {}", dir.display()))?;
        }
        write_json_atomic(self.fs, &path, index)
    }

    pub fn load_repo_record(&self, repo_id: &str) -> Result<Option<RepoRecord>> {
        self.read_versioned(&self.repo_record_path(repo_id))
    }

    pub fn save_repo_record(&self, record: &RepoRecord) -> Result<()> {
        let dir = self.repo_dir(&record.repo_id);
        self.fs
            .create_dir_all(&dir)
            .with_context(|| format!("create {}", dir.display()))?;
        write_json_atomic(self.fs, &self.repo_record_path(&record.repo_id), record)
    }

    /// Every `repos/*/runs/*` directory, sorted by repo id then run id.
    pub fn scan_runs(&self) -> Result<Vec<RunEntry>> {
        let mut entries = Vec::new();
        for repo_id in self.list_dirs_or_empty(&self.data_dir.join("repos"))? {
            let runs_dir = self.repo_dir(&repo_id).join("runs");
            for run_id in self.list_dirs_or_empty(&runs_dir)? {
                let (meta, error) = match self.read_meta(&repo_id, &run_id) {
                    Ok(meta) => (Some(meta), None),
                    Err(e) => {
                        warn!(repo_id, run_id, err = %e, "broken run");
                        (None, Some(e.to_string()))
                    }
                };
                entries.push(RunEntry {
                    repo_id: repo_id.clone(),
                    run_id,
                    meta,
                    error,
                });
            }
        }
        Ok(entries)
    }

    fn list_dirs_or_empty(&self, dir: &Path) -> Result<Vec<String>> {
        match self.fs.list_dirs(dir) {
            Ok(names) => Ok(names),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("list {}", dir.display())),
        }
    }

    /// `Ok(None)` when absent. Records must carry a supported `schema_version`.
    fn read_versioned<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let raw = match self.fs.read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let corrupt = |detail: String| -> anyhow::Error {
            AgencyError::new(
                ErrorCode::StoreCorrupt,
                format!("{}: {detail}", path.display()),
            )
            .into()
        };
        let value: Value =
            serde_json::from_slice(&raw).map_err(|e| corrupt(format!("invalid json: {e}")))?;
        match value.get("schema_version").and_then(Value::as_str) {
            Some(v) if is_supported_version(v) => {}
            Some(v) => return Err(corrupt(format!("unsupported schema_version {v:?}"))),
            None => return Err(corrupt("missing schema_version".to_string())),
        }
        let parsed = serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
        Ok(Some(parsed))
    }
}

/// Same major version as [`SCHEMA_VERSION`].
fn is_supported_version(version: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(str::to_owned);
    major(version).is_some_and(|m| Some(m) == major(SCHEMA_VERSION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fs::OsFs;
    use crate::test_support::{FaultyFs, sample_meta};

    fn code_of(e: anyhow::Error) -> ErrorCode {
        e.downcast::<AgencyError>().expect("domain error").code()
    }

    #[test]
    fn run_dir_creation_is_exclusive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Store::new(&OsFs, temp.path());
        let dir = store.ensure_run_dir("r1", "20260110120000-a3f2").expect("create");
        assert!(dir.join("logs").is_dir());

        let e = store
            .ensure_run_dir("r1", "20260110120000-a3f2")
            .expect_err("collision");
        assert_eq!(code_of(e), ErrorCode::RunDirCollision);
    }

    #[test]
    fn run_dir_io_failure_is_not_a_collision() {
        let temp = tempfile::tempdir().expect("tempdir");
        let faulty = FaultyFs {
            fail_create_dir: true,
            ..FaultyFs::default()
        };
        let e = Store::new(&faulty, temp.path())
            .ensure_run_dir("r1", "20260110120000-a3f2")
            .expect_err("create_dir fails");
        assert!(e.downcast_ref::<AgencyError>().is_none());
        assert!(format!("{e:#}").contains("injected create_dir failure"));
    }

    #[test]
    fn read_meta_reports_missing_and_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Store::new(&OsFs, temp.path());
        assert_eq!(
            code_of(store.read_meta("r1", "nope").expect_err("missing")),
            ErrorCode::RunNotFound
        );

        store.ensure_run_dir("r1", "bad").expect("dir");
        std::fs::write(store.meta_path("r1", "bad"), "{ truncated").expect("write");
        assert_eq!(
            code_of(store.read_meta("r1", "bad").expect_err("corrupt")),
            ErrorCode::StoreCorrupt
        );

        let mut value = serde_json::to_value(sample_meta("bad")).expect("value");
        value["schema_version"] = "2.0".into();
        std::fs::write(store.meta_path("r1", "bad"), value.to_string()).expect("write");
        assert_eq!(
            code_of(store.read_meta("r1", "bad").expect_err("version")),
            ErrorCode::StoreCorrupt
        );
    }

    #[test]
    fn update_meta_preserves_unknown_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Store::new(&OsFs, temp.path());
        let meta = sample_meta("20260110120000-a3f2");
        store.ensure_run_dir(&meta.repo_id, &meta.run_id).expect("dir");

        let mut value = serde_json::to_value(&meta).expect("value");
        value["pushed_by"] = "someone-else".into();
        let path = store.meta_path(&meta.repo_id, &meta.run_id);
        std::fs::write(&path, serde_json::to_string_pretty(&value).expect("json")).expect("write");

        store
            .update_meta(&meta.repo_id, &meta.run_id, |m| m.flags.needs_attention = true)
            .expect("update");

        let raw: Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("parse");
        assert_eq!(raw["pushed_by"], "someone-else");
        assert_eq!(raw["flags"]["needs_attention"], true);
        assert_eq!(raw["title"], meta.title);
    }

    #[test]
    fn failed_meta_write_keeps_previous_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let meta = sample_meta("20260110120000-a3f2");
        Store::new(&OsFs, temp.path())
            .ensure_run_dir(&meta.repo_id, &meta.run_id)
            .expect("dir");
        Store::new(&OsFs, temp.path()).write_meta(&meta).expect("write");

        let faulty = FaultyFs {
            fail_rename: true,
            ..FaultyFs::default()
        };
        let store = Store::new(&faulty, temp.path());
        let e = store
            .update_meta(&meta.repo_id, &meta.run_id, |m| m.title = "changed".to_string())
            .expect_err("rename fails");
        assert_eq!(code_of(e), ErrorCode::MetaWriteFailed);

        let back = Store::new(&OsFs, temp.path())
            .read_meta(&meta.repo_id, &meta.run_id)
            .expect("read");
        assert_eq!(back.title, meta.title);
    }

    #[test]
    fn missing_index_loads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let index = Store::new(&OsFs, temp.path())
            .load_repo_index()
            .expect("load");
        assert!(index.repos.is_empty());
        assert_eq!(index.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn scan_marks_runs_without_meta_broken() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Store::new(&OsFs, temp.path());
        let meta = sample_meta("20260110120000-a3f2");
        store.ensure_run_dir(&meta.repo_id, &meta.run_id).expect("dir");
        store.write_meta(&meta).expect("write");
        store.ensure_run_dir(&meta.repo_id, "20260110130000-0000").expect("dir");

        let entries = store.scan_runs().expect("scan");
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].is_broken());
        assert!(entries[1].is_broken());
        assert!(entries[1].run_ref().broken);
        assert!(entries[1].error.as_deref().is_some_and(|e| e.contains("run-not-found")));
    }

    #[test]
    fn scan_of_empty_data_dir_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(
            Store::new(&OsFs, temp.path())
                .scan_runs()
                .expect("scan")
                .is_empty()
        );
    }
}
