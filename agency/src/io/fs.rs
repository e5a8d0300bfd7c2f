//! Filesystem capability.
//!
//! The store and the run steps only touch the filesystem through [`Fs`], so
//! tests can inject faults (e.g. a failing rename) without special hooks.

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

pub trait Fs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Plain (non-atomic) write, creating or truncating `path`.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn metadata(&self, path: &Path) -> io::Result<Metadata>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Set unix permission bits. No-op where unsupported.
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Create a single directory, failing with `AlreadyExists` if present.
    fn create_dir(&self, path: &Path) -> io::Result<()>;
    /// Create `path` exclusively and write `contents`, failing with
    /// `AlreadyExists` if present. A failed write leaves no file behind.
    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    /// Create a uniquely named file in `dir` whose name starts with `prefix`.
    fn create_temp(&self, dir: &Path, prefix: &str) -> io::Result<(PathBuf, File)>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    /// Names of the subdirectories of `path`, sorted.
    fn list_dirs(&self, path: &Path) -> io::Result<Vec<String>>;

    fn exists(&self, path: &Path) -> bool {
        self.metadata(path).is_ok()
    }
}

/// [`Fs`] backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl Fs for OsFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        fs::write(path, contents)
    }

    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        fs::metadata(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    #[cfg(unix)]
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    fn set_mode(&self, _path: &Path, _mode: u32) -> io::Result<()> {
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        if let Err(e) = file.write_all(contents) {
            drop(file);
            if let Err(rm) = fs::remove_file(path) {
                warn!(path = %path.display(), err = %rm, "failed to remove partial file");
            }
            return Err(e);
        }
        Ok(())
    }

    fn create_temp(&self, dir: &Path, prefix: &str) -> io::Result<(PathBuf, File)> {
        let named = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".tmp")
            .tempfile_in(dir)?;
        let (file, path) = named.keep().map_err(|e| e.error)?;
        Ok((path, file))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn list_dirs(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}
