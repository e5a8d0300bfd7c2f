//! Crash-safe file replacement (temp file + fsync + rename).
//!
//! Readers never observe a partially written file: the target is either the
//! old contents or the new ones. On any failure before the rename the temp
//! file is removed and the target is untouched.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::io::fs::Fs;

/// Permissions for JSON records.
pub const FILE_MODE: u32 = 0o644;

pub fn write_atomic(fs: &dyn Fs, path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no parent directory for {}", path.display()),
        )
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (tmp_path, file) = fs.create_temp(dir, &format!(".{file_name}."))?;

    if let Err(err) = finish(fs, file, &tmp_path, path, contents, mode) {
        if let Err(cleanup) = fs.remove_file(&tmp_path) {
            warn!(tmp = %tmp_path.display(), err = %cleanup, "failed to remove temp file");
        }
        return Err(err);
    }
    debug!(path = %path.display(), bytes = contents.len(), "atomic write");
    Ok(())
}

fn finish(
    fs: &dyn Fs,
    mut file: File,
    tmp_path: &Path,
    path: &Path,
    contents: &[u8],
    mode: u32,
) -> io::Result<()> {
    file.write_all(contents)?;
    if let Err(err) = file.sync_all() {
        debug!(err = %err, "fsync failed (ignored)");
    }
    drop(file);
    fs.set_mode(tmp_path, mode)?;
    fs.rename(tmp_path, path)
}

/// Serialize `value` to pretty-printed JSON with trailing newline and write atomically.
pub fn write_json_atomic<T: Serialize>(fs: &dyn Fs, path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    write_atomic(fs, path, payload.as_bytes(), FILE_MODE)
        .with_context(|| format!("write {}", path.display()))
}
