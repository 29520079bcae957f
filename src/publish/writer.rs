//! Reservation files and atomic write-then-rename.

use filetime::FileTime;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::PublishError;
use crate::temp_file::TempFileGuard;

/// Zero-length placeholder at a publish target.
///
/// Discourages a second enquirer from publishing the same path while the
/// first upload is in flight. Not a lock. Dropping an unreleased
/// reservation removes the file, but only while it is still empty so a
/// real file renamed over it is never touched.
#[derive(Debug)]
pub struct Reservation {
    path: PathBuf,
    released: bool,
}

impl Reservation {
    /// Create or truncate the placeholder.
    pub fn create(path: &Path) -> Result<Self, PublishError> {
        File::create(path).map_err(|source| PublishError::Reserve {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The target now holds real content.
    pub fn release(mut self) {
        self.released = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() && meta.len() == 0 => {
                if let Err(e) = fs::remove_file(&self.path) {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Failed to remove reservation"
                    );
                } else {
                    tracing::debug!(path = %self.path.display(), "Removed reservation");
                }
            }
            _ => {}
        }
    }
}

/// `.<name>.<pid>.<nanos>.tmp` next to the target, or in `tmp_dir`.
pub fn temp_path_for(target: &Path, tmp_dir: Option<&Path>) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "publish".to_string());
    let temp_name = format!(".{}.{}.{}.tmp", name, std::process::id(), unique_nanos());

    match tmp_dir {
        Some(dir) => dir.join(temp_name),
        None => target
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(temp_name),
    }
}

/// Wall-clock nanoseconds, strictly increasing within the process.
fn unique_nanos() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Write `data` to a temp file and rename it onto `target`.
///
/// A reader of `target` sees either the old state or the complete new
/// file. `tmp_dir` has to be on the same filesystem as the target.
pub fn write_atomic(
    target: &Path,
    data: &[u8],
    mod_time: i64,
    tmp_dir: Option<&Path>,
) -> Result<(), PublishError> {
    let temp_path = temp_path_for(target, tmp_dir);
    let guard = TempFileGuard::new(&temp_path);

    let write_err = |source: io::Error| PublishError::Write {
        path: temp_path.clone(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .map_err(write_err)?;
    file.write_all(data).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    if mod_time > 0 {
        filetime::set_file_mtime(&temp_path, FileTime::from_unix_time(mod_time, 0)).map_err(
            |source| PublishError::SetMtime {
                path: temp_path.clone(),
                source,
            },
        )?;
    }

    fs::rename(&temp_path, target).map_err(|source| PublishError::Rename {
        from: temp_path.clone(),
        to: target.to_path_buf(),
        source,
    })?;
    guard.defuse();
    Ok(())
}
