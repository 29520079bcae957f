//! Drop guards for files that must not outlive a failed publish.

use std::path::{Path, PathBuf};

/// Removes a staged temp file on drop unless [`defuse`](Self::defuse)d.
///
/// Create the guard before the file is opened so every early return
/// cleans up.
#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file. Call after the temp file was renamed into place.
    pub fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed temp file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove temp file"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_guard_removes_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("staged.tmp");
        std::fs::write(&path, b"partial").unwrap();

        {
            let _guard = TempFileGuard::new(&path);
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_defused_guard_keeps_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kept.tmp");
        std::fs::write(&path, b"complete").unwrap();

        TempFileGuard::new(&path).defuse();

        assert!(path.exists());
    }

    #[test]
    fn test_guard_tolerates_missing_file() {
        let tmp = TempDir::new().unwrap();
        let _guard = TempFileGuard::new(tmp.path().join("never-created"));
    }
}
