//! Where a publish lands, and whether it should happen at all.

use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::url::DataUrl;
use super::{PublishError, PublishSettings};
use crate::protocol::{FileInfo, PublishRequest};

/// Extension used by the time-keyed variants when none is given.
pub const DEFAULT_FILE_EXT: &str = "dat";

/// Resolved destination of one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    /// Directory the file lands in (created on demand)
    pub target_dir: PathBuf,
    pub target_path: PathBuf,
    /// Directory named by the data URL; holds the sidecar
    pub ldata_dir: PathBuf,
    /// `target_path` relative to `ldata_dir`
    pub rel_path: String,
    pub file_ext: String,
}

/// Overwrite policy.
///
/// An absent file is always written. An existing file is replaced only if
/// it is at least `overwrite_age` seconds old; `-1` never replaces.
pub fn decide_put(exists: bool, mod_time: i64, overwrite_age: i32, now: i64) -> bool {
    if !exists {
        return true;
    }
    if overwrite_age == FileInfo::NEVER_OVERWRITE {
        return false;
    }
    now.saturating_sub(mod_time) >= i64::from(overwrite_age)
}

/// Accept only plain relative names that stay below their root.
pub fn validate_relative(name: &str) -> Result<(), PublishError> {
    let unsafe_name = |reason: &str| PublishError::UnsafeName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(unsafe_name("empty"));
    }
    for component in Path::new(name).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(unsafe_name("contains '..'")),
            Component::RootDir | Component::Prefix(_) => return Err(unsafe_name("absolute")),
        }
    }
    Ok(())
}

/// Explicit-name variants.
///
/// With a file name the URL names the directory. Without one the URL's
/// last component is the file and its parent the directory.
pub fn resolve_named(
    url_dir: &Path,
    file_name: Option<&str>,
) -> Result<PublishTarget, PublishError> {
    let (ldata_dir, rel_path) = match file_name {
        Some(name) => {
            validate_relative(name)?;
            (url_dir.to_path_buf(), name.to_string())
        }
        None => {
            let name = url_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| PublishError::UnsafeName {
                    name: url_dir.display().to_string(),
                    reason: "URL names no file and no file name was given".to_string(),
                })?;
            let parent = url_dir.parent().unwrap_or_else(|| Path::new("/"));
            (parent.to_path_buf(), name)
        }
    };
    Ok(build(ldata_dir, rel_path))
}

/// Time-keyed variants: `YYYYMMDD/HHMMSS.<ext>` in UTC.
pub fn resolve_by_time(
    url_dir: &Path,
    data_time: i64,
    file_ext: Option<&str>,
) -> Result<PublishTarget, PublishError> {
    let time = DateTime::<Utc>::from_timestamp(data_time, 0).ok_or_else(|| {
        PublishError::UnsafeName {
            name: data_time.to_string(),
            reason: "data time out of range".to_string(),
        }
    })?;
    let ext = file_ext
        .map(|e| e.trim_start_matches('.'))
        .filter(|e| !e.is_empty())
        .unwrap_or(DEFAULT_FILE_EXT);
    let rel_path = format!("{}.{}", time.format("%Y%m%d/%H%M%S"), ext);
    validate_relative(&rel_path)?;
    Ok(build(url_dir.to_path_buf(), rel_path))
}

fn build(ldata_dir: PathBuf, rel_path: String) -> PublishTarget {
    let target_path = ldata_dir.join(&rel_path);
    let target_dir = target_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ldata_dir.clone());
    let file_ext = Path::new(&rel_path)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    PublishTarget {
        target_dir,
        target_path,
        ldata_dir,
        rel_path,
        file_ext,
    }
}

/// Apply the request guards and compute where the file goes.
///
/// Read-only and secure-mode checks run here, before anything touches the
/// filesystem.
pub fn resolve(
    request: &PublishRequest,
    settings: &PublishSettings,
) -> Result<PublishTarget, PublishError> {
    if settings.read_only {
        return Err(PublishError::ReadOnly);
    }
    let url = DataUrl::parse(&request.url)?;
    if settings.secure {
        url.check_secure()?;
    }
    let url_dir = url.resolve_dir(&settings.data_dir);

    if request.kind.is_by_time() {
        let data_time = request.data_time.ok_or_else(|| PublishError::UnsafeName {
            name: request.url.clone(),
            reason: "time-keyed request without data time".to_string(),
        })?;
        resolve_by_time(&url_dir, data_time, request.file_ext.as_deref())
    } else {
        resolve_named(&url_dir, request.file_name.as_deref())
    }
}

/// Create the target directory and its parents.
pub async fn ensure_dir(dir: &Path) -> Result<(), PublishError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| PublishError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })
}

/// Stat the target and apply [`decide_put`].
pub async fn decide(
    target: &PublishTarget,
    info: &FileInfo,
    now: i64,
) -> Result<bool, PublishError> {
    let (exists, mod_time) = match tokio::fs::metadata(&target.target_path).await {
        Ok(meta) => {
            let mod_time = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            (true, mod_time)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (false, 0),
        Err(source) => {
            return Err(PublishError::Stat {
                path: target.target_path.clone(),
                source,
            })
        }
    };
    Ok(decide_put(exists, mod_time, info.overwrite_age, now))
}
