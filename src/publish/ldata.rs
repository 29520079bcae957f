//! Latest-data-info sidecar.
//!
//! One `_latest_data_info.xml` per data directory describes the most
//! recently published file. Downstream consumers poll it. Writers hold an
//! exclusive lock on `_latest_data_info.lock` for the read-modify-write
//! and replace the XML by rename, so readers never see a partial record.

use chrono::{DateTime, Datelike, Timelike, Utc};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::writer::temp_path_for;
use crate::temp_file::TempFileGuard;

pub const LDATA_FILE_NAME: &str = "_latest_data_info.xml";
pub const LDATA_LOCK_NAME: &str = "_latest_data_info.lock";

const ROOT_TAG: &str = "latest_data_info";

#[derive(Error, Debug)]
pub enum LdataError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed latest data info: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatestDataInfo {
    /// Logical time of the data, unix seconds
    pub latest_time: i64,
    /// Path of the file relative to the sidecar's directory
    pub rel_data_path: String,
    pub file_ext: String,
    pub data_type: String,
    pub user_info1: String,
    pub user_info2: String,
    pub writer: String,
    /// Largest `latest_time` ever recorded here
    pub max_time: i64,
    /// mtime of the record this one replaced, 0 if none
    pub prev_mod_time: i64,
}

impl LatestDataInfo {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(LDATA_FILE_NAME)
    }

    pub fn to_xml(&self) -> String {
        let t = DateTime::<Utc>::from_timestamp(self.latest_time, 0).unwrap_or_default();

        let mut out = String::with_capacity(512);
        out.push_str(&format!("<{ROOT_TAG}>\n"));
        let mut field = |tag: &str, value: &str| {
            out.push_str(&format!("  <{tag}>{}</{tag}>\n", escape(value)));
        };
        field("unix_time", &self.latest_time.to_string());
        field("year", &t.year().to_string());
        field("month", &t.month().to_string());
        field("day", &t.day().to_string());
        field("hour", &t.hour().to_string());
        field("min", &t.minute().to_string());
        field("sec", &t.second().to_string());
        field("rel_data_path", &self.rel_data_path);
        field("file_ext", &self.file_ext);
        field("data_type", &self.data_type);
        field("user_info1", &self.user_info1);
        field("user_info2", &self.user_info2);
        field("writer", &self.writer);
        field("max_time", &self.max_time.to_string());
        field("prev_mod_time", &self.prev_mod_time.to_string());
        out.push_str(&format!("</{ROOT_TAG}>\n"));
        out
    }

    pub fn from_xml(xml: &str) -> Result<Self, LdataError> {
        if !xml.contains(&format!("</{ROOT_TAG}>")) {
            return Err(LdataError::Malformed(format!("no </{ROOT_TAG}> tag")));
        }
        let text = |tag: &str| find_field(xml, tag).unwrap_or_default();
        let int = |tag: &str| -> Result<i64, LdataError> {
            match find_field(xml, tag) {
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|_| LdataError::Malformed(format!("bad {tag} '{v}'"))),
                None => Ok(0),
            }
        };

        let latest_time = match find_field(xml, "unix_time") {
            Some(_) => int("unix_time")?,
            None => return Err(LdataError::Malformed("no unix_time".to_string())),
        };

        Ok(Self {
            latest_time,
            rel_data_path: text("rel_data_path"),
            file_ext: text("file_ext"),
            data_type: text("data_type"),
            user_info1: text("user_info1"),
            user_info2: text("user_info2"),
            writer: text("writer"),
            max_time: int("max_time")?,
            prev_mod_time: int("prev_mod_time")?,
        })
    }

    /// Read the record in `dir`, if there is one.
    pub fn read(dir: &Path) -> Result<Option<Self>, LdataError> {
        let path = Self::path_in(dir);
        match fs::read_to_string(&path) {
            Ok(xml) => Self::from_xml(&xml).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LdataError::Io {
                op: "read",
                path,
                source,
            }),
        }
    }

    /// Replace the record in `dir` with `self`.
    ///
    /// Fills `max_time` and `prev_mod_time` from the record being
    /// replaced and returns what was written.
    pub fn write(mut self, dir: &Path) -> Result<Self, LdataError> {
        let lock_path = dir.join(LDATA_LOCK_NAME);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| LdataError::Io {
                op: "open lock",
                path: lock_path.clone(),
                source,
            })?;
        FileExt::lock_exclusive(&lock).map_err(|source| LdataError::Io {
            op: "lock",
            path: lock_path.clone(),
            source,
        })?;

        let result = self.write_locked(dir);
        let _ = FileExt::unlock(&lock);
        result.map(|()| self)
    }

    fn write_locked(&mut self, dir: &Path) -> Result<(), LdataError> {
        let path = Self::path_in(dir);

        self.max_time = self.latest_time;
        self.prev_mod_time = 0;
        if let Ok(meta) = fs::metadata(&path) {
            self.prev_mod_time = filetime::FileTime::from_last_modification_time(&meta)
                .unix_seconds();
            match Self::read(dir) {
                Ok(Some(prev)) => self.max_time = self.max_time.max(prev.max_time),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Replacing unreadable latest data info"
                ),
            }
        }

        let temp_path = temp_path_for(&path, None);
        let guard = TempFileGuard::new(&temp_path);
        let io_err = |op: &'static str| {
            let temp_path = temp_path.clone();
            move |source: io::Error| LdataError::Io {
                op,
                path: temp_path,
                source,
            }
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .map_err(io_err("create"))?;
        file.write_all(self.to_xml().as_bytes())
            .map_err(io_err("write"))?;
        file.sync_all().map_err(io_err("sync"))?;
        drop(file);

        fs::rename(&temp_path, &path).map_err(|source| LdataError::Io {
            op: "rename",
            path: path.clone(),
            source,
        })?;
        guard.defuse();
        Ok(())
    }
}

/// Best guess at a data type name from a file extension.
pub fn guess_data_type(ext: &str) -> String {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    match ext.as_str() {
        "" => "unknown",
        "mdv" => "mdv",
        "nc" | "ncf" | "cdf" | "netcdf" => "netcdf",
        "h5" | "hdf5" | "he5" => "hdf5",
        "grb" | "grib" | "grb2" | "grib2" => "grib",
        "png" | "gif" | "jpg" | "jpeg" => "www",
        "txt" | "csv" | "json" | "xml" => "ascii",
        other => return other.to_string(),
    }
    .to_string()
}

fn find_field(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    Some(unescape(&xml[start..end]))
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
