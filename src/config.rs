//! Server configuration.
//!
//! Priority: command-line flags > environment variables > config file >
//! defaults. Flags are applied by the binary on top of [`ServerConfig::load`].
//! An invalid environment value is logged and ignored.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::HEADER_LEN;
use crate::publish::codec::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::publish::PublishSettings;
use crate::transport::DEFAULT_MAX_MESSAGE_BYTES;

pub const DEFAULT_PORT: u16 = 5440;
pub const DEFAULT_MAX_CLIENTS: i64 = 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on (default: 0.0.0.0)
    pub bind: String,
    pub port: u16,
    /// Root for relative data URLs
    pub data_dir: PathBuf,
    /// Instance name reported by IS_ALIVE (default: the port number)
    pub instance: Option<String>,
    /// Concurrent client limit; negative disables it
    pub max_clients: i64,
    /// Exit after this long with no clients; negative disables it
    pub max_quiescent_secs: i64,
    pub accept_timeout_ms: u64,
    /// Read/write timeout per message; 0 blocks indefinitely
    pub comm_timeout_ms: u64,
    /// Staging directory for temp files; must share a filesystem with the data
    pub tmp_dir: Option<PathBuf>,
    /// Handle each connection inline in the listener (debugging)
    pub no_threads: bool,
    /// Stop the server when a connection handler fails
    pub strict: bool,
    /// Reject absolute and `..` data URL paths
    pub secure: bool,
    pub read_only: bool,
    pub writer: Option<String>,
    pub ldata_no_write: bool,
    pub max_message_bytes: u32,
    /// Largest declared payload length accepted, checked before decompressing
    pub max_payload_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            data_dir: PathBuf::from("."),
            instance: None,
            max_clients: DEFAULT_MAX_CLIENTS,
            max_quiescent_secs: -1,
            accept_timeout_ms: 1000,
            comm_timeout_ms: 30_000,
            tmp_dir: None,
            no_threads: false,
            strict: false,
            secure: false,
            read_only: false,
            writer: None,
            ldata_no_write: false,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl ServerConfig {
    /// Load from `path` (or the default location) and apply the environment.
    ///
    /// An explicit path must exist and parse. The default location is
    /// optional, and a broken file there only produces a warning.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path).unwrap_or_else(|e| {
                    tracing::warn!("{}", e);
                    tracing::info!("Using default configuration");
                    Self::default()
                }),
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.data_dir = expand_tilde(&config.data_dir);
        config.tmp_dir = config.tmp_dir.as_deref().map(expand_tilde);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = lookup("PUBLISHD_BIND") {
            self.bind = bind;
            tracing::debug!("Overriding bind from PUBLISHD_BIND environment variable");
        }
        if let Some(port) = parse_env(&lookup, "PUBLISHD_PORT") {
            self.port = port;
        }
        if let Some(dir) = lookup("RAP_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
            tracing::debug!("Overriding data_dir from RAP_DATA_DIR environment variable");
        }
        if let Some(max) = parse_env(&lookup, "DS_SERVER_MAX_CLIENTS") {
            self.max_clients = max;
        }
        if let Some(secs) = parse_env(&lookup, "PUBLISHD_MAX_QUIESCENT_SECS") {
            self.max_quiescent_secs = secs;
        }
        if let Some(ms) = parse_env(&lookup, "DS_COMM_TIMEOUT_MSECS") {
            self.comm_timeout_ms = ms;
        }
        if let Some(dir) = lookup("PUBLISHD_TMP_DIR") {
            self.tmp_dir = Some(PathBuf::from(dir));
            tracing::debug!("Overriding tmp_dir from PUBLISHD_TMP_DIR environment variable");
        }
        if let Some(max) = parse_env(&lookup, "PUBLISHD_MAX_PAYLOAD_BYTES") {
            self.max_payload_bytes = max;
        }
        if let Some(value) = lookup("LDATA_NO_WRITE") {
            match parse_bool(&value) {
                Some(v) => self.ldata_no_write = v,
                None => tracing::warn!("Invalid LDATA_NO_WRITE value: {}", value),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "accept_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_payload_bytes must be positive".to_string(),
            ));
        }
        if (self.max_message_bytes as usize) < HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_message_bytes must be at least {HEADER_LEN}"
            )));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid(
                "max_clients of 0 would deny every client; use a negative value for no limit"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn max_clients(&self) -> Option<usize> {
        usize::try_from(self.max_clients).ok()
    }

    pub fn max_quiescent(&self) -> Option<Duration> {
        u64::try_from(self.max_quiescent_secs)
            .ok()
            .map(Duration::from_secs)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn comm_timeout(&self) -> Option<Duration> {
        (self.comm_timeout_ms > 0).then(|| Duration::from_millis(self.comm_timeout_ms))
    }

    pub fn instance_name(&self) -> String {
        self.instance
            .clone()
            .unwrap_or_else(|| self.port.to_string())
    }

    pub fn server_name(&self) -> String {
        format!("publishd.{}", self.instance_name())
    }

    /// Writer recorded in the sidecar for requests that name none.
    pub fn writer_name(&self) -> String {
        self.writer.clone().unwrap_or_else(|| {
            let host = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string());
            format!("publishd@{host}")
        })
    }

    pub fn publish_settings(&self) -> PublishSettings {
        PublishSettings {
            data_dir: self.data_dir.clone(),
            tmp_dir: self.tmp_dir.clone(),
            secure: self.secure,
            read_only: self.read_only,
            writer: self.writer_name(),
            ldata_no_write: self.ldata_no_write,
            comm_timeout: self.comm_timeout(),
            max_payload_bytes: self.max_payload_bytes,
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => {
            tracing::debug!("Overriding from {} environment variable", key);
            Some(v)
        }
        Err(_) => {
            tracing::warn!("Invalid {} value: {}", key, raw);
            None
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `~/.config/publishd/publishd.toml` or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("publishd").join("publishd.toml"))
}

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:5440");
        assert_eq!(config.max_clients(), Some(1024));
        assert_eq!(config.max_quiescent(), None);
        assert_eq!(config.accept_timeout(), Duration::from_secs(1));
        assert_eq!(config.comm_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.server_name(), "publishd.5440");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServerConfig::default();
        config.apply_env(env(&[
            ("PUBLISHD_PORT", "6000"),
            ("RAP_DATA_DIR", "/data"),
            ("DS_SERVER_MAX_CLIENTS", "-1"),
            ("PUBLISHD_MAX_QUIESCENT_SECS", "30"),
            ("DS_COMM_TIMEOUT_MSECS", "500"),
            ("PUBLISHD_MAX_PAYLOAD_BYTES", "4096"),
            ("LDATA_NO_WRITE", "true"),
        ]));

        assert_eq!(config.port, 6000);
        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert_eq!(config.max_clients(), None);
        assert_eq!(config.max_quiescent(), Some(Duration::from_secs(30)));
        assert_eq!(config.comm_timeout(), Some(Duration::from_millis(500)));
        assert!(config.ldata_no_write);
        assert_eq!(config.publish_settings().max_payload_bytes, 4096);
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let mut config = ServerConfig::default();
        config.apply_env(env(&[
            ("PUBLISHD_PORT", "not-a-port"),
            ("DS_SERVER_MAX_CLIENTS", "many"),
            ("LDATA_NO_WRITE", "maybe"),
        ]));
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("publishd.toml");
        fs::write(
            &path,
            "port = 7000\ndata_dir = \"/srv/data\"\nsecure = true\nmax_quiescent_secs = 10\n",
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert!(config.secure);
        assert_eq!(config.max_quiescent(), Some(Duration::from_secs(10)));
        // Unset fields keep their defaults
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
    }

    #[test]
    fn test_from_file_rejects_unknown_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        fs::write(&path, "prot = 7000\n").unwrap();
        assert!(matches!(
            ServerConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let err = ServerConfig::load(Some(&tmp.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validate() {
        let mut config = ServerConfig::default();
        config.max_clients = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.accept_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.max_payload_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_reads_process_env() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("publishd.toml");
        fs::write(&path, "port = 7000\n").unwrap();

        std::env::set_var("PUBLISHD_PORT", "7100");
        let config = ServerConfig::load(Some(&path));
        std::env::remove_var("PUBLISHD_PORT");

        assert_eq!(config.unwrap().port, 7100);
    }

    #[test]
    #[serial]
    fn test_comm_timeout_zero_blocks() {
        std::env::set_var("DS_COMM_TIMEOUT_MSECS", "0");
        let mut config = ServerConfig::default();
        config.apply_env(|key| std::env::var(key).ok());
        std::env::remove_var("DS_COMM_TIMEOUT_MSECS");

        assert_eq!(config.comm_timeout(), None);
    }

    #[test]
    fn test_publish_settings_writer() {
        let mut config = ServerConfig::default();
        assert!(config.writer_name().starts_with("publishd@"));
        config.writer = Some("ingest".to_string());
        assert_eq!(config.publish_settings().writer, "ingest");
    }

    #[test]
    fn test_expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde(Path::new("/abs")), PathBuf::from("/abs"));
        assert_eq!(expand_tilde(Path::new("rel/x")), PathBuf::from("rel/x"));
    }
}
