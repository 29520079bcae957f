//! Data URLs: `scheme://[host][:port]::path` or `scheme://[host][:port]/path`.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use super::PublishError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    /// Relative to the data root unless it starts with `/`.
    pub path: String,
}

impl DataUrl {
    pub fn parse(url: &str) -> Result<Self, PublishError> {
        let invalid = |reason: &str| PublishError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| invalid("missing '://'"))?;
        // `mdvp:://host::dir` style
        let scheme = scheme.strip_suffix(':').unwrap_or(scheme);
        if scheme.is_empty() {
            return Err(invalid("empty scheme"));
        }

        // A bracketed host may itself contain "::"
        let (host, after_host) = match rest.strip_prefix('[') {
            Some(bracketed) => bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unclosed '[' in host"))?,
            None => rest.split_at(rest.find([':', '/']).unwrap_or(rest.len())),
        };

        let (port, tail) = match after_host.strip_prefix(':') {
            Some(after) if !after.starts_with(':') => {
                let end = after.find([':', '/']).unwrap_or(after.len());
                let port = after[..end]
                    .parse::<u16>()
                    .map_err(|_| invalid(&format!("bad port '{}'", &after[..end])))?;
                (Some(port), &after[end..])
            }
            _ => (None, after_host),
        };

        let path = match tail.strip_prefix("::") {
            Some(path) => path,
            None if tail.is_empty() || tail.starts_with('/') => tail,
            None => return Err(invalid("expected '::' or '/' after host")),
        };

        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn is_absolute(&self) -> bool {
        Path::new(&self.path).is_absolute()
    }

    /// Reject paths that could escape the data root.
    pub fn check_secure(&self) -> Result<(), PublishError> {
        let escapes = Path::new(&self.path)
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if self.is_absolute() || escapes {
            return Err(PublishError::SecurityDenied(format!(
                "URL path '{}' must be relative and must not contain '..'",
                self.path
            )));
        }
        Ok(())
    }

    /// Directory the URL names on this host.
    pub fn resolve_dir(&self, data_dir: &Path) -> PathBuf {
        if self.is_absolute() {
            PathBuf::from(&self.path)
        } else {
            data_dir.join(&self.path)
        }
    }
}

impl fmt::Display for DataUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]", self.scheme, self.host)?;
        } else {
            write!(f, "{}://{}", self.scheme, self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "::{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rap_style() {
        let url = DataUrl::parse("mdvp:://radar01:5440::mdv/cart").unwrap();
        assert_eq!(url.scheme, "mdvp");
        assert_eq!(url.host, "radar01");
        assert_eq!(url.port, Some(5440));
        assert_eq!(url.path, "mdv/cart");
        assert!(!url.is_absolute());
    }

    #[test]
    fn test_parse_plain_double_colon() {
        let url = DataUrl::parse("spdbp://localhost::spdb/obs").unwrap();
        assert_eq!(url.port, None);
        assert_eq!(url.path, "spdb/obs");
    }

    #[test]
    fn test_parse_slash_form_is_absolute() {
        let url = DataUrl::parse("file://host/var/data/out").unwrap();
        assert_eq!(url.host, "host");
        assert_eq!(url.path, "/var/data/out");
        assert!(url.is_absolute());
        assert_eq!(
            url.resolve_dir(Path::new("/ignored")),
            PathBuf::from("/var/data/out")
        );
    }

    #[test]
    fn test_parse_without_path() {
        let url = DataUrl::parse("file://localhost").unwrap();
        assert_eq!(url.path, "");
        assert_eq!(url.resolve_dir(Path::new("/data")), PathBuf::from("/data/"));
    }

    #[test]
    fn test_parse_bracketed_ipv6_host() {
        let url = DataUrl::parse("mdvp:://[::1]:5440::dir").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, Some(5440));
        assert_eq!(url.path, "dir");
        assert_eq!(url.to_string(), "mdvp://[::1]:5440::dir");

        let url = DataUrl::parse("file://[fe80::2]/var/data").unwrap();
        assert_eq!(url.host, "fe80::2");
        assert_eq!(url.port, None);
        assert_eq!(url.path, "/var/data");

        let url = DataUrl::parse("mdvp:://[::1]::a::b").unwrap();
        assert_eq!(url.port, None);
        assert_eq!(url.path, "a::b");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DataUrl::parse("no-scheme-here").is_err());
        assert!(DataUrl::parse("://host::x").is_err());
        assert!(DataUrl::parse("file://host:notaport::x").is_err());
        assert!(DataUrl::parse("mdvp:://[::1::dir").is_err());
        assert!(DataUrl::parse("mdvp:://host:5440:dir").is_err());
    }

    #[test]
    fn test_resolve_relative_under_data_dir() {
        let url = DataUrl::parse("mdvp:://h::a/b").unwrap();
        let dir = url.resolve_dir(Path::new("/data"));
        assert_eq!(dir, PathBuf::from("/data/a/b"));
    }

    #[test]
    fn test_check_secure() {
        let url = DataUrl::parse("mdvp:://h::a/b").unwrap();
        assert!(url.check_secure().is_ok());
        assert!(matches!(
            DataUrl::parse("mdvp:://h::a/../../etc")
                .unwrap()
                .check_secure(),
            Err(PublishError::SecurityDenied(_))
        ));
        assert!(matches!(
            DataUrl::parse("mdvp:://h::/etc").unwrap().check_secure(),
            Err(PublishError::SecurityDenied(_))
        ));
    }
}
