//! Parsing of `--endpoint` values.

use std::fmt;
use std::path::PathBuf;

use daos_csi_common::error::{CsiError, Result};

/// Address the RPC server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix socket path.
    Unix(PathBuf),
    /// TCP `host:port`.
    Tcp(String),
}

impl Endpoint {
    /// Parses `unix:/path`, `unix:///path`, or `tcp://host:port`.
    ///
    /// With `cleanup_socket`, a leftover file at a unix socket path is
    /// removed so the server can bind again after a restart.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::Config`] for an unsupported scheme or an empty
    /// address, and [`CsiError::Io`] if the stale socket cannot be removed.
    pub fn parse(endpoint: &str, cleanup_socket: bool) -> Result<Self> {
        let Some((scheme, rest)) = endpoint.split_once(':') else {
            return Err(config_error(format!("endpoint {endpoint:?} has no scheme")));
        };
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        match scheme {
            "unix" => {
                if rest.is_empty() {
                    return Err(config_error(format!("endpoint {endpoint:?} has no path")));
                }
                let path = PathBuf::from(rest);
                if cleanup_socket {
                    match std::fs::remove_file(&path) {
                        Ok(()) => tracing::debug!(path = %path.display(), "removed stale endpoint socket"),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(CsiError::Io { path, source: e }),
                    }
                }
                Ok(Self::Unix(path))
            }
            "tcp" => {
                let host = rest.split('/').next().unwrap_or_default();
                if host.is_empty() {
                    return Err(config_error(format!("endpoint {endpoint:?} has no host")));
                }
                Ok(Self::Tcp(host.to_string()))
            }
            other => Err(config_error(format!(
                "{other} endpoint scheme not supported"
            ))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

fn config_error(message: String) -> CsiError {
    CsiError::Config { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_forms() {
        assert_eq!(
            Endpoint::parse("unix:/tmp/csi.sock", false).unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/csi.sock"))
        );
        assert_eq!(
            Endpoint::parse("unix:///csi/csi.sock", false).unwrap(),
            Endpoint::Unix(PathBuf::from("/csi/csi.sock"))
        );
    }

    #[test]
    fn tcp_keeps_host_and_port() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:10000", false).unwrap(),
            Endpoint::Tcp("127.0.0.1:10000".into())
        );
        assert_eq!(
            Endpoint::parse("tcp://localhost:9/ignored", false).unwrap(),
            Endpoint::Tcp("localhost:9".into())
        );
    }

    #[test]
    fn bad_schemes_fail() {
        assert!(Endpoint::parse("http://x", false).is_err());
        assert!(Endpoint::parse("/tmp/csi.sock", false).is_err());
        assert!(Endpoint::parse("unix:", false).is_err());
        assert!(Endpoint::parse("tcp://", false).is_err());
    }

    #[test]
    fn cleanup_removes_stale_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("csi.sock");
        std::fs::write(&path, b"").expect("stale");
        let endpoint = Endpoint::parse(&format!("unix:{}", path.display()), true).unwrap();
        assert_eq!(endpoint, Endpoint::Unix(path.clone()));
        assert!(!path.exists());
        assert_eq!(endpoint.to_string(), format!("unix:{}", path.display()));
    }
}
