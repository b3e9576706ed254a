//! `host:/export` target parsing.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("remote target '{0}' is not of the form host:/path")]
    MissingSeparator(String),

    #[error("remote target '{0}' has an empty host")]
    EmptyHost(String),

    #[error("export path '{0}' must be absolute")]
    RelativeExport(String),

    #[error("unterminated IPv6 address in '{0}'")]
    UnterminatedBracket(String),
}

/// A remote export. IPv6 hosts are written `[addr]:/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Host without brackets.
    pub host: String,
    pub export: String,
}

impl RemoteTarget {
    /// Host as it appears in a target string, bracketed when it contains ':'.
    pub fn display_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl FromStr for RemoteTarget {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, export) = if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| TargetError::UnterminatedBracket(s.to_string()))?;
            let export = rest[end + 1..]
                .strip_prefix(':')
                .ok_or_else(|| TargetError::MissingSeparator(s.to_string()))?;
            (&rest[..end], export)
        } else {
            s.split_once(':')
                .ok_or_else(|| TargetError::MissingSeparator(s.to_string()))?
        };

        if host.is_empty() {
            return Err(TargetError::EmptyHost(s.to_string()));
        }
        if !export.starts_with('/') {
            return Err(TargetError::RelativeExport(export.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            export: export.to_string(),
        })
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.display_host(), self.export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hostname() {
        let t: RemoteTarget = "server:/srv/export".parse().unwrap();
        assert_eq!(t.host, "server");
        assert_eq!(t.export, "/srv/export");
        assert_eq!(t.to_string(), "server:/srv/export");
    }

    #[test]
    fn test_parse_ipv6() {
        let t: RemoteTarget = "[fe80::1]:/data".parse().unwrap();
        assert_eq!(t.host, "fe80::1");
        assert_eq!(t.export, "/data");
        assert_eq!(t.to_string(), "[fe80::1]:/data");
    }

    #[test]
    fn test_export_may_contain_colons() {
        let t: RemoteTarget = "host:/a:b".parse().unwrap();
        assert_eq!(t.export, "/a:b");
    }

    #[test]
    fn test_rejects_malformed_targets() {
        assert!(matches!(
            "nocolon".parse::<RemoteTarget>(),
            Err(TargetError::MissingSeparator(_))
        ));
        assert!(matches!(
            ":/x".parse::<RemoteTarget>(),
            Err(TargetError::EmptyHost(_))
        ));
        assert!(matches!(
            "host:relative".parse::<RemoteTarget>(),
            Err(TargetError::RelativeExport(_))
        ));
        assert!(matches!(
            "[::1:/x".parse::<RemoteTarget>(),
            Err(TargetError::UnterminatedBracket(_))
        ));
        assert!(matches!(
            "[::1]/x".parse::<RemoteTarget>(),
            Err(TargetError::MissingSeparator(_))
        ));
    }
}
