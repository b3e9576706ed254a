//! Kernel-facing configuration for the FUSE session.
//!
//! Attribute caching on the NFS side lives in [`nfsfuse_core::CoreConfig`];
//! this only governs how long the kernel may hold entries and attributes
//! before asking again, plus how the mount is labelled.

use std::time::Duration;

/// Default kernel entry/attribute TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Type label shown in the mount table (`fuse.nfs`).
pub const DEFAULT_SUBTYPE: &str = "nfs";

/// Configuration options for the FUSE session.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// How long the kernel may cache attributes returned by getattr/setattr.
    pub attr_ttl: Duration,

    /// How long the kernel may cache name → inode results from lookup.
    pub entry_ttl: Duration,

    /// Filesystem name reported to the kernel; normally the remote target.
    pub fsname: Option<String>,

    pub subtype: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_ttl: DEFAULT_TTL,
            entry_ttl: DEFAULT_TTL,
            fsname: None,
            subtype: DEFAULT_SUBTYPE.to_string(),
        }
    }
}

impl MountConfig {
    /// Sets the kernel attribute TTL.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Sets the kernel entry TTL.
    #[must_use]
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    #[must_use]
    pub fn fsname(mut self, name: impl Into<String>) -> Self {
        self.fsname = Some(name.into());
        self
    }

    #[must_use]
    pub fn subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = subtype.into();
        self
    }

    /// Filesystem type as recorded in the mount table.
    pub fn fstype(&self) -> String {
        format!("fuse.{}", self.subtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MountConfig::default();
        assert_eq!(config.attr_ttl, Duration::from_secs(1));
        assert_eq!(config.entry_ttl, Duration::from_secs(1));
        assert!(config.fsname.is_none());
        assert_eq!(config.fstype(), "fuse.nfs");
    }

    #[test]
    fn test_builder_pattern() {
        let config = MountConfig::default()
            .attr_ttl(Duration::from_secs(5))
            .entry_ttl(Duration::from_secs(2))
            .fsname("server:/export")
            .subtype("nfs4");
        assert_eq!(config.attr_ttl, Duration::from_secs(5));
        assert_eq!(config.entry_ttl, Duration::from_secs(2));
        assert_eq!(config.fsname.as_deref(), Some("server:/export"));
        assert_eq!(config.fstype(), "fuse.nfs4");
    }
}
