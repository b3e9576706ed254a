//! Mounting an export end to end.
//!
//! [`MountPlan`] validates everything that can be checked before the
//! network is touched. [`mount`] then runs the handshake, starts the FUSE
//! session and records the mount table entry; [`ActiveMount::shutdown`]
//! undoes those steps in reverse order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nfsfuse_core::config::ConfigError;
use nfsfuse_core::handshake::{self, DEFAULT_VERSION};
use nfsfuse_core::{
    CoreConfig, Dispatcher, HandshakeError, InodeCache, MountRequest, MountState, RpcConnector,
};
use nfsfuse_mount::{
    LocalFlags, MountTable, OptionError, ParsedOptions, RemoteTarget, TargetError,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{self, BackendError, FuseMountHandle};
use crate::config::MountConfig;
use crate::exit_code;
use crate::filesystem::NfsFuse;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("invalid mount options: {0}")]
    Options(#[from] OptionError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("mount point {}: {reason}", path.display())]
    MountPoint { path: PathBuf, reason: String },

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl MountError {
    /// mount(8)-style exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Options(_) | Self::Target(_) | Self::Config(_) => exit_code::USAGE,
            Self::MountPoint { .. } | Self::Backend(_) => exit_code::SYSTEM_ERROR,
            Self::Handshake(e) => exit_code::for_class(e.exit_class()),
        }
    }
}

/// Command-line inputs to a mount, before validation.
#[derive(Debug, Clone, Default)]
pub struct MountArgs {
    pub target: String,
    pub mountpoint: PathBuf,
    pub options: Option<String>,
    /// `-r` (Some(true)) or `-w` (Some(false)); applied after `-o`.
    pub read_only: Option<bool>,
    /// `-t`
    pub version: Option<u32>,
    pub local: LocalFlags,
    pub debug_mount: bool,
}

/// A validated mount request.
#[derive(Debug, Clone)]
pub struct MountPlan {
    pub target: RemoteTarget,
    pub mountpoint: PathBuf,
    pub options: ParsedOptions,
    pub core: CoreConfig,
    pub version: u32,
    pub local: LocalFlags,
}

impl MountPlan {
    /// Parses and checks `args`. Nothing is mounted or written.
    pub fn from_args(args: &MountArgs) -> Result<Self, MountError> {
        let target: RemoteTarget = args.target.parse()?;
        let raw = args.options.as_deref().unwrap_or("");
        let mut options = nfsfuse_mount::parse(raw)?;
        if let Some(ro) = args.read_only {
            options.set_read_only(ro);
        }
        let core = CoreConfig::from_extra_options(&options.extra)?.debug_mount(args.debug_mount);
        let version = args
            .version
            .or(core.requested_version)
            .unwrap_or(DEFAULT_VERSION);

        let mountpoint = args.mountpoint.canonicalize().map_err(|e| MountError::MountPoint {
            path: args.mountpoint.clone(),
            reason: e.to_string(),
        })?;
        if !mountpoint.is_dir() {
            return Err(MountError::MountPoint {
                path: mountpoint,
                reason: "not a directory".into(),
            });
        }

        Ok(Self {
            target,
            mountpoint,
            options,
            core,
            version,
            local: args.local,
        })
    }

    pub fn request(&self) -> MountRequest {
        MountRequest {
            host: self.target.host.clone(),
            export: self.target.export.clone(),
            version: self.version,
        }
    }

    pub fn fuse_config(&self) -> MountConfig {
        MountConfig::default()
            .fsname(self.target.to_string())
            .subtype(if self.version == 4 { "nfs4" } else { "nfs" })
    }

    pub fn registry(&self) -> MountTable {
        MountTable::system().disabled(self.local.no_mtab)
    }
}

/// A live mount: handshake state, FUSE session and mount table entry.
pub struct ActiveMount<'a, C: RpcConnector + ?Sized> {
    connector: &'a C,
    state: MountState,
    cache: Arc<InodeCache>,
    handle: FuseMountHandle,
    registry: MountTable,
}

/// Mounts `plan` using `connector` for the remote side.
///
/// A failure after the handshake undoes it before returning. A mount table
/// failure is only logged.
pub fn mount<'a, C: RpcConnector + ?Sized>(
    plan: &MountPlan,
    connector: &'a C,
    registry: MountTable,
) -> Result<ActiveMount<'a, C>, MountError> {
    let request = plan.request();
    let cache = Arc::new(InodeCache::new(plan.core.clone()));
    let state = handshake::mount(connector, &request, &plan.core, &cache)?;

    let config = plan.fuse_config();
    let options = backend::mount_options(&plan.options.bridge_args, &config);
    let fs = NfsFuse::new(Dispatcher::for_mount(&state, Arc::clone(&cache)), config.clone());
    let handle = match FuseMountHandle::mount(fs, &plan.mountpoint, &options) {
        Ok(handle) => handle,
        Err(e) => {
            if let Err(undo) = handshake::unmount(connector, state, &cache) {
                warn!(error = %undo, "failed to undo handshake");
            }
            return Err(e.into());
        }
    };

    if let Err(e) = registry.record_mount(
        &plan.target.to_string(),
        &plan.mountpoint,
        &config.fstype(),
        plan.options.flags,
        &plan.options.extra,
    ) {
        warn!(error = %e, "could not record mount, continuing");
    }

    info!(
        target = %plan.target,
        mountpoint = %plan.mountpoint.display(),
        version = plan.version,
        "mounted"
    );
    Ok(ActiveMount {
        connector,
        state,
        cache,
        handle,
        registry,
    })
}

impl<C: RpcConnector + ?Sized> ActiveMount<'_, C> {
    pub fn mountpoint(&self) -> &Path {
        self.handle.mountpoint()
    }

    pub fn state(&self) -> &MountState {
        &self.state
    }

    /// Unmounts the session, drops the mount table entry and ends the
    /// remote mount.
    pub fn shutdown(self) {
        let mountpoint = self.handle.mountpoint().to_path_buf();
        self.handle.unmount();
        if let Err(e) = self.registry.remove_mount(&mountpoint) {
            warn!(error = %e, "could not remove mount table entry");
        }
        if let Err(e) = handshake::unmount(self.connector, self.state, &self.cache) {
            warn!(error = %e, "remote unmount failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(dir: &Path) -> MountArgs {
        MountArgs {
            target: "localhost:/srv".into(),
            mountpoint: dir.to_path_buf(),
            ..MountArgs::default()
        }
    }

    #[test]
    fn test_default_version() {
        let dir = tempfile::tempdir().unwrap();
        let plan = MountPlan::from_args(&args(dir.path())).unwrap();
        assert_eq!(plan.version, DEFAULT_VERSION);
        assert_eq!(plan.fuse_config().fstype(), "fuse.nfs");
    }

    #[test]
    fn test_version_from_options_then_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(dir.path());
        a.options = Some("vers=4".into());
        assert_eq!(MountPlan::from_args(&a).unwrap().version, 4);

        a.version = Some(3);
        assert_eq!(MountPlan::from_args(&a).unwrap().version, 3);
    }

    #[test]
    fn test_read_write_flag_applies_after_options() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(dir.path());
        a.options = Some("ro,noatime".into());
        a.read_only = Some(false);
        let plan = MountPlan::from_args(&a).unwrap();
        assert!(!plan.options.is_read_only());
        assert!(plan.options.bridge_args.contains(&"rw".to_string()));
    }

    #[test]
    fn test_extra_options_are_kept_for_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(dir.path());
        a.options = Some("ro,actimeo=5,foo=bar".into());
        let plan = MountPlan::from_args(&a).unwrap();
        assert_eq!(plan.options.extra, "actimeo=5,foo=bar");
        assert_eq!(plan.core.acregmin, std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_usage_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(dir.path());
        a.options = Some("ro,\"unterminated".into());
        let err = MountPlan::from_args(&a).unwrap_err();
        assert!(matches!(err, MountError::Options(_)));
        assert_eq!(err.exit_code(), exit_code::USAGE);

        let mut a = args(dir.path());
        a.target = "no-separator".into();
        assert_eq!(
            MountPlan::from_args(&a).unwrap_err().exit_code(),
            exit_code::USAGE
        );
    }

    #[test]
    fn test_missing_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let a = args(&dir.path().join("absent"));
        let err = MountPlan::from_args(&a).unwrap_err();
        assert!(matches!(err, MountError::MountPoint { .. }));
        assert_eq!(err.exit_code(), exit_code::SYSTEM_ERROR);
    }

    #[test]
    fn test_handshake_errors_use_their_class() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(dir.path());
        a.target = "remote.example:/srv".into();
        let plan = MountPlan::from_args(&a).unwrap();
        let connector = nfsfuse_core::LoopbackConnector::new();
        let registry = MountTable::new(dir.path().join("mtab"));
        let Err(err) = mount(&plan, &connector, registry) else {
            panic!("remote hosts must fail");
        };
        assert_eq!(err.exit_code(), exit_code::SYSTEM_ERROR);
        assert!(!dir.path().join("mtab").exists());
    }
}
