//! FUSE session management.
//!
//! Turns bridge arguments into `fuser` mount options, starts the session in
//! the background with a timeout, confirms the mount is live and tears it
//! down again.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use fuser::{BackgroundSession, MountOption};
use thiserror::Error;

use crate::config::MountConfig;
use crate::filesystem::NfsFuse;

/// How long to wait for the kernel to accept the mount.
pub const MOUNT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a dropped handle waits for its session before unmounting lazily.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("FUSE is not available: {0}")]
    Unavailable(&'static str),

    #[error("mount failed: {0}")]
    Mount(#[from] io::Error),

    #[error("mount did not become ready within {0:?}")]
    Timeout(Duration),
}

/// Whether the kernel side of FUSE is present.
pub fn is_available() -> bool {
    #[cfg(target_os = "macos")]
    {
        Path::new("/Library/Filesystems/macfuse.fs").exists()
    }
    #[cfg(target_os = "linux")]
    {
        Path::new("/dev/fuse").exists()
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        false
    }
}

fn unavailable_reason() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "macFUSE is not installed"
    }
    #[cfg(not(target_os = "macos"))]
    {
        "ensure the fuse kernel module is loaded"
    }
}

/// Maps a bridge argument to a `fuser` option.
pub fn to_mount_option(arg: &str) -> MountOption {
    match arg {
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        "dirsync" => MountOption::DirSync,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        other => {
            if let Some(name) = other.strip_prefix("fsname=") {
                MountOption::FSName(name.to_string())
            } else if let Some(name) = other.strip_prefix("subtype=") {
                MountOption::Subtype(name.to_string())
            } else {
                MountOption::CUSTOM(other.to_string())
            }
        }
    }
}

/// Builds the full option list for a session.
///
/// `fsname` and `subtype` come from `config` unless the user supplied them.
pub fn mount_options(bridge_args: &[String], config: &MountConfig) -> Vec<MountOption> {
    let mut options: Vec<MountOption> = bridge_args.iter().map(|a| to_mount_option(a)).collect();
    let has_fsname = options.iter().any(|o| matches!(o, MountOption::FSName(_)));
    let has_subtype = options.iter().any(|o| matches!(o, MountOption::Subtype(_)));
    if !has_fsname && let Some(name) = &config.fsname {
        options.push(MountOption::FSName(name.clone()));
    }
    if !has_subtype {
        options.push(MountOption::Subtype(config.subtype.clone()));
    }
    options
}

/// Whether `path` is the root of a mounted filesystem.
///
/// Compares device IDs with the parent, which needs no mount table access
/// and so cannot block on a hung mount listing.
pub fn is_mounted(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let parent = path.parent().unwrap_or(Path::new("/"));
    match (std::fs::metadata(path), std::fs::metadata(parent)) {
        (Ok(path_meta), Ok(parent_meta)) => path_meta.dev() != parent_meta.dev(),
        _ => false,
    }
}

/// Handle to a mounted FUSE session. Dropping it unmounts.
pub struct FuseMountHandle {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
}

impl FuseMountHandle {
    /// Mounts `fs` at `mountpoint` and waits until the kernel reports it.
    pub fn mount(
        fs: NfsFuse,
        mountpoint: &Path,
        options: &[MountOption],
    ) -> Result<Self, BackendError> {
        if !is_available() {
            return Err(BackendError::Unavailable(unavailable_reason()));
        }
        tracing::info!(mountpoint = %mountpoint.display(), ?options, "starting FUSE session");
        let session = spawn_mount_with_timeout(fs, mountpoint, options, MOUNT_TIMEOUT)?;
        let handle = Self {
            session: Some(session),
            mountpoint: mountpoint.to_path_buf(),
        };
        // On failure the handle's Drop tears the session down.
        wait_for_mount(mountpoint, MOUNT_TIMEOUT)?;
        Ok(handle)
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmounts and waits for the session thread. Blocks while files are
    /// still open on the mount.
    pub fn unmount(mut self) {
        tracing::info!(mountpoint = %self.mountpoint.display(), "unmounting");
        if let Some(session) = self.session.take() {
            session.join();
        }
    }

    /// Lazy unmount through the system tools, for a session that will not
    /// join on its own.
    fn force_unmount(&self) {
        #[cfg(target_os = "macos")]
        let result = std::process::Command::new("umount")
            .arg("-f")
            .arg(&self.mountpoint)
            .output();

        #[cfg(not(target_os = "macos"))]
        let result = std::process::Command::new("fusermount")
            .arg("-uz")
            .arg(&self.mountpoint)
            .output();

        if let Err(e) = result {
            tracing::warn!(mountpoint = %self.mountpoint.display(), error = %e, "force unmount failed");
        }
    }
}

impl Drop for FuseMountHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!(mountpoint = %self.mountpoint.display(), "dropping FUSE session");

            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                session.join();
                let _ = tx.send(());
            });

            if rx.recv_timeout(JOIN_TIMEOUT).is_err() {
                tracing::warn!(
                    timeout = ?JOIN_TIMEOUT,
                    mountpoint = %self.mountpoint.display(),
                    "session did not stop, forcing unmount"
                );
                self.force_unmount();
            }
        }
    }
}

/// Polls until `mountpoint` is live or `timeout` passes.
pub fn wait_for_mount(mountpoint: &Path, timeout: Duration) -> Result<(), BackendError> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if is_mounted(mountpoint) {
            tracing::debug!(mountpoint = %mountpoint.display(), "FUSE mount confirmed active");
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Err(BackendError::Timeout(timeout))
}

/// Runs `spawn_mount2` on its own thread so a mount(2) that hangs on a
/// stale mount point cannot block the caller past `timeout`.
fn spawn_mount_with_timeout(
    fs: NfsFuse,
    mountpoint: &Path,
    options: &[MountOption],
    timeout: Duration,
) -> Result<BackgroundSession, BackendError> {
    let mountpoint = mountpoint.to_path_buf();
    let options = options.to_vec();
    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        let result = fuser::spawn_mount2(fs, &mountpoint, &options);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(session)) => Ok(session),
        Ok(Err(e)) => Err(BackendError::Mount(e)),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(BackendError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(BackendError::Mount(io::Error::other(
            "mount thread exited without a result",
        ))),
    }
}
