//! RPC client collaborator interface.
//!
//! The wire encoding of NFS lives behind these traits. A [`RpcConnector`]
//! allocates sessions and owns the legacy (pre-v4) mount protocol; a
//! [`RpcSession`] is one established client context whose methods map 1:1
//! onto protocol procedures.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use crate::attr::{Attributes, FileKind, SetAttributes};
use crate::config::CoreConfig;
use crate::fh::FileHandle;
use crate::handshake::{self, HandshakeError, MountRequest, MountState};
use crate::icache::InodeCache;

/// Protocol status codes a server can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NfsStatus {
    Perm,
    NoEnt,
    Io,
    Nxio,
    Access,
    Exist,
    Xdev,
    NoDev,
    NotDir,
    IsDir,
    Inval,
    FBig,
    NoSpc,
    Rofs,
    Mlink,
    NameTooLong,
    NotEmpty,
    Dquot,
    Stale,
    Remote,
    BadHandle,
    NotSync,
    BadCookie,
    NotSupp,
    TooSmall,
    ServerFault,
    BadType,
    Jukebox,
    NoXattr,
    Other(u32),
}

impl NfsStatus {
    /// Maps the status to the errno the kernel expects.
    pub fn to_errno(self) -> i32 {
        match self {
            Self::Perm => libc::EPERM,
            Self::NoEnt => libc::ENOENT,
            Self::Io | Self::ServerFault | Self::Other(_) => libc::EIO,
            Self::Nxio => libc::ENXIO,
            Self::Access => libc::EACCES,
            Self::Exist => libc::EEXIST,
            Self::Xdev => libc::EXDEV,
            Self::NoDev => libc::ENODEV,
            Self::NotDir => libc::ENOTDIR,
            Self::IsDir => libc::EISDIR,
            Self::Inval | Self::BadType => libc::EINVAL,
            Self::FBig => libc::EFBIG,
            Self::NoSpc => libc::ENOSPC,
            Self::Rofs => libc::EROFS,
            Self::Mlink => libc::EMLINK,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Dquot => libc::EDQUOT,
            Self::Stale | Self::BadHandle => libc::ESTALE,
            Self::Remote => libc::EREMOTE,
            Self::NotSync | Self::BadCookie | Self::NotSupp | Self::TooSmall => libc::ENOTSUP,
            Self::Jukebox => libc::EAGAIN,
            Self::NoXattr => libc::ENODATA,
        }
    }

    /// Best-effort status for a local I/O error.
    pub fn from_io_error(e: &io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::EPERM) => Self::Perm,
            Some(libc::ENOENT) => Self::NoEnt,
            Some(libc::ENXIO) => Self::Nxio,
            Some(libc::EACCES) => Self::Access,
            Some(libc::EEXIST) => Self::Exist,
            Some(libc::EXDEV) => Self::Xdev,
            Some(libc::ENODEV) => Self::NoDev,
            Some(libc::ENOTDIR) => Self::NotDir,
            Some(libc::EISDIR) => Self::IsDir,
            Some(libc::EINVAL) => Self::Inval,
            Some(libc::EFBIG) => Self::FBig,
            Some(libc::ENOSPC) => Self::NoSpc,
            Some(libc::EROFS) => Self::Rofs,
            Some(libc::EMLINK) => Self::Mlink,
            Some(libc::ENAMETOOLONG) => Self::NameTooLong,
            Some(libc::ENOTEMPTY) => Self::NotEmpty,
            Some(libc::EDQUOT) => Self::Dquot,
            Some(libc::ESTALE) => Self::Stale,
            Some(libc::ENOTSUP) => Self::NotSupp,
            Some(libc::EAGAIN) => Self::Jukebox,
            Some(libc::ENODATA) => Self::NoXattr,
            Some(_) => Self::Io,
            None => match e.kind() {
                io::ErrorKind::NotFound => Self::NoEnt,
                io::ErrorKind::PermissionDenied => Self::Access,
                io::ErrorKind::AlreadyExists => Self::Exist,
                io::ErrorKind::InvalidInput => Self::Inval,
                _ => Self::Io,
            },
        }
    }

    /// The object behind the handle no longer exists on the server.
    pub fn is_gone(self) -> bool {
        matches!(self, Self::NoEnt | Self::Stale | Self::BadHandle)
    }
}

/// Failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The call never got a reply: connection, timeout, local resources.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server replied with a non-OK status.
    #[error("server returned {0:?}")]
    Status(NfsStatus),
}

impl RpcError {
    pub fn status(&self) -> Option<NfsStatus> {
        match self {
            Self::Status(s) => Some(*s),
            Self::Transport(_) => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Status(s) => s.to_errno(),
            Self::Transport(_) => libc::EIO,
        }
    }
}

impl From<NfsStatus> for RpcError {
    fn from(s: NfsStatus) -> Self {
        Self::Status(s)
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

bitflags! {
    /// ACCESS procedure permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessMask: u32 {
        const READ = 0x01;
        const LOOKUP = 0x02;
        const MODIFY = 0x04;
        const EXTEND = 0x08;
        const DELETE = 0x10;
        const EXECUTE = 0x20;
    }
}

/// Reply to the MOUNT exchange: the raw root handle and its attributes.
///
/// The handle is left as bytes; bounding it is the handshake's job.
#[derive(Debug, Clone)]
pub struct MountReply {
    pub root_fh: Vec<u8>,
    pub attrs: Attributes,
}

/// Reply of procedures that yield a (possibly new) child object.
#[derive(Debug, Clone)]
pub struct EntryReply {
    pub fh: FileHandle,
    pub attrs: Option<Attributes>,
    pub dir_attrs: Option<Attributes>,
}

/// Post-operation attributes of the directory a procedure modified.
#[derive(Debug, Clone, Default)]
pub struct WccReply {
    pub dir_attrs: Option<Attributes>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkReply {
    pub attrs: Option<Attributes>,
    pub dir_attrs: Option<Attributes>,
}

#[derive(Debug, Clone, Default)]
pub struct RenameReply {
    pub from_dir_attrs: Option<Attributes>,
    pub to_dir_attrs: Option<Attributes>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadReply {
    pub data: Vec<u8>,
    pub eof: bool,
    pub attrs: Option<Attributes>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteReply {
    pub count: u32,
    pub attrs: Option<Attributes>,
}

#[derive(Debug, Clone, Default)]
pub struct AccessReply {
    pub granted: AccessMask,
    pub attrs: Option<Attributes>,
}

#[derive(Debug, Clone)]
pub struct ReadlinkReply {
    pub target: PathBuf,
    pub attrs: Option<Attributes>,
}

/// One READDIRPLUS entry. Handle and attributes are optional on the wire.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub fileid: u64,
    pub name: OsString,
    pub cookie: u64,
    pub fh: Option<FileHandle>,
    pub attrs: Option<Attributes>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadDirReply {
    pub entries: Vec<DirEntry>,
    pub cookieverf: u64,
    pub eof: bool,
    pub dir_attrs: Option<Attributes>,
}

/// FSSTAT reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStat {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub avail_files: u64,
    pub block_size: u32,
    pub name_max: u32,
}

/// Exclusivity of CREATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateHow {
    Unchecked,
    Guarded,
}

/// An established client context.
///
/// Sessions are shared across dispatcher threads; implementations provide
/// their own interior synchronization.
pub trait RpcSession: Send + Sync {
    /// Negotiates the protocol major version.
    fn select_version(&self, version: u32) -> RpcResult<()>;

    /// Attaches to `export` on `host` and returns the root handle.
    fn mount(&self, host: &str, export: &str) -> RpcResult<MountReply>;

    /// Releases the context. Called exactly once per session.
    fn destroy(&self);

    fn getattr(&self, fh: &FileHandle) -> RpcResult<Attributes>;

    fn setattr(&self, fh: &FileHandle, changes: &SetAttributes) -> RpcResult<Option<Attributes>>;

    fn lookup(&self, dir: &FileHandle, name: &OsStr) -> RpcResult<EntryReply>;

    fn access(&self, fh: &FileHandle, mask: AccessMask) -> RpcResult<AccessReply>;

    fn readlink(&self, fh: &FileHandle) -> RpcResult<ReadlinkReply>;

    fn read(&self, fh: &FileHandle, offset: u64, count: u32) -> RpcResult<ReadReply>;

    /// Writes with FILE_SYNC stability.
    fn write(&self, fh: &FileHandle, offset: u64, data: &[u8]) -> RpcResult<WriteReply>;

    fn create(
        &self,
        dir: &FileHandle,
        name: &OsStr,
        mode: u32,
        how: CreateHow,
    ) -> RpcResult<EntryReply>;

    fn mkdir(&self, dir: &FileHandle, name: &OsStr, mode: u32) -> RpcResult<EntryReply>;

    fn symlink(&self, dir: &FileHandle, name: &OsStr, target: &Path) -> RpcResult<EntryReply>;

    fn mknod(
        &self,
        dir: &FileHandle,
        name: &OsStr,
        kind: FileKind,
        mode: u32,
        rdev: u64,
    ) -> RpcResult<EntryReply>;

    fn remove(&self, dir: &FileHandle, name: &OsStr) -> RpcResult<WccReply>;

    fn rmdir(&self, dir: &FileHandle, name: &OsStr) -> RpcResult<WccReply>;

    fn rename(
        &self,
        from_dir: &FileHandle,
        from_name: &OsStr,
        to_dir: &FileHandle,
        to_name: &OsStr,
    ) -> RpcResult<RenameReply>;

    fn link(&self, fh: &FileHandle, dir: &FileHandle, name: &OsStr) -> RpcResult<LinkReply>;

    /// READDIRPLUS starting after `cookie`, returning at most `max_entries`.
    ///
    /// `.` and `..` are not part of the reply.
    fn readdir(
        &self,
        dir: &FileHandle,
        cookie: u64,
        cookieverf: u64,
        max_entries: u32,
    ) -> RpcResult<ReadDirReply>;

    fn fsstat(&self, fh: &FileHandle) -> RpcResult<FsStat>;

    fn getxattr(&self, _fh: &FileHandle, _name: &OsStr) -> RpcResult<Vec<u8>> {
        Err(RpcError::Status(NfsStatus::NotSupp))
    }

    fn setxattr(&self, _fh: &FileHandle, _name: &OsStr, _value: &[u8], _flags: i32) -> RpcResult<()> {
        Err(RpcError::Status(NfsStatus::NotSupp))
    }

    fn listxattr(&self, _fh: &FileHandle) -> RpcResult<Vec<OsString>> {
        Err(RpcError::Status(NfsStatus::NotSupp))
    }

    fn removexattr(&self, _fh: &FileHandle, _name: &OsStr) -> RpcResult<()> {
        Err(RpcError::Status(NfsStatus::NotSupp))
    }
}

/// Allocates sessions and owns the pre-v4 mount protocol.
pub trait RpcConnector: Send + Sync {
    /// Allocates a fresh, unversioned client context.
    fn init_context(&self) -> RpcResult<Box<dyn RpcSession>>;

    /// Full handshake for protocol versions other than 4.
    ///
    /// The default runs the shared establishment sequence with the requested
    /// version and records the result as a legacy mount.
    fn legacy_mount(
        &self,
        request: &MountRequest,
        config: &CoreConfig,
        cache: &Arc<InodeCache>,
    ) -> Result<MountState, HandshakeError> {
        handshake::establish(self, request, config, cache, handshake::MountedProtocol::Legacy)
    }

    /// Protocol-level unmount for legacy mounts.
    fn legacy_unmount(&self, state: &MountState) -> RpcResult<()> {
        state.session.destroy();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_errno_mapping() {
        assert_eq!(NfsStatus::NoEnt.to_errno(), libc::ENOENT);
        assert_eq!(NfsStatus::Stale.to_errno(), libc::ESTALE);
        assert_eq!(NfsStatus::NotSupp.to_errno(), libc::ENOTSUP);
        assert_eq!(RpcError::Transport("down".into()).to_errno(), libc::EIO);
    }

    #[test]
    fn test_status_from_io_error() {
        let e = io::Error::from_raw_os_error(libc::ENOTEMPTY);
        assert_eq!(NfsStatus::from_io_error(&e), NfsStatus::NotEmpty);
        let e = io::Error::other("boom");
        assert_eq!(NfsStatus::from_io_error(&e), NfsStatus::Io);
    }

    #[test]
    fn test_gone_statuses() {
        assert!(NfsStatus::NoEnt.is_gone());
        assert!(NfsStatus::Stale.is_gone());
        assert!(!NfsStatus::Access.is_gone());
    }
}
