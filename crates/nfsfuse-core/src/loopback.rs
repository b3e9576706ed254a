//! Loopback transport: serves a local directory as an export.
//!
//! Targets on `localhost`, `127.0.0.1` or `::1` are served straight from the
//! local filesystem so the whole mount path runs without a server. Handles
//! are the object's `(dev, ino)` pair. Every name an object was seen under is
//! recorded; a handle none of whose names still lead to the same pair is
//! reported stale, as a server would.

use std::ffi::{OsStr, OsString};
use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{
    DirBuilderExt, FileExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt,
};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use filetime::FileTime;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::AccessFlags;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::attr::{AttrValid, Attributes, FileKind, Fsid, SetAttributes, SetTime};
use crate::client::{
    AccessMask, AccessReply, CreateHow, DirEntry, EntryReply, FsStat, LinkReply, MountReply,
    NfsStatus, ReadDirReply, ReadReply, ReadlinkReply, RenameReply, RpcConnector, RpcError,
    RpcResult, RpcSession, WccReply, WriteReply,
};
use crate::fh::FileHandle;

/// Hosts the loopback transport serves.
pub const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]"];

pub fn is_local_host(host: &str) -> bool {
    LOCAL_HOSTS.contains(&host)
}

/// Connector for local exports.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackConnector;

impl LoopbackConnector {
    pub fn new() -> Self {
        Self
    }
}

impl RpcConnector for LoopbackConnector {
    fn init_context(&self) -> RpcResult<Box<dyn RpcSession>> {
        Ok(Box::new(LoopbackSession::default()))
    }
}

type ObjectKey = (u64, u64);

/// A session over one local directory tree.
#[derive(Debug, Default)]
pub struct LoopbackSession {
    root: RwLock<Option<PathBuf>>,
    /// Known names of each object; more than one for hard links.
    paths: DashMap<ObjectKey, Vec<PathBuf>>,
}

fn io_err(e: io::Error) -> RpcError {
    RpcError::Status(NfsStatus::from_io_error(&e))
}

fn nix_err(e: nix::Error) -> RpcError {
    io_err(io::Error::from(e))
}

fn key_of(meta: &fs::Metadata) -> ObjectKey {
    (meta.dev(), meta.ino())
}

fn encode(key: ObjectKey) -> FileHandle {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&key.0.to_be_bytes());
    bytes[8..].copy_from_slice(&key.1.to_be_bytes());
    FileHandle::from_array(bytes)
}

fn decode(fh: &FileHandle) -> RpcResult<ObjectKey> {
    let b = fh.as_bytes();
    if b.len() != 16 {
        return Err(NfsStatus::BadHandle.into());
    }
    let mut dev = [0u8; 8];
    let mut ino = [0u8; 8];
    dev.copy_from_slice(&b[..8]);
    ino.copy_from_slice(&b[8..]);
    Ok((u64::from_be_bytes(dev), u64::from_be_bytes(ino)))
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = u32::try_from(nsecs).unwrap_or(0);
    match u64::try_from(secs) {
        Ok(s) => UNIX_EPOCH + Duration::new(s, nanos),
        Err(_) => UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()),
    }
}

fn kind_of(ft: fs::FileType) -> FileKind {
    if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else if ft.is_block_device() {
        FileKind::BlockDevice
    } else if ft.is_char_device() {
        FileKind::CharDevice
    } else if ft.is_fifo() {
        FileKind::NamedPipe
    } else if ft.is_socket() {
        FileKind::Socket
    } else {
        FileKind::Regular
    }
}

fn attrs_of(meta: &fs::Metadata) -> Attributes {
    Attributes {
        valid: AttrValid::FATTR_V3,
        kind: kind_of(meta.file_type()),
        mode: meta.mode() & 0o7777,
        nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev(),
        size: meta.size(),
        used: meta.blocks() * 512,
        fsid: Fsid {
            major: meta.dev(),
            minor: 0,
        },
        fileid: meta.ino(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        ..Attributes::default()
    }
}

/// Rejects names that would escape their directory.
fn check_name(name: &OsStr) -> RpcResult<()> {
    if name.len() > 255 {
        return Err(NfsStatus::NameTooLong.into());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(n)), None) if n == name => Ok(()),
        _ => Err(NfsStatus::Inval.into()),
    }
}

impl LoopbackSession {
    fn root(&self) -> RpcResult<PathBuf> {
        self.root
            .read()
            .clone()
            .ok_or(RpcError::Status(NfsStatus::Stale))
    }

    fn register(&self, path: &Path) -> RpcResult<(FileHandle, Attributes)> {
        let meta = fs::symlink_metadata(path).map_err(io_err)?;
        let key = key_of(&meta);
        let mut names = self.paths.entry(key).or_default();
        if !names.iter().any(|p| p == path) {
            names.push(path.to_path_buf());
        }
        drop(names);
        Ok((encode(key), attrs_of(&meta)))
    }

    /// A path for `fh`, verified to still name the same object.
    ///
    /// Names that no longer lead to the object are dropped on the way.
    fn path_of(&self, fh: &FileHandle) -> RpcResult<PathBuf> {
        let key = decode(fh)?;
        let mut names = self
            .paths
            .get_mut(&key)
            .ok_or(RpcError::Status(NfsStatus::Stale))?;
        names.retain(|path| {
            let live = fs::symlink_metadata(path).is_ok_and(|meta| key_of(&meta) == key);
            if !live {
                trace!(path = %path.display(), "name no longer leads to its handle");
            }
            live
        });
        let live = names.first().cloned();
        drop(names);
        live.ok_or(RpcError::Status(NfsStatus::Stale))
    }

    fn attrs_at(&self, path: &Path) -> Option<Attributes> {
        fs::symlink_metadata(path).ok().map(|m| attrs_of(&m))
    }

    fn child(&self, dir: &FileHandle, name: &OsStr) -> RpcResult<(PathBuf, PathBuf)> {
        check_name(name)?;
        let dir_path = self.path_of(dir)?;
        let path = dir_path.join(name);
        Ok((dir_path, path))
    }

    fn entry(&self, dir_path: &Path, path: &Path) -> RpcResult<EntryReply> {
        let (fh, attrs) = self.register(path)?;
        Ok(EntryReply {
            fh,
            attrs: Some(attrs),
            dir_attrs: self.attrs_at(dir_path),
        })
    }

    /// Drops `path` after the name was removed. Objects left without a
    /// known name are forgotten.
    fn forget_path(&self, path: &Path) {
        self.paths.retain(|_, names| {
            names.retain(|p| p != path);
            !names.is_empty()
        });
    }

    /// Rewrites recorded paths under `from` after a rename.
    fn rebase(&self, from: &Path, to: &Path) {
        for mut entry in self.paths.iter_mut() {
            for name in entry.value_mut().iter_mut() {
                if let Ok(rest) = name.strip_prefix(from) {
                    let moved = to.join(rest);
                    *name = moved;
                }
            }
        }
    }
}

impl RpcSession for LoopbackSession {
    fn select_version(&self, version: u32) -> RpcResult<()> {
        match version {
            3 | 4 => Ok(()),
            _ => Err(NfsStatus::NotSupp.into()),
        }
    }

    fn mount(&self, host: &str, export: &str) -> RpcResult<MountReply> {
        if !is_local_host(host) {
            return Err(RpcError::Transport(format!(
                "cannot reach {host}: only local exports are served"
            )));
        }
        let root = fs::canonicalize(export).map_err(io_err)?;
        let meta = fs::metadata(&root).map_err(io_err)?;
        if !meta.is_dir() {
            return Err(NfsStatus::NotDir.into());
        }
        debug!(root = %root.display(), "serving local export");
        let (fh, attrs) = self.register(&root)?;
        *self.root.write() = Some(root);
        Ok(MountReply {
            root_fh: fh.as_bytes().to_vec(),
            attrs,
        })
    }

    fn destroy(&self) {
        self.paths.clear();
        *self.root.write() = None;
    }

    fn getattr(&self, fh: &FileHandle) -> RpcResult<Attributes> {
        let path = self.path_of(fh)?;
        fs::symlink_metadata(&path).map(|m| attrs_of(&m)).map_err(io_err)
    }

    fn setattr(&self, fh: &FileHandle, changes: &SetAttributes) -> RpcResult<Option<Attributes>> {
        let path = self.path_of(fh)?;
        if let Some(mode) = changes.mode {
            fs::set_permissions(&path, Permissions::from_mode(mode & 0o7777)).map_err(io_err)?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            std::os::unix::fs::lchown(&path, changes.uid, changes.gid).map_err(io_err)?;
        }
        if let Some(size) = changes.size {
            OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|f| f.set_len(size))
                .map_err(io_err)?;
        }
        let to_filetime = |t: SetTime| match t {
            SetTime::ServerCurrent => FileTime::now(),
            SetTime::ClientTime(t) => FileTime::from_system_time(t),
        };
        match (changes.atime, changes.mtime) {
            (Some(a), Some(m)) => {
                filetime::set_symlink_file_times(&path, to_filetime(a), to_filetime(m))
                    .map_err(io_err)?;
            }
            (Some(a), None) => filetime::set_file_atime(&path, to_filetime(a)).map_err(io_err)?,
            (None, Some(m)) => filetime::set_file_mtime(&path, to_filetime(m)).map_err(io_err)?,
            (None, None) => {}
        }
        Ok(self.attrs_at(&path))
    }

    fn lookup(&self, dir: &FileHandle, name: &OsStr) -> RpcResult<EntryReply> {
        let dir_path = self.path_of(dir)?;
        let path = if name == "." {
            dir_path.clone()
        } else if name == ".." {
            let root = self.root()?;
            if dir_path == root {
                root
            } else {
                dir_path.parent().map_or(root, Path::to_path_buf)
            }
        } else {
            check_name(name)?;
            dir_path.join(name)
        };
        self.entry(&dir_path, &path)
    }

    fn access(&self, fh: &FileHandle, mask: AccessMask) -> RpcResult<AccessReply> {
        let path = self.path_of(fh)?;
        let mut granted = AccessMask::empty();
        let checks = [
            (AccessMask::READ, AccessFlags::R_OK),
            (AccessMask::LOOKUP | AccessMask::EXECUTE, AccessFlags::X_OK),
            (
                AccessMask::MODIFY | AccessMask::EXTEND | AccessMask::DELETE,
                AccessFlags::W_OK,
            ),
        ];
        for (bits, flag) in checks {
            if mask.intersects(bits) && nix::unistd::access(&path, flag).is_ok() {
                granted |= bits & mask;
            }
        }
        Ok(AccessReply {
            granted,
            attrs: self.attrs_at(&path),
        })
    }

    fn readlink(&self, fh: &FileHandle) -> RpcResult<ReadlinkReply> {
        let path = self.path_of(fh)?;
        let target = fs::read_link(&path).map_err(io_err)?;
        Ok(ReadlinkReply {
            target,
            attrs: self.attrs_at(&path),
        })
    }

    fn read(&self, fh: &FileHandle, offset: u64, count: u32) -> RpcResult<ReadReply> {
        let path = self.path_of(fh)?;
        let file = File::open(&path).map_err(io_err)?;
        let mut buf = vec![0u8; count as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(io_err(e)),
            }
        }
        buf.truncate(filled);
        let attrs = file.metadata().ok().map(|m| attrs_of(&m));
        let eof = attrs
            .as_ref()
            .is_none_or(|a| offset + filled as u64 >= a.size);
        Ok(ReadReply {
            data: buf,
            eof,
            attrs,
        })
    }

    fn write(&self, fh: &FileHandle, offset: u64, data: &[u8]) -> RpcResult<WriteReply> {
        let path = self.path_of(fh)?;
        let file = OpenOptions::new().write(true).open(&path).map_err(io_err)?;
        file.write_all_at(data, offset).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        Ok(WriteReply {
            count: u32::try_from(data.len()).map_err(|_| RpcError::Status(NfsStatus::Inval))?,
            attrs: file.metadata().ok().map(|m| attrs_of(&m)),
        })
    }

    fn create(
        &self,
        dir: &FileHandle,
        name: &OsStr,
        mode: u32,
        how: CreateHow,
    ) -> RpcResult<EntryReply> {
        let (dir_path, path) = self.child(dir, name)?;
        let mut options = OpenOptions::new();
        options.write(true).mode(mode & 0o7777);
        match how {
            CreateHow::Guarded => options.create_new(true),
            CreateHow::Unchecked => options.create(true),
        };
        options.open(&path).map_err(io_err)?;
        self.entry(&dir_path, &path)
    }

    fn mkdir(&self, dir: &FileHandle, name: &OsStr, mode: u32) -> RpcResult<EntryReply> {
        let (dir_path, path) = self.child(dir, name)?;
        fs::DirBuilder::new()
            .mode(mode & 0o7777)
            .create(&path)
            .map_err(io_err)?;
        self.entry(&dir_path, &path)
    }

    fn symlink(&self, dir: &FileHandle, name: &OsStr, target: &Path) -> RpcResult<EntryReply> {
        let (dir_path, path) = self.child(dir, name)?;
        std::os::unix::fs::symlink(target, &path).map_err(io_err)?;
        self.entry(&dir_path, &path)
    }

    fn mknod(
        &self,
        dir: &FileHandle,
        name: &OsStr,
        kind: FileKind,
        mode: u32,
        rdev: u64,
    ) -> RpcResult<EntryReply> {
        let (dir_path, path) = self.child(dir, name)?;
        let sflag = match kind {
            FileKind::NamedPipe => SFlag::S_IFIFO,
            FileKind::CharDevice => SFlag::S_IFCHR,
            FileKind::BlockDevice => SFlag::S_IFBLK,
            FileKind::Socket => SFlag::S_IFSOCK,
            FileKind::Regular => SFlag::S_IFREG,
            FileKind::Directory | FileKind::Symlink => return Err(NfsStatus::BadType.into()),
        };
        #[allow(clippy::cast_possible_truncation, clippy::unnecessary_cast)]
        let (perm, dev) = (
            Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t),
            rdev as libc::dev_t,
        );
        nix::sys::stat::mknod(&path, sflag, perm, dev).map_err(nix_err)?;
        self.entry(&dir_path, &path)
    }

    fn remove(&self, dir: &FileHandle, name: &OsStr) -> RpcResult<WccReply> {
        let (dir_path, path) = self.child(dir, name)?;
        fs::remove_file(&path).map_err(io_err)?;
        self.forget_path(&path);
        Ok(WccReply {
            dir_attrs: self.attrs_at(&dir_path),
        })
    }

    fn rmdir(&self, dir: &FileHandle, name: &OsStr) -> RpcResult<WccReply> {
        let (dir_path, path) = self.child(dir, name)?;
        fs::remove_dir(&path).map_err(io_err)?;
        self.forget_path(&path);
        Ok(WccReply {
            dir_attrs: self.attrs_at(&dir_path),
        })
    }

    fn rename(
        &self,
        from_dir: &FileHandle,
        from_name: &OsStr,
        to_dir: &FileHandle,
        to_name: &OsStr,
    ) -> RpcResult<RenameReply> {
        let (from_dir_path, from) = self.child(from_dir, from_name)?;
        let (to_dir_path, to) = self.child(to_dir, to_name)?;
        fs::rename(&from, &to).map_err(io_err)?;
        if from != to {
            // Whatever `to` named before is gone under that name.
            self.forget_path(&to);
            self.rebase(&from, &to);
        }
        Ok(RenameReply {
            from_dir_attrs: self.attrs_at(&from_dir_path),
            to_dir_attrs: self.attrs_at(&to_dir_path),
        })
    }

    fn link(&self, fh: &FileHandle, dir: &FileHandle, name: &OsStr) -> RpcResult<LinkReply> {
        let source = self.path_of(fh)?;
        let (dir_path, path) = self.child(dir, name)?;
        fs::hard_link(&source, &path).map_err(io_err)?;
        let (_, attrs) = self.register(&path)?;
        Ok(LinkReply {
            attrs: Some(attrs),
            dir_attrs: self.attrs_at(&dir_path),
        })
    }

    fn readdir(
        &self,
        dir: &FileHandle,
        cookie: u64,
        _cookieverf: u64,
        max_entries: u32,
    ) -> RpcResult<ReadDirReply> {
        let dir_path = self.path_of(dir)?;
        let mut names: Vec<OsString> = fs::read_dir(&dir_path)
            .map_err(io_err)?
            .filter_map(|e| e.ok().map(|e| e.file_name()))
            .collect();
        names.sort();

        let skip = usize::try_from(cookie).map_err(|_| RpcError::Status(NfsStatus::BadCookie))?;
        let mut entries = Vec::new();
        for (i, name) in names.iter().enumerate().skip(skip) {
            if entries.len() >= max_entries as usize {
                break;
            }
            // Entries can vanish between listing and stat.
            let Ok((fh, attrs)) = self.register(&dir_path.join(name)) else {
                continue;
            };
            entries.push(DirEntry {
                fileid: attrs.fileid,
                name: name.clone(),
                cookie: i as u64 + 1,
                fh: Some(fh),
                attrs: Some(attrs),
            });
        }
        let last = entries.last().map_or(skip as u64, |e| e.cookie);
        Ok(ReadDirReply {
            eof: last as usize >= names.len(),
            entries,
            cookieverf: 0,
            dir_attrs: self.attrs_at(&dir_path),
        })
    }

    fn fsstat(&self, fh: &FileHandle) -> RpcResult<FsStat> {
        let path = self.path_of(fh)?;
        let stat = nix::sys::statvfs::statvfs(&path).map_err(nix_err)?;
        #[allow(clippy::unnecessary_cast)]
        let frsize = stat.fragment_size() as u64;
        Ok(FsStat {
            total_bytes: u64::from(stat.blocks()) * frsize,
            free_bytes: u64::from(stat.blocks_free()) * frsize,
            avail_bytes: u64::from(stat.blocks_available()) * frsize,
            total_files: u64::from(stat.files()),
            free_files: u64::from(stat.files_free()),
            avail_files: u64::from(stat.files_available()),
            block_size: u32::try_from(frsize).unwrap_or(4096),
            name_max: u32::try_from(stat.name_max()).unwrap_or(255),
        })
    }
}
