//! FUSE filesystem over the NFS dispatch surface.
//!
//! [`NfsFuse`] is a thin translation layer: kernel requests become
//! [`Dispatcher`] calls, attribute snapshots become [`FileAttr`]s and errors
//! become errnos. Caching, staleness and generation ordering all live in the
//! core; the only state held here is the kernel's lookup counts.
//!
//! ## Directory offsets
//!
//! FUSE offsets are resume points. `.` and `..` are synthesized at offsets 1
//! and 2, and a remote entry with cookie `c` is reported at offset `c + 2`,
//! so the kernel hands back exactly what the server needs to continue.
//!
//! ## File handles
//!
//! The protocol is stateless, so `open`/`opendir` return file handle 0 and
//! every data operation works from the inode alone.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use nfsfuse_core::client::FsStat;
use nfsfuse_core::{
    AccessMask, Attributes, DirItem, Dispatcher, FileKind, NfsError, SetAttributes, SetTime,
};
use tracing::{debug, info, trace, warn};

use crate::config::MountConfig;
use crate::error::{FuseError, FuseResult};
use crate::inode::LookupCounts;

/// Preferred I/O size reported in `st_blksize`.
pub const BLOCK_SIZE: u32 = 4096;

/// Entries requested from the server per READDIR call.
const READDIR_BATCH: u32 = 128;

/// Offset of the first remote entry relative to its cookie.
const DOT_ENTRIES: u64 = 2;

/// `d_ino` for listed entries that have no inode yet, as libfuse reports.
pub const UNKNOWN_INO: u64 = 0xffff_ffff;

/// Inode reported for a plain `readdir` entry. Remote file ids live in
/// another number space and are never used here.
fn listed_ino(item: &DirItem) -> u64 {
    item.ino.unwrap_or(UNKNOWN_INO)
}

/// FUSE adapter for an NFS mount.
pub struct NfsFuse {
    dispatcher: Dispatcher,
    config: MountConfig,
    lookups: LookupCounts,
}

impl NfsFuse {
    pub fn new(dispatcher: Dispatcher, config: MountConfig) -> Self {
        Self {
            dispatcher,
            config,
            lookups: LookupCounts::new(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn lookup_counts(&self) -> &LookupCounts {
        &self.lookups
    }

    /// Translates an error and logs it at the level its kind deserves.
    fn errno(op: &'static str, ino: u64, err: &NfsError) -> c_int {
        match err {
            NfsError::NotFound => trace!(op, inode = ino, "not found"),
            NfsError::StaleHandle(_) => warn!(op, inode = ino, "stale file handle"),
            other => debug!(op, inode = ino, error = %other, "operation failed"),
        }
        err.to_errno()
    }

    /// Builds the kernel attribute for an inode and records the reference.
    fn entry_reply(&self, ino: u64, attrs: &Attributes, reply: ReplyEntry) {
        self.lookups.inc(ino);
        reply.entry(&self.config.entry_ttl, &to_file_attr(ino, attrs), 0);
    }

    fn forget_node(&self, ino: u64, nlookup: u64) {
        if self.lookups.forget(ino, nlookup) {
            self.dispatcher.release_node(ino);
        }
    }

    /// Hands one listed entry to `add` with a live inode.
    ///
    /// An entry the kernel accepted takes a lookup reference. One that did
    /// not fit is released again unless the kernel already knows it.
    /// Returns true when the reply is full.
    fn plus_entry(
        &self,
        parent: u64,
        item: &DirItem,
        add: impl FnOnce(u64, &Attributes) -> bool,
    ) -> bool {
        let Ok(entry) = self.dispatcher.adopt(parent, item) else {
            // Vanished between READDIR and LOOKUP.
            return false;
        };
        let full = add(entry.ino, &entry.attrs);
        if !full {
            self.lookups.inc(entry.ino);
        } else if self.lookups.get(entry.ino) == 0 {
            self.dispatcher.release_node(entry.ino);
        }
        full
    }

    fn readdir_pages(
        &self,
        ino: u64,
        offset: i64,
        mut emit: impl FnMut(&DirItem, i64) -> bool,
        mut emit_dot: impl FnMut(&'static str, i64) -> bool,
    ) -> FuseResult<()> {
        let offset = u64::try_from(offset).map_err(|_| FuseError::InvalidOffset(offset))?;
        if offset < 1 && emit_dot(".", 1) {
            return Ok(());
        }
        if offset < 2 && emit_dot("..", 2) {
            return Ok(());
        }

        let mut cookie = offset.saturating_sub(DOT_ENTRIES);
        loop {
            let page = self.dispatcher.readdir(ino, cookie, READDIR_BATCH)?;
            let last = page.items.last().map(|i| i.cookie);
            for item in &page.items {
                let next = dir_offset(item.cookie)?;
                if emit(item, next) {
                    return Ok(());
                }
            }
            match last {
                Some(c) if !page.eof => cookie = c,
                _ => return Ok(()),
            }
        }
    }
}

impl Filesystem for NfsFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        info!(root = self.dispatcher.root_ino(), "FUSE filesystem initialized");
        // Enable async reads for better performance with concurrent readers
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        Ok(())
    }

    fn destroy(&mut self) {
        info!(nodes = self.dispatcher.cache().len(), "FUSE filesystem destroyed");
    }

    /// Look up a directory entry by name.
    ///
    /// # FUSE Spec
    ///
    /// A successful reply increments the inode's lookup count; the kernel
    /// returns it through `forget`.
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.dispatcher.lookup(parent, name) {
            Ok(entry) => self.entry_reply(entry.ino, &entry.attrs, reply),
            Err(e) => reply.error(Self::errno("lookup", parent, &e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.forget_node(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        trace!(count = nodes.len(), "batch_forget");
        for node in nodes {
            self.forget_node(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.dispatcher.getattr(ino) {
            Ok(attrs) => reply.attr(&self.config.attr_ttl, &to_file_attr(ino, &attrs)),
            Err(e) => reply.error(Self::errno("getattr", ino, &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttributes {
            mode: mode.map(|m| m & 0o7777),
            uid,
            gid,
            size,
            atime: atime.map(to_set_time),
            mtime: mtime.map(to_set_time),
        };
        match self.dispatcher.setattr(ino, &changes) {
            Ok(attrs) => reply.attr(&self.config.attr_ttl, &to_file_attr(ino, &attrs)),
            Err(e) => reply.error(Self::errno("setattr", ino, &e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.dispatcher.readlink(ino) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(Self::errno("readlink", ino, &e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        match self.dispatcher.mknod(parent, name, mode, u64::from(rdev)) {
            Ok(entry) => self.entry_reply(entry.ino, &entry.attrs, reply),
            Err(e) => reply.error(Self::errno("mknod", parent, &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.dispatcher.mkdir(parent, name, mode & 0o7777) {
            Ok(entry) => self.entry_reply(entry.ino, &entry.attrs, reply),
            Err(e) => reply.error(Self::errno("mkdir", parent, &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.dispatcher.unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::errno("unlink", parent, &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.dispatcher.rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::errno("rmdir", parent, &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        match self.dispatcher.symlink(parent, link_name, target) {
            Ok(entry) => self.entry_reply(entry.ino, &entry.attrs, reply),
            Err(e) => reply.error(Self::errno("symlink", parent, &e)),
        }
    }

    /// Rename an entry.
    ///
    /// # FUSE Spec
    ///
    /// `RENAME_NOREPLACE` and `RENAME_EXCHANGE` arrive in `flags`. The remote
    /// RENAME cannot honour either atomically, so both are refused.
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            debug!(flags, "rename flags not supported");
            reply.error(libc::EINVAL);
            return;
        }
        match self.dispatcher.rename(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::errno("rename", parent, &e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        match self.dispatcher.link(ino, newparent, newname) {
            Ok(entry) => self.entry_reply(entry.ino, &entry.attrs, reply),
            Err(e) => reply.error(Self::errno("link", ino, &e)),
        }
    }

    /// Open a file.
    ///
    /// Revalidates attributes (close-to-open). When the file is unchanged
    /// since it was last seen the kernel may keep its page cache.
    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.dispatcher.open(ino) {
            Ok(outcome) => {
                let flags = if outcome.keep_cache {
                    fuser::consts::FOPEN_KEEP_CACHE
                } else {
                    0
                };
                reply.opened(0, flags);
            }
            Err(e) => reply.error(Self::errno("open", ino, &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.read(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(Self::errno("read", ino, &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.write(ino, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(Self::errno("write", ino, &e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    /// Writes are committed before they are acknowledged, so there is
    /// nothing left to sync.
    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.dispatcher.getattr(ino) {
            Ok(attrs) if attrs.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(Self::errno("opendir", ino, &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, offset, "readdir");
        // No parent links are kept, so ".." carries the directory's own inode.
        let shared = std::cell::RefCell::new(&mut reply);
        let outcome = self.readdir_pages(
            ino,
            offset,
            |item, next| {
                shared
                    .borrow_mut()
                    .add(listed_ino(item), next, to_file_type(item.kind), &item.name)
            },
            |name, next| shared.borrow_mut().add(ino, next, FileType::Directory, name),
        );
        drop(shared);
        match outcome {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        trace!(inode = ino, offset, "readdirplus");
        let dir_attr = match self.dispatcher.getattr(ino) {
            Ok(attrs) => to_file_attr(ino, &attrs),
            Err(e) => {
                reply.error(Self::errno("readdirplus", ino, &e));
                return;
            }
        };
        let ttl = self.config.entry_ttl;
        let this = &*self;

        // Both closures push into the same reply, so it is shared through a
        // RefCell rather than borrowed twice.
        let shared = std::cell::RefCell::new(&mut reply);
        let outcome = self.readdir_pages(
            ino,
            offset,
            |item, next| {
                this.plus_entry(ino, item, |child, attrs| {
                    shared.borrow_mut().add(
                        child,
                        next,
                        &item.name,
                        &ttl,
                        &to_file_attr(child, attrs),
                        0,
                    )
                })
            },
            |name, next| {
                shared
                    .borrow_mut()
                    .add(ino, next, name, &Duration::ZERO, &dir_attr, 0)
            },
        );
        drop(shared);
        match outcome {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: fuser::ReplyStatfs) {
        match self.dispatcher.statfs(ino) {
            Ok(stat) => {
                let s = StatfsBlocks::from(&stat);
                reply.statfs(
                    s.blocks,
                    s.bfree,
                    s.bavail,
                    stat.total_files,
                    stat.free_files,
                    s.bsize,
                    stat.name_max,
                    s.bsize,
                );
            }
            Err(e) => reply.error(Self::errno("statfs", ino, &e)),
        }
    }

    /// Check file access permissions.
    ///
    /// # FUSE Spec
    ///
    /// Only called when `default_permissions` is not in effect. `F_OK` is an
    /// existence check; other bits are answered by the server's ACCESS.
    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let wanted = to_access_mask(mask);
        let result = if wanted.is_empty() {
            self.dispatcher.getattr(ino).map(|_| true)
        } else {
            self.dispatcher
                .access(ino, wanted)
                .map(|granted| grants(wanted, granted))
        };
        match result {
            Ok(true) => reply.ok(),
            Ok(false) => reply.error(libc::EACCES),
            Err(e) => reply.error(Self::errno("access", ino, &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let exclusive = flags & libc::O_EXCL != 0;
        match self.dispatcher.create(parent, name, mode & 0o7777, exclusive) {
            Ok(entry) => {
                self.lookups.inc(entry.ino);
                reply.created(
                    &self.config.entry_ttl,
                    &to_file_attr(entry.ino, &entry.attrs),
                    0,
                    0,
                    0,
                );
            }
            Err(e) => reply.error(Self::errno("create", parent, &e)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        match self.dispatcher.getxattr(ino, name) {
            Ok(value) => match xattr_reply(&value, size) {
                Ok(XattrReply::Size(n)) => reply.size(n),
                Ok(XattrReply::Data) => reply.data(&value),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(Self::errno("getxattr", ino, &e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        if position != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.dispatcher.setxattr(ino, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::errno("setxattr", ino, &e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr) {
        match self.dispatcher.listxattr(ino) {
            Ok(names) => {
                let list = encode_xattr_names(&names);
                match xattr_reply(&list, size) {
                    Ok(XattrReply::Size(n)) => reply.size(n),
                    Ok(XattrReply::Data) => reply.data(&list),
                    Err(e) => reply.error(e.to_errno()),
                }
            }
            Err(e) => reply.error(Self::errno("listxattr", ino, &e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.dispatcher.removexattr(ino, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::errno("removexattr", ino, &e)),
        }
    }
}

/// Converts an attribute snapshot into the kernel's view of inode `ino`.
#[allow(clippy::cast_possible_truncation)]
pub fn to_file_attr(ino: u64, attrs: &Attributes) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.blocks(),
        atime: attrs.atime,
        mtime: attrs.mtime,
        ctime: attrs.ctime,
        crtime: attrs.ctime,
        kind: to_file_type(attrs.kind),
        perm: (attrs.mode & 0o7777) as u16,
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: attrs.rdev as u32,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

pub fn to_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Regular => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::NamedPipe => FileType::NamedPipe,
        FileKind::Socket => FileType::Socket,
    }
}

fn to_set_time(t: TimeOrNow) -> SetTime {
    match t {
        TimeOrNow::Now => SetTime::ServerCurrent,
        TimeOrNow::SpecificTime(at) => SetTime::ClientTime(at),
    }
}

/// Maps `access(2)` mode bits to the ACCESS procedure's mask.
pub fn to_access_mask(mask: i32) -> AccessMask {
    let mut wanted = AccessMask::empty();
    if mask & libc::R_OK != 0 {
        wanted |= AccessMask::READ;
    }
    if mask & libc::W_OK != 0 {
        wanted |= AccessMask::MODIFY | AccessMask::EXTEND;
    }
    if mask & libc::X_OK != 0 {
        wanted |= AccessMask::EXECUTE | AccessMask::LOOKUP;
    }
    wanted
}

/// Whether `granted` satisfies `wanted`.
///
/// Execute on a file and lookup on a directory share `X_OK`; the server only
/// ever grants the one that applies, so either is enough.
fn grants(wanted: AccessMask, granted: AccessMask) -> bool {
    let search = AccessMask::EXECUTE | AccessMask::LOOKUP;
    let plain = wanted - search;
    granted.contains(plain) && (!wanted.intersects(search) || granted.intersects(search))
}

fn dir_offset(cookie: u64) -> FuseResult<i64> {
    cookie
        .checked_add(DOT_ENTRIES)
        .and_then(|o| i64::try_from(o).ok())
        .ok_or(FuseError::InvalidOffset(i64::MAX))
}

#[derive(Debug, PartialEq, Eq)]
enum XattrReply {
    Size(u32),
    Data,
}

/// Applies the xattr size protocol: a zero `size` asks for the length.
fn xattr_reply(value: &[u8], size: u32) -> FuseResult<XattrReply> {
    let len = u32::try_from(value.len()).map_err(|_| FuseError::Range {
        needed: value.len(),
        size,
    })?;
    if size == 0 {
        Ok(XattrReply::Size(len))
    } else if len > size {
        Err(FuseError::Range {
            needed: value.len(),
            size,
        })
    } else {
        Ok(XattrReply::Data)
    }
}

/// NUL-terminated name list as `listxattr(2)` returns it.
fn encode_xattr_names(names: &[OsString]) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    out
}

/// Byte counts from FSSTAT expressed in blocks.
#[derive(Debug, PartialEq, Eq)]
struct StatfsBlocks {
    blocks: u64,
    bfree: u64,
    bavail: u64,
    bsize: u32,
}

impl From<&FsStat> for StatfsBlocks {
    fn from(stat: &FsStat) -> Self {
        let bsize = if stat.block_size == 0 {
            BLOCK_SIZE
        } else {
            stat.block_size
        };
        let b = u64::from(bsize);
        Self {
            blocks: stat.total_bytes / b,
            bfree: stat.free_bytes / b,
            bavail: stat.avail_bytes / b,
            bsize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfsfuse_core::{AttrValid, ROOT_INODE};

    fn attrs(kind: FileKind, mode: u32, size: u64) -> Attributes {
        Attributes {
            valid: AttrValid::all(),
            kind,
            mode,
            nlink: 1,
            uid: 1000,
            gid: 100,
            size,
            used: size,
            ..Attributes::default()
        }
    }

    #[test]
    fn test_file_attr_conversion() {
        let a = attrs(FileKind::Regular, 0o100644, 1000);
        let fa = to_file_attr(7, &a);
        assert_eq!(fa.ino, 7);
        assert_eq!(fa.size, 1000);
        assert_eq!(fa.blocks, 2);
        assert_eq!(fa.kind, FileType::RegularFile);
        assert_eq!(fa.perm, 0o644);
        assert_eq!(fa.uid, 1000);
        assert_eq!(fa.gid, 100);
        assert_eq!(fa.blksize, BLOCK_SIZE);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(to_file_type(FileKind::Directory), FileType::Directory);
        assert_eq!(to_file_type(FileKind::Symlink), FileType::Symlink);
        assert_eq!(to_file_type(FileKind::NamedPipe), FileType::NamedPipe);
        assert_eq!(to_file_type(FileKind::Socket), FileType::Socket);
        assert_eq!(to_file_type(FileKind::CharDevice), FileType::CharDevice);
        assert_eq!(to_file_type(FileKind::BlockDevice), FileType::BlockDevice);
    }

    #[test]
    fn test_setuid_bits_survive() {
        let a = attrs(FileKind::Regular, 0o104755, 0);
        assert_eq!(to_file_attr(2, &a).perm, 0o4755);
    }

    #[test]
    fn test_access_mask() {
        assert!(to_access_mask(libc::F_OK).is_empty());
        assert_eq!(to_access_mask(libc::R_OK), AccessMask::READ);
        assert_eq!(
            to_access_mask(libc::W_OK),
            AccessMask::MODIFY | AccessMask::EXTEND
        );
        assert_eq!(
            to_access_mask(libc::X_OK),
            AccessMask::EXECUTE | AccessMask::LOOKUP
        );
    }

    #[test]
    fn test_grants() {
        let x = to_access_mask(libc::X_OK);
        assert!(grants(x, AccessMask::LOOKUP));
        assert!(grants(x, AccessMask::EXECUTE));
        assert!(!grants(x, AccessMask::READ));

        let rw = to_access_mask(libc::R_OK | libc::W_OK);
        assert!(!grants(rw, AccessMask::READ | AccessMask::MODIFY));
        assert!(grants(
            rw,
            AccessMask::READ | AccessMask::MODIFY | AccessMask::EXTEND
        ));
    }

    fn mounted_fs(files: usize) -> NfsFuse {
        use std::sync::Arc;

        use nfsfuse_core::testing::MemoryConnector;
        use nfsfuse_core::{CoreConfig, InodeCache, MountRequest, handshake};

        let connector = MemoryConnector::new();
        for i in 0..files {
            connector.export().add_file(&format!("/f{i}"), b"x");
        }
        let config = CoreConfig::default();
        let cache = Arc::new(InodeCache::new(config.clone()));
        let request = MountRequest {
            host: "server".into(),
            export: "/".into(),
            version: 3,
        };
        let state = handshake::mount(&connector, &request, &config, &cache).unwrap();
        NfsFuse::new(Dispatcher::for_mount(&state, cache), MountConfig::default())
    }

    #[test]
    fn test_plain_listing_reports_unknown_inode_for_uncached_entries() {
        let fs = mounted_fs(3);
        let page = fs.dispatcher().readdir(ROOT_INODE, 0, 10).unwrap();
        assert!(page.items.iter().all(|i| listed_ino(i) == UNKNOWN_INO));
        assert_eq!(fs.dispatcher().cache().len(), 1);

        let known = fs.dispatcher().lookup(ROOT_INODE, OsStr::new("f0")).unwrap();
        let page = fs.dispatcher().readdir(ROOT_INODE, 0, 10).unwrap();
        let f0 = page.items.iter().find(|i| i.name == "f0").unwrap();
        assert_eq!(listed_ino(f0), known.ino);
    }

    #[test]
    fn test_plus_entry_takes_reference_when_accepted() {
        let fs = mounted_fs(2);
        let page = fs.dispatcher().readdir(ROOT_INODE, 0, 10).unwrap();
        let mut seen = Vec::new();
        for item in &page.items {
            assert!(!fs.plus_entry(ROOT_INODE, item, |ino, _| {
                seen.push(ino);
                false
            }));
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|&ino| fs.lookup_counts().get(ino) == 1));
        assert_eq!(fs.dispatcher().cache().len(), 3);
    }

    #[test]
    fn test_plus_entry_releases_entry_that_did_not_fit() {
        let fs = mounted_fs(1);
        let page = fs.dispatcher().readdir(ROOT_INODE, 0, 10).unwrap();
        assert!(fs.plus_entry(ROOT_INODE, &page.items[0], |_, _| true));
        assert_eq!(fs.dispatcher().cache().len(), 1);
        assert!(fs.lookup_counts().is_empty());
    }

    #[test]
    fn test_plus_entry_keeps_node_the_kernel_already_holds() {
        let fs = mounted_fs(1);
        let entry = fs.dispatcher().lookup(ROOT_INODE, OsStr::new("f0")).unwrap();
        fs.lookup_counts().inc(entry.ino);
        let page = fs.dispatcher().readdir(ROOT_INODE, 0, 10).unwrap();
        assert!(fs.plus_entry(ROOT_INODE, &page.items[0], |_, _| true));
        assert!(fs.dispatcher().cache().get(entry.ino).is_some());
        assert_eq!(fs.lookup_counts().get(entry.ino), 1);
    }

    #[test]
    fn test_dir_offsets_leave_room_for_dot_entries() {
        assert_eq!(dir_offset(1).unwrap(), 3);
        assert!(dir_offset(u64::MAX).is_err());
        assert!(dir_offset(i64::MAX as u64).is_err());
    }

    #[test]
    fn test_xattr_size_protocol() {
        assert_eq!(xattr_reply(b"abc", 0).unwrap(), XattrReply::Size(3));
        assert_eq!(xattr_reply(b"abc", 3).unwrap(), XattrReply::Data);
        assert_eq!(xattr_reply(b"abc", 2).unwrap_err().to_errno(), libc::ERANGE);
    }

    #[test]
    fn test_xattr_names_are_nul_terminated() {
        let names = vec![OsString::from("user.a"), OsString::from("user.bc")];
        assert_eq!(encode_xattr_names(&names), b"user.a\0user.bc\0");
        assert!(encode_xattr_names(&[]).is_empty());
    }

    #[test]
    fn test_statfs_bytes_to_blocks() {
        let stat = FsStat {
            total_bytes: 8192 * 10,
            free_bytes: 8192 * 4,
            avail_bytes: 8192 * 3,
            total_files: 100,
            free_files: 50,
            avail_files: 50,
            block_size: 8192,
            name_max: 255,
        };
        let s = StatfsBlocks::from(&stat);
        assert_eq!(
            s,
            StatfsBlocks {
                blocks: 10,
                bfree: 4,
                bavail: 3,
                bsize: 8192
            }
        );

        let unknown = FsStat {
            block_size: 0,
            ..stat
        };
        assert_eq!(StatfsBlocks::from(&unknown).bsize, BLOCK_SIZE);
    }

    #[test]
    fn test_set_time_mapping() {
        assert_eq!(to_set_time(TimeOrNow::Now), SetTime::ServerCurrent);
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(5);
        assert_eq!(to_set_time(TimeOrNow::SpecificTime(t)), SetTime::ClientTime(t));
    }
}
