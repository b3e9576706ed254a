//! In-memory export for exercising the handshake, cache and dispatcher.
//!
//! [`MemoryConnector`] hands out sessions over one shared [`MemoryExport`].
//! Failures can be injected at each handshake stage, the export can be taken
//! offline, and objects can be changed or deleted "by another client" to
//! produce stale handles.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::attr::{AttrValid, Attributes, FileKind, Fsid, SetAttributes, SetTime};
use crate::client::{
    AccessMask, AccessReply, CreateHow, DirEntry, EntryReply, FsStat, LinkReply, MountReply,
    NfsStatus, ReadDirReply, ReadReply, ReadlinkReply, RenameReply, RpcConnector, RpcError,
    RpcResult, RpcSession, WccReply, WriteReply,
};
use crate::config::CoreConfig;
use crate::fh::{FileHandle, MAX_FHSIZE};
use crate::handshake::{self, HandshakeError, MountRequest, MountState, MountedProtocol};
use crate::icache::InodeCache;

const ROOT_ID: u64 = 1;

/// Handshake failures a [`MemoryConnector`] can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    InitContext,
    SelectVersion,
    MountTransport,
    MountStatus(NfsStatus),
    OversizedRootHandle,
}

#[derive(Debug, Clone)]
struct MemNode {
    kind: FileKind,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    rdev: u64,
    data: Vec<u8>,
    target: PathBuf,
    children: BTreeMap<OsString, u64>,
    xattrs: BTreeMap<OsString, Vec<u8>>,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    change: u64,
}

impl MemNode {
    fn new(kind: FileKind, mode: u32, now: SystemTime, change: u64) -> Self {
        Self {
            kind,
            mode: mode & 0o7777,
            uid: 0,
            gid: 0,
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            rdev: 0,
            data: Vec::new(),
            target: PathBuf::new(),
            children: BTreeMap::new(),
            xattrs: BTreeMap::new(),
            atime: now,
            mtime: now,
            ctime: now,
            change,
        }
    }

    fn size(&self) -> u64 {
        match self.kind {
            FileKind::Symlink => self.target.as_os_str().len() as u64,
            FileKind::Directory => 4096,
            _ => self.data.len() as u64,
        }
    }
}

#[derive(Debug)]
struct ExportState {
    nodes: HashMap<u64, MemNode>,
    next_id: u64,
    clock: u64,
}

impl ExportState {
    fn tick(&mut self) -> (SystemTime, u64) {
        self.clock += 1;
        (UNIX_EPOCH + Duration::from_secs(self.clock), self.clock)
    }

    fn node(&self, fh: &FileHandle) -> RpcResult<(u64, &MemNode)> {
        let id = decode(fh)?;
        self.nodes
            .get(&id)
            .map(|n| (id, n))
            .ok_or(RpcError::Status(NfsStatus::Stale))
    }

    fn node_mut(&mut self, fh: &FileHandle) -> RpcResult<(u64, &mut MemNode)> {
        let id = decode(fh)?;
        self.nodes
            .get_mut(&id)
            .map(|n| (id, n))
            .ok_or(RpcError::Status(NfsStatus::Stale))
    }

    fn dir(&self, fh: &FileHandle) -> RpcResult<(u64, &MemNode)> {
        let (id, node) = self.node(fh)?;
        if node.kind != FileKind::Directory {
            return Err(NfsStatus::NotDir.into());
        }
        Ok((id, node))
    }

    fn attrs(&self, id: u64) -> Option<Attributes> {
        let n = self.nodes.get(&id)?;
        Some(Attributes {
            valid: AttrValid::FATTR_V4,
            kind: n.kind,
            mode: n.mode,
            nlink: n.nlink,
            uid: n.uid,
            gid: n.gid,
            rdev: n.rdev,
            size: n.size(),
            used: n.size(),
            fsid: Fsid { major: 1, minor: 0 },
            fileid: id,
            atime: n.atime,
            mtime: n.mtime,
            ctime: n.ctime,
            change_attr: n.change,
            ..Attributes::default()
        })
    }

    fn touch(&mut self, id: u64) {
        let (now, change) = self.tick();
        if let Some(n) = self.nodes.get_mut(&id) {
            n.mtime = now;
            n.ctime = now;
            n.change = change;
        }
    }

    fn insert_child(&mut self, dir: u64, name: &OsStr, node: MemNode) -> RpcResult<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let is_dir = node.kind == FileKind::Directory;
        self.nodes.insert(id, node);
        let parent = self
            .nodes
            .get_mut(&dir)
            .ok_or(RpcError::Status(NfsStatus::Stale))?;
        parent.children.insert(name.to_os_string(), id);
        if is_dir {
            parent.nlink += 1;
        }
        self.touch(dir);
        Ok(id)
    }

    /// Drops one link to `id`, deleting the object when none remain.
    fn unlink_id(&mut self, id: u64) {
        let gone = match self.nodes.get_mut(&id) {
            Some(n) if n.kind == FileKind::Directory => true,
            Some(n) => {
                n.nlink = n.nlink.saturating_sub(1);
                n.nlink == 0
            }
            None => false,
        };
        if gone {
            self.nodes.remove(&id);
        } else {
            self.touch(id);
        }
    }

    fn walk(&self, path: &Path) -> Option<(u64, u64, OsString)> {
        let mut parent = ROOT_ID;
        let mut current = ROOT_ID;
        let mut last = OsString::new();
        for c in path.components() {
            if let Component::Normal(name) = c {
                parent = current;
                current = *self.nodes.get(&current)?.children.get(name)?;
                last = name.to_os_string();
            }
        }
        Some((parent, current, last))
    }

    fn entry(&self, id: u64, dir: u64) -> RpcResult<EntryReply> {
        Ok(EntryReply {
            fh: encode(id),
            attrs: self.attrs(id),
            dir_attrs: self.attrs(dir),
        })
    }
}

/// Shared in-memory export tree.
#[derive(Debug)]
pub struct MemoryExport {
    state: Mutex<ExportState>,
    offline: AtomicBool,
    getattr_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
}

impl Default for MemoryExport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryExport {
    /// An export holding only an empty root directory.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID, MemNode::new(FileKind::Directory, 0o755, UNIX_EPOCH, 0));
        Self {
            state: Mutex::new(ExportState {
                nodes,
                next_id: ROOT_ID + 1,
                clock: 0,
            }),
            offline: AtomicBool::new(false),
            getattr_calls: AtomicUsize::new(0),
            lookup_calls: AtomicUsize::new(0),
        }
    }

    /// Creates a regular file at `path` (parents must exist).
    pub fn add_file(&self, path: &str, contents: &[u8]) {
        let mut state = self.state.lock();
        let path = Path::new(path);
        let parent = path.parent().unwrap_or(Path::new("/"));
        let Some((_, dir, _)) = state.walk(parent) else {
            return;
        };
        let (now, change) = state.tick();
        let mut node = MemNode::new(FileKind::Regular, 0o644, now, change);
        node.data = contents.to_vec();
        if let Some(name) = path.file_name() {
            let _ = state.insert_child(dir, name, node);
        }
    }

    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.lock();
        let path = Path::new(path);
        let parent = path.parent().unwrap_or(Path::new("/"));
        let Some((_, dir, _)) = state.walk(parent) else {
            return;
        };
        let (now, change) = state.tick();
        let node = MemNode::new(FileKind::Directory, 0o755, now, change);
        if let Some(name) = path.file_name() {
            let _ = state.insert_child(dir, name, node);
        }
    }

    /// Deletes `path` as another client would, leaving handles dangling.
    pub fn remove_path(&self, path: &str) {
        let mut state = self.state.lock();
        let Some((parent, id, name)) = state.walk(Path::new(path)) else {
            return;
        };
        if let Some(p) = state.nodes.get_mut(&parent) {
            p.children.remove(&name);
        }
        state.nodes.remove(&id);
        state.touch(parent);
    }

    /// Replaces a file's contents as another client would.
    pub fn overwrite(&self, path: &str, contents: &[u8]) {
        let mut state = self.state.lock();
        let Some((_, id, _)) = state.walk(Path::new(path)) else {
            return;
        };
        if let Some(n) = state.nodes.get_mut(&id) {
            n.data = contents.to_vec();
        }
        state.touch(id);
    }

    /// The handle the export assigns to `path`.
    pub fn handle_of(&self, path: &str) -> Option<FileHandle> {
        let state = self.state.lock();
        state.walk(Path::new(path)).map(|(_, id, _)| encode(id))
    }

    /// Makes every call fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn getattr_calls(&self) -> usize {
        self.getattr_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> RpcResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RpcError::Transport("export offline".into()))
        } else {
            Ok(())
        }
    }
}

fn encode(id: u64) -> FileHandle {
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(b"mem0");
    bytes[4..].copy_from_slice(&id.to_be_bytes());
    FileHandle::from_array(bytes)
}

fn decode(fh: &FileHandle) -> RpcResult<u64> {
    let b = fh.as_bytes();
    if b.len() != 12 || &b[..4] != b"mem0" {
        return Err(NfsStatus::BadHandle.into());
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&b[4..]);
    Ok(u64::from_be_bytes(id))
}

/// Connector over a [`MemoryExport`] with handshake failure injection.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    export: Arc<MemoryExport>,
    failures: Arc<Mutex<Vec<Failure>>>,
    destroyed: Arc<AtomicUsize>,
    legacy_mounts: AtomicUsize,
    legacy_unmounts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_export(export: Arc<MemoryExport>) -> Self {
        Self {
            export,
            ..Self::default()
        }
    }

    pub fn export(&self) -> &Arc<MemoryExport> {
        &self.export
    }

    /// Injects `failure` into every subsequent handshake.
    pub fn fail(&self, failure: Failure) {
        self.failures.lock().push(failure);
    }

    /// Number of sessions destroyed so far.
    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn legacy_mounts(&self) -> usize {
        self.legacy_mounts.load(Ordering::SeqCst)
    }

    pub fn legacy_unmounts(&self) -> usize {
        self.legacy_unmounts.load(Ordering::SeqCst)
    }

    fn failing(&self, failure: Failure) -> bool {
        self.failures.lock().contains(&failure)
    }
}

impl RpcConnector for MemoryConnector {
    fn init_context(&self) -> RpcResult<Box<dyn RpcSession>> {
        if self.failing(Failure::InitContext) {
            return Err(RpcError::Transport("cannot allocate context".into()));
        }
        Ok(Box::new(MemorySession {
            export: Arc::clone(&self.export),
            failures: Arc::clone(&self.failures),
            destroyed: Arc::clone(&self.destroyed),
        }))
    }

    fn legacy_mount(
        &self,
        request: &MountRequest,
        config: &CoreConfig,
        cache: &Arc<InodeCache>,
    ) -> Result<MountState, HandshakeError> {
        self.legacy_mounts.fetch_add(1, Ordering::SeqCst);
        handshake::establish(self, request, config, cache, MountedProtocol::Legacy)
    }

    fn legacy_unmount(&self, state: &MountState) -> RpcResult<()> {
        self.legacy_unmounts.fetch_add(1, Ordering::SeqCst);
        state.session.destroy();
        Ok(())
    }
}

/// One session over a [`MemoryExport`].
pub struct MemorySession {
    export: Arc<MemoryExport>,
    failures: Arc<Mutex<Vec<Failure>>>,
    destroyed: Arc<AtomicUsize>,
}

impl MemorySession {
    fn failing(&self, failure: Failure) -> bool {
        self.failures.lock().contains(&failure)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ExportState) -> RpcResult<T>) -> RpcResult<T> {
        self.export.check_online()?;
        f(&mut self.export.state.lock())
    }
}

impl RpcSession for MemorySession {
    fn select_version(&self, version: u32) -> RpcResult<()> {
        if self.failing(Failure::SelectVersion) || !(2..=4).contains(&version) {
            return Err(NfsStatus::NotSupp.into());
        }
        Ok(())
    }

    fn mount(&self, _host: &str, _export: &str) -> RpcResult<MountReply> {
        let statuses: Vec<Failure> = self.failures.lock().clone();
        for f in statuses {
            match f {
                Failure::MountTransport => return Err(RpcError::Transport("connection refused".into())),
                Failure::MountStatus(s) => return Err(s.into()),
                _ => {}
            }
        }
        let root_fh = if self.failing(Failure::OversizedRootHandle) {
            vec![0xaa; MAX_FHSIZE + 1]
        } else {
            encode(ROOT_ID).as_bytes().to_vec()
        };
        self.with_state(|s| {
            let attrs = s.attrs(ROOT_ID).ok_or(RpcError::Status(NfsStatus::Stale))?;
            Ok(MountReply { root_fh, attrs })
        })
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn getattr(&self, fh: &FileHandle) -> RpcResult<Attributes> {
        self.export.getattr_calls.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            let (id, _) = s.node(fh)?;
            s.attrs(id).ok_or(RpcError::Status(NfsStatus::Stale))
        })
    }

    fn setattr(&self, fh: &FileHandle, changes: &SetAttributes) -> RpcResult<Option<Attributes>> {
        self.with_state(|s| {
            let (now, change) = s.tick();
            let (id, n) = s.node_mut(fh)?;
            if let Some(mode) = changes.mode {
                n.mode = mode & 0o7777;
            }
            if let Some(uid) = changes.uid {
                n.uid = uid;
            }
            if let Some(gid) = changes.gid {
                n.gid = gid;
            }
            if let Some(size) = changes.size {
                if n.kind != FileKind::Regular {
                    return Err(NfsStatus::Inval.into());
                }
                n.data.resize(usize::try_from(size).map_err(|_| NfsStatus::FBig)?, 0);
                n.mtime = now;
            }
            let resolve = |t: SetTime| match t {
                SetTime::ServerCurrent => now,
                SetTime::ClientTime(t) => t,
            };
            if let Some(t) = changes.atime {
                n.atime = resolve(t);
            }
            if let Some(t) = changes.mtime {
                n.mtime = resolve(t);
            }
            n.ctime = now;
            n.change = change;
            Ok(s.attrs(id))
        })
    }

    fn lookup(&self, dir: &FileHandle, name: &OsStr) -> RpcResult<EntryReply> {
        self.export.lookup_calls.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            let (dir_id, d) = s.dir(dir)?;
            let id = *d.children.get(name).ok_or(RpcError::Status(NfsStatus::NoEnt))?;
            s.entry(id, dir_id)
        })
    }

    fn access(&self, fh: &FileHandle, mask: AccessMask) -> RpcResult<AccessReply> {
        self.with_state(|s| {
            let (id, _) = s.node(fh)?;
            Ok(AccessReply {
                granted: mask,
                attrs: s.attrs(id),
            })
        })
    }

    fn readlink(&self, fh: &FileHandle) -> RpcResult<ReadlinkReply> {
        self.with_state(|s| {
            let (id, n) = s.node(fh)?;
            if n.kind != FileKind::Symlink {
                return Err(NfsStatus::Inval.into());
            }
            Ok(ReadlinkReply {
                target: n.target.clone(),
                attrs: s.attrs(id),
            })
        })
    }

    fn read(&self, fh: &FileHandle, offset: u64, count: u32) -> RpcResult<ReadReply> {
        self.with_state(|s| {
            let (id, n) = s.node(fh)?;
            if n.kind == FileKind::Directory {
                return Err(NfsStatus::IsDir.into());
            }
            let len = n.data.len();
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
            let end = start.saturating_add(count as usize).min(len);
            Ok(ReadReply {
                data: n.data[start..end].to_vec(),
                eof: end == len,
                attrs: s.attrs(id),
            })
        })
    }

    fn write(&self, fh: &FileHandle, offset: u64, data: &[u8]) -> RpcResult<WriteReply> {
        self.with_state(|s| {
            let (now, change) = s.tick();
            let (id, n) = s.node_mut(fh)?;
            if n.kind == FileKind::Directory {
                return Err(NfsStatus::IsDir.into());
            }
            let start = usize::try_from(offset).map_err(|_| NfsStatus::FBig)?;
            let end = start + data.len();
            if n.data.len() < end {
                n.data.resize(end, 0);
            }
            n.data[start..end].copy_from_slice(data);
            n.mtime = now;
            n.ctime = now;
            n.change = change;
            Ok(WriteReply {
                count: u32::try_from(data.len()).map_err(|_| NfsStatus::Inval)?,
                attrs: s.attrs(id),
            })
        })
    }

    fn create(
        &self,
        dir: &FileHandle,
        name: &OsStr,
        mode: u32,
        how: CreateHow,
    ) -> RpcResult<EntryReply> {
        self.with_state(|s| {
            let (dir_id, d) = s.dir(dir)?;
            if let Some(&existing) = d.children.get(name) {
                return match how {
                    CreateHow::Guarded => Err(NfsStatus::Exist.into()),
                    CreateHow::Unchecked => s.entry(existing, dir_id),
                };
            }
            let (now, change) = s.tick();
            let id = s.insert_child(dir_id, name, MemNode::new(FileKind::Regular, mode, now, change))?;
            s.entry(id, dir_id)
        })
    }

    fn mkdir(&self, dir: &FileHandle, name: &OsStr, mode: u32) -> RpcResult<EntryReply> {
        self.with_state(|s| {
            let (dir_id, d) = s.dir(dir)?;
            if d.children.contains_key(name) {
                return Err(NfsStatus::Exist.into());
            }
            let (now, change) = s.tick();
            let id =
                s.insert_child(dir_id, name, MemNode::new(FileKind::Directory, mode, now, change))?;
            s.entry(id, dir_id)
        })
    }

    fn symlink(&self, dir: &FileHandle, name: &OsStr, target: &Path) -> RpcResult<EntryReply> {
        self.with_state(|s| {
            let (dir_id, d) = s.dir(dir)?;
            if d.children.contains_key(name) {
                return Err(NfsStatus::Exist.into());
            }
            let (now, change) = s.tick();
            let mut node = MemNode::new(FileKind::Symlink, 0o777, now, change);
            node.target = target.to_path_buf();
            let id = s.insert_child(dir_id, name, node)?;
            s.entry(id, dir_id)
        })
    }

    fn mknod(
        &self,
        dir: &FileHandle,
        name: &OsStr,
        kind: FileKind,
        mode: u32,
        rdev: u64,
    ) -> RpcResult<EntryReply> {
        if matches!(kind, FileKind::Directory | FileKind::Symlink) {
            return Err(NfsStatus::BadType.into());
        }
        self.with_state(|s| {
            let (dir_id, d) = s.dir(dir)?;
            if d.children.contains_key(name) {
                return Err(NfsStatus::Exist.into());
            }
            let (now, change) = s.tick();
            let mut node = MemNode::new(kind, mode, now, change);
            node.rdev = rdev;
            let id = s.insert_child(dir_id, name, node)?;
            s.entry(id, dir_id)
        })
    }

    fn remove(&self, dir: &FileHandle, name: &OsStr) -> RpcResult<WccReply> {
        self.with_state(|s| {
            let (dir_id, d) = s.dir(dir)?;
            let id = *d.children.get(name).ok_or(RpcError::Status(NfsStatus::NoEnt))?;
            if s.nodes.get(&id).is_some_and(|n| n.kind == FileKind::Directory) {
                return Err(NfsStatus::IsDir.into());
            }
            if let Some(d) = s.nodes.get_mut(&dir_id) {
                d.children.remove(name);
            }
            s.unlink_id(id);
            s.touch(dir_id);
            Ok(WccReply {
                dir_attrs: s.attrs(dir_id),
            })
        })
    }

    fn rmdir(&self, dir: &FileHandle, name: &OsStr) -> RpcResult<WccReply> {
        self.with_state(|s| {
            let (dir_id, d) = s.dir(dir)?;
            let id = *d.children.get(name).ok_or(RpcError::Status(NfsStatus::NoEnt))?;
            match s.nodes.get(&id) {
                Some(n) if n.kind != FileKind::Directory => return Err(NfsStatus::NotDir.into()),
                Some(n) if !n.children.is_empty() => return Err(NfsStatus::NotEmpty.into()),
                _ => {}
            }
            if let Some(d) = s.nodes.get_mut(&dir_id) {
                d.children.remove(name);
                d.nlink = d.nlink.saturating_sub(1);
            }
            s.unlink_id(id);
            s.touch(dir_id);
            Ok(WccReply {
                dir_attrs: s.attrs(dir_id),
            })
        })
    }

    fn rename(
        &self,
        from_dir: &FileHandle,
        from_name: &OsStr,
        to_dir: &FileHandle,
        to_name: &OsStr,
    ) -> RpcResult<RenameReply> {
        self.with_state(|s| {
            let (from_id, f) = s.dir(from_dir)?;
            let id = *f.children.get(from_name).ok_or(RpcError::Status(NfsStatus::NoEnt))?;
            let (to_id, t) = s.dir(to_dir)?;
            if let Some(&victim) = t.children.get(to_name)
                && victim != id
            {
                let moving_dir = s.nodes.get(&id).is_some_and(|n| n.kind == FileKind::Directory);
                match s.nodes.get(&victim) {
                    Some(v) if v.kind == FileKind::Directory && !v.children.is_empty() => {
                        return Err(NfsStatus::NotEmpty.into());
                    }
                    Some(v) if (v.kind == FileKind::Directory) != moving_dir => {
                        let status = if moving_dir { NfsStatus::NotDir } else { NfsStatus::IsDir };
                        return Err(status.into());
                    }
                    _ => {}
                }
                s.unlink_id(victim);
            }
            if let Some(f) = s.nodes.get_mut(&from_id) {
                f.children.remove(from_name);
            }
            if let Some(t) = s.nodes.get_mut(&to_id) {
                t.children.insert(to_name.to_os_string(), id);
            }
            s.touch(from_id);
            s.touch(to_id);
            Ok(RenameReply {
                from_dir_attrs: s.attrs(from_id),
                to_dir_attrs: s.attrs(to_id),
            })
        })
    }

    fn link(&self, fh: &FileHandle, dir: &FileHandle, name: &OsStr) -> RpcResult<LinkReply> {
        self.with_state(|s| {
            let (id, n) = s.node(fh)?;
            if n.kind == FileKind::Directory {
                return Err(NfsStatus::IsDir.into());
            }
            let (dir_id, d) = s.dir(dir)?;
            if d.children.contains_key(name) {
                return Err(NfsStatus::Exist.into());
            }
            if let Some(d) = s.nodes.get_mut(&dir_id) {
                d.children.insert(name.to_os_string(), id);
            }
            if let Some(n) = s.nodes.get_mut(&id) {
                n.nlink += 1;
            }
            s.touch(id);
            s.touch(dir_id);
            Ok(LinkReply {
                attrs: s.attrs(id),
                dir_attrs: s.attrs(dir_id),
            })
        })
    }

    fn readdir(
        &self,
        dir: &FileHandle,
        cookie: u64,
        _cookieverf: u64,
        max_entries: u32,
    ) -> RpcResult<ReadDirReply> {
        self.with_state(|s| {
            let (dir_id, d) = s.dir(dir)?;
            let skip = usize::try_from(cookie).map_err(|_| NfsStatus::BadCookie)?;
            let all: Vec<(OsString, u64)> =
                d.children.iter().map(|(k, v)| (k.clone(), *v)).collect();
            let mut entries = Vec::new();
            for (i, (name, id)) in all.iter().enumerate().skip(skip) {
                if entries.len() >= max_entries as usize {
                    break;
                }
                entries.push(DirEntry {
                    fileid: *id,
                    name: name.clone(),
                    cookie: i as u64 + 1,
                    fh: Some(encode(*id)),
                    attrs: s.attrs(*id),
                });
            }
            let eof = skip + entries.len() >= all.len();
            Ok(ReadDirReply {
                entries,
                cookieverf: 1,
                eof,
                dir_attrs: s.attrs(dir_id),
            })
        })
    }

    fn fsstat(&self, fh: &FileHandle) -> RpcResult<FsStat> {
        self.with_state(|s| {
            s.node(fh)?;
            let files = s.nodes.len() as u64;
            Ok(FsStat {
                total_bytes: 1 << 30,
                free_bytes: 1 << 29,
                avail_bytes: 1 << 29,
                total_files: 1 << 20,
                free_files: (1 << 20) - files,
                avail_files: (1 << 20) - files,
                block_size: 4096,
                name_max: 255,
            })
        })
    }

    fn getxattr(&self, fh: &FileHandle, name: &OsStr) -> RpcResult<Vec<u8>> {
        self.with_state(|s| {
            let (_, n) = s.node(fh)?;
            n.xattrs.get(name).cloned().ok_or(RpcError::Status(NfsStatus::NoXattr))
        })
    }

    fn setxattr(&self, fh: &FileHandle, name: &OsStr, value: &[u8], _flags: i32) -> RpcResult<()> {
        self.with_state(|s| {
            let (_, n) = s.node_mut(fh)?;
            n.xattrs.insert(name.to_os_string(), value.to_vec());
            Ok(())
        })
    }

    fn listxattr(&self, fh: &FileHandle) -> RpcResult<Vec<OsString>> {
        self.with_state(|s| {
            let (_, n) = s.node(fh)?;
            Ok(n.xattrs.keys().cloned().collect())
        })
    }

    fn removexattr(&self, fh: &FileHandle, name: &OsStr) -> RpcResult<()> {
        self.with_state(|s| {
            let (_, n) = s.node_mut(fh)?;
            n.xattrs
                .remove(name)
                .map(|_| ())
                .ok_or(RpcError::Status(NfsStatus::NoXattr))
        })
    }
}
