//! Filesystem operations over the inode cache and an RPC session.
//!
//! Each operation resolves its nodes through the cache, goes to the server
//! only when the cache cannot answer or the operation mutates, folds any
//! returned attributes back into the cache, and reports results in
//! filesystem terms.
//!
//! Error mapping: a name that is missing from its directory is
//! [`NfsError::NotFound`]; a handle the server no longer recognises is
//! [`NfsError::StaleHandle`] and the node is marked stale.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::attr::{Attributes, FileKind, SetAttributes};
use crate::client::{
    AccessMask, CreateHow, EntryReply, FsStat, NfsStatus, RpcError, RpcSession,
};
use crate::error::{NfsError, NfsResult};
use crate::fh::FileHandle;
use crate::handshake::MountState;
use crate::icache::{CacheNode, InodeCache, ROOT_INODE};

/// A node handed back to the kernel.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub ino: u64,
    pub attrs: Attributes,
}

/// Result of `open`.
#[derive(Debug, Clone)]
pub struct OpenOutcome {
    pub attrs: Attributes,
    /// False when revalidation saw the file change since it was last cached.
    pub keep_cache: bool,
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct DirItem {
    pub name: OsString,
    /// Resume point for the next `readdir` call.
    pub cookie: u64,
    pub kind: FileKind,
    pub fh: Option<FileHandle>,
    /// Cache inode, present when the entry is already cached.
    pub ino: Option<u64>,
    pub attrs: Option<Attributes>,
}

#[derive(Debug, Clone, Default)]
pub struct DirPage {
    pub items: Vec<DirItem>,
    pub eof: bool,
}

/// The dispatch surface.
pub struct Dispatcher {
    cache: Arc<InodeCache>,
    session: Arc<dyn RpcSession>,
}

impl Dispatcher {
    pub fn new(cache: Arc<InodeCache>, session: Arc<dyn RpcSession>) -> Self {
        Self { cache, session }
    }

    /// Dispatcher for an established mount.
    pub fn for_mount(state: &MountState, cache: Arc<InodeCache>) -> Self {
        Self::new(cache, Arc::clone(&state.session))
    }

    pub fn cache(&self) -> &Arc<InodeCache> {
        &self.cache
    }

    pub fn root_ino(&self) -> u64 {
        ROOT_INODE
    }

    fn node(&self, ino: u64) -> NfsResult<Arc<CacheNode>> {
        self.cache.get(ino).ok_or(NfsError::InvalidInode(ino))
    }

    /// Maps a failure of a call addressed to `node`'s own handle.
    fn handle_error(&self, node: &CacheNode, err: RpcError) -> NfsError {
        match err {
            RpcError::Status(s) if s.is_gone() => {
                self.cache.invalidate(node);
                warn!(ino = node.ino(), status = ?s, "stale file handle");
                NfsError::StaleHandle(node.ino())
            }
            RpcError::Status(s) => NfsError::Remote(s),
            RpcError::Transport(msg) => NfsError::Transport(msg),
        }
    }

    /// Maps a failure of a call addressed to a name inside `dir`.
    fn name_error(&self, dir: &CacheNode, name: &OsStr, err: RpcError) -> NfsError {
        match err {
            RpcError::Status(NfsStatus::NoEnt) => {
                trace!(parent = dir.ino(), ?name, "not found");
                NfsError::NotFound
            }
            other => self.handle_error(dir, other),
        }
    }

    fn apply(&self, node: &CacheNode, attrs: Option<&Attributes>, generation: u64) {
        match attrs {
            Some(a) => {
                self.cache.refresh(node, a, generation);
            }
            None => self.cache.expire(node),
        }
    }

    /// Fetches attributes from the server and folds them into the cache.
    fn revalidate(&self, node: &CacheNode) -> NfsResult<Attributes> {
        let generation = self.cache.next_generation();
        let attrs = self
            .session
            .getattr(node.fh())
            .map_err(|e| self.handle_error(node, e))?;
        self.cache.refresh(node, &attrs, generation);
        Ok(node.attrs())
    }

    /// Records a directory mutation and its post-op attributes.
    fn dir_changed(&self, dir: &CacheNode, attrs: Option<&Attributes>, generation: u64) {
        self.cache.invalidate_dir(dir);
        if let Some(a) = attrs {
            self.cache.refresh(dir, a, generation);
        }
    }

    /// The cached node `name` in `dir` refers to right now, if any.
    ///
    /// Taken before a name is removed or replaced so that node can be
    /// expired afterwards. Never allocates a node.
    fn cached_child(&self, dir: &CacheNode, name: &OsStr) -> Option<Arc<CacheNode>> {
        let reply = self.session.lookup(dir.fh(), name).ok()?;
        self.cache.get_by_handle(&reply.fh)
    }

    /// Forces a node that lost a name back to the server. Other hard links
    /// may keep it alive; otherwise the next fetch reports it stale.
    fn unlinked(&self, node: Option<Arc<CacheNode>>) {
        if let Some(node) = node {
            trace!(ino = node.ino(), "expiring node after name change");
            self.cache.expire(&node);
        }
    }

    /// Caches the child an entry-producing RPC returned.
    fn finish_entry(
        &self,
        dir: &CacheNode,
        reply: EntryReply,
        generation: u64,
    ) -> NfsResult<NodeEntry> {
        self.dir_changed(dir, reply.dir_attrs.as_ref(), generation);
        let node = self.cache.resolve(&reply.fh)?;
        let attrs = match reply.attrs {
            Some(a) => {
                self.cache.refresh(&node, &a, generation);
                node.attrs()
            }
            None => self.revalidate(&node)?,
        };
        Ok(NodeEntry {
            ino: node.ino(),
            attrs,
        })
    }

    pub fn lookup(&self, parent: u64, name: &OsStr) -> NfsResult<NodeEntry> {
        trace!(parent, ?name, "lookup");
        let dir = self.node(parent)?;
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .lookup(dir.fh(), name)
            .map_err(|e| self.name_error(&dir, name, e))?;
        if let Some(a) = &reply.dir_attrs {
            self.cache.refresh(&dir, a, generation);
        }
        let node = self.cache.resolve(&reply.fh)?;
        let attrs = match reply.attrs {
            Some(a) => {
                self.cache.refresh(&node, &a, generation);
                node.attrs()
            }
            None => self.revalidate(&node)?,
        };
        Ok(NodeEntry {
            ino: node.ino(),
            attrs,
        })
    }

    /// Serves attributes from cache when fresh, otherwise from the server.
    pub fn getattr(&self, ino: u64) -> NfsResult<Attributes> {
        let node = self.node(ino)?;
        if self.cache.is_fresh(&node, Instant::now()) {
            trace!(ino, "attribute cache hit");
            return Ok(node.attrs());
        }
        debug!(ino, stale = node.is_stale(), "attribute cache miss");
        self.revalidate(&node)
    }

    pub fn setattr(&self, ino: u64, changes: &SetAttributes) -> NfsResult<Attributes> {
        trace!(ino, ?changes, "setattr");
        let node = self.node(ino)?;
        if changes.is_empty() {
            return self.getattr(ino);
        }
        let generation = self.cache.next_generation();
        let post = self
            .session
            .setattr(node.fh(), changes)
            .map_err(|e| self.handle_error(&node, e))?;
        match post {
            Some(a) => {
                self.cache.refresh(&node, &a, generation);
                Ok(node.attrs())
            }
            None => {
                self.cache.expire(&node);
                self.revalidate(&node)
            }
        }
    }

    /// Close-to-open: revalidates attributes unless `nocto` is set.
    pub fn open(&self, ino: u64) -> NfsResult<OpenOutcome> {
        let node = self.node(ino)?;
        if self.cache.config().nocto && self.cache.is_fresh(&node, Instant::now()) {
            return Ok(OpenOutcome {
                attrs: node.attrs(),
                keep_cache: true,
            });
        }
        let before = node.attrs();
        let after = self.revalidate(&node)?;
        let keep_cache = !before.valid.is_empty() && !before.differs_in_content(&after);
        if !keep_cache {
            debug!(ino, "file changed since last open");
        }
        Ok(OpenOutcome {
            attrs: after,
            keep_cache,
        })
    }

    pub fn read(&self, ino: u64, offset: u64, size: u32) -> NfsResult<Vec<u8>> {
        trace!(ino, offset, size, "read");
        let node = self.node(ino)?;
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .read(node.fh(), offset, size)
            .map_err(|e| self.handle_error(&node, e))?;
        if let Some(a) = &reply.attrs {
            self.cache.refresh(&node, a, generation);
        }
        Ok(reply.data)
    }

    pub fn write(&self, ino: u64, offset: u64, data: &[u8]) -> NfsResult<u32> {
        trace!(ino, offset, len = data.len(), "write");
        let node = self.node(ino)?;
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .write(node.fh(), offset, data)
            .map_err(|e| self.handle_error(&node, e))?;
        self.apply(&node, reply.attrs.as_ref(), generation);
        Ok(reply.count)
    }

    pub fn create(&self, parent: u64, name: &OsStr, mode: u32, exclusive: bool) -> NfsResult<NodeEntry> {
        trace!(parent, ?name, mode, exclusive, "create");
        let dir = self.node(parent)?;
        let how = if exclusive {
            CreateHow::Guarded
        } else {
            CreateHow::Unchecked
        };
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .create(dir.fh(), name, mode, how)
            .map_err(|e| self.handle_error(&dir, e))?;
        self.finish_entry(&dir, reply, generation)
    }

    pub fn mkdir(&self, parent: u64, name: &OsStr, mode: u32) -> NfsResult<NodeEntry> {
        trace!(parent, ?name, mode, "mkdir");
        let dir = self.node(parent)?;
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .mkdir(dir.fh(), name, mode)
            .map_err(|e| self.handle_error(&dir, e))?;
        self.finish_entry(&dir, reply, generation)
    }

    pub fn mknod(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u64,
    ) -> NfsResult<NodeEntry> {
        trace!(parent, ?name, mode, rdev, "mknod");
        let dir = self.node(parent)?;
        let kind = FileKind::from_mode(mode);
        if matches!(kind, FileKind::Directory | FileKind::Symlink) {
            return Err(NfsError::InvalidArgument("mknod cannot create directories or symlinks"));
        }
        let generation = self.cache.next_generation();
        let reply = if kind == FileKind::Regular {
            self.session.create(dir.fh(), name, mode & 0o7777, CreateHow::Guarded)
        } else {
            self.session.mknod(dir.fh(), name, kind, mode & 0o7777, rdev)
        }
        .map_err(|e| self.handle_error(&dir, e))?;
        self.finish_entry(&dir, reply, generation)
    }

    pub fn symlink(&self, parent: u64, name: &OsStr, target: &Path) -> NfsResult<NodeEntry> {
        trace!(parent, ?name, ?target, "symlink");
        let dir = self.node(parent)?;
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .symlink(dir.fh(), name, target)
            .map_err(|e| self.handle_error(&dir, e))?;
        self.finish_entry(&dir, reply, generation)
    }

    pub fn link(&self, ino: u64, new_parent: u64, new_name: &OsStr) -> NfsResult<NodeEntry> {
        trace!(ino, new_parent, ?new_name, "link");
        let node = self.node(ino)?;
        let dir = self.node(new_parent)?;
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .link(node.fh(), dir.fh(), new_name)
            .map_err(|e| self.handle_error(&node, e))?;
        self.dir_changed(&dir, reply.dir_attrs.as_ref(), generation);
        let attrs = match reply.attrs {
            Some(a) => {
                self.cache.refresh(&node, &a, generation);
                node.attrs()
            }
            None => self.revalidate(&node)?,
        };
        Ok(NodeEntry { ino, attrs })
    }

    pub fn unlink(&self, parent: u64, name: &OsStr) -> NfsResult<()> {
        trace!(parent, ?name, "unlink");
        let dir = self.node(parent)?;
        let child = self.cached_child(&dir, name);
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .remove(dir.fh(), name)
            .map_err(|e| self.name_error(&dir, name, e))?;
        self.dir_changed(&dir, reply.dir_attrs.as_ref(), generation);
        self.unlinked(child);
        Ok(())
    }

    pub fn rmdir(&self, parent: u64, name: &OsStr) -> NfsResult<()> {
        trace!(parent, ?name, "rmdir");
        let dir = self.node(parent)?;
        let child = self.cached_child(&dir, name);
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .rmdir(dir.fh(), name)
            .map_err(|e| self.name_error(&dir, name, e))?;
        self.dir_changed(&dir, reply.dir_attrs.as_ref(), generation);
        if let Some(node) = child {
            self.cache.invalidate(&node);
        }
        Ok(())
    }

    pub fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> NfsResult<()> {
        trace!(parent, ?name, new_parent, ?new_name, "rename");
        let from = self.node(parent)?;
        let to = self.node(new_parent)?;
        let moved = self.cached_child(&from, name);
        let replaced = self.cached_child(&to, new_name);
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .rename(from.fh(), name, to.fh(), new_name)
            .map_err(|e| self.name_error(&from, name, e))?;
        self.dir_changed(&from, reply.from_dir_attrs.as_ref(), generation);
        if new_parent != parent {
            self.dir_changed(&to, reply.to_dir_attrs.as_ref(), generation);
        }
        self.unlinked(moved);
        self.unlinked(replaced);
        Ok(())
    }

    pub fn readlink(&self, ino: u64) -> NfsResult<PathBuf> {
        trace!(ino, "readlink");
        let node = self.node(ino)?;
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .readlink(node.fh())
            .map_err(|e| self.handle_error(&node, e))?;
        if let Some(a) = &reply.attrs {
            self.cache.refresh(&node, a, generation);
        }
        Ok(reply.target)
    }

    /// Lists `ino` starting after `cookie`; cookie 0 starts a fresh listing.
    ///
    /// Entries that are already cached are refreshed with the attributes the
    /// server returned. No nodes are created here: a listing hands the kernel
    /// no references, so nothing would ever release them. See [`adopt`].
    ///
    /// [`adopt`]: Self::adopt
    pub fn readdir(&self, ino: u64, cookie: u64, max_entries: u32) -> NfsResult<DirPage> {
        trace!(ino, cookie, max_entries, "readdir");
        let dir = self.node(ino)?;
        let verf = if cookie == 0 { 0 } else { dir.cookieverf() };
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .readdir(dir.fh(), cookie, verf, max_entries)
            .map_err(|e| self.handle_error(&dir, e))?;
        dir.set_cookieverf(reply.cookieverf);
        if let Some(a) = &reply.dir_attrs {
            self.cache.refresh(&dir, a, generation);
        }

        let items = reply
            .entries
            .into_iter()
            .map(|entry| {
                let cached = entry.fh.as_ref().and_then(|fh| self.cache.get_by_handle(fh));
                if let (Some(node), Some(attrs)) = (&cached, entry.attrs.as_ref()) {
                    self.cache.refresh(node, attrs, generation);
                }
                DirItem {
                    kind: entry.attrs.as_ref().map_or(FileKind::Regular, |a| a.kind),
                    name: entry.name,
                    cookie: entry.cookie,
                    fh: entry.fh,
                    ino: cached.map(|n| n.ino()),
                    attrs: entry.attrs,
                }
            })
            .collect();
        Ok(DirPage {
            items,
            eof: reply.eof,
        })
    }

    /// Caches a listed entry so it can be handed to the kernel.
    ///
    /// Uses the handle and attributes the listing carried, falling back to a
    /// lookup in `parent` when the server left either out. The caller owns
    /// the resulting node and must release it if the kernel never sees it.
    pub fn adopt(&self, parent: u64, item: &DirItem) -> NfsResult<NodeEntry> {
        let (Some(fh), Some(attrs)) = (item.fh.as_ref(), item.attrs.as_ref()) else {
            return self.lookup(parent, &item.name);
        };
        let generation = self.cache.next_generation();
        let node = self.cache.resolve(fh)?;
        self.cache.refresh(&node, attrs, generation);
        Ok(NodeEntry {
            ino: node.ino(),
            attrs: node.attrs(),
        })
    }

    /// Returns the subset of `mask` the server grants.
    pub fn access(&self, ino: u64, mask: AccessMask) -> NfsResult<AccessMask> {
        let node = self.node(ino)?;
        let generation = self.cache.next_generation();
        let reply = self
            .session
            .access(node.fh(), mask)
            .map_err(|e| self.handle_error(&node, e))?;
        if let Some(a) = &reply.attrs {
            self.cache.refresh(&node, a, generation);
        }
        Ok(reply.granted & mask)
    }

    pub fn statfs(&self, ino: u64) -> NfsResult<FsStat> {
        let node = self.node(ino)?;
        self.session
            .fsstat(node.fh())
            .map_err(|e| self.handle_error(&node, e))
    }

    pub fn getxattr(&self, ino: u64, name: &OsStr) -> NfsResult<Vec<u8>> {
        let node = self.node(ino)?;
        self.session
            .getxattr(node.fh(), name)
            .map_err(|e| self.handle_error(&node, e))
    }

    pub fn setxattr(&self, ino: u64, name: &OsStr, value: &[u8], flags: i32) -> NfsResult<()> {
        let node = self.node(ino)?;
        self.session
            .setxattr(node.fh(), name, value, flags)
            .map_err(|e| self.handle_error(&node, e))?;
        self.cache.expire(&node);
        Ok(())
    }

    pub fn listxattr(&self, ino: u64) -> NfsResult<Vec<OsString>> {
        let node = self.node(ino)?;
        self.session
            .listxattr(node.fh())
            .map_err(|e| self.handle_error(&node, e))
    }

    pub fn removexattr(&self, ino: u64, name: &OsStr) -> NfsResult<()> {
        let node = self.node(ino)?;
        self.session
            .removexattr(node.fh(), name)
            .map_err(|e| self.handle_error(&node, e))?;
        self.cache.expire(&node);
        Ok(())
    }

    /// Drops a node the kernel no longer references.
    pub fn release_node(&self, ino: u64) {
        if self.cache.evict(ino) {
            trace!(ino, "released node");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::handshake::{self, MountRequest};
    use crate::testing::MemoryConnector;

    struct Fixture {
        connector: MemoryConnector,
        dispatcher: Dispatcher,
    }

    fn mounted(config: CoreConfig) -> Fixture {
        let connector = MemoryConnector::new();
        connector.export().add_dir("/docs");
        connector.export().add_file("/docs/a.txt", b"hello");
        let cache = Arc::new(InodeCache::new(config.clone()));
        let request = MountRequest {
            host: "server".into(),
            export: "/".into(),
            version: 4,
        };
        let state = handshake::mount(&connector, &request, &config, &cache).unwrap();
        let dispatcher = Dispatcher::for_mount(&state, cache);
        Fixture {
            connector,
            dispatcher,
        }
    }

    fn os(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn test_lookup_resolves_same_inode_twice() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let again = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        assert_eq!(docs.ino, again.ino);
        assert!(docs.attrs.is_dir());
    }

    #[test]
    fn test_lookup_missing_name_creates_no_node() {
        let f = mounted(CoreConfig::default());
        let before = f.dispatcher.cache().len();
        let err = f.dispatcher.lookup(ROOT_INODE, os("nope")).unwrap_err();
        assert_eq!(err, NfsError::NotFound);
        assert_eq!(f.dispatcher.cache().len(), before);
    }

    #[test]
    fn test_getattr_served_from_cache_while_fresh() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let calls = f.connector.export().getattr_calls();
        f.dispatcher.getattr(docs.ino).unwrap();
        f.dispatcher.getattr(docs.ino).unwrap();
        assert_eq!(f.connector.export().getattr_calls(), calls);
    }

    #[test]
    fn test_getattr_goes_to_server_when_noac() {
        let f = mounted(CoreConfig::default().noac(true));
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let calls = f.connector.export().getattr_calls();
        f.dispatcher.getattr(docs.ino).unwrap();
        assert_eq!(f.connector.export().getattr_calls(), calls + 1);
    }

    #[test]
    fn test_stale_node_then_remote_delete() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let file = f.dispatcher.lookup(docs.ino, os("a.txt")).unwrap();
        let node = f.dispatcher.cache().get(file.ino).unwrap();
        f.dispatcher.cache().invalidate(&node);
        f.connector.export().remove_path("/docs/a.txt");

        let err = f.dispatcher.getattr(file.ino).unwrap_err();
        assert_eq!(err, NfsError::StaleHandle(file.ino));
        assert_eq!(err.to_errno(), libc::ESTALE);

        let err = f.dispatcher.lookup(docs.ino, os("a.txt")).unwrap_err();
        assert_eq!(err, NfsError::NotFound);
    }

    #[test]
    fn test_invalidated_node_refreshes_when_still_alive() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let node = f.dispatcher.cache().get(docs.ino).unwrap();
        f.dispatcher.cache().invalidate(&node);
        assert!(f.dispatcher.getattr(docs.ino).unwrap().is_dir());
        assert!(!node.is_stale());
    }

    #[test]
    fn test_read_and_write_round_trip_through_server() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let file = f.dispatcher.lookup(docs.ino, os("a.txt")).unwrap();
        assert_eq!(f.dispatcher.read(file.ino, 0, 100).unwrap(), b"hello");
        assert_eq!(f.dispatcher.write(file.ino, 5, b" world").unwrap(), 6);
        assert_eq!(f.dispatcher.getattr(file.ino).unwrap().size, 11);
        assert_eq!(f.dispatcher.read(file.ino, 6, 5).unwrap(), b"world");
    }

    #[test]
    fn test_create_invalidates_parent_listing() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let dir = f.dispatcher.cache().get(docs.ino).unwrap();
        let version = dir.dir_version();

        let created = f.dispatcher.create(docs.ino, os("b.txt"), 0o600, true).unwrap();
        assert_eq!(created.attrs.mode, 0o600);
        assert!(dir.dir_version() > version);
        assert_eq!(
            f.dispatcher.create(docs.ino, os("b.txt"), 0o600, true).unwrap_err().to_errno(),
            libc::EEXIST
        );
    }

    #[test]
    fn test_mkdir_rmdir_unlink() {
        let f = mounted(CoreConfig::default());
        let sub = f.dispatcher.mkdir(ROOT_INODE, os("sub"), 0o755).unwrap();
        f.dispatcher.create(sub.ino, os("x"), 0o644, false).unwrap();
        assert_eq!(
            f.dispatcher.rmdir(ROOT_INODE, os("sub")).unwrap_err().to_errno(),
            libc::ENOTEMPTY
        );
        f.dispatcher.unlink(sub.ino, os("x")).unwrap();
        f.dispatcher.rmdir(ROOT_INODE, os("sub")).unwrap();
        assert_eq!(f.dispatcher.unlink(ROOT_INODE, os("gone")).unwrap_err(), NfsError::NotFound);
    }

    #[test]
    fn test_rename_moves_entry() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let before = f.dispatcher.lookup(docs.ino, os("a.txt")).unwrap();
        f.dispatcher.rename(docs.ino, os("a.txt"), ROOT_INODE, os("moved.txt")).unwrap();
        let after = f.dispatcher.lookup(ROOT_INODE, os("moved.txt")).unwrap();
        assert_eq!(before.ino, after.ino);
        assert_eq!(f.dispatcher.lookup(docs.ino, os("a.txt")).unwrap_err(), NfsError::NotFound);
    }

    #[test]
    fn test_symlink_and_readlink() {
        let f = mounted(CoreConfig::default());
        let link = f
            .dispatcher
            .symlink(ROOT_INODE, os("ln"), Path::new("docs/a.txt"))
            .unwrap();
        assert_eq!(link.attrs.kind, FileKind::Symlink);
        assert_eq!(f.dispatcher.readlink(link.ino).unwrap(), PathBuf::from("docs/a.txt"));
    }

    #[test]
    fn test_hard_link_bumps_nlink() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let file = f.dispatcher.lookup(docs.ino, os("a.txt")).unwrap();
        let linked = f.dispatcher.link(file.ino, ROOT_INODE, os("hard")).unwrap();
        assert_eq!(linked.ino, file.ino);
        assert_eq!(linked.attrs.nlink, 2);
    }

    #[test]
    fn test_mknod_rejects_directories() {
        let f = mounted(CoreConfig::default());
        let err = f
            .dispatcher
            .mknod(ROOT_INODE, os("d"), u32::from(libc::S_IFDIR) | 0o755, 0)
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EINVAL);
        let fifo = f
            .dispatcher
            .mknod(ROOT_INODE, os("p"), u32::from(libc::S_IFIFO) | 0o644, 0)
            .unwrap();
        assert_eq!(fifo.attrs.kind, FileKind::NamedPipe);
    }

    #[test]
    fn test_readdir_pages_entries() {
        let f = mounted(CoreConfig::default());
        for name in ["b", "c", "d"] {
            f.connector.export().add_file(&format!("/{name}"), b"");
        }
        let first = f.dispatcher.readdir(ROOT_INODE, 0, 2).unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(!first.eof);
        let last_cookie = first.items[1].cookie;
        let rest = f.dispatcher.readdir(ROOT_INODE, last_cookie, 10).unwrap();
        assert!(rest.eof);
        let names: Vec<_> = first
            .items
            .iter()
            .chain(rest.items.iter())
            .map(|i| i.name.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b", "c", "d", "docs"]);
        assert!(first.items.iter().all(|i| i.fh.is_some()));
    }

    #[test]
    fn test_readdir_allocates_no_nodes() {
        let f = mounted(CoreConfig::default());
        for i in 0..50 {
            f.connector.export().add_file(&format!("/f{i}"), b"");
        }
        let before = f.dispatcher.cache().len();
        let page = f.dispatcher.readdir(ROOT_INODE, 0, 100).unwrap();
        assert_eq!(page.items.len(), 51);
        assert_eq!(f.dispatcher.cache().len(), before);
        assert!(page.items.iter().all(|i| i.ino.is_none()));
    }

    #[test]
    fn test_readdir_refreshes_known_nodes_and_adopt_caches_new_ones() {
        let f = mounted(CoreConfig::default());
        f.connector.export().add_file("/b", b"");
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();

        let page = f.dispatcher.readdir(ROOT_INODE, 0, 10).unwrap();
        let listed_docs = page.items.iter().find(|i| i.name == "docs").unwrap();
        assert_eq!(listed_docs.ino, Some(docs.ino));

        let b = page.items.iter().find(|i| i.name == "b").unwrap();
        assert_eq!(b.ino, None);
        let adopted = f.dispatcher.adopt(ROOT_INODE, b).unwrap();
        assert_eq!(adopted.ino, f.dispatcher.lookup(ROOT_INODE, os("b")).unwrap().ino);
        assert!(!adopted.attrs.is_dir());
    }

    #[test]
    fn test_unlink_expires_removed_child() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let file = f.dispatcher.lookup(docs.ino, os("a.txt")).unwrap();
        let calls = f.connector.export().getattr_calls();

        f.dispatcher.unlink(docs.ino, os("a.txt")).unwrap();
        let err = f.dispatcher.getattr(file.ino).unwrap_err();
        assert_eq!(err, NfsError::StaleHandle(file.ino));
        assert_eq!(f.connector.export().getattr_calls(), calls + 1);
        assert!(f.dispatcher.cache().get(file.ino).unwrap().is_stale());
    }

    #[test]
    fn test_unlink_of_one_hard_link_keeps_node_alive() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let file = f.dispatcher.lookup(docs.ino, os("a.txt")).unwrap();
        f.dispatcher.link(file.ino, ROOT_INODE, os("hard")).unwrap();

        f.dispatcher.unlink(docs.ino, os("a.txt")).unwrap();
        let attrs = f.dispatcher.getattr(file.ino).unwrap();
        assert_eq!(attrs.nlink, 1);
    }

    #[test]
    fn test_rename_over_existing_expires_replaced_node() {
        let f = mounted(CoreConfig::default());
        f.connector.export().add_file("/victim", b"old");
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let victim = f.dispatcher.lookup(ROOT_INODE, os("victim")).unwrap();

        f.dispatcher
            .rename(docs.ino, os("a.txt"), ROOT_INODE, os("victim"))
            .unwrap();
        assert_eq!(
            f.dispatcher.getattr(victim.ino).unwrap_err(),
            NfsError::StaleHandle(victim.ino)
        );
        assert_eq!(f.dispatcher.lookup(ROOT_INODE, os("victim")).unwrap().attrs.size, 5);
    }

    #[test]
    fn test_rmdir_marks_directory_stale() {
        let f = mounted(CoreConfig::default());
        let sub = f.dispatcher.mkdir(ROOT_INODE, os("sub"), 0o755).unwrap();
        f.dispatcher.rmdir(ROOT_INODE, os("sub")).unwrap();
        assert!(f.dispatcher.cache().get(sub.ino).unwrap().is_stale());
        assert_eq!(f.dispatcher.getattr(sub.ino).unwrap_err(), NfsError::StaleHandle(sub.ino));
    }

    #[test]
    fn test_open_detects_remote_change() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let file = f.dispatcher.lookup(docs.ino, os("a.txt")).unwrap();
        assert!(f.dispatcher.open(file.ino).unwrap().keep_cache);
        f.connector.export().overwrite("/docs/a.txt", b"changed!");
        let outcome = f.dispatcher.open(file.ino).unwrap();
        assert!(!outcome.keep_cache);
        assert_eq!(outcome.attrs.size, 8);
    }

    #[test]
    fn test_transport_failure_maps_to_eio_and_keeps_cache() {
        let f = mounted(CoreConfig::default().noac(true));
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        f.connector.export().set_offline(true);
        let err = f.dispatcher.getattr(docs.ino).unwrap_err();
        assert_eq!(err.to_errno(), libc::EIO);
        let node = f.dispatcher.cache().get(docs.ino).unwrap();
        assert!(!node.is_stale());
    }

    #[test]
    fn test_setattr_truncates() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        let file = f.dispatcher.lookup(docs.ino, os("a.txt")).unwrap();
        let changes = SetAttributes {
            size: Some(2),
            mode: Some(0o600),
            ..SetAttributes::default()
        };
        let attrs = f.dispatcher.setattr(file.ino, &changes).unwrap();
        assert_eq!((attrs.size, attrs.mode), (2, 0o600));
    }

    #[test]
    fn test_xattrs_pass_through() {
        let f = mounted(CoreConfig::default());
        f.dispatcher.setxattr(ROOT_INODE, os("user.k"), b"v", 0).unwrap();
        assert_eq!(f.dispatcher.getxattr(ROOT_INODE, os("user.k")).unwrap(), b"v");
        assert_eq!(f.dispatcher.listxattr(ROOT_INODE).unwrap(), vec![OsString::from("user.k")]);
        f.dispatcher.removexattr(ROOT_INODE, os("user.k")).unwrap();
        assert_eq!(
            f.dispatcher.getxattr(ROOT_INODE, os("user.k")).unwrap_err().to_errno(),
            libc::ENODATA
        );
    }

    #[test]
    fn test_unknown_inode() {
        let f = mounted(CoreConfig::default());
        assert_eq!(f.dispatcher.getattr(9999).unwrap_err(), NfsError::InvalidInode(9999));
    }

    #[test]
    fn test_release_node_keeps_root() {
        let f = mounted(CoreConfig::default());
        let docs = f.dispatcher.lookup(ROOT_INODE, os("docs")).unwrap();
        f.dispatcher.release_node(docs.ino);
        f.dispatcher.release_node(ROOT_INODE);
        assert!(f.dispatcher.cache().get(docs.ino).is_none());
        assert!(f.dispatcher.cache().get(ROOT_INODE).is_some());
    }

    #[test]
    fn test_statfs() {
        let f = mounted(CoreConfig::default());
        let st = f.dispatcher.statfs(ROOT_INODE).unwrap();
        assert_eq!(st.block_size, 4096);
        assert_eq!(st.name_max, 255);
    }
}
