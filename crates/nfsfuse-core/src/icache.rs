//! Handle-keyed inode and attribute cache.
//!
//! Every remote object the kernel has seen is a [`CacheNode`] in one arena,
//! addressed by a stable local inode number and reachable from its
//! [`FileHandle`]. Nodes carry the last applied attribute snapshot, a
//! staleness flag and an adaptive attribute timeout.
//!
//! Concurrency: the two maps are sharded (`DashMap`); each node's mutable
//! state sits behind its own mutex. No operation takes a cache-wide lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, trace};

use crate::attr::{AttrValid, Attributes};
use crate::config::CoreConfig;
use crate::fh::FileHandle;

/// Inode number of the export root (FUSE convention).
pub const ROOT_INODE: u64 = 1;

bitflags! {
    /// Per-node state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NodeFlags: u32 {
        /// Prefer READDIRPLUS when listing this directory.
        const ADVISE_RDPLUS = 1 << 0;
        /// The node may no longer name a live object; refresh before use.
        const STALE = 1 << 1;
        const ACL_LRU_SET = 1 << 2;
        /// Root of the mounted export.
        const MOUNTPOINT = 1 << 3;
        /// Dirty data is being written back.
        const FLUSHING = 1 << 4;
        const FSCACHE = 1 << 5;
        const FSCACHE_LOCK = 1 << 6;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("inode cache is full ({limit} nodes)")]
    Full { limit: usize },
}

/// Mutable part of a node, guarded by the node's mutex.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub attrs: Attributes,
    pub flags: NodeFlags,
    pub attr_timeout: Duration,
    pub fetched_at: Option<Instant>,
    /// Generation of the last snapshot applied.
    pub last_generation: u64,
    /// Bumped whenever the directory's contents may have changed.
    pub dir_version: u64,
    /// READDIR cookie verifier from the last listing.
    pub cookieverf: u64,
}

/// One cached remote object.
#[derive(Debug)]
pub struct CacheNode {
    ino: u64,
    fh: FileHandle,
    state: Mutex<NodeState>,
}

impl CacheNode {
    fn new(ino: u64, fh: FileHandle, flags: NodeFlags, attr_timeout: Duration) -> Self {
        Self {
            ino,
            fh,
            state: Mutex::new(NodeState {
                attrs: Attributes::default(),
                flags,
                attr_timeout,
                fetched_at: None,
                last_generation: 0,
                dir_version: 0,
                cookieverf: 0,
            }),
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn fh(&self) -> &FileHandle {
        &self.fh
    }

    /// Copy of the current attribute snapshot.
    pub fn attrs(&self) -> Attributes {
        self.state.lock().attrs.clone()
    }

    pub fn flags(&self) -> NodeFlags {
        self.state.lock().flags
    }

    pub fn is_stale(&self) -> bool {
        self.flags().contains(NodeFlags::STALE)
    }

    pub fn fileid(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .attrs
            .valid
            .contains(AttrValid::FILEID)
            .then_some(state.attrs.fileid)
    }

    pub fn dir_version(&self) -> u64 {
        self.state.lock().dir_version
    }

    pub fn cookieverf(&self) -> u64 {
        self.state.lock().cookieverf
    }

    pub fn set_cookieverf(&self, verf: u64) {
        self.state.lock().cookieverf = verf;
    }

    pub fn set_flags(&self, flags: NodeFlags, on: bool) {
        self.state.lock().flags.set(flags, on);
    }

    /// Locks the node's state for a compound read-modify-write.
    pub fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }
}

/// The inode/attribute cache.
pub struct InodeCache {
    by_handle: DashMap<FileHandle, u64>,
    nodes: DashMap<u64, Arc<CacheNode>>,
    next_ino: AtomicU64,
    generation: AtomicU64,
    config: CoreConfig,
}

impl InodeCache {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            by_handle: DashMap::new(),
            nodes: DashMap::new(),
            next_ino: AtomicU64::new(ROOT_INODE + 1),
            generation: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Returns the node for `fh`, allocating one on first sight.
    ///
    /// A new node has an empty validity mask and is expired; callers must
    /// refresh it before serving attributes.
    pub fn resolve(&self, fh: &FileHandle) -> Result<Arc<CacheNode>, CacheError> {
        self.resolve_as(fh, None)
    }

    /// Resolves the export root, pinning it to [`ROOT_INODE`].
    pub fn resolve_root(&self, fh: &FileHandle) -> Result<Arc<CacheNode>, CacheError> {
        self.resolve_as(fh, Some(ROOT_INODE))
    }

    fn resolve_as(
        &self,
        fh: &FileHandle,
        fixed_ino: Option<u64>,
    ) -> Result<Arc<CacheNode>, CacheError> {
        match self.by_handle.entry(*fh) {
            Entry::Occupied(mut e) => {
                if let Some(node) = self.nodes.get(e.get()) {
                    return Ok(Arc::clone(node.value()));
                }
                // Evicted between the two map reads.
                let node = self.allocate(fh, fixed_ino)?;
                e.insert(node.ino);
                Ok(node)
            }
            Entry::Vacant(e) => {
                let node = self.allocate(fh, fixed_ino)?;
                e.insert(node.ino);
                Ok(node)
            }
        }
    }

    fn allocate(&self, fh: &FileHandle, fixed_ino: Option<u64>) -> Result<Arc<CacheNode>, CacheError> {
        if let Some(limit) = self.config.max_nodes
            && self.nodes.len() >= limit
        {
            return Err(CacheError::Full { limit });
        }
        let (ino, flags) = match fixed_ino {
            Some(ino) => (ino, NodeFlags::MOUNTPOINT),
            None => (self.next_ino.fetch_add(1, Ordering::Relaxed), NodeFlags::empty()),
        };
        let (min, _) = self.config.timeout_bounds(false);
        let node = Arc::new(CacheNode::new(ino, *fh, flags, min));
        self.nodes.insert(ino, Arc::clone(&node));
        trace!(ino, ?fh, "allocated cache node");
        Ok(node)
    }

    pub fn get(&self, ino: u64) -> Option<Arc<CacheNode>> {
        self.nodes.get(&ino).map(|n| Arc::clone(n.value()))
    }

    pub fn get_by_handle(&self, fh: &FileHandle) -> Option<Arc<CacheNode>> {
        let ino = *self.by_handle.get(fh)?;
        self.get(ino)
    }

    pub fn root(&self) -> Option<Arc<CacheNode>> {
        self.get(ROOT_INODE)
    }

    /// Hands out the next fetch generation.
    ///
    /// Take a generation before issuing the RPC whose reply will be applied,
    /// so replies that arrive out of order are ordered by issue time.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Applies `snapshot` to `node` unless a newer generation is already in.
    ///
    /// Returns whether the snapshot was applied.
    pub fn refresh(&self, node: &CacheNode, snapshot: &Attributes, generation: u64) -> bool {
        self.refresh_at(node, snapshot, generation, Instant::now())
    }

    pub fn refresh_at(
        &self,
        node: &CacheNode,
        snapshot: &Attributes,
        generation: u64,
        now: Instant,
    ) -> bool {
        let mut state = node.state.lock();
        if generation < state.last_generation {
            debug!(
                ino = node.ino,
                generation,
                applied = state.last_generation,
                "ignoring out-of-order attribute refresh"
            );
            return false;
        }

        let first = state.attrs.valid.is_empty();
        let changed = !first && state.attrs.differs_in_content(snapshot);
        state.attrs.merge_from(snapshot);
        state.attrs.gencount = generation;
        state.attrs.owner = Some(node.ino);
        state.last_generation = generation;
        state.fetched_at = Some(now);
        state.flags.remove(NodeFlags::STALE);

        let is_dir = state.attrs.is_dir();
        let (min, max) = self.config.timeout_bounds(is_dir);
        state.attr_timeout = if first || changed {
            min
        } else {
            state.attr_timeout.saturating_mul(2).clamp(min, max)
        };
        if is_dir && changed {
            state.dir_version += 1;
        }
        trace!(
            ino = node.ino,
            generation,
            changed,
            timeout_ms = state.attr_timeout.as_millis(),
            "refreshed attributes"
        );
        true
    }

    /// Marks `node` stale. The node stays in the cache.
    pub fn invalidate(&self, node: &CacheNode) {
        node.state.lock().flags.insert(NodeFlags::STALE);
        debug!(ino = node.ino, "invalidated cache node");
    }

    /// Forces the next attribute read of `node` to go to the server.
    pub fn expire(&self, node: &CacheNode) {
        node.state.lock().fetched_at = None;
    }

    /// Records that a directory's contents changed locally.
    ///
    /// Expires its attributes and restarts listing from a fresh verifier.
    pub fn invalidate_dir(&self, node: &CacheNode) {
        let mut state = node.state.lock();
        state.dir_version += 1;
        state.cookieverf = 0;
        state.fetched_at = None;
    }

    /// Whether the attribute timeout of `node` has elapsed at `now`.
    ///
    /// Expiry is a soft hint; staleness is checked separately.
    pub fn is_expired(&self, node: &CacheNode, now: Instant) -> bool {
        if self.config.noac {
            return true;
        }
        let state = node.state.lock();
        match state.fetched_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) > state.attr_timeout,
        }
    }

    /// Whether `node` can be served from cache at `now`.
    pub fn is_fresh(&self, node: &CacheNode, now: Instant) -> bool {
        let usable = {
            let state = node.state.lock();
            !state.flags.contains(NodeFlags::STALE) && state.attrs.valid.contains(AttrValid::TYPE)
        };
        usable && !self.is_expired(node, now)
    }

    /// Drops a node once nothing above the cache refers to it.
    ///
    /// The root is never evicted.
    pub fn evict(&self, ino: u64) -> bool {
        if ino == ROOT_INODE {
            return false;
        }
        let Some((_, node)) = self.nodes.remove(&ino) else {
            return false;
        };
        self.by_handle.remove_if(&node.fh, |_, v| *v == ino);
        trace!(ino, "evicted cache node");
        true
    }

    /// Drops every node, including the root.
    pub fn clear(&self) {
        self.nodes.clear();
        self.by_handle.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl std::fmt::Debug for InodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeCache")
            .field("nodes", &self.nodes.len())
            .field("next_ino", &self.next_ino.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
