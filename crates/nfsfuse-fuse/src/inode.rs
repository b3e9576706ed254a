//! Kernel lookup counts.
//!
//! Every reply that hands the kernel an inode (lookup, create, mkdir, mknod,
//! symlink, link and each readdirplus entry) takes one reference; `forget`
//! gives references back. When an inode's count reaches zero its cache node
//! may be evicted. The root is pinned for the life of the mount.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use nfsfuse_core::ROOT_INODE;

/// Per-inode `nlookup` tracking.
#[derive(Debug, Default)]
pub struct LookupCounts {
    counts: DashMap<u64, AtomicU64>,
}

impl LookupCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more kernel reference to `ino` and returns the new count.
    pub fn inc(&self, ino: u64) -> u64 {
        self.counts
            .entry(ino)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    /// Drops `nlookup` references. Returns true when the inode is no longer
    /// referenced and may be evicted; never true for the root.
    pub fn forget(&self, ino: u64, nlookup: u64) -> bool {
        if ino == ROOT_INODE {
            return false;
        }
        let Some(entry) = self.counts.get(&ino) else {
            return false;
        };
        let (Ok(old) | Err(old)) = entry.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
            Some(c.saturating_sub(nlookup))
        });
        let remaining = old.saturating_sub(nlookup);
        drop(entry);
        if remaining == 0 {
            self.counts.remove_if(&ino, |_, c| c.load(Ordering::Acquire) == 0);
            return true;
        }
        false
    }

    pub fn get(&self, ino: u64) -> u64 {
        self.counts
            .get(&ino)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nlookup_increment_decrement() {
        let counts = LookupCounts::new();
        assert_eq!(counts.inc(5), 1);
        assert_eq!(counts.inc(5), 2);
        assert!(!counts.forget(5, 1));
        assert_eq!(counts.get(5), 1);
        assert!(counts.forget(5, 1));
        assert_eq!(counts.get(5), 0);
        assert!(counts.is_empty());
    }

    #[test]
    fn test_batched_forget() {
        let counts = LookupCounts::new();
        for _ in 0..3 {
            counts.inc(9);
        }
        assert!(counts.forget(9, 3));
    }

    #[test]
    fn test_over_forget_saturates() {
        let counts = LookupCounts::new();
        counts.inc(4);
        assert!(counts.forget(4, 10));
        assert_eq!(counts.get(4), 0);
    }

    #[test]
    fn test_root_is_never_released() {
        let counts = LookupCounts::new();
        counts.inc(ROOT_INODE);
        assert!(!counts.forget(ROOT_INODE, 1));
        assert_eq!(counts.len(), 1);
    }

    #[test]
    fn test_unknown_inode_is_ignored() {
        let counts = LookupCounts::new();
        assert!(!counts.forget(42, 1));
    }
}
