//! Attribute snapshots returned by the server.
//!
//! Every field of [`Attributes`] is guarded by a bit in [`AttrValid`]; a field
//! whose bit is clear carries no information and must not be served.

use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

bitflags! {
    /// Which fields of an [`Attributes`] snapshot are meaningful.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttrValid: u32 {
        const TYPE = 1 << 0;
        const MODE = 1 << 1;
        const NLINK = 1 << 2;
        const OWNER = 1 << 3;
        const GROUP = 1 << 4;
        const RDEV = 1 << 5;
        const SIZE = 1 << 6;
        const PRESIZE = 1 << 7;
        const BLOCKS_USED = 1 << 8;
        const SPACE_USED = 1 << 9;
        const FSID = 1 << 10;
        const FILEID = 1 << 11;
        const ATIME = 1 << 12;
        const MTIME = 1 << 13;
        const CTIME = 1 << 14;
        const PREMTIME = 1 << 15;
        const PRECTIME = 1 << 16;
        const CHANGE = 1 << 17;
        const PRECHANGE = 1 << 18;
        const V4_REFERRAL = 1 << 19;

        /// Fields every GETATTR reply carries.
        const FATTR = Self::TYPE.bits()
            | Self::MODE.bits()
            | Self::NLINK.bits()
            | Self::OWNER.bits()
            | Self::GROUP.bits()
            | Self::RDEV.bits()
            | Self::SIZE.bits()
            | Self::FSID.bits()
            | Self::FILEID.bits()
            | Self::ATIME.bits()
            | Self::MTIME.bits()
            | Self::CTIME.bits();
        const FATTR_V3 = Self::FATTR.bits() | Self::SPACE_USED.bits();
        const FATTR_V4 = Self::FATTR.bits() | Self::SPACE_USED.bits() | Self::CHANGE.bits();
    }
}

/// Object type as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileKind {
    #[default]
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    NamedPipe,
    Socket,
}

impl FileKind {
    /// Derives the kind from the `S_IFMT` bits of a mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & u32::from(libc::S_IFMT) {
            m if m == u32::from(libc::S_IFDIR) => Self::Directory,
            m if m == u32::from(libc::S_IFLNK) => Self::Symlink,
            m if m == u32::from(libc::S_IFBLK) => Self::BlockDevice,
            m if m == u32::from(libc::S_IFCHR) => Self::CharDevice,
            m if m == u32::from(libc::S_IFIFO) => Self::NamedPipe,
            m if m == u32::from(libc::S_IFSOCK) => Self::Socket,
            _ => Self::Regular,
        }
    }
}

/// Filesystem id of the export an object lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fsid {
    pub major: u64,
    pub minor: u64,
}

/// One attribute snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub valid: AttrValid,
    pub kind: FileKind,
    /// Permission bits only (`0o7777`).
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub used: u64,
    pub fsid: Fsid,
    pub fileid: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub change_attr: u64,
    pub pre_size: u64,
    pub pre_mtime: SystemTime,
    pub pre_ctime: SystemTime,
    pub pre_change_attr: u64,
    /// Fetch generation stamped by the cache when the snapshot is applied.
    pub gencount: u64,
    /// Arena index (local inode number) of the node this snapshot belongs to.
    pub owner: Option<u64>,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            valid: AttrValid::empty(),
            kind: FileKind::Regular,
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            used: 0,
            fsid: Fsid::default(),
            fileid: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            change_attr: 0,
            pre_size: 0,
            pre_mtime: UNIX_EPOCH,
            pre_ctime: UNIX_EPOCH,
            pre_change_attr: 0,
            gencount: 0,
            owner: None,
        }
    }
}

impl Attributes {
    /// Copies every field that `newer` marks valid into `self`.
    ///
    /// Fields `newer` does not carry keep their previous value and validity.
    pub fn merge_from(&mut self, newer: &Attributes) {
        let v = newer.valid;
        if v.contains(AttrValid::TYPE) {
            self.kind = newer.kind;
        }
        if v.contains(AttrValid::MODE) {
            self.mode = newer.mode;
        }
        if v.contains(AttrValid::NLINK) {
            self.nlink = newer.nlink;
        }
        if v.contains(AttrValid::OWNER) {
            self.uid = newer.uid;
        }
        if v.contains(AttrValid::GROUP) {
            self.gid = newer.gid;
        }
        if v.contains(AttrValid::RDEV) {
            self.rdev = newer.rdev;
        }
        if v.contains(AttrValid::SIZE) {
            self.size = newer.size;
        }
        if v.intersects(AttrValid::SPACE_USED | AttrValid::BLOCKS_USED) {
            self.used = newer.used;
        }
        if v.contains(AttrValid::FSID) {
            self.fsid = newer.fsid;
        }
        if v.contains(AttrValid::FILEID) {
            self.fileid = newer.fileid;
        }
        if v.contains(AttrValid::ATIME) {
            self.atime = newer.atime;
        }
        if v.contains(AttrValid::MTIME) {
            self.mtime = newer.mtime;
        }
        if v.contains(AttrValid::CTIME) {
            self.ctime = newer.ctime;
        }
        if v.contains(AttrValid::CHANGE) {
            self.change_attr = newer.change_attr;
        }
        if v.contains(AttrValid::PRESIZE) {
            self.pre_size = newer.pre_size;
        }
        if v.contains(AttrValid::PREMTIME) {
            self.pre_mtime = newer.pre_mtime;
        }
        if v.contains(AttrValid::PRECTIME) {
            self.pre_ctime = newer.pre_ctime;
        }
        if v.contains(AttrValid::PRECHANGE) {
            self.pre_change_attr = newer.pre_change_attr;
        }
        self.valid |= v;
    }

    /// Whether applying `newer` would change data-visible state.
    ///
    /// Drives attribute-timeout adaptation: a changed object gets a short
    /// timeout, an unchanged one a longer one.
    pub fn differs_in_content(&self, newer: &Attributes) -> bool {
        let v = newer.valid & self.valid;
        (v.contains(AttrValid::MTIME) && self.mtime != newer.mtime)
            || (v.contains(AttrValid::CTIME) && self.ctime != newer.ctime)
            || (v.contains(AttrValid::SIZE) && self.size != newer.size)
            || (v.contains(AttrValid::CHANGE) && self.change_attr != newer.change_attr)
    }

    /// Number of 512-byte blocks backing the object.
    pub fn blocks(&self) -> u64 {
        let bytes = if self.valid.intersects(AttrValid::SPACE_USED | AttrValid::BLOCKS_USED) {
            self.used
        } else {
            self.size
        };
        calc_block_size(bytes)
    }

    /// Size clamped to the signed file offset range.
    pub fn size_as_offset(&self) -> i64 {
        size_to_off_t(self.size)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Rounds a byte count up to 512-byte blocks.
pub fn calc_block_size(bytes: u64) -> u64 {
    bytes.div_ceil(512)
}

/// Clamps an unsigned size into `off_t` range.
pub fn size_to_off_t(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// Timestamp update in a SETATTR request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    ServerCurrent,
    ClientTime(SystemTime),
}

/// Fields to change in a SETATTR request; `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttributes {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
}

impl SetAttributes {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn full(size: u64, mtime_secs: u64) -> Attributes {
        Attributes {
            valid: AttrValid::FATTR_V3,
            kind: FileKind::Regular,
            mode: 0o644,
            nlink: 1,
            size,
            used: size,
            fileid: 42,
            mtime: UNIX_EPOCH + Duration::from_secs(mtime_secs),
            ..Attributes::default()
        }
    }

    #[test]
    fn test_merge_copies_only_valid_fields() {
        let mut base = full(100, 10);
        let partial = Attributes {
            valid: AttrValid::SIZE,
            size: 500,
            mode: 0o777,
            ..Attributes::default()
        };
        base.merge_from(&partial);
        assert_eq!(base.size, 500);
        assert_eq!(base.mode, 0o644);
        assert_eq!(base.fileid, 42);
    }

    #[test]
    fn test_merge_accumulates_validity() {
        let mut base = Attributes::default();
        base.merge_from(&Attributes {
            valid: AttrValid::MODE,
            mode: 0o600,
            ..Attributes::default()
        });
        base.merge_from(&Attributes {
            valid: AttrValid::NLINK,
            nlink: 3,
            ..Attributes::default()
        });
        assert!(base.valid.contains(AttrValid::MODE | AttrValid::NLINK));
        assert_eq!((base.mode, base.nlink), (0o600, 3));
    }

    #[test]
    fn test_differs_in_content() {
        let a = full(100, 10);
        assert!(!a.differs_in_content(&full(100, 10)));
        assert!(a.differs_in_content(&full(101, 10)));
        assert!(a.differs_in_content(&full(100, 11)));
    }

    #[test]
    fn test_block_math() {
        assert_eq!(calc_block_size(0), 0);
        assert_eq!(calc_block_size(1), 1);
        assert_eq!(calc_block_size(512), 1);
        assert_eq!(calc_block_size(513), 2);
        assert_eq!(size_to_off_t(u64::MAX), i64::MAX);
        assert_eq!(size_to_off_t(7), 7);
    }

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(FileKind::from_mode(0o040755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(0o120777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(0o100644), FileKind::Regular);
    }

    #[test]
    fn test_composite_masks() {
        assert!(AttrValid::FATTR_V4.contains(AttrValid::CHANGE));
        assert!(!AttrValid::FATTR_V3.contains(AttrValid::CHANGE));
        assert!(AttrValid::FATTR_V3.contains(AttrValid::SPACE_USED));
    }
}
