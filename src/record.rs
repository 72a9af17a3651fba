//! Record types returned by the query layer (section 3: FSMAP, FSREFS,
//! BMAPX, bulkstat) plus the small value types shared by the rest of the
//! engine (owners, handles).

use bitflags::bitflags;

use crate::geometry::Device;

/// Identifies who a physical extent (or file extent) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// A regular inode, identified by its number.
    Inode(u64),
    /// Free space: no owner.
    FreeSpace,
    /// An inode chunk (the inode btree's backing blocks).
    InodeChunk,
    /// Per-AG bookkeeping metadata (free-space btrees, free list, reverse-map
    /// btree, refcount btree).
    AgMetadata,
    /// The filesystem log.
    Log,
    /// Superblock / AG header area.
    Superblock,
    /// A block the filesystem has marked defective; never movable.
    Defective,
}

impl Owner {
    /// Whether this owner is a "special" owner, i.e. not a regular file or
    /// directory inode.
    pub fn is_special(self) -> bool {
        !matches!(self, Owner::Inode(_))
    }

    /// Whether this owner can ever be relocated by this engine.
    pub fn is_movable(self) -> bool {
        !matches!(self, Owner::Log | Owner::Superblock | Owner::Defective)
    }
}

bitflags! {
    /// Flags carried by an FSMAP record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsmapFlags: u32 {
        /// The extent belongs to the owner's attribute fork.
        const ATTR_FORK   = 1 << 0;
        /// The extent belongs to the owner's extent-map (BMBT) blocks.
        const EXTENT_MAP  = 1 << 1;
        /// The extent is preallocated but unwritten.
        const UNWRITTEN   = 1 << 2;
        /// This is the last record of the query.
        const LAST        = 1 << 3;
    }
}

bitflags! {
    /// Flags carried by a BMAPX record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BmapxFlags: u32 {
        /// The extent is shared with another owner (reflinked).
        const SHARED      = 1 << 0;
        /// The extent is preallocated but unwritten.
        const UNWRITTEN   = 1 << 1;
        /// This is the last record of the file.
        const LAST        = 1 << 2;
    }
}

/// A reverse-mapping record: physical range to logical owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmapRecord {
    /// Which volume this record is on.
    pub device: Device,
    /// Start of the physical extent, in bytes.
    pub physical_start: u64,
    /// Length of the extent, in bytes.
    pub length: u64,
    /// Who owns this extent.
    pub owner: Owner,
    /// Byte offset within the owner, if meaningful for this owner/flags.
    pub offset_in_owner: u64,
    /// Record flags.
    pub flags: FsmapFlags,
}

impl FsmapRecord {
    /// Exclusive end of the physical extent.
    pub fn end(&self) -> u64 {
        self.physical_start + self.length
    }

    /// Clips this record to `[low, high)`, shifting `offset_in_owner` by the
    /// same delta applied to `physical_start` when the offset is meaningful
    /// (extent-map or special-owner records).
    ///
    /// Returns `None` if the record does not intersect the window at all.
    pub fn clip(&self, low: u64, high: u64) -> Option<Self> {
        let start = self.physical_start.max(low);
        let end = self.end().min(high);
        if start >= end {
            return None;
        }
        let delta = start - self.physical_start;
        let shift_offset = self.flags.contains(FsmapFlags::EXTENT_MAP) || self.owner.is_special();
        let offset_in_owner = if shift_offset {
            self.offset_in_owner + delta
        } else {
            self.offset_in_owner
        };
        Some(Self {
            device: self.device,
            physical_start: start,
            length: end - start,
            owner: self.owner,
            offset_in_owner,
            flags: self.flags,
        })
    }
}

/// A refcount record: physical range to number of owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsrefsRecord {
    /// Which volume this record is on.
    pub device: Device,
    /// Start of the physical extent, in bytes.
    pub physical_start: u64,
    /// Length of the extent, in bytes.
    pub length: u64,
    /// Number of distinct owners sharing this extent.
    pub owners: u32,
    /// Record flags (reuses the FSMAP flag space; only `UNWRITTEN`/`LAST`
    /// are meaningful here).
    pub flags: FsmapFlags,
}

impl FsrefsRecord {
    /// Exclusive end of the physical extent.
    pub fn end(&self) -> u64 {
        self.physical_start + self.length
    }

    /// Clips this record to `[low, high)`.
    pub fn clip(&self, low: u64, high: u64) -> Option<Self> {
        let start = self.physical_start.max(low);
        let end = self.end().min(high);
        if start >= end {
            return None;
        }
        Some(Self {
            device: self.device,
            physical_start: start,
            length: end - start,
            owners: self.owners,
            flags: self.flags,
        })
    }
}

/// A per-file extent map record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmapxRecord {
    /// Logical offset within the file, in bytes.
    pub file_offset: u64,
    /// Physical start address, or a hole/delalloc sentinel.
    pub physical: PhysicalOrSentinel,
    /// Length of the extent, in bytes.
    pub length: u64,
    /// Record flags.
    pub flags: BmapxFlags,
}

/// Either an on-disk physical address or one of the two BMAPX sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalOrSentinel {
    /// An on-disk physical byte address.
    Addr(u64),
    /// A hole (`physical_start == -1`).
    Hole,
    /// A delayed allocation (`physical_start == -2`).
    Delalloc,
}

/// A compact inode snapshot used as a freshness token (section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bulkstat {
    /// Inode number.
    pub ino: u64,
    /// Inode generation.
    pub generation: u32,
    /// File mode (type + permission bits).
    pub mode: u32,
    /// Last change time, as (seconds, nanoseconds) since the epoch.
    pub ctime: (i64, u32),
    /// Last modification time, as (seconds, nanoseconds) since the epoch.
    pub mtime: (i64, u32),
}

impl Bulkstat {
    /// Whether the inode is a regular file.
    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    /// Whether the inode is a directory.
    pub fn is_directory(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Whether `other` represents the exact same inode at the exact same
    /// freshness: same generation and same (ctime, mtime). This is the
    /// check required before any mutating kernel call on an opened owner.
    pub fn is_fresh_against(&self, other: &Bulkstat) -> bool {
        self.ino == other.ino
            && self.generation == other.generation
            && self.ctime == other.ctime
            && self.mtime == other.mtime
    }
}

/// An opaque, device-scoped handle: filesystem id plus (inode, generation).
/// Used for race-safe "open by handle" without a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    /// Inode number.
    pub ino: u64,
    /// Inode generation, used to detect reuse.
    pub generation: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    fn rec(physical_start: u64, length: u64, owner: Owner, flags: FsmapFlags) -> FsmapRecord {
        FsmapRecord {
            device: Device::Data,
            physical_start,
            length,
            owner,
            offset_in_owner: 0,
            flags,
        }
    }

    #[test]
    fn clip_inside_window() {
        let r = rec(100, 50, Owner::Inode(5), FsmapFlags::empty());
        let clipped = r.clip(0, 1000).unwrap();
        assert_eq!(clipped, r);
    }

    #[test]
    fn clip_truncates_and_shifts_special_owner() {
        let r = FsmapRecord {
            device: Device::Data,
            physical_start: 100,
            length: 100,
            owner: Owner::AgMetadata,
            offset_in_owner: 0,
            flags: FsmapFlags::empty(),
        };
        let clipped = r.clip(120, 1000).unwrap();
        assert_eq!(clipped.physical_start, 120);
        assert_eq!(clipped.length, 80);
        assert_eq!(clipped.offset_in_owner, 20);
    }

    #[test]
    fn clip_does_not_shift_plain_inode_offset() {
        let r = rec(100, 100, Owner::Inode(7), FsmapFlags::empty());
        let clipped = r.clip(120, 1000).unwrap();
        assert_eq!(clipped.offset_in_owner, 0);
    }

    #[test]
    fn clip_outside_window_is_none() {
        let r = rec(100, 50, Owner::Inode(5), FsmapFlags::empty());
        assert!(r.clip(200, 300).is_none());
    }

    #[test]
    fn bulkstat_freshness() {
        let a = Bulkstat {
            ino: 1,
            generation: 2,
            mode: libc::S_IFREG,
            ctime: (10, 0),
            mtime: (10, 0),
        };
        let b = a;
        assert!(a.is_fresh_against(&b));
        let mut c = a;
        c.mtime.0 += 1;
        assert!(!a.is_fresh_against(&c));
    }
}
