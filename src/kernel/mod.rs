//! The kernel boundary.
//!
//! Every ioctl-like primitive the engine needs (section 6) is reached
//! through the [`Kernel`] trait rather than called directly. Production
//! code drives it against [`linux::LinuxKernel`]; tests drive it against an
//! in-memory fake (enabled by the `testkit` feature, see `kernel::fake`).
//! Keeping the boundary behind a trait is what lets sections 8's invariants
//! and scenarios run as ordinary `cargo test`, without a mounted
//! reflink-capable filesystem.

pub mod linux;

#[cfg(any(test, feature = "testkit"))]
pub mod fake;

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::geometry::{Device, Geometry};
use crate::record::{Bulkstat, BmapxRecord, FsmapRecord, FsrefsRecord, Handle, Owner};

/// Errors a `Kernel` implementation can report. These map onto section 7's
/// transient-per-record and resource-pressure categories; precondition and
/// invariant failures are raised by the engine itself from the data a
/// `Kernel` call returns.
#[derive(Debug, Error)]
pub enum KernelError {
    /// The primitive is not implemented by this kernel/filesystem.
    #[error("primitive not supported")]
    NotSupported,
    /// The filesystem is out of space to complete the operation.
    #[error("out of space")]
    OutOfSpace,
    /// A freshness precondition failed (owner changed since it was opened).
    #[error("target busy: freshness check failed")]
    Busy,
    /// Dedupe's byte comparison found the ranges differ.
    #[error("dedupe compare mismatch")]
    DataDiffers,
    /// The referenced object (inode, AG, handle) no longer exists.
    #[error("not found")]
    NotFound,
    /// A query result named a device other than the one queried.
    #[error("result named the wrong device")]
    WrongDevice,
    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Opaque handle to a file the engine is operating on (a helper file or an
/// owner opened by handle). Implementations map this onto a real file
/// descriptor internally; the engine never assumes anything about its
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u64);

/// Which fork of a file a BMAPX query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    /// The data fork.
    Data,
    /// The extended-attribute fork.
    Attr,
    /// The copy-on-write fork.
    Cow,
}

/// The named metadata objects the metadata stage (C6) can force a rebuild
/// of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebuildKind {
    /// Free-space-by-block btree.
    FreeSpaceByBlock,
    /// Free-space-by-count btree.
    FreeSpaceByCount,
    /// The AG free list.
    FreeList,
    /// Reverse-map btree.
    ReverseMap,
    /// Inode btree.
    InodeBtree,
    /// Free inode btree.
    FreeInodeBtree,
    /// Refcount btree.
    RefcountBtree,
}

impl RebuildKind {
    /// All metadata kinds the metadata stage knows how to rebuild, in the
    /// order the driver attempts them for a given allocation group.
    pub const ALL: [RebuildKind; 7] = [
        RebuildKind::FreeSpaceByBlock,
        RebuildKind::FreeSpaceByCount,
        RebuildKind::FreeList,
        RebuildKind::ReverseMap,
        RebuildKind::InodeBtree,
        RebuildKind::FreeInodeBtree,
        RebuildKind::RefcountBtree,
    ];
}

/// Parameters for a dedupe-range call (section 4.5, dedupe path).
#[derive(Debug, Clone, Copy)]
pub struct DedupeRequest {
    /// Source file (the work file, holding the data to compare against).
    pub src: FileId,
    /// Offset into the source.
    pub src_offset: u64,
    /// Length to compare/remap.
    pub length: u64,
    /// Destination file (the owner).
    pub dest: FileId,
    /// Offset into the destination.
    pub dest_offset: u64,
}

/// Outcome of a dedupe-range call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeOutcome {
    /// Bytes matched; the destination now shares the source's blocks.
    Remapped {
        /// Number of bytes actually remapped (may be less than requested).
        bytes: u64,
    },
    /// Bytes differed; nothing changed.
    Differed,
}

/// Parameters for an exchange-range call (section 4.5, exchange path).
#[derive(Debug, Clone, Copy)]
pub struct ExchangeRequest {
    /// The owner file (file1).
    pub file1: FileId,
    /// The work file (file2).
    pub file2: FileId,
    /// Offset into file1.
    pub offset1: u64,
    /// Offset into file2.
    pub offset2: u64,
    /// Length to exchange.
    pub length: u64,
    /// Freshness snapshot file2 (the owner, confusingly named file1 above in
    /// the byte-range sense but file2 in the source's freshness-check sense)
    /// must still match for the exchange to proceed atomically.
    pub freshness: Bulkstat,
}

/// The kernel boundary the engine is built against. See the module
/// documentation for why this is a trait rather than free functions.
pub trait Kernel {
    /// Probes `device`'s geometry and capabilities: block/sector size, AG
    /// size, and whether reverse mapping, map-freesp, reflink, and metadata
    /// rebuild are available.
    fn probe(&mut self, device: Device) -> Result<Geometry, KernelError>;

    /// Creates an anonymous, mode-0600 helper file on `device`, rooted under
    /// `directory`. `realtime` must match `device`'s realtime-ness.
    fn create_helper_file(
        &mut self,
        device: Device,
        directory: &Path,
        realtime: bool,
    ) -> Result<FileId, KernelError>;

    /// Truncates `file` to `len` bytes.
    fn truncate(&mut self, file: FileId, len: u64) -> Result<(), KernelError>;

    /// Closes `file`. Implementations must make this infallible from the
    /// caller's point of view (best-effort on the underlying resource).
    fn close(&mut self, file: FileId);

    /// Returns the [`Owner`] identity a file would show up as in fsmap
    /// records, i.e. `Owner::Inode(ino)`. Used right after creating a
    /// helper file so the freeze/migration stages can recognize and skip
    /// their own capture/work files while scanning the reverse map.
    fn owner_of(&mut self, file: FileId) -> Result<Owner, KernelError>;

    /// Cursored reverse-map query (get-fsmap), returning up to `max`
    /// records clipped to `[low, high)`.
    fn fsmap(
        &mut self,
        device: Device,
        low: u64,
        high: u64,
        max: usize,
    ) -> Result<Vec<FsmapRecord>, KernelError>;

    /// Cursored refcount query (get-fsrefs), returning up to `max` records
    /// clipped to `[low, high)`.
    fn fsrefs(
        &mut self,
        device: Device,
        low: u64,
        high: u64,
        max: usize,
    ) -> Result<Vec<FsrefsRecord>, KernelError>;

    /// Cursored per-file extent query (get-bmapx), returning up to `max`
    /// records clipped to `[low, high)` of the given fork.
    fn bmapx(
        &mut self,
        file: FileId,
        fork: Fork,
        low: u64,
        high: u64,
        max: usize,
    ) -> Result<Vec<BmapxRecord>, KernelError>;

    /// Reserves `[physical_start, physical_start + length)` into `file`'s
    /// extent map without writing data. Returns the number of bytes
    /// actually reserved (may be less than requested on partial success).
    fn map_freesp(
        &mut self,
        file: FileId,
        physical_start: u64,
        length: u64,
    ) -> Result<u64, KernelError>;

    /// Reflinks `[src_offset, src_offset + length)` of `src` into `dst` at
    /// `dst_offset`. Returns the number of bytes actually accepted.
    fn clone_range(
        &mut self,
        src: FileId,
        src_offset: u64,
        dst: FileId,
        dst_offset: u64,
        length: u64,
    ) -> Result<u64, KernelError>;

    /// Verify-and-remap a source range over a destination range.
    fn dedupe_range(&mut self, req: DedupeRequest) -> Result<DedupeOutcome, KernelError>;

    /// Atomically swaps the mappings of two files over a byte range,
    /// conditional on `req.freshness` still matching `req.file1`.
    /// Returns [`KernelError::Busy`] if the freshness check fails.
    fn exchange_range(&mut self, req: ExchangeRequest) -> Result<(), KernelError>;

    /// Breaks one level of sharing on `[offset, offset + length)` of
    /// `file`, forcing a private copy.
    fn unshare(&mut self, file: FileId, offset: u64, length: u64) -> Result<(), KernelError>;

    /// Forces an in-kernel rebuild of the named metadata object for
    /// allocation group `ag`.
    fn scrub_metadata(&mut self, device: Device, ag: u32, kind: RebuildKind)
        -> Result<(), KernelError>;

    /// Snapshots an inode by number.
    fn bulkstat_single(&mut self, device: Device, ino: u64) -> Result<Bulkstat, KernelError>;

    /// Race-safe open given a device-scoped handle.
    fn open_by_handle(&mut self, device: Device, handle: Handle) -> Result<FileId, KernelError>;

    /// Administrative sync: drops speculative preallocations and CoW forks
    /// across `device`.
    fn free_eofblocks(&mut self, device: Device) -> Result<(), KernelError>;

    /// Toggles the realtime-volume affinity flag on a freshly created file,
    /// before any data is written to it.
    fn set_realtime_flag(&mut self, file: FileId, realtime: bool) -> Result<(), KernelError>;

    /// Buffered read-then-write copy of `[src_offset, src_offset + length)`
    /// from `src` into `dst` at `dst_offset`. Used by the exchange path,
    /// which has no reflink to lean on.
    fn buffered_copy(
        &mut self,
        src: FileId,
        src_offset: u64,
        dst: FileId,
        dst_offset: u64,
        length: u64,
    ) -> Result<(), KernelError>;

    /// Returns the physical address backing `file` at `offset`, or `None`
    /// if it is a hole. A thin convenience over a single-record BMAPX
    /// query, used by the freeze stage's post-reflink verification step.
    fn physical_at(&mut self, file: FileId, offset: u64) -> Result<Option<u64>, KernelError>;
}
