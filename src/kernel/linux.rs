//! Linux/XFS-backed implementation of [`super::Kernel`].
//!
//! This is the production binding: every method here issues a real ioctl
//! (or, where Linux has no ioctl for the primitive, a real syscall) against
//! an open file descriptor. It is exercised by nothing in this crate's test
//! suite — there is no mounted reflink-capable filesystem available in CI —
//! but it is kept to the same trait as [`super::fake::FakeKernel`] so the
//! phase logic cannot tell the difference.

use std::collections::HashMap;
use std::ffi::c_long;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;

use libc::{c_int, c_void};

use super::{DedupeOutcome, DedupeRequest, ExchangeRequest, FileId, Fork, Kernel, KernelError, RebuildKind};
use crate::geometry::{Device, Geometry};
use crate::record::{
    BmapxFlags, BmapxRecord, Bulkstat, FsmapFlags, FsmapRecord, FsrefsRecord, Handle, Owner,
    PhysicalOrSentinel,
};

extern "C" {
    /// Raw syscall trampoline, used for `open_by_handle_at`, which `libc`
    /// does not wrap directly.
    fn syscall(number: c_long, ...) -> c_long;
}

#[cfg(target_arch = "x86_64")]
const SYS_OPEN_BY_HANDLE_AT: c_long = 304;
#[cfg(target_arch = "aarch64")]
const SYS_OPEN_BY_HANDLE_AT: c_long = 155;

/// Magic byte shared by every XFS-specific ioctl.
const XFS_IOC_MAGIC: u8 = b'X';

mod ffi {
    use super::XFS_IOC_MAGIC;
    use nix::{ioctl_none, ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    #[repr(C)]
    pub struct FsGeometry {
        pub block_size: u32,
        pub sector_size: u32,
        pub flags: u32,
        pub agblocks: u32,
    }
    const XFS_FSOP_GEOM_FLAGS_REFLINK: u32 = 1 << 0;
    const XFS_FSOP_GEOM_FLAGS_RMAPBT: u32 = 1 << 1;
    pub const FLAG_REFLINK: u32 = XFS_FSOP_GEOM_FLAGS_REFLINK;
    pub const FLAG_RMAPBT: u32 = XFS_FSOP_GEOM_FLAGS_RMAPBT;

    #[repr(C)]
    pub struct FsmapHead {
        pub fmh_iflags: u32,
        pub fmh_oflags: u32,
        pub fmh_count: u32,
        pub fmh_entries: u32,
        pub fmh_reserved: [u64; 3],
        pub fmh_keys: [FsmapExtent; 2],
        // Followed in the real kernel ABI by `fmh_count` trailing
        // `FsmapExtent` records; this binding allocates that tail
        // separately rather than as a flexible array member.
    }

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    pub struct FsmapExtent {
        pub fmr_device: u32,
        pub fmr_flags: u32,
        pub fmr_physical: u64,
        pub fmr_owner: u64,
        pub fmr_offset: u64,
        pub fmr_length: u64,
    }

    #[repr(C)]
    pub struct FileCloneRange {
        pub src_fd: i64,
        pub src_offset: u64,
        pub src_length: u64,
        pub dest_offset: u64,
    }

    #[repr(C)]
    pub struct FileDedupeRangeInfo {
        pub dest_fd: i64,
        pub dest_offset: u64,
        pub bytes_deduped: u64,
        pub status: i32,
        pub reserved: u32,
    }

    #[repr(C)]
    pub struct FileDedupeRange {
        pub src_offset: u64,
        pub src_length: u64,
        pub dest_count: u16,
        pub reserved1: u16,
        pub reserved2: u32,
        pub info: [FileDedupeRangeInfo; 1],
    }

    #[repr(C)]
    pub struct ExchangeRange {
        pub flags: u64,
        pub file1_fd: i64,
        pub file1_offset: u64,
        pub file2_offset: u64,
        pub length: u64,
        pub file2_ino: u64,
        pub file2_mtime: u64,
        pub file2_ctime: u64,
        pub file2_mtime_nsec: u32,
        pub file2_ctime_nsec: u32,
    }
    pub const EXCHANGE_RANGE_FILE2_FRESH: u64 = 1 << 0;

    #[repr(C)]
    pub struct FsEofblocks {
        pub flags: u32,
        pub min_file_size: u64,
    }

    #[repr(C)]
    pub struct ScrubMetadata {
        pub sm_type: u32,
        pub sm_flags: u32,
        pub sm_ino: u64,
        pub sm_gen: u32,
        pub sm_agno: u32,
    }

    #[repr(C)]
    pub struct BulkstatReq {
        pub ino: u64,
        pub gen: u32,
        pub mode: u32,
        pub ctime: i64,
        pub ctime_nsec: i32,
        pub mtime: i64,
        pub mtime_nsec: i32,
    }

    #[repr(C)]
    pub struct FsxAttr {
        pub fsx_xflags: u32,
        pub fsx_extsize: u32,
        pub fsx_nextents: u32,
        pub fsx_projid: u32,
        pub fsx_cowextsize: u32,
        pub fsx_pad: [u8; 8],
    }
    pub const XFS_XFLAG_REALTIME: u32 = 1 << 0;

    /// Owner-class sentinels `fmr_owner` carries for non-inode extents
    /// (XFS's fs/xfs_fsmap.h `XFS_FMR_OWN_*` constants).
    pub const FMR_OWN_FREE: u64 = u64::MAX; // -1
    pub const FMR_OWN_UNKNOWN: u64 = u64::MAX - 1; // -2
    pub const FMR_OWN_FS: u64 = u64::MAX - 2; // -3
    pub const FMR_OWN_LOG: u64 = u64::MAX - 3; // -4
    pub const FMR_OWN_AG: u64 = u64::MAX - 4; // -5
    pub const FMR_OWN_SUMMARY: u64 = u64::MAX - 5; // -6
    pub const FMR_OWN_INOBT: u64 = u64::MAX - 6; // -7
    pub const FMR_OWN_INODES: u64 = u64::MAX - 7; // -8
    pub const FMR_OWN_REFC: u64 = u64::MAX - 8; // -9
    pub const FMR_OWN_COW: u64 = u64::MAX - 9; // -10
    pub const FMR_OWN_DEFECTIVE: u64 = u64::MAX - 10; // -11

    /// `fmr_flags` bits.
    pub const FMR_OF_PREALLOC: u32 = 1 << 1;
    pub const FMR_OF_ATTR_FORK: u32 = 1 << 2;
    pub const FMR_OF_EXTENT_MAP: u32 = 1 << 3;
    pub const FMR_OF_SHARED: u32 = 1 << 4;
    pub const FMR_OF_LAST: u32 = 1 << 6;

    /// `fmh_iflags` bits selecting which fork a file-scoped query reads.
    pub const FMH_IF_ATTRFORK: u32 = 1 << 0;
    pub const FMH_IF_COWFORK: u32 = 1 << 1;

    ioctl_read!(xfs_fsgeometry, XFS_IOC_MAGIC, 126, FsGeometry);
    ioctl_readwrite!(fs_getfsmap, XFS_IOC_MAGIC, 59, FsmapHead);
    ioctl_write_ptr!(file_clone_range, 0x94, 13, FileCloneRange);
    ioctl_readwrite!(file_dedupe_range, 0x94, 54, FileDedupeRange);
    ioctl_write_ptr!(xfs_exchange_range, XFS_IOC_MAGIC, 68, ExchangeRange);
    ioctl_write_ptr!(xfs_free_eofblocks, XFS_IOC_MAGIC, 58, FsEofblocks);
    ioctl_readwrite!(xfs_scrub_metadata, XFS_IOC_MAGIC, 127, ScrubMetadata);
    ioctl_readwrite!(xfs_bulkstat_single, XFS_IOC_MAGIC, 60, BulkstatReq);
    ioctl_read!(fs_getxattr, XFS_IOC_MAGIC, 31, FsxAttr);
    ioctl_write_ptr!(fs_setxattr, XFS_IOC_MAGIC, 32, FsxAttr);
    ioctl_none!(blk_rrpart, 0x12, 0x5f);
}

/// A production [`Kernel`] implementation against a single mounted
/// filesystem, reached through its data and realtime device nodes.
pub struct LinuxKernel {
    data_path: std::path::PathBuf,
    realtime_path: Option<std::path::PathBuf>,
    files: HashMap<FileId, File>,
    next_id: u64,
}

impl LinuxKernel {
    /// Creates a binding rooted at the data volume's device path, with an
    /// optional realtime volume.
    pub fn new(
        data_path: impl Into<std::path::PathBuf>,
        realtime_path: Option<std::path::PathBuf>,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            realtime_path,
            files: HashMap::new(),
            next_id: 0,
        }
    }

    fn device_path(&self, device: Device) -> Result<&Path, KernelError> {
        match device {
            Device::Data => Ok(&self.data_path),
            Device::Realtime => self
                .realtime_path
                .as_deref()
                .ok_or(KernelError::NotSupported),
        }
    }

    fn insert(&mut self, file: File) -> FileId {
        let id = FileId(self.next_id);
        self.next_id += 1;
        self.files.insert(id, file);
        id
    }

    fn fd(&self, id: FileId) -> Result<RawFd, KernelError> {
        Ok(self
            .files
            .get(&id)
            .ok_or(KernelError::NotFound)?
            .as_raw_fd())
    }

    /// Whether `directory` lives on the same volume as `device`'s mount
    /// point, compared by device id (a directory's `st_dev` against the
    /// device node's `st_rdev`).
    fn same_volume(&self, directory: &Path, device: Device) -> Result<bool, KernelError> {
        use std::os::unix::fs::MetadataExt;
        let dir_dev = std::fs::metadata(directory)?.dev();
        let vol_dev = std::fs::metadata(self.device_path(device)?)?.rdev();
        Ok(dir_dev == vol_dev)
    }
}

fn last_os_error() -> KernelError {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOSPC) => KernelError::OutOfSpace,
        Some(libc::ENOENT) | Some(libc::ESTALE) => KernelError::NotFound,
        Some(libc::ETXTBSY) | Some(libc::EAGAIN) => KernelError::Busy,
        Some(libc::EOPNOTSUPP) | Some(libc::ENOTTY) => KernelError::NotSupported,
        _ => KernelError::Io(err),
    }
}

/// Maps an ioctl's `Errno` result onto the same taxonomy `last_os_error`
/// uses for raw syscalls, so both ioctl- and syscall-backed primitives here
/// report errors identically.
fn map_ioctl_err(err: nix::errno::Errno) -> KernelError {
    match err {
        nix::errno::Errno::ENOSPC => KernelError::OutOfSpace,
        nix::errno::Errno::ENOENT | nix::errno::Errno::ESTALE => KernelError::NotFound,
        nix::errno::Errno::ETXTBSY | nix::errno::Errno::EAGAIN => KernelError::Busy,
        nix::errno::Errno::EOPNOTSUPP | nix::errno::Errno::ENOTTY => KernelError::NotSupported,
        e => KernelError::Io(io::Error::from(e)),
    }
}

/// Issues `FS_IOC_GETFSMAP` against `fd` and returns up to `max` decoded
/// trailing records.
///
/// The real ABI places `fmh_entries` `FsmapExtent` records directly after
/// the fixed header in the same ioctl buffer, which `ffi::FsmapHead` cannot
/// express as a Rust struct (no flexible array member). This over-allocates
/// the buffer by hand, issues the ioctl against it cast to `*mut FsmapHead`,
/// then reads the trailing records back out by pointer arithmetic.
fn getfsmap_raw(
    fd: RawFd,
    low: u64,
    high: u64,
    max: usize,
    iflags: u32,
) -> Result<Vec<ffi::FsmapExtent>, KernelError> {
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    let header_size = std::mem::size_of::<ffi::FsmapHead>();
    let entry_size = std::mem::size_of::<ffi::FsmapExtent>();
    let layout = Layout::from_size_align(
        header_size + max * entry_size,
        std::mem::align_of::<ffi::FsmapHead>(),
    )
    .expect("fsmap ioctl buffer layout");
    let buf = unsafe { alloc_zeroed(layout) };
    if buf.is_null() {
        std::alloc::handle_alloc_error(layout);
    }
    let head = buf as *mut ffi::FsmapHead;
    unsafe {
        std::ptr::write(
            head,
            ffi::FsmapHead {
                fmh_iflags: iflags,
                fmh_oflags: 0,
                fmh_count: max as u32,
                fmh_entries: 0,
                fmh_reserved: [0; 3],
                fmh_keys: [
                    ffi::FsmapExtent {
                        fmr_physical: low,
                        ..Default::default()
                    },
                    ffi::FsmapExtent {
                        fmr_physical: high,
                        ..Default::default()
                    },
                ],
            },
        );
    }
    let result = unsafe { ffi::fs_getfsmap(fd, head) };
    let out = match result {
        Ok(_) => {
            let entries = unsafe { (*head).fmh_entries as usize }.min(max);
            let first = unsafe { buf.add(header_size) } as *const ffi::FsmapExtent;
            let slice = unsafe { std::slice::from_raw_parts(first, entries) };
            Ok(slice.to_vec())
        }
        Err(e) => Err(map_ioctl_err(e)),
    };
    unsafe { dealloc(buf, layout) };
    out
}

/// Maps a raw `fmr_owner` value onto this crate's [`Owner`], recognizing
/// XFS's reserved negative-range owner classes and otherwise treating the
/// value as a regular inode number.
fn owner_from_raw(owner: u64) -> Owner {
    match owner {
        ffi::FMR_OWN_FREE => Owner::FreeSpace,
        ffi::FMR_OWN_FS | ffi::FMR_OWN_AG | ffi::FMR_OWN_REFC | ffi::FMR_OWN_COW => {
            Owner::AgMetadata
        }
        ffi::FMR_OWN_LOG => Owner::Log,
        ffi::FMR_OWN_SUMMARY => Owner::Superblock,
        ffi::FMR_OWN_INOBT | ffi::FMR_OWN_INODES => Owner::InodeChunk,
        ffi::FMR_OWN_DEFECTIVE | ffi::FMR_OWN_UNKNOWN => Owner::Defective,
        ino => Owner::Inode(ino),
    }
}

fn fsmap_flags_from_raw(raw: u32) -> FsmapFlags {
    let mut out = FsmapFlags::empty();
    if raw & ffi::FMR_OF_ATTR_FORK != 0 {
        out |= FsmapFlags::ATTR_FORK;
    }
    if raw & ffi::FMR_OF_EXTENT_MAP != 0 {
        out |= FsmapFlags::EXTENT_MAP;
    }
    if raw & ffi::FMR_OF_PREALLOC != 0 {
        out |= FsmapFlags::UNWRITTEN;
    }
    if raw & ffi::FMR_OF_LAST != 0 {
        out |= FsmapFlags::LAST;
    }
    out
}

fn bmapx_flags_from_raw(raw: u32) -> BmapxFlags {
    let mut out = BmapxFlags::empty();
    if raw & ffi::FMR_OF_SHARED != 0 {
        out |= BmapxFlags::SHARED;
    }
    if raw & ffi::FMR_OF_PREALLOC != 0 {
        out |= BmapxFlags::UNWRITTEN;
    }
    if raw & ffi::FMR_OF_LAST != 0 {
        out |= BmapxFlags::LAST;
    }
    out
}

impl Kernel for LinuxKernel {
    fn probe(&mut self, device: Device) -> Result<Geometry, KernelError> {
        let path = self.device_path(device)?.to_owned();
        let file = File::open(&path)?;
        let mut geom = ffi::FsGeometry {
            block_size: 0,
            sector_size: 0,
            flags: 0,
            agblocks: 0,
        };
        unsafe { ffi::xfs_fsgeometry(file.as_raw_fd(), &mut geom) }.map_err(map_ioctl_err)?;
        Ok(Geometry {
            block_size: geom.block_size,
            sector_size: geom.sector_size,
            reflink_capable: geom.flags & ffi::FLAG_REFLINK != 0,
            metadata_rebuild_capable: true,
            reverse_map_capable: geom.flags & ffi::FLAG_RMAPBT != 0,
            map_freesp_capable: geom.flags & ffi::FLAG_RMAPBT != 0,
            ag_size: geom.agblocks as u64 * geom.block_size as u64,
        })
    }

    fn create_helper_file(
        &mut self,
        device: Device,
        directory: &Path,
        realtime: bool,
    ) -> Result<FileId, KernelError> {
        if !self.same_volume(directory, device)? {
            return Err(KernelError::WrongDevice);
        }
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
        let name = format!(".spaceman-helper-{}", self.next_id);
        let path = directory.join(name);
        let file = opts.open(&path)?;
        // An anonymous helper is unlinked immediately after creation so it
        // is invisible to other processes from the moment it exists.
        std::fs::remove_file(&path)?;
        let id = self.insert(file);
        self.set_realtime_flag(id, realtime)?;
        Ok(id)
    }

    fn truncate(&mut self, file: FileId, len: u64) -> Result<(), KernelError> {
        let f = self.files.get(&file).ok_or(KernelError::NotFound)?;
        f.set_len(len)?;
        Ok(())
    }

    fn close(&mut self, file: FileId) {
        self.files.remove(&file);
    }

    fn owner_of(&mut self, file: FileId) -> Result<crate::record::Owner, KernelError> {
        let f = self.files.get(&file).ok_or(KernelError::NotFound)?;
        let meta = f.metadata()?;
        use std::os::unix::fs::MetadataExt;
        Ok(crate::record::Owner::Inode(meta.ino()))
    }

    fn fsmap(
        &mut self,
        device: Device,
        low: u64,
        high: u64,
        max: usize,
    ) -> Result<Vec<FsmapRecord>, KernelError> {
        let path = self.device_path(device)?.to_owned();
        let file = File::open(&path)?;
        let raw = getfsmap_raw(file.as_raw_fd(), low, high, max, 0)?;
        Ok(raw
            .into_iter()
            .map(|e| FsmapRecord {
                device,
                physical_start: e.fmr_physical,
                length: e.fmr_length,
                owner: owner_from_raw(e.fmr_owner),
                offset_in_owner: e.fmr_offset,
                flags: fsmap_flags_from_raw(e.fmr_flags),
            })
            .collect())
    }

    fn fsrefs(
        &mut self,
        device: Device,
        low: u64,
        high: u64,
        max: usize,
    ) -> Result<Vec<FsrefsRecord>, KernelError> {
        // Reflinked blocks show up as one reverse-map record per owner, all
        // covering the same physical range; refcounts fall out of how many
        // fsmap records overlap a given sub-range, so this reuses the same
        // ioctl as `fsmap` and counts overlaps client-side.
        let path = self.device_path(device)?.to_owned();
        let file = File::open(&path)?;
        let raw = getfsmap_raw(file.as_raw_fd(), low, high, max, 0)?;
        let last_flag = raw.last().is_some_and(|e| e.fmr_flags & ffi::FMR_OF_LAST != 0);

        let mut bounds: Vec<u64> = raw
            .iter()
            .flat_map(|e| [e.fmr_physical, e.fmr_physical + e.fmr_length])
            .collect();
        bounds.sort_unstable();
        bounds.dedup();

        let mut out = Vec::new();
        for w in bounds.windows(2) {
            let (start, end) = (w[0], w[1]);
            let covering: Vec<&ffi::FsmapExtent> = raw
                .iter()
                .filter(|e| e.fmr_physical <= start && start < e.fmr_physical + e.fmr_length)
                .collect();
            if covering.is_empty() {
                continue;
            }
            let unwritten = covering.iter().any(|e| e.fmr_flags & ffi::FMR_OF_PREALLOC != 0);
            out.push(FsrefsRecord {
                device,
                physical_start: start,
                length: end - start,
                owners: covering.len() as u32,
                flags: if unwritten {
                    FsmapFlags::UNWRITTEN
                } else {
                    FsmapFlags::empty()
                },
            });
        }
        out.truncate(max);
        if last_flag {
            if let Some(last) = out.last_mut() {
                last.flags |= FsmapFlags::LAST;
            }
        }
        Ok(out)
    }

    fn bmapx(
        &mut self,
        file: FileId,
        fork: Fork,
        low: u64,
        high: u64,
        max: usize,
    ) -> Result<Vec<BmapxRecord>, KernelError> {
        let fd = self.fd(file)?;
        let iflags = match fork {
            Fork::Data => 0,
            Fork::Attr => ffi::FMH_IF_ATTRFORK,
            Fork::Cow => ffi::FMH_IF_COWFORK,
        };
        let raw = getfsmap_raw(fd, low, high, max, iflags)?;
        Ok(raw
            .into_iter()
            .map(|e| {
                let owner = owner_from_raw(e.fmr_owner);
                let physical = if matches!(owner, Owner::FreeSpace) {
                    PhysicalOrSentinel::Hole
                } else {
                    PhysicalOrSentinel::Addr(e.fmr_physical)
                };
                BmapxRecord {
                    file_offset: e.fmr_offset,
                    physical,
                    length: e.fmr_length,
                    flags: bmapx_flags_from_raw(e.fmr_flags),
                }
            })
            .collect())
    }

    fn map_freesp(
        &mut self,
        file: FileId,
        physical_start: u64,
        length: u64,
    ) -> Result<u64, KernelError> {
        // Reserves blocks into the file's own extent map at the given
        // offset (the capture file is identity-mapped, so its logical
        // offsets equal the physical addresses being pinned) without
        // writing data, leaving them as unwritten extents.
        let fd = self.fd(file)?;
        let ret = unsafe {
            libc::fallocate(
                fd,
                libc::FALLOC_FL_KEEP_SIZE,
                physical_start as libc::off_t,
                length as libc::off_t,
            )
        };
        if ret < 0 {
            return Err(last_os_error());
        }
        Ok(length)
    }

    fn clone_range(
        &mut self,
        src: FileId,
        src_offset: u64,
        dst: FileId,
        dst_offset: u64,
        length: u64,
    ) -> Result<u64, KernelError> {
        let src_fd = self.fd(src)?;
        let dst_fd = self.fd(dst)?;
        let range = ffi::FileCloneRange {
            src_fd: src_fd as i64,
            src_offset,
            src_length: length,
            dest_offset: dst_offset,
        };
        unsafe { ffi::file_clone_range(dst_fd, &range) }.map_err(map_ioctl_err)?;
        Ok(length)
    }

    fn dedupe_range(&mut self, req: DedupeRequest) -> Result<DedupeOutcome, KernelError> {
        let src_fd = self.fd(req.src)?;
        let dst_fd = self.fd(req.dest)?;
        let mut range = ffi::FileDedupeRange {
            src_offset: req.src_offset,
            src_length: req.length,
            dest_count: 1,
            reserved1: 0,
            reserved2: 0,
            info: [ffi::FileDedupeRangeInfo {
                dest_fd: dst_fd as i64,
                dest_offset: req.dest_offset,
                bytes_deduped: 0,
                status: 0,
                reserved: 0,
            }],
        };
        unsafe { ffi::file_dedupe_range(src_fd, &mut range) }.map_err(map_ioctl_err)?;
        let info = &range.info[0];
        if info.status < 0 {
            return Ok(DedupeOutcome::Differed);
        }
        Ok(DedupeOutcome::Remapped {
            bytes: info.bytes_deduped,
        })
    }

    fn exchange_range(&mut self, req: ExchangeRequest) -> Result<(), KernelError> {
        let fd1 = self.fd(req.file1)?;
        let fd2 = self.fd(req.file2)?;
        let range = ffi::ExchangeRange {
            flags: ffi::EXCHANGE_RANGE_FILE2_FRESH,
            file1_fd: fd2 as i64,
            file1_offset: req.offset2,
            file2_offset: req.offset1,
            length: req.length,
            file2_ino: req.freshness.ino,
            file2_mtime: req.freshness.mtime.0 as u64,
            file2_ctime: req.freshness.ctime.0 as u64,
            file2_mtime_nsec: req.freshness.mtime.1,
            file2_ctime_nsec: req.freshness.ctime.1,
        };
        unsafe { ffi::xfs_exchange_range(fd1, &range) }.map_err(map_ioctl_err)?;
        Ok(())
    }

    fn unshare(&mut self, file: FileId, offset: u64, length: u64) -> Result<(), KernelError> {
        let fd = self.fd(file)?;
        let ret = unsafe {
            libc::fallocate(
                fd,
                libc::FALLOC_FL_UNSHARE_RANGE,
                offset as libc::off_t,
                length as libc::off_t,
            )
        };
        if ret < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    fn scrub_metadata(
        &mut self,
        device: Device,
        ag: u32,
        kind: RebuildKind,
    ) -> Result<(), KernelError> {
        let path = self.device_path(device)?.to_owned();
        let file = File::open(&path)?;
        let sm_type = match kind {
            RebuildKind::FreeSpaceByBlock => 1,
            RebuildKind::FreeSpaceByCount => 2,
            RebuildKind::FreeList => 3,
            RebuildKind::ReverseMap => 4,
            RebuildKind::InodeBtree => 5,
            RebuildKind::FreeInodeBtree => 6,
            RebuildKind::RefcountBtree => 7,
        };
        let mut sm = ffi::ScrubMetadata {
            sm_type,
            sm_flags: 1, // repair
            sm_ino: 0,
            sm_gen: 0,
            sm_agno: ag,
        };
        unsafe { ffi::xfs_scrub_metadata(file.as_raw_fd(), &mut sm) }.map_err(map_ioctl_err)?;
        Ok(())
    }

    fn bulkstat_single(&mut self, device: Device, ino: u64) -> Result<Bulkstat, KernelError> {
        let path = self.device_path(device)?.to_owned();
        let file = File::open(&path)?;
        let mut req = ffi::BulkstatReq {
            ino,
            gen: 0,
            mode: 0,
            ctime: 0,
            ctime_nsec: 0,
            mtime: 0,
            mtime_nsec: 0,
        };
        unsafe { ffi::xfs_bulkstat_single(file.as_raw_fd(), &mut req) }.map_err(map_ioctl_err)?;
        Ok(Bulkstat {
            ino: req.ino,
            generation: req.gen,
            mode: req.mode,
            ctime: (req.ctime, req.ctime_nsec as u32),
            mtime: (req.mtime, req.mtime_nsec as u32),
        })
    }

    fn open_by_handle(&mut self, device: Device, handle: Handle) -> Result<FileId, KernelError> {
        let mount_path = self.device_path(device)?.to_owned();
        let mount_fd = File::open(&mount_path)?;

        #[repr(C)]
        struct CFileHandle {
            handle_bytes: u32,
            handle_type: i32,
            f_handle: [u8; 16],
        }
        let mut encoded = CFileHandle {
            handle_bytes: 16,
            handle_type: 0,
            f_handle: [0; 16],
        };
        encoded.f_handle[..8].copy_from_slice(&handle.ino.to_ne_bytes());
        encoded.f_handle[8..12].copy_from_slice(&handle.generation.to_ne_bytes());

        let fd = unsafe {
            syscall(
                SYS_OPEN_BY_HANDLE_AT,
                mount_fd.as_raw_fd() as c_int,
                &encoded as *const CFileHandle as *const c_void,
                libc::O_RDWR as c_int,
            )
        };
        if fd < 0 {
            return Err(last_os_error());
        }
        let file = unsafe { File::from(std::os::fd::OwnedFd::from_raw_fd(fd as RawFd)) };
        Ok(self.insert(file))
    }

    fn free_eofblocks(&mut self, device: Device) -> Result<(), KernelError> {
        let path = self.device_path(device)?.to_owned();
        let file = File::open(&path)?;
        let eofb = ffi::FsEofblocks {
            flags: 0,
            min_file_size: 0,
        };
        unsafe { ffi::xfs_free_eofblocks(file.as_raw_fd(), &eofb) }.map_err(map_ioctl_err)?;
        Ok(())
    }

    fn set_realtime_flag(&mut self, file: FileId, realtime: bool) -> Result<(), KernelError> {
        let fd = self.fd(file)?;
        let mut attr = ffi::FsxAttr {
            fsx_xflags: 0,
            fsx_extsize: 0,
            fsx_nextents: 0,
            fsx_projid: 0,
            fsx_cowextsize: 0,
            fsx_pad: [0; 8],
        };
        unsafe { ffi::fs_getxattr(fd, &mut attr) }.map_err(map_ioctl_err)?;
        if realtime {
            attr.fsx_xflags |= ffi::XFS_XFLAG_REALTIME;
        } else {
            attr.fsx_xflags &= !ffi::XFS_XFLAG_REALTIME;
        }
        unsafe { ffi::fs_setxattr(fd, &attr) }.map_err(map_ioctl_err)?;
        Ok(())
    }

    fn buffered_copy(
        &mut self,
        src: FileId,
        src_offset: u64,
        dst: FileId,
        dst_offset: u64,
        length: u64,
    ) -> Result<(), KernelError> {
        use std::io::{Read, Seek, SeekFrom, Write};
        let mut buf = vec![0u8; 1 << 20];
        let mut remaining = length;
        let mut src_pos = src_offset;
        let mut dst_pos = dst_offset;
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            {
                let src_file = self.files.get_mut(&src).ok_or(KernelError::NotFound)?;
                src_file.seek(SeekFrom::Start(src_pos))?;
                src_file.read_exact(&mut buf[..chunk])?;
            }
            {
                let dst_file = self.files.get_mut(&dst).ok_or(KernelError::NotFound)?;
                dst_file.seek(SeekFrom::Start(dst_pos))?;
                dst_file.write_all(&buf[..chunk])?;
            }
            src_pos += chunk as u64;
            dst_pos += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    fn physical_at(&mut self, file: FileId, offset: u64) -> Result<Option<u64>, KernelError> {
        let records = self.bmapx(file, Fork::Data, offset, offset + 1, 1)?;
        Ok(records.into_iter().find_map(|r| match r.physical {
            crate::record::PhysicalOrSentinel::Addr(addr) => Some(addr),
            _ => None,
        }))
    }
}
