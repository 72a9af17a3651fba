//! In-memory fake filesystem, used to drive the engine in tests without a
//! real reflink-capable, reverse-mapped filesystem underneath.
//!
//! The fake tracks, per inode, a list of extents mapping logical offsets to
//! physical block ranges (or a hole). Physical blocks are reference-counted
//! so that fsrefs/priority ranking and reflink semantics fall out of the
//! same bookkeeping the real filesystem would do. Byte content is modeled
//! as an opaque token per physical block rather than real bytes: two
//! extents "contain the same bytes" (what dedupe-range compares) iff they
//! carry the same token, which is exactly the case reflink wants.

use std::collections::HashMap;
use std::path::Path;

use super::{
    DedupeOutcome, DedupeRequest, ExchangeRequest, FileId, Fork, Kernel, KernelError, RebuildKind,
};
use crate::geometry::{Device, Geometry};
use crate::record::{
    Bulkstat, BmapxFlags, BmapxRecord, FsmapFlags, FsmapRecord, FsrefsRecord, Handle, Owner,
    PhysicalOrSentinel,
};

/// A single data-fork extent of a fake file.
#[derive(Debug, Clone, Copy)]
struct FakeExtent {
    file_offset: u64,
    physical: Option<u64>,
    length: u64,
    unwritten: bool,
}

/// A file tracked by the fake filesystem: either a regular owner inode or
/// a helper file (capture/work), both addressed the same way.
#[derive(Debug, Clone)]
struct FakeFile {
    ino: u64,
    generation: u32,
    is_directory: bool,
    ctime: (i64, u32),
    mtime: (i64, u32),
    extents: Vec<FakeExtent>,
    len: u64,
}

impl FakeFile {
    fn touch(&mut self, clock: &mut i64) {
        *clock += 1;
        self.mtime = (*clock, 0);
        self.ctime = (*clock, 0);
    }

    /// Extents intersecting `[low, high)`, clipped to it.
    fn extents_in(&self, low: u64, high: u64) -> Vec<FakeExtent> {
        self.extents
            .iter()
            .filter_map(|e| {
                let start = e.file_offset.max(low);
                let end = (e.file_offset + e.length).min(high);
                if start >= end {
                    return None;
                }
                let delta = start - e.file_offset;
                Some(FakeExtent {
                    file_offset: start,
                    physical: e.physical.map(|p| p + delta),
                    length: end - start,
                    unwritten: e.unwritten,
                })
            })
            .collect()
    }

    fn physical_at(&self, offset: u64) -> Option<u64> {
        self.extents.iter().find_map(|e| {
            if offset >= e.file_offset && offset < e.file_offset + e.length {
                e.physical.map(|p| p + (offset - e.file_offset))
            } else {
                None
            }
        })
    }

    /// Finds the extent backing physical address `byte`, returning the
    /// corresponding logical offset within this file and whether the
    /// extent is unwritten. Inverse of `physical_at`.
    fn locate_physical(&self, byte: u64) -> Option<(u64, bool)> {
        self.extents.iter().find_map(|e| {
            let p = e.physical?;
            if byte >= p && byte < p + e.length {
                Some((e.file_offset + (byte - p), e.unwritten))
            } else {
                None
            }
        })
    }

    /// Replaces the mapping over `[offset, offset+length)` with a single
    /// extent backed by `physical` (or a hole, if `physical` is `None`).
    fn remap(&mut self, offset: u64, length: u64, physical: Option<u64>, unwritten: bool) {
        let end = offset + length;
        let mut kept = Vec::new();
        for e in &self.extents {
            let e_end = e.file_offset + e.length;
            if e_end <= offset || e.file_offset >= end {
                kept.push(*e);
                continue;
            }
            if e.file_offset < offset {
                kept.push(FakeExtent {
                    file_offset: e.file_offset,
                    physical: e.physical,
                    length: offset - e.file_offset,
                    unwritten: e.unwritten,
                });
            }
            if e_end > end {
                let delta = end - e.file_offset;
                kept.push(FakeExtent {
                    file_offset: end,
                    physical: e.physical.map(|p| p + delta),
                    length: e_end - end,
                    unwritten: e.unwritten,
                });
            }
        }
        kept.push(FakeExtent {
            file_offset: offset,
            physical,
            length,
            unwritten,
        });
        kept.retain(|e| e.length > 0);
        kept.sort_by_key(|e| e.file_offset);
        self.extents = kept;
        self.len = self.len.max(end);
    }
}

/// Special, non-inode regions of the simulated volume (free space aside).
#[derive(Debug, Clone, Copy)]
struct SpecialRegion {
    start: u64,
    length: u64,
    owner: Owner,
}

/// An in-memory stand-in for a reverse-mapped, reflink-capable filesystem.
pub struct FakeKernel {
    block_size: u64,
    data_len: u64,
    ag_size: u64,
    reflink_capable: bool,
    metadata_rebuild_capable: bool,
    map_freesp_capable: bool,
    files: HashMap<FileId, FakeFile>,
    next_ino: u64,
    special_regions: Vec<SpecialRegion>,
    /// Content token per physical block index; two blocks with the same
    /// token compare equal under dedupe.
    content: HashMap<u64, u64>,
    next_content_token: u64,
    clock: i64,
    /// Set of offsets where `unshare` has already been called this dedupe
    /// iteration, so the engine's "unshare once per offset" rule is
    /// observable in tests.
    unshared_once: std::collections::HashSet<(FileId, u64)>,
    /// Next free physical address above the simulated device, handed out
    /// to relocate blocks (unshare, buffered copy) strictly outside it.
    next_synthetic: u64,
}

impl FakeKernel {
    /// Creates a fake filesystem of `data_len` bytes with the given block
    /// size, fully free.
    pub fn new(data_len: u64, block_size: u64) -> Self {
        Self {
            block_size,
            data_len,
            ag_size: data_len,
            reflink_capable: true,
            metadata_rebuild_capable: true,
            map_freesp_capable: true,
            files: HashMap::new(),
            next_ino: 1,
            special_regions: Vec::new(),
            content: HashMap::new(),
            next_content_token: 1,
            clock: 0,
            unshared_once: std::collections::HashSet::new(),
            next_synthetic: data_len,
        }
    }

    /// Hands out `length` bytes of fresh physical address space strictly
    /// above the simulated device, for relocating blocks during unshare or
    /// buffered copy.
    fn alloc_synthetic(&mut self, length: u64) -> u64 {
        let base = self.next_synthetic;
        self.next_synthetic += length.max(self.block_size);
        base
    }

    /// Disables reflink support, for exercising the exchange migration
    /// path.
    pub fn without_reflink(mut self) -> Self {
        self.reflink_capable = false;
        self
    }

    /// Sets the simulated allocation-group size, for exercising the
    /// metadata stage's per-AG grouping.
    pub fn with_ag_size(mut self, ag_size: u64) -> Self {
        self.ag_size = ag_size;
        self
    }

    /// Registers a new regular file owning `length` bytes of fresh physical
    /// space starting at `physical_start`, and returns its inode number.
    /// The physical range must not already be owned.
    pub fn create_owner_file(&mut self, physical_start: u64, length: u64) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        let token = self.fresh_content(length);
        let mut file = FakeFile {
            ino,
            generation: 1,
            is_directory: false,
            ctime: (self.clock, 0),
            mtime: (self.clock, 0),
            extents: Vec::new(),
            len: length,
        };
        file.remap(0, length, Some(physical_start), false);
        self.claim_content(physical_start, length, token);
        self.files.insert(FileId(ino), file);
        ino
    }

    /// Registers a new regular file with a single unwritten (preallocated)
    /// extent.
    pub fn create_owner_file_unwritten(&mut self, physical_start: u64, length: u64) -> u64 {
        let ino = self.create_owner_file(physical_start, length);
        if let Some(f) = self.files.get_mut(&FileId(ino)) {
            f.remap(0, length, Some(physical_start), true);
        }
        ino
    }

    /// Makes `other_ino`'s data fork reflink the same physical range as
    /// `ino`'s `[offset, offset+length)`, i.e. simulates two files sharing
    /// an extent.
    pub fn share_with(&mut self, ino: u64, offset: u64, other_ino: u64, length: u64) {
        let physical = self.files[&FileId(ino)].physical_at(offset).expect("hole");
        let mut other = FakeFile {
            ino: other_ino,
            generation: 1,
            is_directory: false,
            ctime: (self.clock, 0),
            mtime: (self.clock, 0),
            extents: Vec::new(),
            len: length,
        };
        other.remap(0, length, Some(physical), false);
        self.files.insert(FileId(other_ino), other);
    }

    /// Marks `[start, start+length)` as a non-movable or special-owner
    /// region (metadata, log, superblock, ...), as if the filesystem itself
    /// owned it rather than any inode.
    pub fn mark_special(&mut self, start: u64, length: u64, owner: Owner) {
        self.special_regions.push(SpecialRegion {
            start,
            length,
            owner,
        });
    }

    /// Returns the current bulkstat of `ino`, for assertions in tests.
    pub fn bulkstat_of(&self, ino: u64) -> Bulkstat {
        let f = &self.files[&FileId(ino)];
        Bulkstat {
            ino: f.ino,
            generation: f.generation,
            mode: if f.is_directory {
                libc::S_IFDIR
            } else {
                libc::S_IFREG
            },
            ctime: f.ctime,
            mtime: f.mtime,
        }
    }

    /// Returns the physical address backing `ino` at `offset`, if any.
    pub fn owner_physical_at(&self, ino: u64, offset: u64) -> Option<u64> {
        self.files[&FileId(ino)].physical_at(offset)
    }

    /// Simulates a concurrent writer touching `ino`'s timestamps, as if
    /// another process had written to it between snapshot and exchange.
    pub fn touch_externally(&mut self, ino: u64) {
        self.clock += 1;
        if let Some(f) = self.files.get_mut(&FileId(ino)) {
            f.mtime = (self.clock, 0);
        }
    }

    fn fresh_content(&mut self, length: u64) -> u64 {
        let token = self.next_content_token;
        self.next_content_token += 1;
        let _ = length;
        token
    }

    fn claim_content(&mut self, physical_start: u64, length: u64, token: u64) {
        let first = physical_start / self.block_size;
        let count = length.div_ceil(self.block_size);
        for i in 0..count {
            self.content.insert(first + i, token);
        }
    }

    fn block_owners(&self, block: u64) -> Vec<Owner> {
        let byte = block * self.block_size;
        let mut owners: Vec<Owner> = self
            .files
            .values()
            .filter(|f| f.locate_physical(byte).is_some())
            .map(|f| Owner::Inode(f.ino))
            .collect();
        for region in &self.special_regions {
            if byte >= region.start && byte < region.start + region.length {
                owners.push(region.owner);
            }
        }
        owners
    }

    fn bulk_blocks(&self, low: u64, high: u64) -> Vec<u64> {
        let first = low / self.block_size;
        let last = high.div_ceil(self.block_size);
        (first..last).collect()
    }
}

impl Kernel for FakeKernel {
    fn probe(&mut self, device: Device) -> Result<Geometry, KernelError> {
        Ok(Geometry {
            block_size: self.block_size as u32,
            sector_size: 512,
            reflink_capable: self.reflink_capable,
            metadata_rebuild_capable: self.metadata_rebuild_capable,
            reverse_map_capable: !device.is_realtime(),
            map_freesp_capable: self.map_freesp_capable,
            ag_size: self.ag_size,
        })
    }

    fn create_helper_file(
        &mut self,
        _device: Device,
        _directory: &Path,
        _realtime: bool,
    ) -> Result<FileId, KernelError> {
        let ino = self.next_ino;
        self.next_ino += 1;
        let id = FileId(ino);
        self.files.insert(
            id,
            FakeFile {
                ino,
                generation: 1,
                is_directory: false,
                ctime: (self.clock, 0),
                mtime: (self.clock, 0),
                extents: Vec::new(),
                len: 0,
            },
        );
        Ok(id)
    }

    fn truncate(&mut self, file: FileId, len: u64) -> Result<(), KernelError> {
        let f = self.files.get_mut(&file).ok_or(KernelError::NotFound)?;
        if len < f.len {
            f.extents.retain(|e| e.file_offset < len);
            if let Some(last) = f.extents.last_mut() {
                if last.file_offset + last.length > len {
                    last.length = len - last.file_offset;
                }
            }
        }
        f.len = len;
        Ok(())
    }

    fn close(&mut self, _file: FileId) {
        // Closing a handle never deletes file content; only relevant to
        // the simulation as a no-op, matching real close(2) semantics.
    }

    fn owner_of(&mut self, file: FileId) -> Result<Owner, KernelError> {
        let f = self.files.get(&file).ok_or(KernelError::NotFound)?;
        Ok(Owner::Inode(f.ino))
    }

    fn fsmap(
        &mut self,
        device: Device,
        low: u64,
        high: u64,
        max: usize,
    ) -> Result<Vec<FsmapRecord>, KernelError> {
        if device.is_realtime() {
            return Ok(Vec::new());
        }
        let high = high.min(self.data_len);
        // A reverse map emits one run per (owner, contiguous extent); a
        // shared block legitimately produces several overlapping runs, one
        // per owner holding a reference to it.
        let mut owned = Vec::new();
        for region in &self.special_regions {
            let start = region.start.max(low);
            let end = (region.start + region.length).min(high);
            if start < end {
                owned.push(FsmapRecord {
                    device: Device::Data,
                    physical_start: start,
                    length: end - start,
                    owner: region.owner,
                    offset_in_owner: start - region.start,
                    flags: FsmapFlags::empty(),
                });
            }
        }
        for f in self.files.values() {
            for e in &f.extents {
                let Some(p) = e.physical else { continue };
                let start = p.max(low);
                let end = (p + e.length).min(high);
                if start >= end {
                    continue;
                }
                let delta = start - p;
                owned.push(FsmapRecord {
                    device: Device::Data,
                    physical_start: start,
                    length: end - start,
                    owner: Owner::Inode(f.ino),
                    offset_in_owner: e.file_offset + delta,
                    flags: if e.unwritten {
                        FsmapFlags::UNWRITTEN
                    } else {
                        FsmapFlags::empty()
                    },
                });
            }
        }
        owned.sort_by_key(|r| r.physical_start);

        let mut out = Vec::new();
        let mut cursor = low;
        for rec in owned {
            if rec.physical_start > cursor {
                out.push(FsmapRecord {
                    device: Device::Data,
                    physical_start: cursor,
                    length: rec.physical_start - cursor,
                    owner: Owner::FreeSpace,
                    offset_in_owner: 0,
                    flags: FsmapFlags::empty(),
                });
            }
            cursor = cursor.max(rec.physical_start + rec.length);
            out.push(rec);
        }
        if cursor < high {
            out.push(FsmapRecord {
                device: Device::Data,
                physical_start: cursor,
                length: high - cursor,
                owner: Owner::FreeSpace,
                offset_in_owner: 0,
                flags: FsmapFlags::empty(),
            });
        }
        out.sort_by_key(|r| r.physical_start);
        let truncated = out.len() > max;
        out.truncate(max);
        if !truncated {
            if let Some(last) = out.last_mut() {
                last.flags |= FsmapFlags::LAST;
            }
        }
        Ok(out)
    }

    fn fsrefs(
        &mut self,
        device: Device,
        low: u64,
        high: u64,
        max: usize,
    ) -> Result<Vec<FsrefsRecord>, KernelError> {
        if device.is_realtime() {
            return Ok(Vec::new());
        }
        let high = high.min(self.data_len);
        let blocks = self.bulk_blocks(low, high);
        let mut out = Vec::new();
        let mut run: Option<(u64, u32, FsmapFlags)> = None;
        for block in &blocks {
            if out.len() >= max {
                break;
            }
            let owners = self.block_owners(*block);
            let count = owners.len() as u32;
            let byte = *block * self.block_size;
            let unwritten = self.files.values().any(|f| {
                f.extents.iter().any(|e| {
                    e.unwritten
                        && e.physical
                            .is_some_and(|p| byte >= p && byte < p + e.length)
                })
            });
            let flags = if unwritten {
                FsmapFlags::UNWRITTEN
            } else {
                FsmapFlags::empty()
            };
            match &run {
                Some((_, c, f)) if *c == count && *f == flags => {}
                _ => {
                    if let Some((start, c, f)) = run.take() {
                        out.push(FsrefsRecord {
                            device: Device::Data,
                            physical_start: start * self.block_size,
                            length: (block - start) * self.block_size,
                            owners: c,
                            flags: f,
                        });
                    }
                    run = Some((*block, count, flags));
                }
            }
        }
        if let Some((start, c, f)) = run {
            let end = blocks.last().map(|b| b + 1).unwrap_or(start);
            out.push(FsrefsRecord {
                device: Device::Data,
                physical_start: start * self.block_size,
                length: (end - start) * self.block_size,
                owners: c,
                flags: f,
            });
        }
        let mut out: Vec<FsrefsRecord> =
            out.into_iter().filter_map(|r| r.clip(low, high)).collect();
        out.truncate(max);
        if let Some(last) = out.last_mut() {
            last.flags |= FsmapFlags::LAST;
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
        if fork != Fork::Data {
            return Ok(Vec::new());
        }
        let f = self.files.get(&file).ok_or(KernelError::NotFound)?;
        let mut out: Vec<BmapxRecord> = f
            .extents_in(low, high)
            .into_iter()
            .map(|e| BmapxRecord {
                file_offset: e.file_offset,
                physical: match e.physical {
                    Some(p) => PhysicalOrSentinel::Addr(p),
                    None => PhysicalOrSentinel::Hole,
                },
                length: e.length,
                flags: if e.unwritten {
                    BmapxFlags::UNWRITTEN
                } else {
                    BmapxFlags::empty()
                },
            })
            .collect();
        out.truncate(max);
        if let Some(last) = out.last_mut() {
            last.flags |= BmapxFlags::LAST;
        }
        Ok(out)
    }

    fn map_freesp(
        &mut self,
        file: FileId,
        physical_start: u64,
        length: u64,
    ) -> Result<u64, KernelError> {
        if !self.map_freesp_capable {
            return Err(KernelError::NotSupported);
        }
        let first = physical_start / self.block_size;
        let count = length.div_ceil(self.block_size);
        for i in 0..count {
            if !self.block_owners(first + i).is_empty() {
                return Err(KernelError::OutOfSpace);
            }
        }
        let f = self.files.get_mut(&file).ok_or(KernelError::NotFound)?;
        f.remap(physical_start, length, Some(physical_start), false);
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
        if !self.reflink_capable {
            return Err(KernelError::NotSupported);
        }
        let physical = self
            .files
            .get(&src)
            .ok_or(KernelError::NotFound)?
            .physical_at(src_offset)
            .ok_or(KernelError::NotFound)?;
        let dst_file = self.files.get_mut(&dst).ok_or(KernelError::NotFound)?;
        dst_file.remap(dst_offset, length, Some(physical), false);
        Ok(length)
    }

    fn dedupe_range(&mut self, req: DedupeRequest) -> Result<DedupeOutcome, KernelError> {
        let src_physical = self
            .files
            .get(&req.src)
            .ok_or(KernelError::NotFound)?
            .physical_at(req.src_offset)
            .ok_or(KernelError::NotFound)?;
        let dest_physical = self
            .files
            .get(&req.dest)
            .ok_or(KernelError::NotFound)?
            .physical_at(req.dest_offset)
            .ok_or(KernelError::NotFound)?;
        let src_block = src_physical / self.block_size;
        let dest_block = dest_physical / self.block_size;
        let src_token = self.content.get(&src_block).copied().unwrap_or(0);
        let dest_token = self.content.get(&dest_block).copied().unwrap_or(0);
        if src_token != dest_token {
            return Ok(DedupeOutcome::Differed);
        }
        self.clock += 1;
        let clock = self.clock;
        let dest_file = self.files.get_mut(&req.dest).ok_or(KernelError::NotFound)?;
        dest_file.remap(req.dest_offset, req.length, Some(src_physical), false);
        dest_file.touch(&mut { clock });
        Ok(DedupeOutcome::Remapped { bytes: req.length })
    }

    fn exchange_range(&mut self, req: ExchangeRequest) -> Result<(), KernelError> {
        let current = self.bulkstat_of(req.freshness.ino);
        if !current.is_fresh_against(&req.freshness) {
            return Err(KernelError::Busy);
        }
        let phys2 = self
            .files
            .get(&req.file2)
            .ok_or(KernelError::NotFound)?
            .physical_at(req.offset2);
        let phys1 = self
            .files
            .get(&req.file1)
            .ok_or(KernelError::NotFound)?
            .physical_at(req.offset1);
        self.clock += 1;
        let clock = self.clock;
        if let Some(f) = self.files.get_mut(&req.file1) {
            f.remap(req.offset1, req.length, phys2, false);
            f.mtime = (clock, 0);
            f.ctime = (clock, 0);
        }
        if let Some(f) = self.files.get_mut(&req.file2) {
            f.remap(req.offset2, req.length, phys1, false);
        }
        Ok(())
    }

    fn unshare(&mut self, file: FileId, offset: u64, length: u64) -> Result<(), KernelError> {
        self.unshared_once.insert((file, offset));
        let f = self.files.get(&file).ok_or(KernelError::NotFound)?;
        let physical = f.physical_at(offset);
        if let Some(p) = physical {
            // A real unshare gives the caller a private copy of the same
            // bytes on new blocks, breaking the reflink; it does not alter
            // what's stored at the old (still shared) location.
            let first = p / self.block_size;
            let count = length.div_ceil(self.block_size);
            let tokens: Vec<u64> = (0..count)
                .map(|i| self.content.get(&(first + i)).copied().unwrap_or(0))
                .collect();
            let new_base = self.alloc_synthetic(length);
            let new_first = new_base / self.block_size;
            for (i, token) in tokens.into_iter().enumerate() {
                self.content.insert(new_first + i as u64, token);
            }
            let f = self.files.get_mut(&file).ok_or(KernelError::NotFound)?;
            f.remap(offset, length, Some(new_base), false);
        }
        Ok(())
    }

    fn scrub_metadata(
        &mut self,
        device: Device,
        ag: u32,
        kind: RebuildKind,
    ) -> Result<(), KernelError> {
        if !self.metadata_rebuild_capable {
            return Err(KernelError::NotSupported);
        }
        let _ = (device, ag, kind);
        self.special_regions
            .retain(|r| !matches!(r.owner, Owner::AgMetadata));
        Ok(())
    }

    fn bulkstat_single(&mut self, _device: Device, ino: u64) -> Result<Bulkstat, KernelError> {
        if !self.files.values().any(|f| f.ino == ino) {
            return Err(KernelError::NotFound);
        }
        Ok(self.bulkstat_of(ino))
    }

    fn open_by_handle(&mut self, _device: Device, handle: Handle) -> Result<FileId, KernelError> {
        let existing = self
            .files
            .iter()
            .find(|(_, f)| f.ino == handle.ino && f.generation == handle.generation)
            .map(|(id, _)| *id);
        existing.ok_or(KernelError::NotFound)
    }

    fn free_eofblocks(&mut self, _device: Device) -> Result<(), KernelError> {
        Ok(())
    }

    fn set_realtime_flag(&mut self, _file: FileId, _realtime: bool) -> Result<(), KernelError> {
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
        let physical = self
            .files
            .get(&src)
            .ok_or(KernelError::NotFound)?
            .physical_at(src_offset);
        let count = length.div_ceil(self.block_size);
        let tokens: Vec<u64> = match physical {
            Some(p) => {
                let first = p / self.block_size;
                (0..count)
                    .map(|i| self.content.get(&(first + i)).copied().unwrap_or(0))
                    .collect()
            }
            None => vec![0; count as usize],
        };
        // The dst file gets a synthetic physical address in an unused region
        // above the simulated device so it never collides with a real
        // target range, preserving the copied bytes' content tokens.
        let synthetic = self.alloc_synthetic(length);
        let synthetic_first = synthetic / self.block_size;
        for (i, token) in tokens.into_iter().enumerate() {
            self.content.insert(synthetic_first + i as u64, token);
        }
        let dst_file = self.files.get_mut(&dst).ok_or(KernelError::NotFound)?;
        dst_file.remap(dst_offset, length, Some(synthetic), false);
        Ok(())
    }

    fn physical_at(&mut self, file: FileId, offset: u64) -> Result<Option<u64>, KernelError> {
        Ok(self
            .files
            .get(&file)
            .ok_or(KernelError::NotFound)?
            .physical_at(offset))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn free_window_has_no_owners() {
        let mut fake = FakeKernel::new(4096 * 10, 4096);
        let recs = fake.fsmap(Device::Data, 0, 4096 * 10, 1024).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].owner, Owner::FreeSpace);
        assert!(recs[0].flags.contains(FsmapFlags::LAST));
    }

    #[test]
    fn single_owner_shows_up() {
        let mut fake = FakeKernel::new(4096 * 10, 4096);
        let ino = fake.create_owner_file(0, 4096 * 4);
        let recs = fake.fsmap(Device::Data, 0, 4096 * 10, 1024).unwrap();
        assert_eq!(recs[0].owner, Owner::Inode(ino));
        assert_eq!(recs[0].length, 4096 * 4);
        assert_eq!(recs[1].owner, Owner::FreeSpace);
    }

    #[test]
    fn shared_extent_has_two_owners() {
        let mut fake = FakeKernel::new(4096 * 10, 4096);
        let a = fake.create_owner_file(0, 4096 * 4);
        fake.share_with(a, 0, 999, 4096 * 4);
        let refs = fake.fsrefs(Device::Data, 0, 4096 * 10, 1024).unwrap();
        assert_eq!(refs[0].owners, 2);
    }

    #[test]
    fn dedupe_requires_matching_content() {
        let mut fake = FakeKernel::new(4096 * 10, 4096);
        let a = fake.create_owner_file(0, 4096);
        let b = fake.create_owner_file(4096, 4096);
        let work = fake.create_helper_file(Device::Data, Path::new("/"), false).unwrap();
        // Point `work` at A's physical block so dedupe against B differs.
        fake.clone_range(FileId(a), 0, work, 0, 4096).unwrap();
        let outcome = fake
            .dedupe_range(DedupeRequest {
                src: work,
                src_offset: 0,
                length: 4096,
                dest: FileId(b),
                dest_offset: 0,
            })
            .unwrap();
        assert_eq!(outcome, DedupeOutcome::Differed);
    }
}
