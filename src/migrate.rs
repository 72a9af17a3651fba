//! Migration stage (C5): target selection, and the dedupe-remap / buffered
//! copy + exchange paths that move file mappings out of a selected target.

use crate::error::{EngineError, Progress};
use crate::geometry::{Device, Geometry};
use crate::helpers::HelperFiles;
use crate::kernel::{DedupeOutcome, DedupeRequest, ExchangeRequest, FileId, Kernel, KernelError};
use crate::query::{FsmapCursor, FsrefsCursor, QueryStep};
use crate::record::{Handle, Owner};
use crate::trace::{trace_cat, TraceMask};
use crate::visited::Visited;

/// A transient target selection (section 3, "clearing target").
#[derive(Debug, Clone, Copy)]
pub struct Target {
    /// Start of the selected physical range.
    pub start: u64,
    /// Length of the selected physical range.
    pub length: u64,
    /// Number of distinct owners sharing the range.
    pub owners: u32,
    /// Selection priority (higher is preferred).
    pub priority: u64,
    /// Number of records this target actually migrated.
    pub evacuated_count: u64,
    /// Whether any record asked to be retried next iteration.
    pub try_again: bool,
}

/// Marks a single-owner, preallocated-unwritten extent as cheapest to move.
const UNWRITTEN_PRIORITY_BIT: u64 = 1 << 63;

/// Scans refcount records in `[low, high)`, excluding ranges already in
/// `visited`, and returns the highest-priority candidate, if any. Marks the
/// selected range as visited.
pub fn select_target(
    kernel: &mut impl Kernel,
    device: Device,
    low: u64,
    high: u64,
    geometry: &Geometry,
    visited: &mut Visited,
) -> Result<Option<Target>, EngineError> {
    let mut cursor = FsrefsCursor::start(device, low, high);
    let mut best: Option<Target> = None;
    loop {
        match cursor.next(kernel)? {
            QueryStep::Done => break,
            QueryStep::Rows => {
                for rec in cursor.rows() {
                    if rec.owners == 0 {
                        continue;
                    }
                    if visited.test(rec.physical_start, rec.length) {
                        continue;
                    }
                    let blocks = rec.length / geometry.block_size as u64;
                    let mut priority = blocks.saturating_mul(rec.owners as u64);
                    if rec.owners == 1
                        && rec
                            .flags
                            .contains(crate::record::FsmapFlags::UNWRITTEN)
                    {
                        priority |= UNWRITTEN_PRIORITY_BIT;
                    }
                    let candidate = Target {
                        start: rec.physical_start,
                        length: rec.length,
                        owners: rec.owners,
                        priority,
                        evacuated_count: 0,
                        try_again: false,
                    };
                    best = match best {
                        None => Some(candidate),
                        Some(cur)
                            if candidate.priority > cur.priority
                                || (candidate.priority == cur.priority
                                    && candidate.length > cur.length) =>
                        {
                            Some(candidate)
                        }
                        Some(cur) => Some(cur),
                    };
                }
            }
        }
    }
    if let Some(t) = &best {
        visited.set(t.start, t.length);
    }
    Ok(best)
}

/// Attempts to migrate every record of `target`'s range out, via the dedupe
/// path (reflink filesystems) or the exchange path (no reflink).
pub fn migrate_target(
    kernel: &mut impl Kernel,
    device: Device,
    target: &mut Target,
    helpers: &HelperFiles,
    geometry: &Geometry,
    mask: TraceMask,
) -> Result<Progress, EngineError> {
    let mut made = Progress::None;
    let mut cursor = FsmapCursor::start(device, target.start, target.start + target.length);
    loop {
        match cursor.next(kernel)? {
            QueryStep::Done => break,
            QueryStep::Rows => {
                let rows = cursor.rows().to_vec();
                for rec in rows {
                    if helpers.is_own(rec.owner) || rec.owner.is_special() {
                        continue;
                    }
                    let Owner::Inode(ino) = rec.owner else {
                        continue;
                    };
                    let outcome = if geometry.reflink_capable {
                        migrate_dedupe(
                            kernel,
                            device,
                            ino,
                            rec.physical_start,
                            rec.offset_in_owner,
                            rec.length,
                            helpers,
                            target,
                            geometry.block_size as u64,
                            mask,
                        )
                    } else {
                        migrate_exchange(kernel, device, ino, rec.offset_in_owner, rec.length, helpers, target, mask)
                    };
                    match outcome {
                        Ok(Progress::Made) => {
                            made = Progress::Made;
                            target.evacuated_count += 1;
                        }
                        Ok(Progress::None) => {}
                        Err(_) => {
                            trace_cat!(mask, TARGET, "transient migration failure, skipping record");
                        }
                    }
                }
            }
        }
    }
    let _ = kernel.map_freesp(helpers.capture, target.start, target.length);
    Ok(made)
}

#[allow(clippy::too_many_arguments)]
fn migrate_dedupe(
    kernel: &mut impl Kernel,
    device: Device,
    ino: u64,
    physical_start: u64,
    offset_in_owner: u64,
    length: u64,
    helpers: &HelperFiles,
    target: &mut Target,
    block_size: u64,
    mask: TraceMask,
) -> Result<Progress, KernelError> {
    let snapshot = kernel.bulkstat_single(device, ino)?;
    let handle = Handle {
        ino: snapshot.ino,
        generation: snapshot.generation,
    };
    let owner_fd = kernel.open_by_handle(device, handle)?;
    let result = match dedupe_attempt(
        kernel,
        owner_fd,
        physical_start,
        offset_in_owner,
        length,
        helpers,
        target,
        mask,
    ) {
        Err(_) if length > block_size => {
            // The whole batch failed; retry one block at a time to isolate
            // which blocks can still be moved.
            let mut made = Progress::None;
            let mut first_err = None;
            let mut off = 0;
            while off < length {
                let block_len = block_size.min(length - off);
                match dedupe_attempt(
                    kernel,
                    owner_fd,
                    physical_start + off,
                    offset_in_owner + off,
                    block_len,
                    helpers,
                    target,
                    mask,
                ) {
                    Ok(Progress::Made) => made = Progress::Made,
                    Ok(Progress::None) => {}
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
                off += block_len;
            }
            match first_err {
                Some(e) if made == Progress::None => Err(e),
                _ => Ok(made),
            }
        }
        other => other,
    };
    kernel.close(owner_fd);
    result
}

#[allow(clippy::too_many_arguments)]
fn dedupe_attempt(
    kernel: &mut impl Kernel,
    owner_fd: FileId,
    physical_start: u64,
    offset_in_owner: u64,
    length: u64,
    helpers: &HelperFiles,
    target: &mut Target,
    mask: TraceMask,
) -> Result<Progress, KernelError> {
    let mut unshared_once = false;
    loop {
        let req = DedupeRequest {
            src: helpers.work,
            src_offset: physical_start,
            length,
            dest: owner_fd,
            dest_offset: offset_in_owner,
        };
        match kernel.dedupe_range(req) {
            Ok(DedupeOutcome::Remapped { bytes }) => {
                trace_cat!(mask, DEDUPE, "remapped {} bytes at {}", bytes, physical_start);
                return Ok(Progress::Made);
            }
            Ok(DedupeOutcome::Differed) => {
                target.try_again = true;
                return Ok(Progress::None);
            }
            Err(KernelError::OutOfSpace) if !unshared_once => {
                kernel.unshare(helpers.work, physical_start, length)?;
                unshared_once = true;
            }
            Err(e) => return Err(e),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn migrate_exchange(
    kernel: &mut impl Kernel,
    device: Device,
    ino: u64,
    offset_in_owner: u64,
    length: u64,
    helpers: &HelperFiles,
    target: &mut Target,
    mask: TraceMask,
) -> Result<Progress, KernelError> {
    let snapshot = kernel.bulkstat_single(device, ino)?;
    if !snapshot.is_regular() {
        return Ok(Progress::None);
    }
    let handle = Handle {
        ino: snapshot.ino,
        generation: snapshot.generation,
    };
    let owner_fd = kernel.open_by_handle(device, handle)?;
    kernel.truncate(helpers.work, 0)?;
    kernel.buffered_copy(owner_fd, offset_in_owner, helpers.work, offset_in_owner, length)?;
    let result = kernel.exchange_range(ExchangeRequest {
        file1: owner_fd,
        file2: helpers.work,
        offset1: offset_in_owner,
        offset2: offset_in_owner,
        length,
        freshness: snapshot,
    });
    kernel.close(owner_fd);
    match result {
        Ok(()) => {
            // The swap left the work file holding the window's old blocks;
            // drop that mapping now so the next "map free space" sees them
            // as genuinely free.
            kernel.truncate(helpers.work, 0)?;
            trace_cat!(mask, EXCHANGE, "exchanged {} bytes for inode {}", length, ino);
            Ok(Progress::Made)
        }
        Err(KernelError::Busy) => {
            target.try_again = true;
            Ok(Progress::None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::fake::FakeKernel;
    use crate::kernel::{Fork, RebuildKind};
    use crate::record::{Bulkstat, BmapxRecord, FsmapRecord, FsrefsRecord};
    use std::path::Path;
    use std::path::PathBuf;

    /// Wraps a [`FakeKernel`], simulating a concurrent writer: every
    /// `buffered_copy` (the read side of the exchange path, the same window
    /// a real racing writer would land in) is followed by an external touch
    /// of `racing_ino`, so the exchange's own freshness snapshot goes stale
    /// before `exchange_range` runs.
    struct RacingKernel {
        inner: FakeKernel,
        racing_ino: u64,
    }

    impl Kernel for RacingKernel {
        fn probe(&mut self, device: Device) -> Result<Geometry, KernelError> {
            self.inner.probe(device)
        }
        fn create_helper_file(
            &mut self,
            device: Device,
            directory: &Path,
            realtime: bool,
        ) -> Result<FileId, KernelError> {
            self.inner.create_helper_file(device, directory, realtime)
        }
        fn truncate(&mut self, file: FileId, len: u64) -> Result<(), KernelError> {
            self.inner.truncate(file, len)
        }
        fn close(&mut self, file: FileId) {
            self.inner.close(file)
        }
        fn owner_of(&mut self, file: FileId) -> Result<Owner, KernelError> {
            self.inner.owner_of(file)
        }
        fn fsmap(
            &mut self,
            device: Device,
            low: u64,
            high: u64,
            max: usize,
        ) -> Result<Vec<FsmapRecord>, KernelError> {
            self.inner.fsmap(device, low, high, max)
        }
        fn fsrefs(
            &mut self,
            device: Device,
            low: u64,
            high: u64,
            max: usize,
        ) -> Result<Vec<FsrefsRecord>, KernelError> {
            self.inner.fsrefs(device, low, high, max)
        }
        fn bmapx(
            &mut self,
            file: FileId,
            fork: Fork,
            low: u64,
            high: u64,
            max: usize,
        ) -> Result<Vec<BmapxRecord>, KernelError> {
            self.inner.bmapx(file, fork, low, high, max)
        }
        fn map_freesp(
            &mut self,
            file: FileId,
            physical_start: u64,
            length: u64,
        ) -> Result<u64, KernelError> {
            self.inner.map_freesp(file, physical_start, length)
        }
        fn clone_range(
            &mut self,
            src: FileId,
            src_offset: u64,
            dst: FileId,
            dst_offset: u64,
            length: u64,
        ) -> Result<u64, KernelError> {
            self.inner.clone_range(src, src_offset, dst, dst_offset, length)
        }
        fn dedupe_range(&mut self, req: DedupeRequest) -> Result<DedupeOutcome, KernelError> {
            self.inner.dedupe_range(req)
        }
        fn exchange_range(&mut self, req: ExchangeRequest) -> Result<(), KernelError> {
            self.inner.exchange_range(req)
        }
        fn unshare(&mut self, file: FileId, offset: u64, length: u64) -> Result<(), KernelError> {
            self.inner.unshare(file, offset, length)
        }
        fn scrub_metadata(
            &mut self,
            device: Device,
            ag: u32,
            kind: RebuildKind,
        ) -> Result<(), KernelError> {
            self.inner.scrub_metadata(device, ag, kind)
        }
        fn bulkstat_single(&mut self, device: Device, ino: u64) -> Result<Bulkstat, KernelError> {
            self.inner.bulkstat_single(device, ino)
        }
        fn open_by_handle(&mut self, device: Device, handle: Handle) -> Result<FileId, KernelError> {
            self.inner.open_by_handle(device, handle)
        }
        fn free_eofblocks(&mut self, device: Device) -> Result<(), KernelError> {
            self.inner.free_eofblocks(device)
        }
        fn set_realtime_flag(&mut self, file: FileId, realtime: bool) -> Result<(), KernelError> {
            self.inner.set_realtime_flag(file, realtime)
        }
        fn buffered_copy(
            &mut self,
            src: FileId,
            src_offset: u64,
            dst: FileId,
            dst_offset: u64,
            length: u64,
        ) -> Result<(), KernelError> {
            self.inner.buffered_copy(src, src_offset, dst, dst_offset, length)?;
            self.inner.touch_externally(self.racing_ino);
            Ok(())
        }
        fn physical_at(&mut self, file: FileId, offset: u64) -> Result<Option<u64>, KernelError> {
            self.inner.physical_at(file, offset)
        }
    }

    #[test]
    fn racing_writer_busies_the_exchange_and_leaves_the_record_unmigrated() {
        let mut fake = FakeKernel::new(4096 * 20, 4096).without_reflink();
        let owner = fake.create_owner_file(4096 * 4, 4096 * 2);
        let helpers =
            HelperFiles::create(&mut fake, Device::Data, &PathBuf::from("/"), false, 4096 * 20)
                .unwrap();
        let mut racing = RacingKernel {
            inner: fake,
            racing_ino: owner,
        };
        let mut target = Target {
            start: 4096 * 4,
            length: 4096 * 2,
            owners: 1,
            priority: 2,
            evacuated_count: 0,
            try_again: false,
        };
        let progress = migrate_exchange(
            &mut racing,
            Device::Data,
            owner,
            0,
            4096 * 2,
            &helpers,
            &mut target,
            TraceMask::empty(),
        )
        .unwrap();
        assert_eq!(progress, Progress::None);
        assert!(target.try_again);
        assert_eq!(target.evacuated_count, 0);
        assert_eq!(racing.inner.owner_physical_at(owner, 0), Some(4096 * 4));
    }

    fn geom(reflink: bool) -> Geometry {
        Geometry {
            block_size: 4096,
            sector_size: 512,
            reflink_capable: reflink,
            metadata_rebuild_capable: true,
            reverse_map_capable: true,
            map_freesp_capable: true,
            ag_size: 4096 * 1024,
        }
    }

    #[test]
    fn selects_higher_refcount_over_longer_single_owner() {
        let mut fake = FakeKernel::new(4096 * 30, 4096);
        // Longer single-owner run: 10 blocks, one owner -> priority 10.
        fake.create_owner_file(4096 * 10, 4096 * 10);
        // Shorter but doubly-shared run: 6 blocks, two owners -> priority 12.
        let a = fake.create_owner_file(0, 4096 * 6);
        fake.share_with(a, 0, 999, 4096 * 6);
        let mut visited = Visited::new();
        let target = select_target(&mut fake, Device::Data, 0, 4096 * 30, &geom(true), &mut visited)
            .unwrap()
            .unwrap();
        assert_eq!(target.owners, 2);
        assert_eq!(target.start, 0);
    }

    #[test]
    fn exchange_migration_moves_single_owner_off_target() {
        let mut fake = FakeKernel::new(4096 * 20, 4096);
        let owner = fake.create_owner_file(4096 * 4, 4096 * 2);
        let helpers =
            HelperFiles::create(&mut fake, Device::Data, &PathBuf::from("/"), false, 4096 * 20)
                .unwrap();
        let mut target = Target {
            start: 4096 * 4,
            length: 4096 * 2,
            owners: 1,
            priority: 2,
            evacuated_count: 0,
            try_again: false,
        };
        migrate_target(
            &mut fake,
            Device::Data,
            &mut target,
            &helpers,
            &geom(false),
            TraceMask::empty(),
        )
        .unwrap();
        assert_ne!(fake.owner_physical_at(owner, 0), Some(4096 * 4));
        assert_eq!(target.evacuated_count, 1);
    }

    #[test]
    fn dedupe_retries_per_block_when_whole_batch_fails() {
        let mut fake = FakeKernel::new(4096 * 20, 4096);
        // A block of real content, reflinked into both the owner's second
        // block and the work file at the matching identity-mapped offset.
        let donor = fake.create_owner_file(4096 * 5, 4096);

        // Owner: first block a hole, second block backed by the donor's
        // content. A single dedupe covering both blocks fails immediately
        // (the hole has no physical mapping); the per-block retry should
        // still land the second block.
        let owner_file = fake
            .create_helper_file(Device::Data, &PathBuf::from("/"), false)
            .unwrap();
        fake.truncate(owner_file, 4096 * 2).unwrap();
        fake.clone_range(FileId(donor), 0, owner_file, 4096, 4096)
            .unwrap();
        let owner_ino = owner_file.0;

        let helpers =
            HelperFiles::create(&mut fake, Device::Data, &PathBuf::from("/"), false, 4096 * 20)
                .unwrap();
        fake.truncate(helpers.work, 4096 * 6).unwrap();
        fake.clone_range(FileId(donor), 0, helpers.work, 4096 * 5, 4096)
            .unwrap();

        let mut target = Target {
            start: 4096 * 4,
            length: 4096 * 2,
            owners: 1,
            priority: 2,
            evacuated_count: 0,
            try_again: false,
        };
        let progress = migrate_dedupe(
            &mut fake,
            Device::Data,
            owner_ino,
            4096 * 4,
            0,
            4096 * 2,
            &helpers,
            &mut target,
            4096,
            TraceMask::empty(),
        )
        .unwrap();
        assert_eq!(progress, Progress::Made);
        assert_eq!(fake.owner_physical_at(owner_ino, 4096), Some(4096 * 5));
    }
}
