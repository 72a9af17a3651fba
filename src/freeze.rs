//! Freeze stage (C4): obtain a second reference, by reflink, to every
//! written data extent within the target range, so that subsequent writes
//! by the real owner are redirected to new blocks outside the range.

use crate::error::{EngineError, Progress};
use crate::geometry::{Device, Geometry};
use crate::helpers::HelperFiles;
use crate::kernel::{ExchangeRequest, FileId, Kernel, KernelError};
use crate::query::{FsmapCursor, QueryStep};
use crate::record::{FsmapFlags, FsmapRecord, Handle, Owner};
use crate::trace::{trace_cat, TraceMask};

/// Runs one pass of the freeze stage over `[low, high)`, driven by the
/// capture file's current holes. A no-op if the filesystem lacks reflink.
pub fn run(
    kernel: &mut impl Kernel,
    device: Device,
    low: u64,
    high: u64,
    helpers: &HelperFiles,
    geometry: &Geometry,
    mask: TraceMask,
) -> Result<Progress, EngineError> {
    if !geometry.reflink_capable {
        return Ok(Progress::None);
    }
    let mut made = Progress::None;
    for (hole_start, hole_len) in helpers.holes(kernel, low, high)? {
        let mut cursor = FsmapCursor::start(device, hole_start, hole_start + hole_len);
        loop {
            match cursor.next(kernel)? {
                QueryStep::Done => break,
                QueryStep::Rows => {
                    let rows: Vec<FsmapRecord> = cursor.rows().to_vec();
                    for rec in rows {
                        if helpers.is_own(rec.owner) || rec.owner.is_special() {
                            continue;
                        }
                        if rec
                            .flags
                            .intersects(FsmapFlags::ATTR_FORK | FsmapFlags::EXTENT_MAP)
                        {
                            continue;
                        }
                        match capture_one(kernel, device, &rec, helpers, mask) {
                            Ok(Progress::Made) => made = Progress::Made,
                            Ok(Progress::None) => {}
                            Err(_) => {
                                trace_cat!(mask, FREEZE, "transient failure, skipping record");
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(made)
}

fn capture_one(
    kernel: &mut impl Kernel,
    device: Device,
    rec: &FsmapRecord,
    helpers: &HelperFiles,
    mask: TraceMask,
) -> Result<Progress, KernelError> {
    let Owner::Inode(ino) = rec.owner else {
        return Ok(Progress::None);
    };
    let snapshot = kernel.bulkstat_single(device, ino)?;
    if !snapshot.is_regular() {
        return Ok(Progress::None);
    }
    let handle = Handle {
        ino: snapshot.ino,
        generation: snapshot.generation,
    };
    let owner_fd = kernel.open_by_handle(device, handle)?;
    let result = capture_one_opened(kernel, device, rec, helpers, owner_fd, mask);
    kernel.close(owner_fd);
    result
}

fn capture_one_opened(
    kernel: &mut impl Kernel,
    device: Device,
    rec: &FsmapRecord,
    helpers: &HelperFiles,
    owner_fd: FileId,
    mask: TraceMask,
) -> Result<Progress, KernelError> {
    kernel.truncate(helpers.work, 0)?;
    let mut accepted =
        kernel.clone_range(owner_fd, rec.offset_in_owner, helpers.work, 0, rec.length)?;
    if accepted == 0 {
        return Ok(Progress::None);
    }
    let mapped = kernel.physical_at(helpers.work, 0)?;
    if mapped != Some(rec.physical_start) {
        // Unwritten extents have no backing blocks to reflink; a mismatch
        // here just means there's nothing to capture.
        return Ok(Progress::None);
    }
    if accepted < rec.length {
        let tail_offset = rec.offset_in_owner + accepted;
        kernel.unshare(owner_fd, tail_offset, rec.length - accepted)?;
        let still_shared =
            kernel.physical_at(helpers.work, accepted)? != Some(rec.physical_start + accepted);
        if still_shared {
            let block = 4096u64;
            accepted -= accepted % block;
            if accepted == 0 {
                return Ok(Progress::None);
            }
        }
    }
    trace_cat!(
        mask,
        FREEZE,
        "capturing {} bytes at {}",
        accepted,
        rec.physical_start
    );
    match kernel.clone_range(helpers.work, 0, helpers.capture, rec.physical_start, accepted) {
        Ok(_) => Ok(Progress::Made),
        Err(KernelError::OutOfSpace) => {
            let freshness = kernel.bulkstat_single(device, helpers.capture_ino())?;
            kernel.exchange_range(ExchangeRequest {
                file1: helpers.capture,
                file2: helpers.work,
                offset1: rec.physical_start,
                offset2: 0,
                length: accepted,
                freshness,
            })?;
            Ok(Progress::Made)
        }
        Err(e) => Err(e),
    }
}
