//! Metadata stage (C6): force a rebuild of per-allocation-group metadata
//! objects found inside the target range.
//!
//! Only applies to the data volume: the realtime volume has no per-AG
//! metadata objects to rebuild, so it is skipped entirely.

use std::collections::HashSet;

use crate::error::{EngineError, Progress};
use crate::geometry::{Device, Geometry};
use crate::helpers::HelperFiles;
use crate::kernel::{Kernel, KernelError, RebuildKind};
use crate::query::{FsmapCursor, QueryStep};
use crate::trace::{trace_cat, TraceMask};
use crate::visited::Visited;

/// Runs one pass of the metadata stage over `[low, high)`.
#[allow(clippy::too_many_arguments)]
pub fn run(
    kernel: &mut impl Kernel,
    device: Device,
    low: u64,
    high: u64,
    geometry: &Geometry,
    helpers: &HelperFiles,
    visited: &mut Visited,
    mask: TraceMask,
) -> Result<Progress, EngineError> {
    if device.is_realtime() || !geometry.metadata_rebuild_capable {
        return Ok(Progress::None);
    }
    let mut made = Progress::None;
    let mut done_ags: HashSet<u32> = HashSet::new();
    let mut cursor = FsmapCursor::start(device, low, high);
    loop {
        match cursor.next(kernel)? {
            QueryStep::Done => break,
            QueryStep::Rows => {
                let rows = cursor.rows().to_vec();
                for rec in rows {
                    if !rec.owner.is_special() || !rec.owner.is_movable() {
                        continue;
                    }
                    if visited.test(rec.physical_start, rec.length) {
                        continue;
                    }
                    let ag = (rec.physical_start / geometry.ag_size) as u32;
                    if done_ags.insert(ag) {
                        let mut rebuilt_any = false;
                        for kind in RebuildKind::ALL {
                            match kernel.scrub_metadata(device, ag, kind) {
                                Ok(()) => {
                                    rebuilt_any = true;
                                    trace_cat!(mask, REBUILD, "rebuilt {:?} for AG {}", kind, ag);
                                }
                                Err(KernelError::NotSupported)
                                | Err(KernelError::NotFound)
                                | Err(KernelError::OutOfSpace) => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                        if rebuilt_any {
                            made = Progress::Made;
                        }
                    }
                    visited.set(rec.physical_start, rec.length);
                    let _ = kernel.map_freesp(helpers.capture, rec.physical_start, rec.length);
                }
            }
        }
    }
    Ok(made)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::fake::FakeKernel;
    use crate::record::Owner;
    use std::path::PathBuf;

    fn geom() -> Geometry {
        Geometry {
            block_size: 4096,
            sector_size: 512,
            reflink_capable: true,
            metadata_rebuild_capable: true,
            reverse_map_capable: true,
            map_freesp_capable: true,
            ag_size: 4096 * 1024,
        }
    }

    #[test]
    fn rebuilds_the_one_ag_found_in_window() {
        let mut fake = FakeKernel::new(4096 * 10, 4096);
        fake.mark_special(4096 * 2, 4096, Owner::AgMetadata);
        let helpers =
            HelperFiles::create(&mut fake, Device::Data, &PathBuf::from("/"), false, 4096 * 10)
                .unwrap();
        let mut visited = Visited::new();
        let progress = run(
            &mut fake,
            Device::Data,
            0,
            4096 * 10,
            &geom(),
            &helpers,
            &mut visited,
            TraceMask::empty(),
        )
        .unwrap();
        assert_eq!(progress, Progress::Made);
        assert!(visited.test(4096 * 2, 4096));
        let refs = fake.fsmap(Device::Data, 0, 4096 * 10, 1024).unwrap();
        assert!(!refs.iter().any(|r| r.owner == Owner::AgMetadata));
    }

    #[test]
    fn realtime_volume_is_skipped() {
        let mut fake = FakeKernel::new(4096 * 10, 4096);
        let helpers = HelperFiles::create(
            &mut fake,
            Device::Realtime,
            &PathBuf::from("/"),
            true,
            4096 * 10,
        )
        .unwrap();
        let mut visited = Visited::new();
        let progress = run(
            &mut fake,
            Device::Realtime,
            0,
            4096 * 10,
            &geom(),
            &helpers,
            &mut visited,
            TraceMask::empty(),
        )
        .unwrap();
        assert_eq!(progress, Progress::None);
    }
}
