//! Capture file and work file management (C3).
//!
//! Both files are anonymous, mode-0600, created on the same volume as the
//! target range. The capture file is sized to `start + length` and is only
//! ever written to through `map_freesp`; the work file is scratch space
//! reused by every stage of the driver.

use std::io;
use std::path::Path;

use crate::error::EngineError;
use crate::geometry::Device;
use crate::kernel::{FileId, Fork, Kernel};
use crate::query::{BmapxCursor, QueryStep};
use crate::record::Owner;

fn wrap_create(name: &'static str, err: crate::kernel::KernelError) -> EngineError {
    match err {
        crate::kernel::KernelError::WrongDevice => EngineError::HelperFileWrongVolume { name },
        err => EngineError::HelperFileCreate {
            name,
            source: io::Error::other(err),
        },
    }
}

/// The pair of helper files owned by a clearing request.
#[derive(Clone, Copy)]
pub struct HelperFiles {
    /// The capture file: an identity map of physical blocks pinned against
    /// reuse.
    pub capture: FileId,
    /// The scratch work file.
    pub work: FileId,
    capture_owner: Owner,
    work_owner: Owner,
}

impl HelperFiles {
    /// Creates both helper files on `device`, rooted at `directory`, and
    /// truncates the capture file to `capture_len` bytes (`start + length`
    /// of the target window).
    pub fn create(
        kernel: &mut impl Kernel,
        device: Device,
        directory: &Path,
        realtime: bool,
        capture_len: u64,
    ) -> Result<Self, EngineError> {
        let capture = kernel
            .create_helper_file(device, directory, realtime)
            .map_err(|e| wrap_create("capture", e))?;
        let work = kernel
            .create_helper_file(device, directory, realtime)
            .map_err(|e| wrap_create("work", e))?;
        kernel
            .truncate(capture, capture_len)
            .map_err(|e| wrap_create("capture", e))?;
        let capture_owner = kernel.owner_of(capture).map_err(EngineError::Query)?;
        let work_owner = kernel.owner_of(work).map_err(EngineError::Query)?;
        Ok(Self {
            capture,
            work,
            capture_owner,
            work_owner,
        })
    }

    /// Whether `owner` names one of our own helper files — these must be
    /// skipped while scanning the reverse map (section 4.4 step 1).
    pub fn is_own(&self, owner: Owner) -> bool {
        owner == self.capture_owner || owner == self.work_owner
    }

    /// The capture file's own inode number, used as a non-racy freshness
    /// token when the exchange-range fallback is invoked on our own helper
    /// files.
    pub fn capture_ino(&self) -> u64 {
        match self.capture_owner {
            Owner::Inode(ino) => ino,
            _ => unreachable!("helper files are always backed by a regular inode"),
        }
    }

    /// Closes both files. Best-effort; implementations make `close`
    /// infallible.
    pub fn close(&self, kernel: &mut impl Kernel) {
        kernel.close(self.capture);
        kernel.close(self.work);
    }

    /// Yields `(offset, length)` holes of the capture file within
    /// `[low, high)` — the ranges still unclaimed at this point in the run.
    pub fn holes(
        &self,
        kernel: &mut impl Kernel,
        low: u64,
        high: u64,
    ) -> Result<Vec<(u64, u64)>, EngineError> {
        let extents = self.data_extents(kernel, low, high)?;
        let mut holes = Vec::new();
        let mut cursor = low;
        for (offset, length) in extents {
            if offset > cursor {
                holes.push((cursor, offset - cursor));
            }
            cursor = offset + length;
        }
        if cursor < high {
            holes.push((cursor, high - cursor));
        }
        Ok(holes)
    }

    /// Yields `(offset, length)` of the capture file's actual data extents
    /// within `[low, high)` — the ranges already claimed.
    pub fn data(
        &self,
        kernel: &mut impl Kernel,
        low: u64,
        high: u64,
    ) -> Result<Vec<(u64, u64)>, EngineError> {
        self.data_extents(kernel, low, high)
    }

    fn data_extents(
        &self,
        kernel: &mut impl Kernel,
        low: u64,
        high: u64,
    ) -> Result<Vec<(u64, u64)>, EngineError> {
        let mut cursor = BmapxCursor::start(self.capture, Fork::Data, low, high);
        let mut out = Vec::new();
        loop {
            match cursor.next(kernel)? {
                QueryStep::Done => break,
                QueryStep::Rows => {
                    for row in cursor.rows() {
                        if matches!(row.physical, crate::record::PhysicalOrSentinel::Addr(_)) {
                            out.push((row.file_offset, row.length));
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::fake::FakeKernel;
    use std::path::PathBuf;

    #[test]
    fn fresh_capture_file_is_all_hole() {
        let mut fake = FakeKernel::new(4096 * 10, 4096);
        let helpers =
            HelperFiles::create(&mut fake, Device::Data, &PathBuf::from("/"), false, 4096 * 4)
                .unwrap();
        let holes = helpers.holes(&mut fake, 0, 4096 * 4).unwrap();
        assert_eq!(holes, vec![(0, 4096 * 4)]);
    }

    #[test]
    fn map_freesp_turns_a_hole_into_data() {
        let mut fake = FakeKernel::new(4096 * 10, 4096);
        let helpers =
            HelperFiles::create(&mut fake, Device::Data, &PathBuf::from("/"), false, 4096 * 4)
                .unwrap();
        fake.map_freesp(helpers.capture, 0, 4096).unwrap();
        let data = helpers.data(&mut fake, 0, 4096 * 4).unwrap();
        assert_eq!(data, vec![(0, 4096)]);
        let holes = helpers.holes(&mut fake, 0, 4096 * 4).unwrap();
        assert_eq!(holes, vec![(4096, 4096 * 3)]);
    }
}
