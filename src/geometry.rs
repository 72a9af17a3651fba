//! Filesystem geometry and the attributes a caller supplies to open a
//! clearing request.

use std::path::PathBuf;

use crate::error::EngineError;
use crate::trace::TraceMask;

/// Which volume of the filesystem a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// The primary data volume.
    Data,
    /// The realtime volume.
    Realtime,
}

impl Device {
    /// Returns whether this is the realtime volume.
    pub fn is_realtime(self) -> bool {
        matches!(self, Device::Realtime)
    }
}

/// Geometry exposed by the target filesystem, probed once at request
/// creation.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// The filesystem block size, in bytes. All clearing ranges must be
    /// aligned to this.
    pub block_size: u32,
    /// The underlying sector size, in bytes.
    pub sector_size: u32,
    /// Whether the filesystem supports reflink (clone range, dedupe range).
    pub reflink_capable: bool,
    /// Whether the kernel supports forced metadata rebuild for this
    /// filesystem.
    pub metadata_rebuild_capable: bool,
    /// Whether the filesystem exposes a reverse map (FSMAP/FSREFS).
    pub reverse_map_capable: bool,
    /// Whether the kernel supports reserving free space into a file without
    /// writing ("map free space").
    pub map_freesp_capable: bool,
    /// Size of one allocation group, in bytes. Used only to group reverse-map
    /// records by AG for the metadata stage.
    pub ag_size: u64,
}

impl Geometry {
    /// Rounds `len` down to a multiple of the block size.
    pub fn block_round_down(&self, len: u64) -> u64 {
        len - (len % self.block_size as u64)
    }

    /// Returns whether `offset` is aligned to the block size.
    pub fn is_block_aligned(&self, offset: u64) -> bool {
        offset.is_multiple_of(self.block_size as u64)
    }
}

/// Caller-supplied attributes used to open a clearing request.
///
/// This is the Rust shape of the source's `attrs` structure (section 6):
/// target volume tag, realtime flag, range, trace mask, a directory fd used
/// to anchor helper file creation, and a display name used only in
/// diagnostics.
#[derive(Debug, Clone)]
pub struct Attrs {
    /// The device to clear space on.
    pub device: Device,
    /// Byte offset of the start of the range, relative to the volume.
    pub start: u64,
    /// Length of the range in bytes.
    pub length: u64,
    /// Which trace categories to emit.
    pub trace_mask: TraceMask,
    /// Directory under which helper files are created. Must be on the same
    /// volume as `device`.
    pub open_directory: PathBuf,
    /// Name used in diagnostics (typically the mount point or device path).
    pub display_name: String,
}

impl Attrs {
    /// Validates these attributes against the given geometry.
    ///
    /// A `length` of zero is accepted (it is a valid no-op, see the
    /// boundary behaviours); everything else must be block-aligned.
    pub fn validate(&self, geometry: &Geometry) -> Result<(), EngineError> {
        if self.length == 0 {
            return Ok(());
        }
        if !geometry.is_block_aligned(self.start) {
            return Err(EngineError::InvalidAttrs {
                path: self.open_directory.clone(),
                reason: format!(
                    "start {} is not aligned to block size {}",
                    self.start, geometry.block_size
                ),
            });
        }
        if !geometry.is_block_aligned(self.length) {
            return Err(EngineError::InvalidAttrs {
                path: self.open_directory.clone(),
                reason: format!(
                    "length {} is not aligned to block size {}",
                    self.length, geometry.block_size
                ),
            });
        }
        Ok(())
    }

    /// Returns the exclusive end of the range.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

#[cfg(test)]
mod test {
    use super::*;

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

    fn attrs(start: u64, length: u64) -> Attrs {
        Attrs {
            device: Device::Data,
            start,
            length,
            trace_mask: TraceMask::empty(),
            open_directory: PathBuf::from("/mnt"),
            display_name: "/dev/test".to_owned(),
        }
    }

    #[test]
    fn zero_length_is_valid() {
        assert!(attrs(4096, 0).validate(&geom()).is_ok());
        // Even a misaligned start is fine for a no-op range.
        assert!(attrs(1, 0).validate(&geom()).is_ok());
    }

    #[test]
    fn misaligned_start_rejected() {
        assert!(attrs(1, 4096).validate(&geom()).is_err());
    }

    #[test]
    fn misaligned_length_rejected() {
        assert!(attrs(4096, 1).validate(&geom()).is_err());
    }

    #[test]
    fn aligned_range_accepted() {
        assert!(attrs(4096, 8192).validate(&geom()).is_ok());
    }
}
