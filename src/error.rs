//! Error taxonomy for the evacuation engine.
//!
//! Errors fall into four categories (see the design notes): precondition
//! failures abort a run outright, per-record failures are absorbed by the
//! phase that hit them, resource-pressure failures trigger a fallback path,
//! and invariant violations are bugs that still need to surface instead of
//! being silently swallowed.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal, run-aborting errors. Returned by [`crate::driver::Request::new`] and
/// [`crate::driver::Request::run`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The target filesystem does not expose a reverse map.
    #[error("filesystem does not support reverse mapping")]
    NoReverseMap,

    /// The kernel does not support the "map free space" primitive, without
    /// which the capture file cannot be populated.
    #[error("kernel does not support map-freesp")]
    NoMapFreesp,

    /// A helper file (capture or work) could not be created.
    #[error("failed to create helper file {name}: {source}")]
    HelperFileCreate {
        /// Which helper file failed ("capture" or "work").
        name: &'static str,
        #[source]
        source: io::Error,
    },

    /// A helper file ended up on the wrong device or volume.
    #[error("helper file {name} is not on the target volume")]
    HelperFileWrongVolume {
        /// Which helper file is misplaced.
        name: &'static str,
    },

    /// The requested range is invalid (misaligned, out of bounds, wrong
    /// realtime flag, ...).
    #[error("invalid clearing range at {path}: {reason}")]
    InvalidAttrs {
        /// Display name of the device the request was opened against.
        path: PathBuf,
        /// Human-readable reason.
        reason: String,
    },

    /// A result violated an invariant the engine relies on (wrong device in
    /// a record, mapping not where a successful kernel call said it would
    /// be, ...). These are not supposed to happen; they are reported rather
    /// than silently ignored.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A query-layer cursor failed.
    #[error("query cursor failed: {0}")]
    Query(#[from] crate::kernel::KernelError),

    /// Any other I/O failure that isn't classified above.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The outcome of running a single phase or a single inner-loop step.
///
/// This is the Rust shape of the source's tri-state `{Progress, NoProgress,
/// Fatal}` result: the "fatal" arm folds into [`EngineError`] via the
/// `Result` wrapper, so phases return `Result<Progress, EngineError>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The phase captured, migrated, or rebuilt at least one thing.
    Made,
    /// The phase found nothing it could do this iteration.
    None,
}

impl Progress {
    /// Returns whether the phase made progress.
    pub fn is_progress(self) -> bool {
        matches!(self, Progress::Made)
    }
}
