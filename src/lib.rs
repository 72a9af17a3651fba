//! `spaceman` implements the physical space evacuation engine: given a byte
//! range on a reverse-mapped, copy-on-write filesystem, it tries to make that
//! range empty of live data and metadata so the range can be reused for
//! defragmentation, shrinking, or discard.
//!
//! The engine never touches the filesystem directly. Every kernel primitive
//! it needs (fsmap queries, reflink, dedupe, range exchange, metadata
//! rebuild, ...) is reached through the [`kernel::Kernel`] trait, so the
//! phases in this crate can be driven against a real device or against an
//! in-memory fake for testing.

pub mod driver;
pub mod error;
pub mod freeze;
pub mod geometry;
pub mod helpers;
pub mod kernel;
pub mod metadata;
pub mod migrate;
pub mod query;
pub mod record;
pub mod trace;
pub mod util;
pub mod visited;

pub use driver::Request;
pub use error::EngineError;
pub use geometry::{Attrs, Device, Geometry};
pub use trace::TraceMask;
