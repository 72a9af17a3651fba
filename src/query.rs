//! Cursored, batched queries over the reverse map, refcount map, and
//! per-file extent map (section 4.1).
//!
//! Each cursor holds the current batch of rows plus enough state to ask for
//! the next one: a low key (exclusive of what's already been yielded) and
//! a flag recording whether the kernel marked the last row of the previous
//! batch as the last record overall. Advancing past the last-record flag
//! is not allowed; once a cursor is `Done` or `Error`, it stays that way.

use crate::error::EngineError;
use crate::geometry::Device;
use crate::kernel::{Fork, Kernel};
use crate::record::{BmapxRecord, FsmapFlags, FsmapRecord, FsrefsRecord};

/// Batches never hold more than this many records at a time.
pub const BATCH_SIZE: usize = 1024;

/// What happened on the most recent `next()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStep {
    /// A new batch of rows is available via `rows()`.
    Rows,
    /// The cursor is exhausted; `rows()` is empty.
    Done,
}

/// Cursor over the reverse map (FSMAP).
pub struct FsmapCursor {
    device: Device,
    low: u64,
    high: u64,
    done: bool,
    rows: Vec<FsmapRecord>,
}

impl FsmapCursor {
    /// Starts a cursor over `[low, high)` on `device`.
    pub fn start(device: Device, low: u64, high: u64) -> Self {
        Self {
            device,
            low,
            high,
            done: low >= high,
            rows: Vec::new(),
        }
    }

    /// Fetches the next batch.
    pub fn next(&mut self, kernel: &mut impl Kernel) -> Result<QueryStep, EngineError> {
        if self.done {
            self.rows.clear();
            return Ok(QueryStep::Done);
        }
        let batch = kernel.fsmap(self.device, self.low, self.high, BATCH_SIZE)?;
        if batch.is_empty() {
            self.done = true;
            self.rows.clear();
            return Ok(QueryStep::Done);
        }
        for r in &batch {
            if r.device != self.device {
                return Err(EngineError::Invariant(format!(
                    "fsmap returned a record for the wrong device at {}",
                    r.physical_start
                )));
            }
        }
        let last = batch.last().expect("checked non-empty above");
        self.low = last.end();
        self.done = last.flags.contains(FsmapFlags::LAST) || self.low >= self.high;
        self.rows = batch;
        Ok(QueryStep::Rows)
    }

    /// The current batch.
    pub fn rows(&self) -> &[FsmapRecord] {
        &self.rows
    }
}

/// Cursor over the refcount map (FSREFS).
pub struct FsrefsCursor {
    device: Device,
    low: u64,
    high: u64,
    done: bool,
    rows: Vec<FsrefsRecord>,
}

impl FsrefsCursor {
    /// Starts a cursor over `[low, high)` on `device`.
    pub fn start(device: Device, low: u64, high: u64) -> Self {
        Self {
            device,
            low,
            high,
            done: low >= high,
            rows: Vec::new(),
        }
    }

    /// Fetches the next batch.
    pub fn next(&mut self, kernel: &mut impl Kernel) -> Result<QueryStep, EngineError> {
        if self.done {
            self.rows.clear();
            return Ok(QueryStep::Done);
        }
        let batch = kernel.fsrefs(self.device, self.low, self.high, BATCH_SIZE)?;
        if batch.is_empty() {
            self.done = true;
            self.rows.clear();
            return Ok(QueryStep::Done);
        }
        for r in &batch {
            if r.device != self.device {
                return Err(EngineError::Invariant(format!(
                    "fsrefs returned a record for the wrong device at {}",
                    r.physical_start
                )));
            }
        }
        let last = batch.last().expect("checked non-empty above");
        self.low = last.end();
        self.done = last.flags.contains(FsmapFlags::LAST) || self.low >= self.high;
        self.rows = batch;
        Ok(QueryStep::Rows)
    }

    /// The current batch.
    pub fn rows(&self) -> &[FsrefsRecord] {
        &self.rows
    }
}

/// Cursor over a single file's extent map (BMAPX).
pub struct BmapxCursor {
    file: crate::kernel::FileId,
    fork: Fork,
    low: u64,
    high: u64,
    done: bool,
    rows: Vec<BmapxRecord>,
}

impl BmapxCursor {
    /// Starts a cursor over `file`'s `fork` within `[low, high)`.
    pub fn start(file: crate::kernel::FileId, fork: Fork, low: u64, high: u64) -> Self {
        Self {
            file,
            fork,
            low,
            high,
            done: low >= high,
            rows: Vec::new(),
        }
    }

    /// Fetches the next batch.
    pub fn next(&mut self, kernel: &mut impl Kernel) -> Result<QueryStep, EngineError> {
        if self.done {
            self.rows.clear();
            return Ok(QueryStep::Done);
        }
        let batch = kernel.bmapx(self.file, self.fork, self.low, self.high, BATCH_SIZE)?;
        if batch.is_empty() {
            self.done = true;
            self.rows.clear();
            return Ok(QueryStep::Done);
        }
        let last = *batch.last().expect("checked non-empty above");
        self.low = last.file_offset + last.length;
        self.done = last
            .flags
            .contains(crate::record::BmapxFlags::LAST)
            || self.low >= self.high;
        self.rows = batch;
        Ok(QueryStep::Rows)
    }

    /// The current batch.
    pub fn rows(&self) -> &[BmapxRecord] {
        &self.rows
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::fake::FakeKernel;

    #[test]
    fn fsmap_cursor_drains_to_done() {
        let mut fake = FakeKernel::new(4096 * 4, 4096);
        fake.create_owner_file(0, 4096 * 2);
        let mut cursor = FsmapCursor::start(Device::Data, 0, 4096 * 4);
        let mut total_rows = 0;
        while let QueryStep::Rows = cursor.next(&mut fake).unwrap() {
            total_rows += cursor.rows().len();
        }
        assert!(total_rows >= 2);
    }

    #[test]
    fn empty_window_is_immediately_done() {
        let mut fake = FakeKernel::new(4096 * 4, 4096);
        let mut cursor = FsmapCursor::start(Device::Data, 100, 100);
        assert_eq!(cursor.next(&mut fake).unwrap(), QueryStep::Done);
    }
}
