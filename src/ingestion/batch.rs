//! Batch Accumulator - Pure buffering between normalization and the loader

use crate::ingestion::row::NormalizedRow;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// What the caller should do after offering a row
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushSignal {
    Continue,
    Flush,
}

/// Rows committed together in one transaction.
///
/// Built only by [`BatchAccumulator`]; once handed out it is never touched
/// by the accumulator again.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    rows: Vec<NormalizedRow>,
    sequence: u64,
}

impl Batch {
    pub fn rows(&self) -> &[NormalizedRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<NormalizedRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 1-based position of this batch within its file.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn first_row(&self) -> u64 {
        self.rows.first().map(|r| r.row).unwrap_or(0)
    }

    pub fn last_row(&self) -> u64 {
        self.rows.last().map(|r| r.row).unwrap_or(0)
    }
}

/// Buffers rows up to a fixed capacity
pub struct BatchAccumulator {
    capacity: usize,
    buffer: Vec<NormalizedRow>,
    dispatched: u64,
}

impl BatchAccumulator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: Vec::with_capacity(capacity),
            dispatched: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rows currently buffered.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append a row; `Flush` once the buffer has reached capacity.
    pub fn offer(&mut self, row: NormalizedRow) -> FlushSignal {
        self.buffer.push(row);
        if self.buffer.len() >= self.capacity {
            FlushSignal::Flush
        } else {
            FlushSignal::Continue
        }
    }

    /// Hand out whatever is buffered, full or partial. `None` when empty.
    pub fn drain(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            return None;
        }
        self.dispatched += 1;
        let rows = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.capacity));
        Some(Batch {
            rows,
            sequence: self.dispatched,
        })
    }

    /// Batches handed out so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}
