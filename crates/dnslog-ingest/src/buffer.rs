//! In-memory batch buffer between the tailer and the sink.
//!
//! Appends and drains are serialized by an internal mutex. [`BatchBuffer::drain_all`]
//! swaps in a fresh vector so the caller can insert the batch without holding
//! the lock.
//!
//! Besides the records, the buffer remembers where in the log file the oldest
//! resident record's line starts. The collector uses it to keep the persisted
//! checkpoint behind anything that has not reached the sink yet.

use dnslog_core::QueryLogRecord;
use parking_lot::Mutex;

/// Records drained in one swap.
#[derive(Debug, Default)]
pub struct Drained {
    pub records: Vec<QueryLogRecord>,

    /// File offset of the first drained record's line, if known.
    pub start_offset: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    records: Vec<QueryLogRecord>,
    start_offset: Option<u64>,
}

/// Bounded append-only record buffer.
#[derive(Debug)]
pub struct BatchBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl BatchBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                records: Vec::with_capacity(capacity),
                start_offset: None,
            }),
        }
    }

    /// Capacity that triggers an inline flush.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record whose line starts at `line_offset`.
    ///
    /// Returns `true` once the buffer has reached capacity. Appends beyond
    /// capacity still succeed; there is no backpressure.
    pub fn append(&self, record: QueryLogRecord, line_offset: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.start_offset.is_none() {
            inner.start_offset = Some(line_offset);
        }
        inner.records.push(record);
        inner.records.len() >= self.capacity
    }

    /// Take every buffered record, leaving the buffer empty.
    pub fn drain_all(&self) -> Drained {
        let mut inner = self.inner.lock();
        let records = std::mem::replace(&mut inner.records, Vec::with_capacity(self.capacity));
        Drained {
            records,
            start_offset: inner.start_offset.take(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Offset of the oldest buffered record's line.
    pub fn start_offset(&self) -> Option<u64> {
        self.inner.lock().start_offset
    }

    /// Drop the offset pin but keep the records.
    ///
    /// Used after a rotation: the pin points into the previous file. The next
    /// append pins again.
    pub fn release_offset(&self) {
        self.inner.lock().start_offset = None;
    }
}
