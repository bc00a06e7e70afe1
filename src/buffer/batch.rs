//! Fixed-capacity batches of packet buffers
//!
//! A batch is the unit of hand-off between stages: buffers are written in
//! at `windex` and consumed from `rindex`. The batch timestamp tracks the
//! latest capture time of any packet pushed into it, which the flow table
//! uses to advance the packet clock.

use crate::core::Timestamp;

use super::pool::PacketBuffer;

/// Ordered group of packet buffers moved between stages as one unit
#[derive(Debug)]
pub struct Batch {
    slots: Vec<Option<Box<PacketBuffer>>>,
    rindex: usize,
    windex: usize,
    timestamp: Timestamp,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            rindex: 0,
            windex: 0,
            timestamp: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of buffers written into the batch
    pub fn len(&self) -> usize {
        self.windex
    }

    pub fn is_empty(&self) -> bool {
        self.windex == 0
    }

    pub fn is_full(&self) -> bool {
        self.windex == self.slots.len()
    }

    /// Latest capture timestamp of any packet in the batch
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Append a buffer; hands it back when the batch is full.
    pub fn push(&mut self, buf: Box<PacketBuffer>) -> Result<(), Box<PacketBuffer>> {
        if self.windex >= self.slots.len() {
            return Err(buf);
        }
        if buf.timestamp() > self.timestamp {
            self.timestamp = buf.timestamp();
        }
        self.slots[self.windex] = Some(buf);
        self.windex += 1;
        Ok(())
    }

    /// Borrow the next unread buffer, advancing the read index. Slots whose
    /// buffer was taken out are skipped.
    pub fn read(&mut self) -> Option<&PacketBuffer> {
        while self.rindex < self.windex {
            let i = self.rindex;
            self.rindex += 1;
            if self.slots[i].is_some() {
                return self.slots[i].as_deref();
            }
        }
        None
    }

    /// Take ownership of the next unread buffer, advancing the read index.
    pub fn take(&mut self) -> Option<Box<PacketBuffer>> {
        while self.rindex < self.windex {
            let i = self.rindex;
            self.rindex += 1;
            if let Some(buf) = self.slots[i].take() {
                return Some(buf);
            }
        }
        None
    }

    /// Drain the unread tail `[rindex, windex)`, shrinking the batch to the
    /// already-read prefix. Used when a stage forwards only part of a batch.
    pub(crate) fn drain_unread(&mut self) -> Vec<Box<PacketBuffer>> {
        let mut drained = Vec::new();
        for slot in &mut self.slots[self.rindex..self.windex] {
            if let Some(buf) = slot.take() {
                drained.push(buf);
            }
        }
        self.windex = self.rindex;
        drained
    }

    /// Rewind the read index so a consumer can traverse from the start.
    pub(crate) fn rewind(&mut self) {
        self.rindex = 0;
    }

    /// Clear all indices for reuse. Any buffers still in slots are dropped,
    /// so callers recycle before resetting.
    pub fn reset(&mut self) {
        for slot in &mut self.slots[..self.windex] {
            debug_assert!(slot.is_none(), "batch reset with live buffers");
            *slot = None;
        }
        self.rindex = 0;
        self.windex = 0;
        self.timestamp = 0;
    }
}
