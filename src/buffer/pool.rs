//! Reusable packet buffers and the pool that owns them
//!
//! The pool hands out empty buffers in batches and reclaims them after the
//! flow table is done. The fast path is lock-free: a pop takes buffers off
//! an atomic free list and only touches the mutex when fewer than one
//! batch's worth of buffers is free, in which case it waits on a condvar
//! until recycling catches up.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use crate::core::{FlowKey, PacketMeta, Timestamp};

use super::batch::Batch;

/// A reusable cell holding one captured packet.
///
/// Whoever holds the `Box` is the sole writer. The `in_use` flag tracks the
/// pop/recycle protocol at runtime so a double hand-out or double recycle
/// fails loudly instead of corrupting another stage's packet.
#[derive(Debug)]
pub struct PacketBuffer {
    data: Vec<u8>,
    prealloc: usize,
    grow: bool,
    wire_len: u32,
    timestamp: Timestamp,
    packet_num: u64,
    key: Option<FlowKey>,
    forward: bool,
    meta: Option<PacketMeta>,
    in_use: AtomicBool,
}

impl PacketBuffer {
    pub(crate) fn new(prealloc: usize, grow: bool) -> Self {
        Self {
            data: Vec::with_capacity(prealloc),
            prealloc,
            grow,
            wire_len: 0,
            timestamp: 0,
            packet_num: 0,
            key: None,
            forward: true,
            meta: None,
            in_use: AtomicBool::new(false),
        }
    }

    /// Fill the buffer with a captured frame. Without grow-on-demand the
    /// copy is clamped to the preallocated capacity; `wire_len` always
    /// records the original length on the wire.
    pub(crate) fn assign(&mut self, data: &[u8], wire_len: u32, timestamp: Timestamp, num: u64) {
        self.data.clear();
        let take = if self.grow {
            data.len()
        } else {
            data.len().min(self.prealloc)
        };
        self.data.extend_from_slice(&data[..take]);
        self.wire_len = wire_len;
        self.timestamp = timestamp;
        self.packet_num = num;
        self.key = None;
        self.forward = true;
        self.meta = None;
    }

    pub(crate) fn set_flow(&mut self, key: FlowKey, forward: bool) {
        self.key = Some(key);
        self.forward = forward;
    }

    pub(crate) fn set_meta(&mut self, meta: PacketMeta) {
        self.meta = Some(meta);
    }

    /// Captured bytes (possibly truncated to the preallocation)
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    /// Original length on the wire
    pub fn wire_len(&self) -> u32 {
        self.wire_len
    }

    /// Capture timestamp in nanoseconds
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Monotonic capture sequence number
    pub fn packet_num(&self) -> u64 {
        self.packet_num
    }

    /// Canonical flow key, when decoding succeeded
    pub fn key(&self) -> Option<&FlowKey> {
        self.key.as_ref()
    }

    /// Whether the raw packet matches the canonical key orientation
    pub fn forward(&self) -> bool {
        self.forward
    }

    /// Decoded layer summary, when decoding succeeded
    pub fn meta(&self) -> Option<&PacketMeta> {
        self.meta.as_ref()
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub(crate) fn mark_in_use(&self) {
        let was = self.in_use.swap(true, Ordering::AcqRel);
        assert!(!was, "packet buffer handed out while still in use");
    }

    pub(crate) fn clear_in_use(&self) {
        let was = self.in_use.swap(false, Ordering::AcqRel);
        assert!(was, "packet buffer recycled twice");
    }

    fn reset(&mut self) {
        self.key = None;
        self.meta = None;
        self.forward = true;
        self.wire_len = 0;
        self.timestamp = 0;
        self.packet_num = 0;
    }
}

/// Fixed pool of reusable packet buffers.
///
/// `num_free` is the only cross-stage atomic; the mutex guards nothing but
/// the condvar predicate. Buffer payloads are never touched under the lock.
pub struct BufferPool {
    free: ArrayQueue<Box<PacketBuffer>>,
    num_free: AtomicUsize,
    total: AtomicUsize,
    batch_size: usize,
    prealloc: usize,
    alloc_size: usize,
    grow: bool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl BufferPool {
    /// Create a pool holding `pool_size` buffers of `prealloc` bytes each.
    pub fn new(pool_size: usize, prealloc: usize, grow: bool, batch_size: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            free: ArrayQueue::new(pool_size),
            num_free: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            batch_size,
            prealloc,
            alloc_size: pool_size,
            grow,
            lock: Mutex::new(()),
            cond: Condvar::new(),
        });
        pool.replenish();
        pool
    }

    /// Buffers currently free
    pub fn num_free(&self) -> usize {
        self.num_free.load(Ordering::Acquire)
    }

    /// Buffers owned by the pool (free or in flight)
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Allocate up to `alloc_size` new buffers, bounded by the pool's slot
    /// capacity (slots opened up by `release` are refilled first).
    pub fn replenish(&self) {
        let mut added = 0;
        for _ in 0..self.alloc_size {
            let buf = Box::new(PacketBuffer::new(self.prealloc, self.grow));
            if self.free.push(buf).is_err() {
                break;
            }
            self.total.fetch_add(1, Ordering::AcqRel);
            added += 1;
        }
        self.free(added);
    }

    /// Drop up to `count` unused buffers from the pool. Buffers currently
    /// in flight are untouched. Must not run concurrently with `pop`.
    pub fn release(&self, count: usize) {
        let mut removed = 0;
        for _ in 0..count {
            match self.free.pop() {
                Some(buf) => {
                    drop(buf);
                    self.total.fetch_sub(1, Ordering::AcqRel);
                    removed += 1;
                }
                None => break,
            }
        }
        self.num_free.fetch_sub(removed, Ordering::AcqRel);
    }

    /// Fill `batch` with up to one batch of free buffers.
    ///
    /// Blocks while fewer than `batch_size` buffers are free, calling
    /// `low(free, total)` on each starvation round; `high(free, total)` is
    /// called once the batch has been filled.
    pub fn pop(
        &self,
        batch: &mut Batch,
        mut low: impl FnMut(usize, usize),
        mut high: impl FnMut(usize, usize),
    ) {
        batch.reset();
        if self.num_free.load(Ordering::Acquire) < self.batch_size {
            let mut guard = self.lock.lock();
            while self.num_free.load(Ordering::Acquire) < self.batch_size {
                low(self.num_free(), self.total());
                if self.num_free.load(Ordering::Acquire) < self.batch_size {
                    self.cond.wait(&mut guard);
                }
            }
        }

        let mut taken = 0;
        while !batch.is_full() {
            match self.free.pop() {
                Some(buf) => {
                    buf.mark_in_use();
                    if let Err(buf) = batch.push(buf) {
                        buf.clear_in_use();
                        let _ = self.free.push(buf);
                        break;
                    }
                    taken += 1;
                }
                None => break,
            }
        }
        self.num_free.fetch_sub(taken, Ordering::AcqRel);
        high(self.num_free(), self.total());
    }

    /// Raise the free count by `n`, waking a starved `pop` once the count
    /// rises above one batch.
    pub fn free(&self, n: usize) {
        if n == 0 {
            return;
        }
        let now_free = self.num_free.fetch_add(n, Ordering::AcqRel) + n;
        if now_free > self.batch_size {
            let _guard = self.lock.lock();
            self.cond.notify_one();
        }
    }

    /// Return one buffer to the free list without adjusting the free
    /// count; callers batch their `free(n)` to amortize the wakeup.
    pub(crate) fn recycle_buffer(&self, mut buf: Box<PacketBuffer>) {
        buf.clear_in_use();
        buf.reset();
        assert!(
            self.free.push(buf).is_ok(),
            "buffer pool free list overflow"
        );
    }

    /// Recycle a single buffer held outside any batch.
    pub fn recycle(&self, buf: Box<PacketBuffer>) {
        self.recycle_buffer(buf);
        self.free(1);
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("total", &self.total())
            .field("free", &self.num_free())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}
