//! Batch rings between pipeline stages
//!
//! A ring is a pair of bounded channels: `empty` carries batches the
//! consumer has recycled back to the producer, `full` carries filled
//! batches forward. Capacities match the number of in-flight batches, so
//! only the two pop operations ever block. Dropping the producer closes
//! the `full` side; the consumer sees end-of-stream as `None`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::warn;

use super::batch::Batch;
use super::pool::BufferPool;

/// In-flight batches and packets currently sitting on the `full` side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingUsage {
    pub batches: usize,
    pub packets: usize,
}

#[derive(Debug, Default)]
struct RingCounters {
    batches: AtomicUsize,
    packets: AtomicUsize,
}

/// Sending half of a batch ring
pub struct RingProducer {
    empty_rx: Receiver<Batch>,
    full_tx: Sender<Batch>,
    counters: Arc<RingCounters>,
    pool: Arc<BufferPool>,
}

/// Receiving half of a batch ring
pub struct RingConsumer {
    full_rx: Receiver<Batch>,
    empty_tx: Sender<Batch>,
    counters: Arc<RingCounters>,
    pool: Arc<BufferPool>,
}

/// Create a ring of `depth` batches of `batch_capacity` buffers each.
pub fn batch_ring(
    depth: usize,
    batch_capacity: usize,
    pool: Arc<BufferPool>,
) -> (RingProducer, RingConsumer) {
    let (empty_tx, empty_rx) = bounded(depth);
    let (full_tx, full_rx) = bounded(depth);
    for _ in 0..depth {
        empty_tx
            .send(Batch::with_capacity(batch_capacity))
            .expect("ring precharge");
    }
    let counters = Arc::new(RingCounters::default());
    (
        RingProducer {
            empty_rx,
            full_tx,
            counters: Arc::clone(&counters),
            pool: Arc::clone(&pool),
        },
        RingConsumer {
            full_rx,
            empty_tx,
            counters,
            pool,
        },
    )
}

impl RingProducer {
    /// Wait for a recycled batch. `None` once the consumer is gone.
    pub fn pop_empty(&self) -> Option<Batch> {
        self.empty_rx.recv().ok()
    }

    /// Hand a filled batch to the consumer. Never blocks: ring capacities
    /// are matched, so a slot is always available.
    pub fn finalize(&self, mut batch: Batch) {
        batch.rewind();
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters.packets.fetch_add(batch.len(), Ordering::Relaxed);
        if let Err(err) = self.full_tx.send(batch) {
            // Consumer is gone mid-shutdown; recycle so the pool balances.
            let mut batch = err.into_inner();
            self.counters.batches.fetch_sub(1, Ordering::Relaxed);
            self.counters.packets.fetch_sub(batch.len(), Ordering::Relaxed);
            warn!(packets = batch.len(), "ring closed, recycling unsent batch");
            let mut n = 0;
            while let Some(buf) = batch.take() {
                self.pool.recycle_buffer(buf);
                n += 1;
            }
            self.pool.free(n);
        }
    }

    /// Hand onward only the already-read prefix `[0, read_index)`; the
    /// unread tail is recycled to the pool immediately.
    pub fn finalize_written(&self, mut batch: Batch) {
        let drained = batch.drain_unread();
        let n = drained.len();
        for buf in drained {
            self.pool.recycle_buffer(buf);
        }
        self.pool.free(n);
        self.finalize(batch);
    }

    /// Close the ring. Dropping the producer has the same effect; this
    /// just makes shutdown explicit at the call site.
    pub fn close(self) {}

    pub fn usage(&self) -> RingUsage {
        RingUsage {
            batches: self.counters.batches.load(Ordering::Relaxed),
            packets: self.counters.packets.load(Ordering::Relaxed),
        }
    }
}

impl RingConsumer {
    /// Wait for the next filled batch. `None` means the producer closed
    /// the ring and the stream is over.
    pub fn pop_full(&self) -> Option<Batch> {
        match self.full_rx.recv() {
            Ok(batch) => {
                self.counters.batches.fetch_sub(1, Ordering::Relaxed);
                self.counters.packets.fetch_sub(batch.len(), Ordering::Relaxed);
                Some(batch)
            }
            Err(_) => None,
        }
    }

    /// Recycle every buffer still held by the batch back to the pool and
    /// return the batch to the producer.
    pub fn recycle(&self, mut batch: Batch) {
        batch.rewind();
        let mut n = 0;
        while let Some(buf) = batch.take() {
            self.pool.recycle_buffer(buf);
            n += 1;
        }
        self.pool.free(n);
        batch.reset();
        let _ = self.empty_tx.send(batch);
    }

    /// Return a batch that carries no buffers.
    pub fn recycle_empty(&self, mut batch: Batch) {
        batch.reset();
        let _ = self.empty_tx.send(batch);
    }

    pub fn usage(&self) -> RingUsage {
        RingUsage {
            batches: self.counters.batches.load(Ordering::Relaxed),
            packets: self.counters.packets.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(16, 64, false, 4)
    }

    fn filled_batch(pool: &BufferPool, mut batch: Batch, packets: usize) -> Batch {
        let mut stock = Batch::with_capacity(packets);
        pool.pop(&mut stock, |_, _| {}, |_, _| {});
        for _ in 0..packets {
            let buf = stock.take().unwrap();
            batch.push(buf).unwrap();
        }
        batch
    }

    #[test]
    fn test_ring_hand_off_and_counters() {
        let pool = pool();
        let (tx, rx) = batch_ring(2, 4, Arc::clone(&pool));
        let batch = tx.pop_empty().unwrap();
        let batch = filled_batch(&pool, batch, 3);
        tx.finalize(batch);
        assert_eq!(tx.usage(), RingUsage { batches: 1, packets: 3 });

        let batch = rx.pop_full().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(rx.usage(), RingUsage { batches: 0, packets: 0 });

        let free_before = pool.num_free();
        rx.recycle(batch);
        assert_eq!(pool.num_free(), free_before + 3);
    }

    #[test]
    fn test_ring_end_of_stream() {
        let pool = pool();
        let (tx, rx) = batch_ring(1, 4, pool);
        tx.close();
        assert!(rx.pop_full().is_none());
    }

    #[test]
    fn test_finalize_written_recycles_tail() {
        let pool = pool();
        let (tx, rx) = batch_ring(1, 4, Arc::clone(&pool));
        let batch = tx.pop_empty().unwrap();
        let mut batch = filled_batch(&pool, batch, 4);
        // Read half the batch, then forward only that prefix.
        let _ = batch.read();
        let _ = batch.read();
        let free_before = pool.num_free();
        tx.finalize_written(batch);
        assert_eq!(pool.num_free(), free_before + 2);

        let forwarded = rx.pop_full().unwrap();
        assert_eq!(forwarded.len(), 2);
        rx.recycle(forwarded);
        assert_eq!(pool.num_free(), 16);
    }

    #[test]
    fn test_recycle_empty_returns_batch() {
        let pool = pool();
        let (tx, rx) = batch_ring(1, 4, pool);
        let batch = tx.pop_empty().unwrap();
        rx.recycle_empty(batch);
        assert!(tx.pop_empty().is_some());
    }
}
