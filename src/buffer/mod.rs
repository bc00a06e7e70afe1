//! Packet buffers, batches, and rings
//!
//! Buffer handling between pipeline stages:
//! - `PacketBuffer`: a reusable cell holding one packet (raw bytes + decode
//!   results); owned by the pool for its whole lifetime and moved through
//!   the stages as a `Box`, so exactly one stage can write at a time
//! - `BufferPool`: source of empty packet buffers; lock-free free list with
//!   a condvar for starvation, batched hand-out
//! - `Batch`: a fixed-capacity group of buffers exchanged between stages
//! - `RingProducer`/`RingConsumer`: bounded two-channel ring moving batches
//!   from one stage to the next and tracking which buffers are in flight
//!
//! Every buffer that leaves `BufferPool::pop` is recycled exactly once;
//! double recycle is a fatal programming error and panics.

pub mod batch;
pub mod pool;
pub mod ring;

pub use batch::Batch;
pub use pool::{BufferPool, PacketBuffer};
pub use ring::{batch_ring, RingConsumer, RingProducer, RingUsage};
