//! Decoder stage
//!
//! Pulls frames from a capture source into pool buffers, decodes link,
//! network, and transport layers, attaches the canonical flow key and
//! forward bit, and hands full batches to the flow table workers. Packets
//! without a usable network or transport layer are dropped here and their
//! buffers recycled immediately; the flow table never sees them.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use etherparse::SlicedPacket;
use tracing::{debug, trace, warn};

use crate::buffer::{Batch, BufferPool, RingProducer};
use crate::core::{five_tuple, FlowKey, IpProtocol, PacketMeta, TcpFlags, Timestamp};
use crate::error::{Error, Result};
use crate::filter::Filters;

/// Framing of the capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Frames start with an Ethernet II header
    Ethernet,
    /// Frames start directly at the IP header
    RawIp,
}

/// One captured frame, borrowed from the source until it is copied into a
/// pool buffer
#[derive(Debug)]
pub struct Captured<'a> {
    pub data: &'a [u8],
    /// Original length on the wire (`data` may be truncated by a snaplen)
    pub wire_len: u32,
    /// Capture timestamp in nanoseconds
    pub timestamp: Timestamp,
}

/// Trait for packet capture implementations feeding the pipeline
pub trait PacketSource: Send {
    /// Get the next frame; `Ok(None)` ends the stream.
    fn next_packet(&mut self) -> anyhow::Result<Option<Captured<'_>>>;

    /// Framing of the frames this source produces
    fn link_type(&self) -> LinkType;
}

/// Custom flow key derivation, used when `flow_key_mode` is `custom`
pub type KeyFn = Arc<dyn Fn(&PacketMeta) -> Option<(FlowKey, bool)> + Send + Sync>;

/// Decoder stage counters, shared with the pipeline summary
#[derive(Debug, Default)]
pub struct DecodeStats {
    packets: AtomicU64,
    rejected: AtomicU64,
    filtered: AtomicU64,
    starved: AtomicU64,
}

impl DecodeStats {
    pub fn snapshot(&self) -> DecodeSnapshot {
        DecodeSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            starved: self.starved.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeSnapshot {
    /// Frames pulled from the source
    pub packets: u64,
    /// Frames dropped for lacking a network or transport layer
    pub rejected: u64,
    /// Frames dropped by configured filters
    pub filtered: u64,
    /// Times the buffer pool ran dry while refilling the stock
    pub starved: u64,
}

/// Decode a frame down to the metadata the flow engine needs.
///
/// Returns `None` for frames without an IP layer or with a transport the
/// engine does not key on. ICMP packets get zero ports; type and code ride
/// along in the metadata without entering the key.
pub fn decode_packet(link: LinkType, data: &[u8]) -> Option<PacketMeta> {
    let sliced = match link {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkType::RawIp => SlicedPacket::from_ip(data).ok()?,
    };

    let (src_ip, dst_ip, protocol) = match &sliced.net {
        Some(etherparse::NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            let protocol = match header.protocol() {
                etherparse::IpNumber::TCP => IpProtocol::Tcp,
                etherparse::IpNumber::UDP => IpProtocol::Udp,
                etherparse::IpNumber::ICMP => IpProtocol::Icmp,
                other => IpProtocol::Other(other.0),
            };
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                protocol,
            )
        }
        Some(etherparse::NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            let protocol = match header.next_header() {
                etherparse::IpNumber::TCP => IpProtocol::Tcp,
                etherparse::IpNumber::UDP => IpProtocol::Udp,
                etherparse::IpNumber::IPV6_ICMP => IpProtocol::Icmpv6,
                other => IpProtocol::Other(other.0),
            };
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                protocol,
            )
        }
        _ => return None,
    };

    match &sliced.transport {
        Some(etherparse::TransportSlice::Tcp(tcp)) => Some(PacketMeta {
            src_ip,
            dst_ip,
            protocol,
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            tcp_flags: Some(TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
                ece: tcp.ece(),
                cwr: tcp.cwr(),
            }),
            icmp_type: None,
            icmp_code: None,
        }),
        Some(etherparse::TransportSlice::Udp(udp)) => Some(PacketMeta {
            src_ip,
            dst_ip,
            protocol,
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
            tcp_flags: None,
            icmp_type: None,
            icmp_code: None,
        }),
        Some(etherparse::TransportSlice::Icmpv4(icmp)) => {
            let bytes = icmp.slice();
            let (icmp_type, icmp_code) = if bytes.len() >= 2 {
                (bytes[0], bytes[1])
            } else {
                (0, 0)
            };
            Some(PacketMeta {
                src_ip,
                dst_ip,
                protocol,
                src_port: 0,
                dst_port: 0,
                tcp_flags: None,
                icmp_type: Some(icmp_type),
                icmp_code: Some(icmp_code),
            })
        }
        Some(etherparse::TransportSlice::Icmpv6(icmp)) => {
            let bytes = icmp.slice();
            let (icmp_type, icmp_code) = if bytes.len() >= 2 {
                (bytes[0], bytes[1])
            } else {
                (0, 0)
            };
            Some(PacketMeta {
                src_ip,
                dst_ip,
                protocol,
                src_port: 0,
                dst_port: 0,
                tcp_flags: None,
                icmp_type: Some(icmp_type),
                icmp_code: Some(icmp_code),
            })
        }
        _ => None,
    }
}

/// The decoder stage: one thread pulling from the source and feeding the
/// per-shard rings.
pub(crate) struct Decoder {
    source: Box<dyn PacketSource>,
    pool: Arc<BufferPool>,
    outputs: Vec<RingProducer>,
    pending: Vec<Option<Batch>>,
    stock: Batch,
    filters: Filters,
    key_fn: Option<KeyFn>,
    stats: Arc<DecodeStats>,
    packet_num: u64,
}

impl Decoder {
    pub fn new(
        source: Box<dyn PacketSource>,
        pool: Arc<BufferPool>,
        outputs: Vec<RingProducer>,
        batch_size: usize,
        filters: Filters,
        key_fn: Option<KeyFn>,
        stats: Arc<DecodeStats>,
    ) -> Self {
        let pending = (0..outputs.len()).map(|_| None).collect();
        Self {
            source,
            pool,
            outputs,
            pending,
            stock: Batch::with_capacity(batch_size),
            filters,
            key_fn,
            stats,
            packet_num: 0,
        }
    }

    /// Run until the source ends or fails. Always drains in order: partial
    /// batches are flushed, leftover stock buffers are recycled, and the
    /// rings close when the producers drop.
    pub fn run(mut self) -> Result<()> {
        let link = self.source.link_type();
        let mut source_err: Option<anyhow::Error> = None;

        'outer: loop {
            let cap = match self.source.next_packet() {
                Ok(Some(cap)) => cap,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "capture source failed, draining pipeline");
                    source_err = Some(err);
                    break;
                }
            };
            self.packet_num += 1;
            self.stats.packets.fetch_add(1, Ordering::Relaxed);

            if !self
                .filters
                .matches(link, cap.data, cap.timestamp, self.packet_num)
            {
                self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let mut buf = loop {
                if let Some(buf) = self.stock.take() {
                    break buf;
                }
                self.stock.reset();
                // When the pool is running dry, buffers parked in partial
                // batches must move downstream before we block, or nothing
                // will ever come back.
                if self.pool.num_free() < self.stock.capacity() {
                    flush_pending(&mut self.pending, &self.outputs);
                }
                let stats = &self.stats;
                self.pool.pop(
                    &mut self.stock,
                    |free, total| {
                        stats.starved.fetch_add(1, Ordering::Relaxed);
                        debug!(free, total, "buffer pool starved, waiting for recycle");
                    },
                    |free, total| trace!(free, total, "buffer stock refilled"),
                );
            };
            buf.assign(cap.data, cap.wire_len, cap.timestamp, self.packet_num);

            let keyed = decode_packet(link, buf.raw()).and_then(|meta| {
                let key = match &self.key_fn {
                    Some(key_fn) => key_fn(&meta),
                    None => five_tuple(&meta),
                };
                key.map(|(key, forward)| (meta, key, forward))
            });
            let Some((meta, key, forward)) = keyed else {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                self.pool.recycle(buf);
                continue;
            };
            buf.set_meta(meta);
            buf.set_flow(key, forward);

            let shard = (key.hash64() % self.outputs.len() as u64) as usize;
            let batch = match &mut self.pending[shard] {
                Some(batch) => batch,
                slot => {
                    match self.outputs[shard].pop_empty() {
                        Some(batch) => slot.insert(batch),
                        None => {
                            // Worker is gone; nothing downstream to feed.
                            self.pool.recycle(buf);
                            break 'outer;
                        }
                    }
                }
            };
            if let Err(buf) = batch.push(buf) {
                self.pool.recycle(buf);
            }
            if self.pending[shard]
                .as_ref()
                .map_or(false, |batch| batch.is_full())
            {
                if let Some(batch) = self.pending[shard].take() {
                    self.outputs[shard].finalize(batch);
                }
            }
        }

        // Flush partial batches, return unused stock to the pool.
        flush_pending(&mut self.pending, &self.outputs);
        let mut returned = 0;
        while let Some(buf) = self.stock.take() {
            self.pool.recycle_buffer(buf);
            returned += 1;
        }
        self.pool.free(returned);

        match source_err {
            Some(err) => Err(Error::Source(err)),
            None => Ok(()),
        }
    }
}

/// Hand every non-empty pending batch to its ring.
fn flush_pending(pending: &mut [Option<Batch>], outputs: &[RingProducer]) {
    for (shard, slot) in pending.iter_mut().enumerate() {
        if slot.as_ref().map_or(false, |batch| !batch.is_empty()) {
            if let Some(batch) = slot.take() {
                outputs[shard].finalize(batch);
            }
        }
    }
}
