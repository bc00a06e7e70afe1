//! Flow table
//!
//! Maps canonical keys to live flows, drives per-packet state transitions,
//! and sweeps timers on the packet clock. Each table instance is one shard
//! owned by exactly one worker thread; packets of a given key always reach
//! the same shard, so events for one flow are naturally serialized.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::buffer::PacketBuffer;
use crate::config::Config;
use crate::core::{FlowKey, IpProtocol, Timestamp};

use super::flow::{ExportReason, Flow, FlowRecord};
use super::FeatureFactory;

/// Table statistics
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub flows_created: u64,
    pub flows_exported: u64,
    pub export_failed: u64,
    pub discarded: u64,
}

impl TableStats {
    fn merge(&mut self, other: &TableStats) {
        self.lookups += other.lookups;
        self.hits += other.hits;
        self.misses += other.misses;
        self.flows_created += other.flows_created;
        self.flows_exported += other.flows_exported;
        self.export_failed += other.export_failed;
        self.discarded += other.discarded;
    }

    /// Sum per-shard statistics into one view
    pub fn aggregate<'a>(shards: impl IntoIterator<Item = &'a TableStats>) -> TableStats {
        let mut total = TableStats::default();
        for shard in shards {
            total.merge(shard);
        }
        total
    }
}

/// One shard of the flow table
pub struct FlowTable {
    flows: HashMap<FlowKey, Flow>,
    ids: Arc<AtomicU64>,
    idle_timeout: u64,
    active_timeout: u64,
    features: FeatureFactory,
    export_tx: Sender<FlowRecord>,
    next_expiry: Timestamp,
    highest_time: Timestamp,
    pub stats: TableStats,
}

impl FlowTable {
    /// Create a shard. `ids` is shared across shards so flow ids stay
    /// process-wide monotonic.
    pub fn new(
        config: &Config,
        ids: Arc<AtomicU64>,
        features: FeatureFactory,
        export_tx: Sender<FlowRecord>,
    ) -> Self {
        Self {
            flows: HashMap::new(),
            ids,
            idle_timeout: config.idle_timeout_ns,
            active_timeout: config.active_timeout_ns,
            features,
            export_tx,
            next_expiry: 0,
            highest_time: 0,
            stats: TableStats::default(),
        }
    }

    /// Live flows in this shard
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Highest packet timestamp observed by this shard
    pub fn highest_time(&self) -> Timestamp {
        self.highest_time
    }

    /// Apply one packet event: expire everything due up to the packet's
    /// timestamp, then look up or create the flow and dispatch. A flow
    /// that exports during the event is removed and emitted.
    pub fn event(&mut self, pkt: &PacketBuffer) {
        let Some(&key) = pkt.key() else {
            self.stats.discarded += 1;
            return;
        };
        let Some(meta) = pkt.meta() else {
            self.stats.discarded += 1;
            return;
        };
        let when = pkt.timestamp();
        if when > self.highest_time {
            self.highest_time = when;
        }
        // Close everything that timed out before this packet arrived, so a
        // packet at `when` can never land on a flow that already expired.
        if self.next_expiry != 0 && when >= self.next_expiry {
            self.expire(when);
        }

        self.stats.lookups += 1;
        let flow = match self.flows.entry(key) {
            Entry::Occupied(entry) => {
                self.stats.hits += 1;
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                self.stats.misses += 1;
                self.stats.flows_created += 1;
                let id = self.ids.fetch_add(1, Ordering::Relaxed);
                let is_tcp = IpProtocol::from(key.proto()) == IpProtocol::Tcp;
                entry.insert(Flow::new(
                    id,
                    key,
                    is_tcp,
                    when,
                    self.idle_timeout,
                    self.active_timeout,
                    (self.features)(),
                ))
            }
        };
        flow.event(meta, pkt.forward(), when, pkt.wire_len());

        let earliest = flow.next_timer();
        let exported = flow.needs_export();
        if earliest != 0 && (self.next_expiry == 0 || earliest < self.next_expiry) {
            self.next_expiry = earliest;
        }
        if exported {
            if let Some(flow) = self.flows.remove(&key) {
                self.emit(flow);
            }
        }
    }

    /// Advance the packet clock to `now`: fire every timer due at or
    /// before it, emit flows that exported, and remember the earliest
    /// remaining expiry.
    pub fn expire(&mut self, now: Timestamp) {
        if now > self.highest_time {
            self.highest_time = now;
        }
        let mut next: Timestamp = 0;
        let mut done: Vec<FlowKey> = Vec::new();
        for (key, flow) in self.flows.iter_mut() {
            let flow_next = flow.expire(now);
            if flow.needs_export() {
                done.push(*key);
            } else if flow_next != 0 && (next == 0 || flow_next < next) {
                next = flow_next;
            }
        }
        for key in done {
            if let Some(flow) = self.flows.remove(&key) {
                self.emit(flow);
            }
        }
        self.next_expiry = next;
    }

    /// End of input: expire everything due, then export every remaining
    /// flow with `forced-end-of-input` at the highest observed packet
    /// time.
    pub fn finish(&mut self, now: Timestamp) {
        let now = now.max(self.highest_time);
        self.expire(now);
        debug!(remaining = self.flows.len(), "flushing flow table");
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        for key in keys {
            if let Some(mut flow) = self.flows.remove(&key) {
                flow.export(ExportReason::ForcedEnd, now);
                self.emit(flow);
            }
        }
        self.next_expiry = 0;
    }

    /// Detach a finished flow and hand its record to the exporter. The
    /// send blocks when the export queue is full; a closed queue drops
    /// the record.
    fn emit(&mut self, flow: Flow) {
        self.stats.flows_exported += 1;
        let record = flow.into_record();
        if self.export_tx.send(record).is_err() {
            self.stats.export_failed += 1;
            warn!("export channel closed, dropping flow record");
        }
    }
}
