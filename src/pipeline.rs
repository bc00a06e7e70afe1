//! Pipeline wiring
//!
//! Connects the stages into the processing DAG: one decoder thread feeds
//! per-shard batch rings, each flow table shard runs on its own worker
//! thread, and finalized flows drain through a bounded channel into the
//! exporter thread. Shutdown propagates from the source: the decoder
//! closes the rings, workers flush their tables, and the exporter drains
//! what remains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use tracing::info;

use crate::buffer::{batch_ring, BufferPool};
use crate::config::{Config, FlowKeyMode};
use crate::decode::{DecodeStats, Decoder, KeyFn, PacketSource};
use crate::error::{Error, Result};
use crate::export::{run_exporter, Exporter};
use crate::filter::{Filters, PacketFilter};
use crate::flow::{default_features, FeatureFactory, FlowTable, TableStats};

/// Aggregate counters from one pipeline run
#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    /// Frames pulled from the capture source
    pub packets: u64,
    /// Frames dropped by filters
    pub filtered: u64,
    /// Frames dropped for lacking a usable network/transport layer
    pub decode_rejected: u64,
    /// Times the decoder waited on an empty buffer pool
    pub pool_starved: u64,
    /// Flows created across all shards
    pub flows_created: u64,
    /// Flows handed to the exporter
    pub flows_exported: u64,
    /// Records the exporter refused or could not be delivered
    pub export_failed: u64,
    /// Packets the flow table discarded for carrying no key
    pub discarded: u64,
    /// Flow table shards used
    pub workers: usize,
}

/// The packet-to-flow processing pipeline
pub struct Pipeline {
    config: Config,
    filters: Filters,
    features: FeatureFactory,
    key_fn: Option<KeyFn>,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            filters: Filters::new(),
            features: default_features(),
            key_fn: None,
        }
    }

    /// Add a packet filter; filters run in insertion order and all must
    /// match.
    pub fn with_filter(mut self, filter: Box<dyn PacketFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Replace the feature factory attached to new flows.
    pub fn with_features(mut self, features: FeatureFactory) -> Self {
        self.features = features;
        self
    }

    /// Install the key function used when `flow_key_mode` is `custom`.
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    /// Run the pipeline until the source ends, then drain and return the
    /// run's counters.
    pub fn run(
        self,
        source: Box<dyn PacketSource>,
        exporter: Box<dyn Exporter>,
    ) -> Result<PipelineSummary> {
        let Pipeline {
            config,
            filters,
            features,
            key_fn,
        } = self;
        config.validate()?;
        let key_fn = match config.flow_key_mode {
            FlowKeyMode::FiveTuple => None,
            FlowKeyMode::Custom => Some(key_fn.ok_or_else(|| {
                Error::Config("flow_key_mode = custom requires a key function".into())
            })?),
        };

        let workers = config.actual_workers();
        let pool = BufferPool::new(
            config.pool_size,
            config.prealloc_bytes,
            config.grow_on_demand,
            config.batch_size,
        );

        let mut producers = Vec::with_capacity(workers);
        let mut consumers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (producer, consumer) =
                batch_ring(config.ring_depth, config.batch_size, Arc::clone(&pool));
            producers.push(producer);
            consumers.push(consumer);
        }

        let (record_tx, record_rx) = bounded(config.ring_depth * config.batch_size);
        let ids = Arc::new(AtomicU64::new(1));
        let decode_stats = Arc::new(DecodeStats::default());
        let export_failed = AtomicU64::new(0);

        let decoder = Decoder::new(
            source,
            Arc::clone(&pool),
            producers,
            config.batch_size,
            filters,
            key_fn,
            Arc::clone(&decode_stats),
        );

        info!(workers, pool_size = config.pool_size, "starting flow pipeline");

        let config_ref = &config;
        let (decode_result, shard_stats) = thread::scope(|s| {
            let exporter_handle =
                s.spawn(|| run_exporter(record_rx, exporter, &export_failed));

            let worker_handles: Vec<_> = consumers
                .into_iter()
                .map(|consumer| {
                    let record_tx = record_tx.clone();
                    let ids = Arc::clone(&ids);
                    let features = Arc::clone(&features);
                    s.spawn(move || {
                        let mut table =
                            FlowTable::new(config_ref, ids, features, record_tx);
                        while let Some(mut batch) = consumer.pop_full() {
                            while let Some(pkt) = batch.read() {
                                table.event(pkt);
                            }
                            consumer.recycle(batch);
                        }
                        let highest = table.highest_time();
                        table.finish(highest);
                        table.stats.clone()
                    })
                })
                .collect();
            drop(record_tx);

            let decoder_handle = s.spawn(move || decoder.run());

            let decode_result = decoder_handle.join().expect("decoder thread panicked");
            let mut shard_stats = Vec::with_capacity(worker_handles.len());
            for handle in worker_handles {
                shard_stats.push(handle.join().expect("flow worker panicked"));
            }
            exporter_handle.join().expect("exporter thread panicked");
            (decode_result, shard_stats)
        });
        decode_result?;

        let decode = decode_stats.snapshot();
        let tables = TableStats::aggregate(shard_stats.iter());
        let summary = PipelineSummary {
            packets: decode.packets,
            filtered: decode.filtered,
            decode_rejected: decode.rejected,
            pool_starved: decode.starved,
            flows_created: tables.flows_created,
            flows_exported: tables.flows_exported,
            export_failed: tables.export_failed + export_failed.load(Ordering::Relaxed),
            discarded: tables.discarded,
            workers,
        };
        info!(
            packets = summary.packets,
            flows = summary.flows_exported,
            rejected = summary.decode_rejected,
            "flow pipeline finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{five_tuple, FlowKey, Timestamp};
    use crate::decode::{Captured, LinkType};
    use crate::flow::{ExportReason, FlowCounters, FlowRecord};
    use etherparse::PacketBuilder;
    use parking_lot::Mutex;

    struct VecSource {
        frames: Vec<(Vec<u8>, Timestamp)>,
        index: usize,
    }

    impl VecSource {
        fn new(frames: Vec<(Vec<u8>, Timestamp)>) -> Box<Self> {
            Box::new(Self { frames, index: 0 })
        }
    }

    impl PacketSource for VecSource {
        fn next_packet(&mut self) -> anyhow::Result<Option<Captured<'_>>> {
            let Some((data, ts)) = self.frames.get(self.index) else {
                return Ok(None);
            };
            self.index += 1;
            Ok(Some(Captured {
                data,
                wire_len: data.len() as u32,
                timestamp: *ts,
            }))
        }

        fn link_type(&self) -> LinkType {
            LinkType::Ethernet
        }
    }

    #[derive(Clone, Default)]
    struct Collect {
        records: Arc<Mutex<Vec<FlowRecord>>>,
    }

    impl Exporter for Collect {
        fn export(&mut self, record: FlowRecord) -> anyhow::Result<()> {
            self.records.lock().push(record);
            Ok(())
        }
    }

    fn udp_frame(src: [u8; 4], sp: u16, dst: [u8; 4], dp: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4(src, dst, 64)
            .udp(sp, dp);
        let mut out = Vec::with_capacity(builder.size(4));
        builder.write(&mut out, b"data").unwrap();
        out
    }

    fn tcp_frame(src: [u8; 4], sp: u16, dst: [u8; 4], dp: u16, flags: &str) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4(src, dst, 64)
            .tcp(sp, dp, 1000, 8192);
        let builder = if flags.contains('S') { builder.syn() } else { builder };
        let builder = if flags.contains('A') { builder.ack(1) } else { builder };
        let builder = if flags.contains('F') { builder.fin() } else { builder };
        let builder = if flags.contains('R') { builder.rst() } else { builder };
        let mut out = Vec::with_capacity(builder.size(0));
        builder.write(&mut out, &[]).unwrap();
        out
    }

    fn test_config() -> Config {
        Config {
            pool_size: 64,
            batch_size: 8,
            ring_depth: 4,
            workers: 1,
            idle_timeout_ns: 0,
            active_timeout_ns: 0,
            ..Config::default()
        }
    }

    fn counters(record: &FlowRecord) -> FlowCounters {
        record
            .features
            .as_any()
            .downcast_ref::<FlowCounters>()
            .unwrap()
            .clone()
    }

    #[test]
    fn test_pipeline_udp_idle_timeout_and_eof() {
        let config = Config {
            idle_timeout_ns: 1_000_000_000,
            ..test_config()
        };
        let frames = vec![
            (udp_frame([1, 2, 3, 4], 1000, [5, 6, 7, 8], 53), 0),
            // A later packet on another flow drives the packet clock past
            // the first flow's idle deadline.
            (udp_frame([1, 2, 3, 4], 1001, [5, 6, 7, 8], 53), 2_000_000_000),
        ];
        let sink = Collect::default();
        let summary = Pipeline::new(config)
            .run(VecSource::new(frames), Box::new(sink.clone()))
            .unwrap();

        assert_eq!(summary.packets, 2);
        assert_eq!(summary.flows_created, 2);
        assert_eq!(summary.flows_exported, 2);
        assert_eq!(summary.export_failed, 0);

        let records = sink.records.lock();
        assert_eq!(records[0].reason, ExportReason::IdleTimeout);
        assert_eq!(records[0].start, 0);
        assert_eq!(records[0].end, 0);
        assert_eq!(records[0].key.src_port(), 1000);
        assert_eq!(records[1].reason, ExportReason::ForcedEnd);
    }

    #[test]
    fn test_pipeline_tcp_graceful_teardown() {
        let client = [1, 0, 0, 1];
        let server = [9, 0, 0, 1];
        let frames: Vec<(Vec<u8>, Timestamp)> = vec![
            (tcp_frame(client, 4000, server, 80, "S"), 0),
            (tcp_frame(server, 80, client, 4000, "SA"), 1),
            (tcp_frame(client, 4000, server, 80, "A"), 2),
            (tcp_frame(client, 4000, server, 80, "FA"), 3),
            (tcp_frame(server, 80, client, 4000, "A"), 4),
            (tcp_frame(server, 80, client, 4000, "FA"), 5),
            (tcp_frame(client, 4000, server, 80, "A"), 6),
        ];
        let sink = Collect::default();
        let summary = Pipeline::new(test_config())
            .run(VecSource::new(frames), Box::new(sink.clone()))
            .unwrap();

        assert_eq!(summary.flows_created, 1);
        assert_eq!(summary.flows_exported, 1);

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, ExportReason::End);
        assert_eq!(records[0].end, 6);
        let c = counters(&records[0]);
        assert_eq!(c.fwd_packets + c.bwd_packets, 7);
    }

    #[test]
    fn test_pipeline_direction_normalization() {
        let frames = vec![
            (udp_frame([9, 0, 0, 1], 1000, [1, 0, 0, 1], 2000), 0),
            (udp_frame([1, 0, 0, 1], 2000, [9, 0, 0, 1], 1000), 1000),
        ];
        let sink = Collect::default();
        let summary = Pipeline::new(test_config())
            .run(VecSource::new(frames), Box::new(sink.clone()))
            .unwrap();

        assert_eq!(summary.flows_created, 1);
        let records = sink.records.lock();
        assert_eq!(records[0].key.src_ip().to_string(), "1.0.0.1");
        assert_eq!(records[0].key.src_port(), 2000);
        assert_eq!(records[0].key.dst_port(), 1000);
        let c = counters(&records[0]);
        // First packet was reverse of the canonical direction.
        assert_eq!(c.bwd_packets, 1);
        assert_eq!(c.fwd_packets, 1);
    }

    #[test]
    fn test_pipeline_tiny_pool_loses_nothing() {
        let config = Config {
            pool_size: 16,
            batch_size: 4,
            ring_depth: 2,
            ..test_config()
        };
        let mut frames = Vec::new();
        for i in 0..200u64 {
            let frame = if i % 2 == 0 {
                udp_frame([1, 1, 1, 1], 10, [2, 2, 2, 2], 20)
            } else {
                udp_frame([3, 3, 3, 3], 30, [4, 4, 4, 4], 40)
            };
            frames.push((frame, i));
        }
        let sink = Collect::default();
        let summary = Pipeline::new(config)
            .run(VecSource::new(frames), Box::new(sink.clone()))
            .unwrap();

        assert_eq!(summary.packets, 200);
        assert_eq!(summary.flows_exported, 2);
        let records = sink.records.lock();
        let total: u64 = records
            .iter()
            .map(|r| {
                let c = counters(r);
                c.fwd_packets + c.bwd_packets
            })
            .sum();
        assert_eq!(total, 200);
    }

    #[test]
    fn test_pipeline_sharded_workers() {
        let config = Config {
            workers: 2,
            ..test_config()
        };
        let mut frames = Vec::new();
        for i in 0..50u16 {
            let frame = udp_frame([10, 0, 0, 1], 1000 + i, [10, 0, 0, 2], 53);
            frames.push((frame.clone(), i as u64));
            frames.push((frame, 1000 + i as u64));
        }
        let sink = Collect::default();
        let summary = Pipeline::new(config)
            .run(VecSource::new(frames), Box::new(sink.clone()))
            .unwrap();

        assert_eq!(summary.workers, 2);
        assert_eq!(summary.flows_created, 50);
        assert_eq!(summary.flows_exported, 50);
        let records = sink.records.lock();
        for record in records.iter() {
            let c = counters(record);
            assert_eq!(c.fwd_packets + c.bwd_packets, 2);
        }
    }

    #[test]
    fn test_pipeline_rejects_non_ip_frames() {
        let mut arp = vec![0u8; 14 + 28];
        arp[12] = 0x08;
        arp[13] = 0x06;
        let frames = vec![
            (arp, 0),
            (udp_frame([1, 2, 3, 4], 1, [5, 6, 7, 8], 2), 1),
        ];
        let sink = Collect::default();
        let summary = Pipeline::new(test_config())
            .run(VecSource::new(frames), Box::new(sink))
            .unwrap();

        assert_eq!(summary.packets, 2);
        assert_eq!(summary.decode_rejected, 1);
        assert_eq!(summary.flows_created, 1);
    }

    #[test]
    fn test_pipeline_custom_mode_requires_key_fn() {
        let config = Config {
            flow_key_mode: FlowKeyMode::Custom,
            ..test_config()
        };
        let result = Pipeline::new(config)
            .run(VecSource::new(Vec::new()), Box::new(Collect::default()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_pipeline_custom_key_fn_collapses_ports() {
        let config = Config {
            flow_key_mode: FlowKeyMode::Custom,
            ..test_config()
        };
        // Key on addresses only: both UDP flows collapse into one.
        let key_fn: KeyFn = Arc::new(|meta| {
            let mut portless = meta.clone();
            portless.src_port = 0;
            portless.dst_port = 0;
            five_tuple(&portless)
        });
        let frames = vec![
            (udp_frame([1, 2, 3, 4], 1000, [5, 6, 7, 8], 53), 0),
            (udp_frame([1, 2, 3, 4], 2000, [5, 6, 7, 8], 80), 1),
        ];
        let sink = Collect::default();
        let summary = Pipeline::new(config)
            .with_key_fn(key_fn)
            .run(VecSource::new(frames), Box::new(sink.clone()))
            .unwrap();

        assert_eq!(summary.flows_created, 1);
        let records = sink.records.lock();
        let key: &FlowKey = &records[0].key;
        assert_eq!(key.src_port(), 0);
        assert_eq!(key.dst_port(), 0);
    }
}
