//! Exporter interface
//!
//! The flow table hands finalized flows to the exporter stage over a
//! bounded channel; the stage runs on its own thread and feeds whatever
//! sink implements `Exporter`. A record the sink refuses is logged and
//! dropped, never retried.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::flow::FlowRecord;

/// Sink for finalized flow records
pub trait Exporter: Send {
    /// Accept one record. An error drops the record and is counted, but
    /// does not stop the pipeline.
    fn export(&mut self, record: FlowRecord) -> anyhow::Result<()>;

    /// Called once after the last record, when the pipeline shuts down.
    fn finish(&mut self) {}
}

/// Exporter that logs each record at debug level; useful as a default
/// sink and in development.
#[derive(Debug, Default)]
pub struct LogExporter;

impl Exporter for LogExporter {
    fn export(&mut self, record: FlowRecord) -> anyhow::Result<()> {
        debug!(
            flow_id = record.id,
            key = %record.key,
            start = record.start,
            end = record.end,
            reason = %record.reason,
            "flow exported"
        );
        Ok(())
    }
}

/// Exporter stage loop: drain the record channel until every sender is
/// gone, then let the sink flush.
pub(crate) fn run_exporter(
    records: Receiver<FlowRecord>,
    mut exporter: Box<dyn Exporter>,
    failed: &AtomicU64,
) {
    while let Ok(record) = records.recv() {
        let flow_id = record.id;
        if let Err(err) = exporter.export(record) {
            failed.fetch_add(1, Ordering::Relaxed);
            warn!(flow_id, error = %err, "exporter rejected flow record");
        }
    }
    exporter.finish();
}
