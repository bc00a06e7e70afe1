//! flowmeter: packet-to-flow metering engine
//!
//! Ingests captured packets and produces per-flow records suitable for
//! export. Packets are grouped by a direction-normalized 5-tuple; each
//! flow accumulates features and is exported when it ends: idle timeout,
//! active timeout, TCP teardown, or end of input. All timeouts run on the
//! packet clock, so replaying a capture reproduces identical output.

pub mod buffer;
pub mod config;
pub mod core;
pub mod decode;
pub mod error;
pub mod export;
pub mod filter;
pub mod flow;
pub mod pipeline;

pub use crate::config::{Config, FlowKeyMode};
pub use crate::core::{FlowKey, IpProtocol, PacketMeta, TcpFlags, Timestamp};
pub use crate::decode::{Captured, KeyFn, LinkType, PacketSource};
pub use crate::error::{Error, Result};
pub use crate::export::{Exporter, LogExporter};
pub use crate::filter::{Filters, PacketFilter};
pub use crate::flow::{
    default_features, ExportReason, FeatureFactory, FlowCounters, FlowFeatures, FlowRecord,
};
pub use crate::pipeline::{Pipeline, PipelineSummary};
