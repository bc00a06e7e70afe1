//! Flow lifecycle engine
//!
//! Per-flow state machines, the flow table that owns them, and the packet
//! time driven timer engine behind idle/active expiry.
//!
//! A flow is created on the first packet of a canonical key and lives until
//! one of the export reasons fires: an idle or active timeout, a completed
//! TCP teardown, or end of input. Exported flows leave the table as
//! `FlowRecord`s carrying their accumulated feature state.

pub mod flow;
pub mod table;
pub mod timer;

pub use flow::{
    ExportReason, Flow, FlowCounters, FlowFeatures, FlowRecord, FlowState,
};
pub use table::{FlowTable, TableStats};
pub use timer::{register_timer, registered_timers, TimerID, TIMER_ACTIVE, TIMER_IDLE};

use std::sync::Arc;

/// Factory producing the opaque feature state attached to each new flow
pub type FeatureFactory = Arc<dyn Fn() -> Box<dyn FlowFeatures> + Send + Sync>;

/// Feature factory for the built-in per-direction counters
pub fn default_features() -> FeatureFactory {
    Arc::new(|| -> Box<dyn FlowFeatures> { Box::<FlowCounters>::default() })
}
