//! Per-flow state machine
//!
//! Tracks one bidirectional flow from first packet to export. Every flow
//! runs on timeouts; TCP flows additionally watch the teardown handshake
//! (FIN/ACK in both directions, or RST) and export the moment it
//! completes. Feature accumulation is delegated to an opaque
//! `FlowFeatures` implementation chosen at table construction.

use std::any::Any;

use serde::Serialize;

use crate::core::{FlowKey, PacketMeta, Timestamp};

use super::timer::{Timers, TIMER_ACTIVE, TIMER_IDLE};

/// Lifecycle state of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Accepting packet events
    Active,
    /// Export decided, record not yet emitted
    Exporting,
    /// Removed from the table
    Terminated,
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowState::Active => write!(f, "ACTIVE"),
            FlowState::Exporting => write!(f, "EXPORTING"),
            FlowState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Why a flow was exported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExportReason {
    #[serde(rename = "idle-timeout")]
    IdleTimeout,
    #[serde(rename = "active-timeout")]
    ActiveTimeout,
    /// TCP teardown completed or connection reset
    #[serde(rename = "tcp-end")]
    End,
    /// Pipeline shut down with the flow still open
    #[serde(rename = "forced-end-of-input")]
    ForcedEnd,
}

impl std::fmt::Display for ExportReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportReason::IdleTimeout => write!(f, "idle-timeout"),
            ExportReason::ActiveTimeout => write!(f, "active-timeout"),
            ExportReason::End => write!(f, "tcp-end"),
            ExportReason::ForcedEnd => write!(f, "forced-end-of-input"),
        }
    }
}

/// Per-flow feature accumulation, opaque to the engine
pub trait FlowFeatures: Send + std::fmt::Debug {
    /// Called once per packet, after the flow's bookkeeping is updated
    fn on_packet(&mut self, meta: &PacketMeta, forward: bool, when: Timestamp, wire_len: u32);

    /// Downcast support for exporters that know the concrete type
    fn as_any(&self) -> &dyn Any;
}

/// Built-in feature set: per-direction packet/byte counts and TCP flag
/// totals
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowCounters {
    pub fwd_packets: u64,
    pub fwd_bytes: u64,
    pub bwd_packets: u64,
    pub bwd_bytes: u64,
    pub syn_count: u32,
    pub fin_count: u32,
    pub rst_count: u32,
    pub ack_count: u32,
}

impl FlowFeatures for FlowCounters {
    fn on_packet(&mut self, meta: &PacketMeta, forward: bool, _when: Timestamp, wire_len: u32) {
        if forward {
            self.fwd_packets += 1;
            self.fwd_bytes += wire_len as u64;
        } else {
            self.bwd_packets += 1;
            self.bwd_bytes += wire_len as u64;
        }
        if let Some(flags) = meta.tcp_flags {
            if flags.syn {
                self.syn_count += 1;
            }
            if flags.fin {
                self.fin_count += 1;
            }
            if flags.rst {
                self.rst_count += 1;
            }
            if flags.ack {
                self.ack_count += 1;
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Finalized flow handed to the exporter
#[derive(Debug)]
pub struct FlowRecord {
    pub id: u64,
    pub key: FlowKey,
    pub start: Timestamp,
    pub end: Timestamp,
    pub reason: ExportReason,
    pub features: Box<dyn FlowFeatures>,
}

/// TCP teardown bookkeeping: which sides have sent a FIN and had it
/// acknowledged
#[derive(Debug, Clone, Copy, Default)]
struct TcpTeardown {
    src_fin: bool,
    dst_fin: bool,
    src_ack: bool,
    dst_ack: bool,
}

impl TcpTeardown {
    fn complete(&self) -> bool {
        self.src_fin && self.src_ack && self.dst_fin && self.dst_ack
    }
}

/// One bidirectional flow
#[derive(Debug)]
pub struct Flow {
    id: u64,
    key: FlowKey,
    state: FlowState,
    start: Timestamp,
    last: Timestamp,
    idle_timeout: u64,
    active_timeout: u64,
    timers: Timers,
    tcp: Option<TcpTeardown>,
    features: Box<dyn FlowFeatures>,
    pending: Option<ExportReason>,
}

impl Flow {
    /// Create a flow for its first packet. TCP flows get teardown
    /// tracking; everything else exports on timeouts alone.
    pub(crate) fn new(
        id: u64,
        key: FlowKey,
        is_tcp: bool,
        when: Timestamp,
        idle_timeout: u64,
        active_timeout: u64,
        features: Box<dyn FlowFeatures>,
    ) -> Self {
        let mut flow = Self {
            id,
            key,
            state: FlowState::Active,
            start: when,
            last: when,
            idle_timeout,
            active_timeout,
            timers: Timers::new(),
            tcp: is_tcp.then(TcpTeardown::default),
            features,
            pending: None,
        };
        if active_timeout > 0 {
            flow.timers
                .add(TIMER_ACTIVE, Flow::on_active_timeout, when + active_timeout);
        }
        flow
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn last_seen(&self) -> Timestamp {
        self.last
    }

    pub fn features(&self) -> &dyn FlowFeatures {
        self.features.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state == FlowState::Active
    }

    /// Whether the timer with `id` is currently scheduled
    pub fn has_timer(&self, id: super::timer::TimerID) -> bool {
        self.timers.has(id)
    }

    /// Apply one packet event. Exporting and terminated flows ignore
    /// further events.
    pub(crate) fn event(
        &mut self,
        meta: &PacketMeta,
        forward: bool,
        when: Timestamp,
        wire_len: u32,
    ) {
        if !self.is_active() {
            return;
        }
        self.last = when;
        if self.idle_timeout > 0 {
            self.timers
                .add(TIMER_IDLE, Flow::on_idle_timeout, when + self.idle_timeout);
        }
        self.features.on_packet(meta, forward, when, wire_len);

        if let Some(mut tcp) = self.tcp {
            let Some(flags) = meta.tcp_flags else {
                return;
            };
            if flags.rst {
                self.export(ExportReason::End, when);
                return;
            }
            if forward {
                if flags.fin {
                    tcp.src_fin = true;
                }
                if tcp.dst_fin && flags.ack {
                    tcp.dst_ack = true;
                }
            } else {
                if flags.fin {
                    tcp.dst_fin = true;
                }
                if tcp.src_fin && flags.ack {
                    tcp.src_ack = true;
                }
            }
            self.tcp = Some(tcp);
            if tcp.complete() {
                self.export(ExportReason::End, when);
            }
        }
    }

    /// Mark the flow for export. Idempotent: only the first reason wins.
    pub(crate) fn export(&mut self, reason: ExportReason, _now: Timestamp) {
        if self.state != FlowState::Active {
            return;
        }
        self.state = FlowState::Exporting;
        self.pending = Some(reason);
    }

    /// Whether an export decision is waiting to be emitted
    pub(crate) fn needs_export(&self) -> bool {
        self.pending.is_some()
    }

    /// Fire every timer scheduled at or before `now`, in ascending
    /// `TimerID` order, clearing each before its callback runs. Returns
    /// the earliest remaining expiry, or zero when none is pending.
    pub(crate) fn expire(&mut self, now: Timestamp) -> Timestamp {
        let mut next: Timestamp = 0;
        let mut i = 0;
        while i < self.timers.len() {
            let entry = self.timers.get(i);
            if entry.when != 0 {
                if entry.when <= now {
                    self.timers.clear(i);
                    if let Some(callback) = entry.callback {
                        callback(self, now);
                    }
                } else if next == 0 || entry.when <= next {
                    next = entry.when;
                }
            }
            i += 1;
        }
        next
    }

    /// Earliest pending timer expiry, zero when none
    pub(crate) fn next_timer(&self) -> Timestamp {
        self.timers.next()
    }

    /// Consume the flow into its export record.
    pub(crate) fn into_record(mut self) -> FlowRecord {
        self.state = FlowState::Terminated;
        let reason = self.pending.take().unwrap_or(ExportReason::ForcedEnd);
        FlowRecord {
            id: self.id,
            key: self.key,
            start: self.start,
            end: self.last,
            reason,
            features: self.features,
        }
    }

    fn on_idle_timeout(flow: &mut Flow, now: Timestamp) {
        flow.export(ExportReason::IdleTimeout, now);
    }

    fn on_active_timeout(flow: &mut Flow, now: Timestamp) {
        flow.export(ExportReason::ActiveTimeout, now);
    }
}
