//! Core shared types for packet processing
//!
//! Value types used by every pipeline stage:
//! - `PacketMeta`: decoded layer summary attached to a packet buffer
//! - `FlowKey`: direction-normalized 5-tuple used as the flow table index
//! - `IpProtocol` / `TcpFlags`: transport layer primitives

pub mod key;
pub mod packet;

pub use key::{five_tuple, FlowKey, FLOW_KEY_V4_LEN, FLOW_KEY_V6_LEN};
pub use packet::{IpProtocol, PacketMeta, TcpFlags, Timestamp};
