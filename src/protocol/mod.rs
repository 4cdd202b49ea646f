//! Tor control protocol
//!
//! This module implements the client side of the control-port protocol:
//! - Reply parsing (mid, data and end lines)
//! - Session handling with password or cookie authentication
//! - `GETINFO` and `SIGNAL` commands

pub mod control;
pub mod reply;

pub use control::{ControlAuth, ControlSession};
pub use reply::{count_circuits, LineKind, Reply, ReplyLine};

/// Signal asking Tor to switch to clean circuits
pub const SIGNAL_NEWNYM: &str = "NEWNYM";

/// `GETINFO` key listing every open circuit
pub const INFO_CIRCUIT_STATUS: &str = "circuit-status";

/// `GETINFO` keys for cumulative traffic counters
pub const INFO_TRAFFIC_READ: &str = "traffic/read";
pub const INFO_TRAFFIC_WRITTEN: &str = "traffic/written";
