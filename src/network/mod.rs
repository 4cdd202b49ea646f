//! Outbound network layer
//!
//! Provides the raw reachability probes and the HTTP clients handed out
//! per traffic class, either direct or through a Tor SOCKS port.

mod client;
mod probe;

pub use client::{ClientOptions, OutboundClient};
pub use probe::{probe_http, probe_tcp, resolve};

/// Request statistics for one outbound client
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NetworkStats {
    /// Requests attempted, retries included
    pub requests_attempted: u64,

    /// Requests that produced a response
    pub requests_successful: u64,

    /// Requests that failed at the connection level
    pub requests_failed: u64,

    /// Retries issued after a connection-level failure
    pub retries: u64,

    /// Rotation requests raised by this client
    pub rotations_requested: u64,
}

impl NetworkStats {
    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.requests_attempted == 0 {
            return 0.0;
        }
        (self.requests_successful as f64 / self.requests_attempted as f64) * 100.0
    }

    /// Get failure rate as percentage
    pub fn failure_rate(&self) -> f64 {
        if self.requests_attempted == 0 {
            return 0.0;
        }
        (self.requests_failed as f64 / self.requests_attempted as f64) * 100.0
    }
}
