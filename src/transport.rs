//! Transports, traffic classes and per-class routing strategies
//!
//! Every outbound call belongs to a traffic class. Each class carries an
//! immutable [`ConnectionStrategy`] naming the transport it prefers and the
//! one it may fall back to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How an outbound call reaches its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// Through a Tor SOCKS port
    AnonymityNetwork,
    /// Straight from this host
    Direct,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::AnonymityNetwork => "anonymity-network",
            Transport::Direct => "direct",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Logical category of outbound traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficClass {
    Web,
    Api,
    Blockchain,
    Admin,
    Monitoring,
}

impl TrafficClass {
    /// All classes, in table order
    pub const ALL: [TrafficClass; 5] = [
        TrafficClass::Web,
        TrafficClass::Api,
        TrafficClass::Blockchain,
        TrafficClass::Admin,
        TrafficClass::Monitoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficClass::Web => "web",
            TrafficClass::Api => "api",
            TrafficClass::Blockchain => "blockchain",
            TrafficClass::Admin => "admin",
            TrafficClass::Monitoring => "monitoring",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Immutable routing policy for one traffic class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStrategy {
    /// The class this policy applies to
    pub class: TrafficClass,

    /// Preferred transport
    pub primary: Transport,

    /// Transport used when the primary fails (`None` forbids fallback)
    pub fallback: Option<Transport>,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Connection-level retries for requests made through built clients
    pub retry_count: u32,

    /// How often this class should be re-checked, in seconds
    pub health_check_interval_secs: u64,

    /// Return to the anonymity network automatically once it recovers
    pub auto_recovery: bool,
}

impl ConnectionStrategy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Whether this class may ever be routed directly
    pub fn allows_direct(&self) -> bool {
        self.primary == Transport::Direct || self.fallback == Some(Transport::Direct)
    }

    /// Whether `transport` is one of the transports this policy names
    pub fn permits(&self, transport: Transport) -> bool {
        self.primary == transport || self.fallback == Some(transport)
    }

    /// The built-in strategy table
    pub fn default_table() -> Vec<ConnectionStrategy> {
        vec![
            ConnectionStrategy {
                class: TrafficClass::Web,
                primary: Transport::AnonymityNetwork,
                fallback: Some(Transport::Direct),
                timeout_secs: 30,
                retry_count: 3,
                health_check_interval_secs: 60,
                auto_recovery: true,
            },
            ConnectionStrategy {
                class: TrafficClass::Api,
                primary: Transport::AnonymityNetwork,
                fallback: Some(Transport::Direct),
                timeout_secs: 15,
                retry_count: 3,
                health_check_interval_secs: 30,
                auto_recovery: true,
            },
            ConnectionStrategy {
                class: TrafficClass::Blockchain,
                primary: Transport::AnonymityNetwork,
                fallback: Some(Transport::Direct),
                timeout_secs: 45,
                retry_count: 5,
                health_check_interval_secs: 120,
                auto_recovery: true,
            },
            // Admin traffic must never leave the anonymity network
            ConnectionStrategy {
                class: TrafficClass::Admin,
                primary: Transport::AnonymityNetwork,
                fallback: None,
                timeout_secs: 10,
                retry_count: 2,
                health_check_interval_secs: 30,
                auto_recovery: false,
            },
            ConnectionStrategy {
                class: TrafficClass::Monitoring,
                primary: Transport::Direct,
                fallback: Some(Transport::AnonymityNetwork),
                timeout_secs: 5,
                retry_count: 1,
                health_check_interval_secs: 30,
                auto_recovery: false,
            },
        ]
    }
}
