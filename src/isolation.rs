//! Stream Isolation Policy
//!
//! Each traffic class that talks to the outside world gets its own SOCKS
//! sub-port on the Tor daemon, and each sub-port carries its own isolation
//! flags.
//!
//! ## Security Rationale
//!
//! Without isolation, an observer at the exit could correlate a wallet RPC
//! call with a page fetch because both rode the same circuit at the same
//! time. Separate sub-ports with distinct isolation flags force Tor to
//! build separate circuits per class.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transport::TrafficClass;

/// Tor `SocksPort` isolation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationFlag {
    /// Don't share circuits with streams to a different destination address
    IsolateDestAddr,
    /// Don't share circuits with streams to a different destination port
    IsolateDestPort,
    /// Don't share circuits with streams using a different client protocol
    IsolateClientProtocol,
    /// Don't share circuits with streams using different SOCKS credentials
    IsolateClientAuth,
}

impl fmt::Display for IsolationFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IsolationFlag::IsolateDestAddr => "IsolateDestAddr",
            IsolationFlag::IsolateDestPort => "IsolateDestPort",
            IsolationFlag::IsolateClientProtocol => "IsolateClientProtocol",
            IsolationFlag::IsolateClientAuth => "IsolateClientAuth",
        };
        f.write_str(s)
    }
}

/// A traffic-class SOCKS sub-port, expressed relative to the primary proxy port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationPort {
    pub class: TrafficClass,

    /// Added to the instance's proxy port
    pub offset: u16,

    pub flags: Vec<IsolationFlag>,
}

impl IsolationPort {
    /// Absolute port for an instance whose primary proxy port is `proxy_port`
    pub fn port_for(&self, proxy_port: u16) -> u16 {
        proxy_port.saturating_add(self.offset)
    }

    /// Render the `SocksPort` line for this sub-port
    pub fn torrc_line(&self, proxy_port: u16) -> String {
        let mut line = format!("SocksPort {}", self.port_for(proxy_port));
        for flag in &self.flags {
            line.push(' ');
            line.push_str(&flag.to_string());
        }
        line
    }
}

/// Isolation layout for a Tor instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationConfig {
    pub ports: Vec<IsolationPort>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        // Offsets start at 2: the control port conventionally sits at proxy + 1
        Self {
            ports: vec![
                IsolationPort {
                    class: TrafficClass::Web,
                    offset: 2,
                    flags: vec![IsolationFlag::IsolateDestAddr],
                },
                IsolationPort {
                    class: TrafficClass::Blockchain,
                    offset: 3,
                    flags: vec![
                        IsolationFlag::IsolateDestAddr,
                        IsolationFlag::IsolateDestPort,
                    ],
                },
                IsolationPort {
                    class: TrafficClass::Api,
                    offset: 4,
                    flags: vec![
                        IsolationFlag::IsolateClientProtocol,
                        IsolationFlag::IsolateClientAuth,
                    ],
                },
            ],
        }
    }
}

impl IsolationConfig {
    /// No sub-ports: every class shares the primary proxy port
    pub fn disabled() -> Self {
        Self { ports: Vec::new() }
    }

    /// SOCKS port a class should use on an instance with primary `proxy_port`
    ///
    /// Classes without a dedicated sub-port use the primary port.
    pub fn port_for(&self, class: TrafficClass, proxy_port: u16) -> u16 {
        self.ports
            .iter()
            .find(|p| p.class == class)
            .map(|p| p.port_for(proxy_port))
            .unwrap_or(proxy_port)
    }

    /// `SocksPort` lines for every sub-port
    pub fn torrc_lines(&self, proxy_port: u16) -> Vec<String> {
        self.ports.iter().map(|p| p.torrc_line(proxy_port)).collect()
    }
}
