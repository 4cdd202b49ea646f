//! # tor-ha
//!
//! High-availability Tor connectivity for services that must keep sensitive
//! traffic on the anonymity network without halting when Tor misbehaves.
//!
//! ## Architecture
//!
//! ```text
//! RedundancyManager   roster of Tor daemons, health cycle, primary election
//!   ↓ (direct calls)
//! FailoverManager     per-traffic-class transport choice and failover
//!   ↓
//! CircuitManager      one daemon: proxy probe, control port, rotation
//!   ↓
//! Tor SOCKS / control ports
//! ```
//!
//! ## Features
//!
//! - **Per-class routing**: web, api, blockchain, admin and monitoring
//!   traffic each carry their own primary and fallback transport
//! - **Never-direct classes**: a class without a fallback stays anonymous
//!   through probe failures, emergencies and manual overrides
//! - **Stream isolation**: distinct SOCKS sub-ports per class
//! - **Redundant daemons**: concurrent health probing, standby promotion
//!   and priority-based primary election
//!
//! ## Quick start
//!
//! ```no_run
//! use tor_ha::{HaConfig, HaSystem, TrafficClass};
//!
//! # async fn run() -> tor_ha::Result<()> {
//! let mut config = HaConfig::default();
//! config.apply_env();
//!
//! let system = HaSystem::new(config)?;
//! system.start().await?;
//!
//! let client = system
//!     .failover()
//!     .acquire_client(TrafficClass::Web, Some("https://check.torproject.org/api/ip"))
//!     .await?;
//! let _response = client.get("https://example.org/").await?;
//!
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Modules
pub mod circuit_manager;
pub mod clock;
pub mod config;
mod error;
pub mod events;
pub mod failover;
pub mod fingerprint;
pub mod isolation;
pub mod network;
pub mod protocol;
pub mod redundancy;
pub mod ring;
pub mod scheduler;
pub mod system;
pub mod transport;

pub use circuit_manager::{CircuitManager, CircuitStatus, ConnectionState, RecordedError, Telemetry};
pub use config::{
    CircuitConfig, FailoverConfig, HaConfig, HiddenServiceConfig, InstanceConfig,
    RedundancyConfig, ENV_CONTROL_PASSWORD, ENV_TOR_ENABLED,
};
pub use error::{ErrorCode, HaError, Result};
pub use events::{AlertLevel, ClusterHealthSnapshot, EventBus, HaEvent, HealthEvent};
pub use failover::{
    ConnectionAttempt, ConnectivityProbe, FailoverManager, FailoverStats,
    HttpConnectivityProbe, TransportStats,
};
pub use isolation::{IsolationConfig, IsolationFlag, IsolationPort};
pub use network::{ClientOptions, NetworkStats, OutboundClient};
pub use redundancy::{
    AnonymityInstance, HiddenServiceCluster, InstanceProber, InstanceStatus,
    RedundancyManager, TcpInstanceProber,
};
pub use system::{HaSystem, SystemStatus};
pub use transport::{ConnectionStrategy, TrafficClass, Transport};
