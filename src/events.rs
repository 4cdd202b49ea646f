//! Event plumbing between the managers and the outside world
//!
//! Two broadcast channels:
//! - [`HealthEvent`]: reported *into* the system by an external health or
//!   alert collaborator
//! - [`HaEvent`]: emitted *by* the managers for collaborators (alerting,
//!   logging, dashboards) and for each other
//!
//! Publishing with no subscribers drops the event silently.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::transport::{TrafficClass, Transport};

/// Channel depth per event kind
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Severity carried by an external alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// Events reported by the external health collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthEvent {
    ServiceFailed { service: String },
    ServiceRecovered { service: String },
    CriticalAlert { level: AlertLevel, service: String },
    DaemonDisconnected,
    DaemonConnected,
}

/// Snapshot published after every redundancy health-check cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealthSnapshot {
    pub total_instances: usize,
    pub active: usize,
    pub failed: usize,
    pub standby: usize,
    pub unknown: usize,
    pub primary: Option<String>,
    pub cycle_duration_ms: u64,
    pub timestamp: u64,
}

/// Events emitted by the circuit, failover and redundancy managers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaEvent {
    // ===== Circuit manager =====
    CircuitConnected,
    CircuitRotated {
        timestamp: u64,
    },
    HealthCheckFailed {
        error: String,
    },

    // ===== Failover manager =====
    Failover {
        class: TrafficClass,
        from: Transport,
        to: Transport,
        reason: String,
    },
    FailoverFailed {
        class: TrafficClass,
        primary_error: String,
        fallback_error: String,
    },
    AutomaticFailover {
        class: TrafficClass,
        reason: String,
    },
    AutomaticRecovery {
        class: TrafficClass,
        reason: String,
    },
    EmergencyFailover {
        reason: String,
        timestamp: u64,
    },
    ManualOverride {
        class: TrafficClass,
        transport: Transport,
    },

    // ===== Redundancy manager =====
    InstanceFailed {
        instance_id: String,
    },
    InstancePromoted {
        instance_id: String,
    },
    PrimaryInstanceChanged {
        old: Option<String>,
        new: String,
        proxy_port: u16,
    },
    InsufficientHealthyInstances {
        active: usize,
        required: usize,
    },
    HiddenServiceFailover {
        service: String,
        from: Option<String>,
        to: Option<String>,
    },
    HealthCheckCompleted(ClusterHealthSnapshot),
}

impl HaEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            HaEvent::CircuitConnected => "circuit_connected",
            HaEvent::CircuitRotated { .. } => "circuit_rotated",
            HaEvent::HealthCheckFailed { .. } => "health_check_failed",
            HaEvent::Failover { .. } => "failover",
            HaEvent::FailoverFailed { .. } => "failover_failed",
            HaEvent::AutomaticFailover { .. } => "automatic_failover",
            HaEvent::AutomaticRecovery { .. } => "automatic_recovery",
            HaEvent::EmergencyFailover { .. } => "emergency_failover",
            HaEvent::ManualOverride { .. } => "manual_override",
            HaEvent::InstanceFailed { .. } => "instance_failed",
            HaEvent::InstancePromoted { .. } => "instance_promoted",
            HaEvent::PrimaryInstanceChanged { .. } => "primary_instance_changed",
            HaEvent::InsufficientHealthyInstances { .. } => "insufficient_healthy_instances",
            HaEvent::HiddenServiceFailover { .. } => "hidden_service_failover",
            HaEvent::HealthCheckCompleted(_) => "health_check_completed",
        }
    }
}

/// Shared handle to both event channels. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    health: broadcast::Sender<HealthEvent>,
    events: broadcast::Sender<HaEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (health, _) = broadcast::channel(capacity);
        let (events, _) = broadcast::channel(capacity);
        Self { health, events }
    }

    /// Report an external health event into the system
    pub fn report(&self, event: HealthEvent) {
        log::debug!("Health event: {:?}", event);
        let _ = self.health.send(event);
    }

    /// Emit a manager event
    pub fn emit(&self, event: HaEvent) {
        log::debug!("Event: {}", event.kind());
        let _ = self.events.send(event);
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.health.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HaEvent> {
        self.events.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
