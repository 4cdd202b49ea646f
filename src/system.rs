//! Composition root
//!
//! Builds the circuit, failover and redundancy managers once, wires the
//! event router between them and owns their lifecycle.
//!
//! Event routing:
//!
//! ```text
//! HealthEvent (external)          ─▶ FailoverManager::handle_health_event
//! HealthCheckFailed (circuit)     ─▶ treated as DaemonDisconnected
//! CircuitConnected  (circuit)     ─▶ treated as DaemonConnected
//! InsufficientHealthyInstances    ─▶ FailoverManager::emergency_failover
//! ```
//!
//! The way back runs through the redundancy cycle: it reconnects the
//! circuit manager (whose `CircuitConnected` then recovers routing) and
//! lifts a shortfall emergency by a direct call once the cluster is back
//! at strength.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::circuit_manager::{CircuitManager, CircuitStatus};
use crate::config::HaConfig;
use crate::error::Result;
use crate::events::{ClusterHealthSnapshot, EventBus, HaEvent, HealthEvent};
use crate::failover::{ConnectivityProbe, FailoverManager, FailoverStats, HttpConnectivityProbe};
use crate::redundancy::{InstanceProber, RedundancyManager, TcpInstanceProber};
use crate::scheduler::Scheduler;

/// Combined view of all three managers
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub circuit: CircuitStatus,
    pub failover: FailoverStats,
    pub cluster: ClusterHealthSnapshot,
}

/// The assembled HA connectivity layer
pub struct HaSystem {
    bus: EventBus,
    circuit: Arc<CircuitManager>,
    failover: Arc<FailoverManager>,
    redundancy: Arc<RedundancyManager>,
    router: Scheduler,
}

impl HaSystem {
    /// Build with production probes
    pub fn new(config: HaConfig) -> Result<Self> {
        let bus = EventBus::new();
        let circuit = Arc::new(CircuitManager::new(config.circuit.clone(), bus.clone()));
        let prober = Arc::new(TcpInstanceProber::new(
            Arc::clone(&circuit),
            config.redundancy.port_probe_timeout(),
        ));
        Self::assemble(config, bus, circuit, Arc::new(HttpConnectivityProbe), prober)
    }

    /// Build with custom probing seams
    pub fn with_probes(
        config: HaConfig,
        connectivity: Arc<dyn ConnectivityProbe>,
        prober: Arc<dyn InstanceProber>,
    ) -> Result<Self> {
        let bus = EventBus::new();
        let circuit = Arc::new(CircuitManager::new(config.circuit.clone(), bus.clone()));
        Self::assemble(config, bus, circuit, connectivity, prober)
    }

    fn assemble(
        config: HaConfig,
        bus: EventBus,
        circuit: Arc<CircuitManager>,
        connectivity: Arc<dyn ConnectivityProbe>,
        prober: Arc<dyn InstanceProber>,
    ) -> Result<Self> {
        config.validate()?;

        let failover = Arc::new(FailoverManager::with_probe(
            config.failover.clone(),
            Arc::clone(&circuit),
            bus.clone(),
            connectivity,
        ));
        let redundancy = Arc::new(RedundancyManager::with_prober(
            config.redundancy.clone(),
            config.circuit.isolation.clone(),
            Arc::clone(&failover),
            Arc::clone(&circuit),
            bus.clone(),
            prober,
        ));

        Ok(Self {
            bus,
            circuit,
            failover,
            redundancy,
            router: Scheduler::new(),
        })
    }

    /// Wire events, connect to Tor and start every periodic task
    ///
    /// An unreachable proxy at startup is not fatal: classes that may go
    /// direct are diverted and the redundancy cycle looks for another
    /// instance.
    pub async fn start(&self) -> Result<()> {
        log::info!("🔄 Starting HA connectivity layer...");

        self.start_router();

        if let Err(e) = self.circuit.initialize().await {
            log::warn!("⚠️ Tor proxy not reachable at startup: {}", e);
            self.failover
                .divert_from_anonymity("Tor proxy unreachable at startup");
        }

        self.failover.start();
        self.redundancy.initialize().await?;

        log::info!("✅ HA connectivity layer running");
        Ok(())
    }

    fn start_router(&self) {
        // Subscribe before anything starts so no early event is missed
        let mut health = self.bus.subscribe_health();
        let mut events = self.bus.subscribe();
        let failover = Arc::clone(&self.failover);

        self.router.spawn("event-router", move |cancel| async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = health.recv() => match event {
                        Ok(event) => failover.handle_health_event(&event),
                        Err(e) => if !keep_listening("health", e) { break },
                    },
                    event = events.recv() => match event {
                        Ok(event) => route(&failover, &event),
                        Err(e) => if !keep_listening("manager", e) { break },
                    },
                }
            }
        });
    }

    /// Stop every task; in-flight probes finish on their own deadlines
    pub async fn shutdown(&self) {
        log::info!("Shutting down HA connectivity layer...");
        self.redundancy.shutdown().await;
        self.failover.shutdown().await;
        self.circuit.shutdown().await;
        self.router.shutdown().await;
        log::info!("✅ HA connectivity layer stopped");
    }

    /// Report an event from the external health collaborator
    pub fn report(&self, event: HealthEvent) {
        self.bus.report(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HaEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn circuit(&self) -> &Arc<CircuitManager> {
        &self.circuit
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    pub fn redundancy(&self) -> &Arc<RedundancyManager> {
        &self.redundancy
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            circuit: self.circuit.status(),
            failover: self.failover.stats(),
            cluster: self.redundancy.snapshot(),
        }
    }
}

fn route(failover: &FailoverManager, event: &HaEvent) {
    match event {
        HaEvent::HealthCheckFailed { .. } => {
            failover.handle_health_event(&HealthEvent::DaemonDisconnected)
        }
        HaEvent::CircuitConnected => failover.handle_health_event(&HealthEvent::DaemonConnected),
        HaEvent::InsufficientHealthyInstances { active, required } => failover
            .emergency_failover(&format!(
                "{} active instances, {} required",
                active, required
            )),
        _ => {}
    }
}

fn keep_listening(channel: &str, error: RecvError) -> bool {
    match error {
        RecvError::Lagged(missed) => {
            log::warn!("Event router lagged on {} events, {} dropped", channel, missed);
            true
        }
        RecvError::Closed => false,
    }
}
