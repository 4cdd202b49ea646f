//! Multi-instance redundancy
//!
//! Supervises a fixed roster of Tor daemons:
//! - Concurrent health probing every cycle (settle-all, never fail-fast)
//! - Primary election by priority among active instances
//! - Standby promotion when the cluster runs short
//! - Onion address clusters per hidden service
//!
//! Election happens before anything else reacts: when a new primary is
//! chosen, the circuit manager is rebound to its ports, then the failover
//! manager's transports are re-asserted by a direct call. Deciding and
//! applying a primary change is serialized by one election lock.
//!
//! The manager also undoes what it caused: a circuit left disconnected
//! while the primary passes its probes is reconnected, and a cluster
//! shortfall emergency is lifted once enough instances are active again.

mod hidden_service;
mod instance;
pub mod torrc;

pub use hidden_service::HiddenServiceCluster;
pub use instance::{AnonymityInstance, InstanceStatus};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;

use crate::circuit_manager::{CircuitManager, ConnectionState};
use crate::clock::now_ms;
use crate::config::RedundancyConfig;
use crate::error::{HaError, Result};
use crate::events::{ClusterHealthSnapshot, EventBus, HaEvent, HealthEvent};
use crate::failover::FailoverManager;
use crate::isolation::IsolationConfig;
use crate::network::{probe_tcp, resolve};
use crate::scheduler::{Scheduler, TickGuard};

/// Probing seam for roster instances
#[async_trait]
pub trait InstanceProber: Send + Sync {
    /// Raw TCP reachability of both the proxy and the control port
    async fn probe_ports(&self, instance: &AnonymityInstance) -> Result<()>;

    /// One full request through the instance's proxy
    async fn end_to_end(&self, instance: &AnonymityInstance) -> Result<()>;

    /// Published onion address of one of the instance's hidden services
    async fn onion_address(&self, instance: &AnonymityInstance, service: &str) -> Option<String>;
}

/// Probes over real sockets, end-to-end through the circuit manager
pub struct TcpInstanceProber {
    circuit: Arc<CircuitManager>,
    timeout: Duration,
}

impl TcpInstanceProber {
    pub fn new(circuit: Arc<CircuitManager>, timeout: Duration) -> Self {
        Self { circuit, timeout }
    }

    async fn probe_port(&self, port: u16) -> Result<()> {
        let addr = resolve(self.circuit.proxy_host(), port).await?;
        probe_tcp(addr, self.timeout).await.map(|_| ())
    }
}

#[async_trait]
impl InstanceProber for TcpInstanceProber {
    async fn probe_ports(&self, instance: &AnonymityInstance) -> Result<()> {
        let (proxy, control) = tokio::join!(
            self.probe_port(instance.proxy_port),
            self.probe_port(instance.control_port)
        );
        proxy.and(control)
    }

    async fn end_to_end(&self, instance: &AnonymityInstance) -> Result<()> {
        self.circuit
            .test_connectivity(instance.proxy_port)
            .await
            .map(|_| ())
    }

    async fn onion_address(&self, instance: &AnonymityInstance, service: &str) -> Option<String> {
        let path = Path::new(&instance.data_dir).join(service).join("hostname");
        let contents = tokio::fs::read_to_string(&path).await.ok()?;
        let address = contents.trim();
        (!address.is_empty()).then(|| address.to_string())
    }
}

struct Cluster {
    instances: Vec<AnonymityInstance>,
    primary: Option<String>,
    services: BTreeMap<String, HiddenServiceCluster>,
}

impl Cluster {
    fn find(&self, id: &str) -> Option<&AnonymityInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut AnonymityInstance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    fn active_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_active()).count()
    }

    /// Lowest priority number among active instances, roster order on ties
    fn best_active(&self) -> Option<&AnonymityInstance> {
        self.instances
            .iter()
            .filter(|i| i.is_active())
            .min_by_key(|i| i.priority)
    }

    fn snapshot(&self, cycle_duration_ms: u64) -> ClusterHealthSnapshot {
        let count = |status| self.instances.iter().filter(|i| i.status == status).count();
        ClusterHealthSnapshot {
            total_instances: self.instances.len(),
            active: count(InstanceStatus::Active),
            failed: count(InstanceStatus::Failed),
            standby: count(InstanceStatus::Standby),
            unknown: count(InstanceStatus::Unknown),
            primary: self.primary.clone(),
            cycle_duration_ms,
            timestamp: now_ms(),
        }
    }
}

/// Supervises the instance roster and elects the primary
pub struct RedundancyManager {
    config: RedundancyConfig,
    isolation: IsolationConfig,
    failover: Arc<FailoverManager>,
    circuit: Arc<CircuitManager>,
    prober: Arc<dyn InstanceProber>,
    bus: EventBus,
    cluster: Mutex<Cluster>,
    cycle_guard: TickGuard,
    election: tokio::sync::Mutex<()>,
    shortfall_emergency: AtomicBool,
    wake: Arc<Notify>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl RedundancyManager {
    pub fn new(
        config: RedundancyConfig,
        isolation: IsolationConfig,
        failover: Arc<FailoverManager>,
        circuit: Arc<CircuitManager>,
        bus: EventBus,
    ) -> Self {
        let prober = Arc::new(TcpInstanceProber::new(
            Arc::clone(&circuit),
            config.port_probe_timeout(),
        ));
        Self::with_prober(config, isolation, failover, circuit, bus, prober)
    }

    /// Build with a custom instance prober
    pub fn with_prober(
        config: RedundancyConfig,
        isolation: IsolationConfig,
        failover: Arc<FailoverManager>,
        circuit: Arc<CircuitManager>,
        bus: EventBus,
        prober: Arc<dyn InstanceProber>,
    ) -> Self {
        let instances = config
            .instances
            .iter()
            .map(AnonymityInstance::from_config)
            .collect();
        let services = config
            .services
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    HiddenServiceCluster::new(&s.name, s.load_balancing),
                )
            })
            .collect();

        Self {
            config,
            isolation,
            failover,
            circuit,
            prober,
            bus,
            cluster: Mutex::new(Cluster {
                instances,
                primary: None,
                services,
            }),
            cycle_guard: TickGuard::new(),
            election: tokio::sync::Mutex::new(()),
            shortfall_emergency: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
            scheduler: Mutex::new(None),
        }
    }

    /// Write instance configs, run the first cycle (which elects the
    /// initial primary) and start supervision
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        log::info!(
            "🔄 Initializing redundancy with {} instances ({} required healthy)",
            self.config.instances.len(),
            self.config.min_healthy_instances
        );

        if self.config.write_instance_configs {
            self.write_instance_configs().await;
        }

        self.run_health_cycle().await;

        let scheduler = Scheduler::new();

        let weak = Arc::downgrade(self);
        scheduler.spawn_periodic(
            "redundancy-health",
            self.config.health_check_interval(),
            Some(Arc::clone(&self.wake)),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.run_health_cycle().await;
                    }
                }
            },
        );

        let mut health = self.bus.subscribe_health();
        let essential = self.config.essential_services.clone();
        let wake = Arc::clone(&self.wake);
        scheduler.spawn("redundancy-events", move |cancel| async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = health.recv() => event,
                };
                match event {
                    Ok(HealthEvent::ServiceFailed { service }) if essential.contains(&service) => {
                        log::warn!("⚠️ Essential service {} failed, re-checking instances", service);
                        wake.notify_one();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Health listener lagged, {} events dropped", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let previous = self.scheduler.lock().replace(scheduler);
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        match self.primary() {
            Some(primary) => log::info!(
                "✅ Redundancy manager running, primary {} on port {}",
                primary.id,
                primary.proxy_port
            ),
            None => log::warn!("⚠️ Redundancy manager running without an active primary"),
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        log::info!("Redundancy manager stopped");
    }

    async fn write_instance_configs(&self) {
        let template = match &self.config.config_template {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("⚠️ Cannot read torrc template {}: {}, using built-in", path, e);
                    torrc::DEFAULT_TEMPLATE.to_string()
                }
            },
            None => torrc::DEFAULT_TEMPLATE.to_string(),
        };

        for instance in &self.config.instances {
            let contents =
                torrc::render(&template, instance, &self.config.services, &self.isolation);
            let path = Path::new(&instance.config_path);

            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    log::warn!("⚠️ Cannot create {}: {}", parent.display(), e);
                    continue;
                }
            }
            match tokio::fs::write(path, contents).await {
                Ok(()) => log::debug!("Wrote torrc for {} to {}", instance.id, path.display()),
                Err(e) => log::warn!("⚠️ Cannot write torrc for {}: {}", instance.id, e),
            }
        }
    }

    // ===== Health cycle =====

    /// One supervision cycle
    ///
    /// Returns `None` when a previous cycle is still running.
    pub async fn run_health_cycle(&self) -> Option<ClusterHealthSnapshot> {
        let Some(_permit) = self.cycle_guard.try_enter() else {
            log::debug!("Redundancy cycle already running, skipping");
            return None;
        };
        let started = Instant::now();

        let (targets, primary) = {
            let cluster = self.cluster.lock();
            let targets: Vec<AnonymityInstance> = cluster
                .instances
                .iter()
                .filter(|i| i.status != InstanceStatus::Standby)
                .cloned()
                .collect();
            (targets, cluster.primary.clone())
        };

        let probes = targets.iter().map(|instance| {
            let is_primary = primary.as_deref() == Some(instance.id.as_str());
            async move {
                let mut result = self.prober.probe_ports(instance).await;
                if result.is_ok() && is_primary {
                    result = self.prober.end_to_end(instance).await;
                }
                (instance.id.clone(), result)
            }
        });
        let results = join_all(probes).await;

        let now = now_ms();
        let threshold = self.config.failure_threshold;
        let mut newly_failed = Vec::new();
        {
            let mut cluster = self.cluster.lock();
            for (id, result) in &results {
                let Some(instance) = cluster.find_mut(id) else {
                    continue;
                };
                if let Err(e) = result {
                    log::debug!("Instance {} probe failed: {}", id, e);
                }
                if instance.record_probe(result.is_ok(), threshold, now) {
                    newly_failed.push(id.clone());
                }
            }
        }

        for id in newly_failed {
            log::error!("❌ Instance {} failed after {} consecutive errors", id, threshold);
            self.bus.emit(HaEvent::InstanceFailed { instance_id: id });
        }

        let shortfall = self.ensure_minimum_healthy().await;
        match &shortfall {
            Err(HaError::InsufficientHealthyInstances { active, required }) => {
                log::error!(
                    "🚨 Insufficient healthy instances: {} active, {} required",
                    active,
                    required
                );
                self.shortfall_emergency.store(true, Ordering::SeqCst);
                self.bus.emit(HaEvent::InsufficientHealthyInstances {
                    active: *active,
                    required: *required,
                });
            }
            Err(e) => log::warn!("⚠️ Standby promotion failed: {}", e),
            Ok(()) => {}
        }

        self.elect_primary().await;
        self.heal_circuit().await;

        if shortfall.is_ok() && self.shortfall_emergency.swap(false, Ordering::SeqCst) {
            self.lift_emergency();
        }
        self.refresh_clusters().await;

        let snapshot = self
            .cluster
            .lock()
            .snapshot(started.elapsed().as_millis() as u64);
        log::debug!(
            "Redundancy cycle: {}/{} active, primary {:?}",
            snapshot.active,
            snapshot.total_instances,
            snapshot.primary
        );
        self.bus.emit(HaEvent::HealthCheckCompleted(snapshot.clone()));
        Some(snapshot)
    }

    /// Promote standbys when short
    ///
    /// Fails with `InsufficientHealthyInstances` when promotion could not
    /// close the gap.
    async fn ensure_minimum_healthy(&self) -> Result<()> {
        let required = self.config.min_healthy_instances;
        let (active, standbys) = {
            let cluster = self.cluster.lock();
            let standbys: Vec<AnonymityInstance> = cluster
                .instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Standby)
                .cloned()
                .collect();
            (cluster.active_count(), standbys)
        };

        if active >= required {
            return Ok(());
        }

        log::warn!(
            "⚠️ Only {} active instances ({} required), promoting standbys",
            active,
            required
        );

        for standby in standbys {
            match self.prober.probe_ports(&standby).await {
                Ok(()) => {
                    if let Some(instance) = self.cluster.lock().find_mut(&standby.id) {
                        instance.promote(now_ms());
                    }
                    log::info!("✅ Promoted standby instance {}", standby.id);
                    self.bus.emit(HaEvent::InstancePromoted {
                        instance_id: standby.id,
                    });
                }
                Err(e) => log::warn!("⚠️ Cannot promote {}: {}", standby.id, e),
            }
        }

        let active = self.cluster.lock().active_count();
        if active < required {
            return Err(HaError::InsufficientHealthyInstances { active, required });
        }
        Ok(())
    }

    /// Reconnect the circuit manager when the primary passes its probes
    /// but the circuit is still marked disconnected
    async fn heal_circuit(&self) {
        if !self.circuit.is_initialized() || self.circuit.state() != ConnectionState::Disconnected
        {
            return;
        }
        let _election = self.election.lock().await;
        let Some(primary) = self.primary().filter(AnonymityInstance::is_active) else {
            return;
        };

        if self.circuit.proxy_port() != primary.proxy_port
            || self.circuit.control_port() != primary.control_port
        {
            if let Err(e) = self.circuit.rebind(primary.proxy_port, primary.control_port).await {
                log::warn!("⚠️ Circuit manager still cannot reach primary {}: {}", primary.id, e);
            }
            return;
        }

        log::info!("🔄 Primary {} is healthy, reconnecting circuit manager", primary.id);
        if let Err(e) = self.circuit.reconnect().await {
            log::warn!("⚠️ Circuit manager still cannot reach primary {}: {}", primary.id, e);
        }
    }

    /// Undo a shortfall emergency once the cluster is back at strength
    fn lift_emergency(&self) {
        let active = self.active_count();
        if self.circuit.state() == ConnectionState::Disconnected {
            // Recovery follows the circuit's own reconnect
            log::info!("Cluster back to {} active instances, waiting for Tor circuit", active);
            return;
        }
        log::info!("✅ Cluster back to {} active instances, lifting emergency", active);
        self.failover
            .recover_to_anonymity(&format!("cluster back to {} active instances", active));
    }

    /// Elect a primary if there is none or the current one failed
    async fn elect_primary(&self) {
        let _election = self.election.lock().await;
        let change = {
            let mut cluster = self.cluster.lock();
            let current = cluster.primary.clone();
            let needs_election = match current.as_deref().and_then(|id| cluster.find(id)) {
                None => true,
                Some(instance) => instance.status == InstanceStatus::Failed,
            };
            if !needs_election {
                return;
            }

            match cluster.best_active().cloned() {
                Some(next) => {
                    cluster.primary = Some(next.id.clone());
                    Some((current, next))
                }
                None => {
                    if let Some(current) = &current {
                        log::error!("🚨 Primary {} failed and no active instance can take over", current);
                    }
                    None
                }
            }
        };

        if let Some((old, next)) = change {
            self.apply_primary_change(old, next, "elected").await;
        }
    }

    async fn apply_primary_change(
        &self,
        old: Option<String>,
        next: AnonymityInstance,
        how: &str,
    ) {
        log::info!(
            "👑 Primary instance {} -> {} ({}, port {})",
            old.as_deref().unwrap_or("none"),
            next.id,
            how,
            next.proxy_port
        );

        if let Err(e) = self.circuit.rebind(next.proxy_port, next.control_port).await {
            log::warn!("⚠️ Circuit manager could not reach new primary {}: {}", next.id, e);
        }

        if old.is_some() {
            self.failover
                .reassert_anonymity_all(&format!("primary instance now {}", next.id));
        }

        self.bus.emit(HaEvent::PrimaryInstanceChanged {
            old,
            new: next.id,
            proxy_port: next.proxy_port,
        });
    }

    /// Manual primary override; the target must be active
    pub async fn force_switch_primary(&self, instance_id: &str) -> Result<()> {
        let _election = self.election.lock().await;
        let change = {
            let mut cluster = self.cluster.lock();
            let target = cluster
                .find(instance_id)
                .cloned()
                .ok_or_else(|| HaError::UnknownInstance(instance_id.to_string()))?;

            if !target.is_active() {
                return Err(HaError::InstanceNotActive {
                    id: target.id,
                    status: target.status.to_string(),
                });
            }
            if cluster.primary.as_deref() == Some(instance_id) {
                None
            } else {
                let old = cluster.primary.replace(target.id.clone());
                Some((old, target))
            }
        };

        if let Some((old, target)) = change {
            self.apply_primary_change(old, target, "manual").await;
        }
        Ok(())
    }

    async fn refresh_clusters(&self) {
        let (mut active, names) = {
            let cluster = self.cluster.lock();
            let active: Vec<AnonymityInstance> = cluster
                .instances
                .iter()
                .filter(|i| i.is_active())
                .cloned()
                .collect();
            (active, cluster.services.keys().cloned().collect::<Vec<_>>())
        };
        active.sort_by_key(|i| i.priority);

        let mut refreshed = Vec::with_capacity(names.len());
        for name in names {
            let mut addresses = Vec::new();
            for instance in active.iter().filter(|i| i.hosts(&name)) {
                if let Some(address) = self.prober.onion_address(instance, &name).await {
                    addresses.push(address);
                }
            }
            refreshed.push((name, addresses));
        }

        let now = now_ms();
        let mut changes = Vec::new();
        {
            let mut cluster = self.cluster.lock();
            for (name, addresses) in refreshed {
                if let Some(service) = cluster.services.get_mut(&name) {
                    if let Some((from, to)) = service.refresh(addresses, now) {
                        changes.push((name, from, to));
                    }
                }
            }
        }

        for (service, from, to) in changes {
            log::warn!(
                "🔄 Hidden service {} moved {} -> {}",
                service,
                from.as_deref().unwrap_or("none"),
                to.as_deref().unwrap_or("none")
            );
            self.bus
                .emit(HaEvent::HiddenServiceFailover { service, from, to });
        }
    }

    // ===== Queries =====

    /// Onion address to hand out for a service
    pub fn get_best_address(&self, service: &str) -> Result<Option<String>> {
        self.cluster
            .lock()
            .services
            .get(service)
            .map(HiddenServiceCluster::best_address)
            .ok_or_else(|| HaError::UnknownService(service.to_string()))
    }

    pub fn instances(&self) -> Vec<AnonymityInstance> {
        self.cluster.lock().instances.clone()
    }

    pub fn instance(&self, id: &str) -> Option<AnonymityInstance> {
        self.cluster.lock().find(id).cloned()
    }

    pub fn primary(&self) -> Option<AnonymityInstance> {
        let cluster = self.cluster.lock();
        cluster
            .primary
            .as_deref()
            .and_then(|id| cluster.find(id))
            .cloned()
    }

    pub fn active_count(&self) -> usize {
        self.cluster.lock().active_count()
    }

    pub fn clusters(&self) -> Vec<HiddenServiceCluster> {
        self.cluster.lock().services.values().cloned().collect()
    }

    pub fn snapshot(&self) -> ClusterHealthSnapshot {
        self.cluster.lock().snapshot(0)
    }
}
