//! Per-traffic-class failover
//!
//! Each traffic class runs on the transport its strategy prefers until a
//! probe fails, then moves to its fallback. Recovery back to the anonymity
//! network happens on health events, for classes with auto-recovery.
//!
//! ## Security Rationale
//!
//! A class whose strategy has no fallback (admin) can never be routed
//! directly. Every path that writes the active transport map (probe
//! failure, health events, emergency, manual override, re-election) checks
//! the strategy before writing, and all writes go through one lock.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::circuit_manager::CircuitManager;
use crate::clock::{now_ms, MonotonicStamp};
use crate::config::FailoverConfig;
use crate::error::{HaError, Result};
use crate::events::{AlertLevel, EventBus, HaEvent, HealthEvent};
use crate::network::OutboundClient;
use crate::ring::BoundedRing;
use crate::scheduler::{Scheduler, TickGuard};
use crate::transport::{ConnectionStrategy, TrafficClass, Transport};

/// Reachability check made through a built client
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Latency on success; any failure means the transport is unusable
    async fn probe(
        &self,
        client: &OutboundClient,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Duration>;
}

/// Bounded GET, any status below 500 counts
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnectivityProbe;

#[async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn probe(
        &self,
        client: &OutboundClient,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Duration> {
        client.probe(endpoint, timeout).await
    }
}

/// One recorded probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionAttempt {
    pub timestamp: u64,
    pub class: TrafficClass,
    pub transport: Transport,
    pub success: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub endpoint: String,
}

/// Aggregates for one transport
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
}

impl TransportStats {
    fn from_attempts<'a>(attempts: impl Iterator<Item = &'a ConnectionAttempt>) -> Self {
        let mut stats = TransportStats::default();
        let mut total_time = 0u64;

        for attempt in attempts {
            stats.attempts += 1;
            total_time += attempt.response_time_ms;
            if attempt.success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
        }

        stats.success_rate = success_rate(stats.successes, stats.attempts);
        if stats.attempts > 0 {
            stats.avg_response_time_ms = total_time as f64 / stats.attempts as f64;
        }
        stats
    }
}

/// `100` with no attempts, otherwise successful/total as a percentage
fn success_rate(successes: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    successes as f64 / total as f64 * 100.0
}

/// Read-only snapshot of failover state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverStats {
    pub overall: TransportStats,
    pub anonymity_network: TransportStats,
    pub direct: TransportStats,
    pub failover_count: u64,
    pub recovery_count: u64,
    pub last_failover: Option<u64>,
    pub active: BTreeMap<TrafficClass, Transport>,
}

struct Routing {
    active: HashMap<TrafficClass, Transport>,
    failover_count: u64,
    recovery_count: u64,
    last_failover: Option<u64>,
}

struct History {
    attempts: BoundedRing<ConnectionAttempt>,
    stamps: HashMap<TrafficClass, MonotonicStamp>,
    overall: TransportStats,
    anonymity_network: TransportStats,
    direct: TransportStats,
}

impl History {
    fn recompute(&mut self) {
        self.overall = TransportStats::from_attempts(self.attempts.iter());
        self.anonymity_network = TransportStats::from_attempts(
            self.attempts
                .iter()
                .filter(|a| a.transport == Transport::AnonymityNetwork),
        );
        self.direct = TransportStats::from_attempts(
            self.attempts
                .iter()
                .filter(|a| a.transport == Transport::Direct),
        );
    }
}

/// Chooses the transport for each traffic class
pub struct FailoverManager {
    config: FailoverConfig,
    strategies: HashMap<TrafficClass, ConnectionStrategy>,
    circuit: Arc<CircuitManager>,
    probe: Arc<dyn ConnectivityProbe>,
    bus: EventBus,
    routing: Mutex<Routing>,
    history: Mutex<History>,
    self_check_guard: TickGuard,
    last_checked: Mutex<HashMap<TrafficClass, Instant>>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl FailoverManager {
    pub fn new(config: FailoverConfig, circuit: Arc<CircuitManager>, bus: EventBus) -> Self {
        Self::with_probe(config, circuit, bus, Arc::new(HttpConnectivityProbe))
    }

    /// Build with a custom connectivity probe
    pub fn with_probe(
        config: FailoverConfig,
        circuit: Arc<CircuitManager>,
        bus: EventBus,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        // Configured strategies override the built-in table class by class
        let mut strategies: HashMap<TrafficClass, ConnectionStrategy> =
            ConnectionStrategy::default_table()
                .into_iter()
                .map(|s| (s.class, s))
                .collect();
        for strategy in &config.strategies {
            strategies.insert(strategy.class, strategy.clone());
        }

        let active = strategies
            .values()
            .map(|s| (s.class, s.primary))
            .collect();

        let history = History {
            attempts: BoundedRing::new(config.attempt_history),
            stamps: HashMap::new(),
            overall: TransportStats::default(),
            anonymity_network: TransportStats::default(),
            direct: TransportStats::default(),
        };

        Self {
            config,
            strategies,
            circuit,
            probe,
            bus,
            routing: Mutex::new(Routing {
                active,
                failover_count: 0,
                recovery_count: 0,
                last_failover: None,
            }),
            history: Mutex::new(history),
            self_check_guard: TickGuard::new(),
            last_checked: Mutex::new(HashMap::new()),
            scheduler: Mutex::new(None),
        }
    }

    /// Start the periodic self-check
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.scheduler.lock();
        if slot.is_some() {
            log::debug!("Failover self-check already running");
            return;
        }

        let scheduler = Scheduler::new();
        let weak = Arc::downgrade(self);

        scheduler.spawn_periodic(
            "failover-self-check",
            self.config.self_check_interval(),
            None,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.self_check().await;
                    }
                }
            },
        );

        *slot = Some(scheduler);
        log::info!(
            "✅ Failover manager started (self-check every {:?})",
            self.config.self_check_interval()
        );
    }

    pub async fn shutdown(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        log::info!("Failover manager stopped");
    }

    // ===== Lookups =====

    pub fn strategy(&self, class: TrafficClass) -> Option<&ConnectionStrategy> {
        self.strategies.get(&class)
    }

    fn strategy_for(&self, class: TrafficClass) -> Result<&ConnectionStrategy> {
        self.strategies
            .get(&class)
            .ok_or_else(|| HaError::Config(format!("no strategy for {}", class)))
    }

    /// Transport currently serving a class
    pub fn active_transport(&self, class: TrafficClass) -> Transport {
        let routing = self.routing.lock();
        self.current(&routing, class)
    }

    /// Full active transport map
    pub fn active_map(&self) -> BTreeMap<TrafficClass, Transport> {
        let routing = self.routing.lock();
        TrafficClass::ALL
            .iter()
            .map(|&class| (class, self.current(&routing, class)))
            .collect()
    }

    fn current(&self, routing: &Routing, class: TrafficClass) -> Transport {
        routing
            .active
            .get(&class)
            .copied()
            .or_else(|| self.strategies.get(&class).map(|s| s.primary))
            .unwrap_or(Transport::AnonymityNetwork)
    }

    fn check_endpoint(&self, transport: Transport) -> &str {
        match transport {
            Transport::AnonymityNetwork => &self.config.anonymity_check_endpoint,
            Transport::Direct => &self.config.direct_check_endpoint,
        }
    }

    fn is_anonymity_service(&self, service: &str) -> bool {
        self.config
            .anonymity_services
            .iter()
            .any(|s| s.eq_ignore_ascii_case(service))
    }

    // ===== Client acquisition =====

    /// Client for a class on its active transport
    ///
    /// With a probe endpoint, the client is probed first and a failure runs
    /// the failover procedure. A client that cannot even be built counts as
    /// a failed probe.
    pub async fn acquire_client(
        &self,
        class: TrafficClass,
        probe_endpoint: Option<&str>,
    ) -> Result<OutboundClient> {
        let strategy = self.strategy_for(class)?;
        let transport = self.active_transport(class);

        let client = match self.circuit.build_client_for(transport, strategy) {
            Ok(client) => client,
            Err(e) => {
                log::warn!("⚠️ Cannot build {} client for {}: {}", transport, class, e);
                return self
                    .fail_over(class, transport, e.to_string(), probe_endpoint)
                    .await;
            }
        };

        let Some(endpoint) = probe_endpoint else {
            return Ok(client);
        };

        match self
            .probe_and_record(class, &client, endpoint, self.config.probe_timeout())
            .await
        {
            Ok(_) => Ok(client),
            Err(e) => {
                log::warn!("⚠️ {} probe via {} failed: {}", class, transport, e);
                self.fail_over(class, transport, e.to_string(), Some(endpoint))
                    .await
            }
        }
    }

    /// Move a class off `failed` onto the other transport it permits
    ///
    /// Normally that is the fallback. A class already on its fallback when
    /// the fallback fails goes back to its primary; the failed transport is
    /// never probed a second time. Landing on the transport the class is
    /// already using only re-confirms the assignment: no count, no event.
    async fn fail_over(
        &self,
        class: TrafficClass,
        failed: Transport,
        reason: String,
        probe_endpoint: Option<&str>,
    ) -> Result<OutboundClient> {
        let strategy = self.strategy_for(class)?;

        let Some(fallback) = strategy.fallback else {
            log::warn!("⚠️ {} has no fallback transport, staying on {}", class, failed);
            return Err(HaError::NoFallbackAvailable { class });
        };
        let target = if failed == fallback {
            strategy.primary
        } else {
            fallback
        };

        let endpoint = probe_endpoint.unwrap_or_else(|| self.check_endpoint(target));

        let outcome = match self.circuit.build_client_for(target, strategy) {
            Ok(client) => self
                .probe_and_record(class, &client, endpoint, self.config.probe_timeout())
                .await
                .map(|_| client),
            Err(e) => Err(e),
        };

        let client = match outcome {
            Ok(client) => client,
            Err(e) => {
                log::error!(
                    "❌ All transports failed for {}: {} via {} / {} via {}",
                    class,
                    reason,
                    failed,
                    e,
                    target
                );
                self.bus.emit(HaEvent::FailoverFailed {
                    class,
                    primary_error: reason.clone(),
                    fallback_error: e.to_string(),
                });
                return Err(HaError::AllTransportsFailed {
                    class,
                    primary_error: reason,
                    fallback_error: e.to_string(),
                });
            }
        };

        let previous = {
            let mut routing = self.routing.lock();
            let previous = self.current(&routing, class);
            routing.active.insert(class, target);
            if previous != target {
                routing.failover_count += 1;
                routing.last_failover = Some(now_ms());
            }
            previous
        };

        if previous != target {
            log::warn!("🔄 Failover: {} {} -> {} ({})", class, previous, target, reason);
            self.bus.emit(HaEvent::Failover {
                class,
                from: previous,
                to: target,
                reason,
            });
        } else {
            log::debug!("{} already on {}", class, target);
        }

        Ok(client)
    }

    async fn probe_and_record(
        &self,
        class: TrafficClass,
        client: &OutboundClient,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Duration> {
        let started = std::time::Instant::now();
        let result = self.probe.probe(client, endpoint, timeout).await;

        let response_time_ms = match &result {
            Ok(latency) => latency.as_millis() as u64,
            Err(_) => started.elapsed().as_millis() as u64,
        };

        self.record_attempt(
            class,
            client.transport(),
            endpoint,
            response_time_ms,
            result.as_ref().err().map(|e| e.to_string()),
        );
        result
    }

    fn record_attempt(
        &self,
        class: TrafficClass,
        transport: Transport,
        endpoint: &str,
        response_time_ms: u64,
        error: Option<String>,
    ) {
        let mut history = self.history.lock();
        let timestamp = history.stamps.entry(class).or_default().next();

        history.attempts.push(ConnectionAttempt {
            timestamp,
            class,
            transport,
            success: error.is_none(),
            response_time_ms,
            error,
            endpoint: endpoint.to_string(),
        });
        history.recompute();
    }

    // ===== Event reactions =====

    /// React to an event from the external health collaborator
    pub fn handle_health_event(&self, event: &HealthEvent) {
        match event {
            HealthEvent::ServiceFailed { service } if self.is_anonymity_service(service) => {
                self.divert_from_anonymity(&format!("service {} failed", service));
            }
            HealthEvent::ServiceRecovered { service } if self.is_anonymity_service(service) => {
                self.recover_to_anonymity(&format!("service {} recovered", service));
            }
            HealthEvent::CriticalAlert {
                level: AlertLevel::Critical,
                service,
            } => {
                self.emergency_failover(&format!("critical alert from {}", service));
            }
            HealthEvent::DaemonDisconnected => {
                self.divert_from_anonymity("Tor daemon disconnected");
            }
            HealthEvent::DaemonConnected => {
                self.recover_to_anonymity("Tor daemon connected");
            }
            other => log::debug!("Ignoring health event {:?}", other),
        }
    }

    /// Move every class that can fall back to direct off the anonymity network
    pub fn divert_from_anonymity(&self, reason: &str) {
        let moved: Vec<TrafficClass> = {
            let mut routing = self.routing.lock();
            let mut moved = Vec::new();
            for class in TrafficClass::ALL {
                let Some(strategy) = self.strategies.get(&class) else {
                    continue;
                };
                if strategy.fallback != Some(Transport::Direct) {
                    continue;
                }
                if self.current(&routing, class) == Transport::AnonymityNetwork {
                    routing.active.insert(class, Transport::Direct);
                    moved.push(class);
                }
            }
            if !moved.is_empty() {
                routing.failover_count += moved.len() as u64;
                routing.last_failover = Some(now_ms());
            }
            moved
        };

        for class in moved {
            log::warn!("🔄 Automatic failover: {} -> direct ({})", class, reason);
            self.bus.emit(HaEvent::AutomaticFailover {
                class,
                reason: reason.to_string(),
            });
        }
    }

    /// Return auto-recovering classes to the anonymity network
    pub fn recover_to_anonymity(&self, reason: &str) {
        let recovered: Vec<TrafficClass> = {
            let mut routing = self.routing.lock();
            let mut recovered = Vec::new();
            for class in TrafficClass::ALL {
                let Some(strategy) = self.strategies.get(&class) else {
                    continue;
                };
                if !strategy.auto_recovery || strategy.primary != Transport::AnonymityNetwork {
                    continue;
                }
                if self.current(&routing, class) != Transport::AnonymityNetwork {
                    routing.active.insert(class, Transport::AnonymityNetwork);
                    recovered.push(class);
                }
            }
            routing.recovery_count += recovered.len() as u64;
            recovered
        };

        for class in recovered {
            log::info!("✅ Automatic recovery: {} -> anonymity-network ({})", class, reason);
            self.bus.emit(HaEvent::AutomaticRecovery {
                class,
                reason: reason.to_string(),
            });
        }
    }

    /// Route everything that may go direct, direct
    pub fn emergency_failover(&self, reason: &str) {
        let timestamp = now_ms();
        {
            let mut routing = self.routing.lock();
            for class in TrafficClass::ALL {
                let allowed = self
                    .strategies
                    .get(&class)
                    .map(ConnectionStrategy::allows_direct)
                    .unwrap_or(false);
                if allowed {
                    routing.active.insert(class, Transport::Direct);
                }
            }
            routing.last_failover = Some(timestamp);
        }

        log::error!("🚨 Emergency failover: all permitted classes now direct ({})", reason);
        self.bus.emit(HaEvent::EmergencyFailover {
            reason: reason.to_string(),
            timestamp,
        });
    }

    /// Put every class that permits it back on the anonymity network
    ///
    /// Called by the redundancy manager right after electing a new primary.
    pub fn reassert_anonymity_all(&self, reason: &str) {
        let mut routing = self.routing.lock();
        for class in TrafficClass::ALL {
            let permitted = self
                .strategies
                .get(&class)
                .map(|s| s.permits(Transport::AnonymityNetwork))
                .unwrap_or(false);
            if permitted {
                routing.active.insert(class, Transport::AnonymityNetwork);
            }
        }
        log::info!("🔄 All classes re-asserted on anonymity-network ({})", reason);
    }

    /// Manual override
    pub fn force_transport(&self, class: TrafficClass, transport: Transport) -> Result<()> {
        let strategy = self.strategy_for(class)?;
        if !strategy.permits(transport) {
            log::warn!("⚠️ Refusing to force {} onto {}", class, transport);
            return Err(HaError::FallbackProhibited {
                class,
                requested: transport,
            });
        }

        self.routing.lock().active.insert(class, transport);

        log::info!("Manual override: {} -> {}", class, transport);
        self.bus.emit(HaEvent::ManualOverride { class, transport });
        Ok(())
    }

    // ===== Self-check =====

    /// Re-probe the active transport of every class that is due, failing
    /// over where needed
    ///
    /// A class is due once its strategy's health-check interval has passed
    /// since it was last checked, give or take half a self-check tick.
    pub async fn self_check(&self) {
        let Some(_permit) = self.self_check_guard.try_enter() else {
            log::debug!("Failover self-check already running, skipping");
            return;
        };

        let due = self.due_classes(Instant::now());
        if due.is_empty() {
            return;
        }
        log::debug!("Self-check for {:?}", due);

        let checks = due.into_iter().map(|class| self.check_class(class));
        join_all(checks).await;
    }

    fn due_classes(&self, now: Instant) -> Vec<TrafficClass> {
        let slack = self.config.self_check_interval() / 2;
        let mut last_checked = self.last_checked.lock();
        let mut due = Vec::new();

        for class in TrafficClass::ALL {
            let Some(strategy) = self.strategies.get(&class) else {
                continue;
            };
            let is_due = match last_checked.get(&class) {
                Some(at) => now.duration_since(*at) + slack >= strategy.health_check_interval(),
                None => true,
            };
            if is_due {
                last_checked.insert(class, now);
                due.push(class);
            }
        }
        due
    }

    async fn check_class(&self, class: TrafficClass) {
        let Some(strategy) = self.strategies.get(&class) else {
            return;
        };
        let transport = self.active_transport(class);
        let endpoint = self.check_endpoint(transport);

        let probed = match self.circuit.build_client_for(transport, strategy) {
            Ok(client) => self
                .probe_and_record(class, &client, endpoint, self.config.probe_timeout())
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };

        let Err(e) = probed else {
            return;
        };

        log::warn!("⚠️ Self-check: {} via {} failed: {}", class, transport, e);
        if let Err(e) = self.fail_over(class, transport, e.to_string(), None).await {
            log::warn!("⚠️ Self-check could not fail over {}: {}", class, e);
        }
    }

    // ===== Stats =====

    pub fn stats(&self) -> FailoverStats {
        let (overall, anonymity_network, direct) = {
            let history = self.history.lock();
            (
                history.overall.clone(),
                history.anonymity_network.clone(),
                history.direct.clone(),
            )
        };
        let routing = self.routing.lock();

        FailoverStats {
            overall,
            anonymity_network,
            direct,
            failover_count: routing.failover_count,
            recovery_count: routing.recovery_count,
            last_failover: routing.last_failover,
            active: TrafficClass::ALL
                .iter()
                .map(|&class| (class, self.current(&routing, class)))
                .collect(),
        }
    }

    /// The last `n` recorded attempts, oldest first
    pub fn recent_attempts(&self, n: usize) -> Vec<ConnectionAttempt> {
        self.history.lock().attempts.last_n(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;

    /// Fails every probe on the listed transports
    struct FailingOn(Vec<Transport>);

    #[async_trait]
    impl ConnectivityProbe for FailingOn {
        async fn probe(
            &self,
            client: &OutboundClient,
            endpoint: &str,
            _timeout: Duration,
        ) -> Result<Duration> {
            if self.0.contains(&client.transport()) {
                Err(HaError::Http(format!("{} unreachable", endpoint)))
            } else {
                Ok(Duration::from_millis(20))
            }
        }
    }

    fn manager(failing: Vec<Transport>) -> (FailoverManager, EventBus) {
        let bus = EventBus::new();
        let circuit = Arc::new(CircuitManager::new(CircuitConfig::default(), bus.clone()));
        let manager = FailoverManager::with_probe(
            FailoverConfig::default(),
            circuit,
            bus.clone(),
            Arc::new(FailingOn(failing)),
        );
        (manager, bus)
    }

    fn assert_admin_never_direct(manager: &FailoverManager) {
        assert_eq!(
            manager.active_transport(TrafficClass::Admin),
            Transport::AnonymityNetwork
        );
    }

    #[test]
    fn test_initial_map_uses_primaries() {
        let (manager, _) = manager(vec![]);
        let map = manager.active_map();
        assert_eq!(map[&TrafficClass::Web], Transport::AnonymityNetwork);
        assert_eq!(map[&TrafficClass::Monitoring], Transport::Direct);
    }

    #[test]
    fn test_success_rate_defaults_to_100() {
        let (manager, _) = manager(vec![]);
        let stats = manager.stats();
        assert_eq!(stats.overall.success_rate, 100.0);
        assert_eq!(stats.anonymity_network.attempts, 0);
    }

    #[tokio::test]
    async fn test_probe_failure_fails_over_web() {
        let (manager, bus) = manager(vec![Transport::AnonymityNetwork]);
        let mut rx = bus.subscribe();

        let client = manager
            .acquire_client(TrafficClass::Web, Some("https://example.org/"))
            .await
            .unwrap();

        assert_eq!(client.transport(), Transport::Direct);
        assert_eq!(manager.active_transport(TrafficClass::Web), Transport::Direct);
        assert_eq!(manager.stats().failover_count, 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            HaEvent::Failover {
                class: TrafficClass::Web,
                from: Transport::AnonymityNetwork,
                to: Transport::Direct,
                reason: "HTTP error: https://example.org/ unreachable".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_admin_has_no_fallback() {
        let (manager, _) = manager(vec![Transport::AnonymityNetwork]);

        let err = manager
            .acquire_client(TrafficClass::Admin, Some("https://example.org/"))
            .await
            .unwrap_err();
        assert!(matches!(err, HaError::NoFallbackAvailable { .. }));
        assert_admin_never_direct(&manager);
    }

    #[tokio::test]
    async fn test_all_transports_failed() {
        let (manager, bus) = manager(vec![Transport::AnonymityNetwork, Transport::Direct]);
        let mut rx = bus.subscribe();

        let err = manager
            .acquire_client(TrafficClass::Api, Some("https://example.org/"))
            .await
            .unwrap_err();
        assert!(matches!(err, HaError::AllTransportsFailed { .. }));
        assert_eq!(
            manager.active_transport(TrafficClass::Api),
            Transport::AnonymityNetwork
        );
        assert!(matches!(rx.try_recv().unwrap(), HaEvent::FailoverFailed { .. }));
    }

    #[tokio::test]
    async fn test_failover_is_idempotent_on_fallback() {
        let (manager, bus) = manager(vec![Transport::AnonymityNetwork]);
        manager
            .acquire_client(TrafficClass::Web, Some("https://example.org/"))
            .await
            .unwrap();

        // A late report about the anonymity network while already direct
        let mut rx = bus.subscribe();
        manager
            .fail_over(TrafficClass::Web, Transport::AnonymityNetwork, "again".into(), None)
            .await
            .unwrap();

        assert_eq!(manager.stats().failover_count, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.active_transport(TrafficClass::Web), Transport::Direct);
    }

    #[tokio::test]
    async fn test_failing_fallback_returns_to_primary() {
        let (manager, bus) = manager(vec![Transport::AnonymityNetwork]);
        manager
            .force_transport(TrafficClass::Monitoring, Transport::AnonymityNetwork)
            .unwrap();
        let mut rx = bus.subscribe();

        manager.self_check().await;

        assert_eq!(
            manager.active_transport(TrafficClass::Monitoring),
            Transport::Direct
        );
        let monitoring: Vec<ConnectionAttempt> = manager
            .recent_attempts(50)
            .into_iter()
            .filter(|a| a.class == TrafficClass::Monitoring)
            .collect();
        assert_eq!(monitoring.len(), 2);
        assert_eq!(monitoring[0].transport, Transport::AnonymityNetwork);
        assert_eq!(monitoring[1].transport, Transport::Direct);
        assert!(monitoring[1].success);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.iter().any(|e| matches!(
            e,
            HaEvent::Failover {
                class: TrafficClass::Monitoring,
                from: Transport::AnonymityNetwork,
                to: Transport::Direct,
                ..
            }
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, HaEvent::FailoverFailed { .. })));
    }

    #[tokio::test]
    async fn test_failing_fallback_tries_each_transport_once() {
        let (manager, bus) = manager(vec![Transport::AnonymityNetwork, Transport::Direct]);
        manager
            .force_transport(TrafficClass::Web, Transport::Direct)
            .unwrap();
        let mut rx = bus.subscribe();

        let err = manager
            .fail_over(TrafficClass::Web, Transport::Direct, "direct down".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HaError::AllTransportsFailed { .. }));

        let attempts = manager.recent_attempts(10);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].transport, Transport::AnonymityNetwork);
        assert_eq!(manager.active_transport(TrafficClass::Web), Transport::Direct);
        assert!(matches!(
            rx.try_recv().unwrap(),
            HaEvent::FailoverFailed { class: TrafficClass::Web, .. }
        ));
    }

    #[test]
    fn test_force_direct_on_admin_prohibited() {
        let (manager, _) = manager(vec![]);
        let err = manager
            .force_transport(TrafficClass::Admin, Transport::Direct)
            .unwrap_err();
        assert!(matches!(err, HaError::FallbackProhibited { .. }));
        assert_admin_never_direct(&manager);

        manager
            .force_transport(TrafficClass::Web, Transport::Direct)
            .unwrap();
        assert_eq!(manager.active_transport(TrafficClass::Web), Transport::Direct);
    }

    #[test]
    fn test_service_failed_then_recovered() {
        let (manager, _) = manager(vec![]);

        manager.handle_health_event(&HealthEvent::ServiceFailed {
            service: "tor".into(),
        });
        assert_eq!(manager.active_transport(TrafficClass::Api), Transport::Direct);
        assert_eq!(
            manager.active_transport(TrafficClass::Monitoring),
            Transport::Direct
        );
        assert_admin_never_direct(&manager);

        manager.handle_health_event(&HealthEvent::ServiceRecovered {
            service: "tor".into(),
        });
        assert_eq!(
            manager.active_transport(TrafficClass::Api),
            Transport::AnonymityNetwork
        );
        // web, api and blockchain auto-recover
        assert_eq!(manager.stats().recovery_count, 3);
    }

    #[test]
    fn test_unrelated_service_ignored() {
        let (manager, _) = manager(vec![]);
        manager.handle_health_event(&HealthEvent::ServiceFailed {
            service: "postgres".into(),
        });
        assert_eq!(
            manager.active_transport(TrafficClass::Web),
            Transport::AnonymityNetwork
        );
    }

    #[test]
    fn test_emergency_keeps_admin_anonymous() {
        let (manager, bus) = manager(vec![]);
        let mut rx = bus.subscribe();

        manager.handle_health_event(&HealthEvent::CriticalAlert {
            level: AlertLevel::Critical,
            service: "tor-cluster".into(),
        });

        for class in [TrafficClass::Web, TrafficClass::Api, TrafficClass::Blockchain] {
            assert_eq!(manager.active_transport(class), Transport::Direct);
        }
        assert_admin_never_direct(&manager);
        assert!(matches!(
            rx.try_recv().unwrap(),
            HaEvent::EmergencyFailover { .. }
        ));
    }

    #[test]
    fn test_warning_alert_is_not_an_emergency() {
        let (manager, _) = manager(vec![]);
        manager.handle_health_event(&HealthEvent::CriticalAlert {
            level: AlertLevel::Warning,
            service: "tor".into(),
        });
        assert_eq!(
            manager.active_transport(TrafficClass::Web),
            Transport::AnonymityNetwork
        );
    }

    #[test]
    fn test_reassert_after_emergency() {
        let (manager, _) = manager(vec![]);
        manager.emergency_failover("test");
        manager.reassert_anonymity_all("new primary");
        for class in TrafficClass::ALL {
            assert_eq!(manager.active_transport(class), Transport::AnonymityNetwork);
        }
    }

    #[tokio::test]
    async fn test_self_check_moves_failing_classes() {
        let (manager, _) = manager(vec![Transport::AnonymityNetwork]);
        manager.self_check().await;

        assert_eq!(manager.active_transport(TrafficClass::Web), Transport::Direct);
        assert_eq!(
            manager.active_transport(TrafficClass::Blockchain),
            Transport::Direct
        );
        assert_admin_never_direct(&manager);
        assert_eq!(
            manager.active_transport(TrafficClass::Monitoring),
            Transport::Direct
        );

        // Nothing is due again right away
        let before = manager.stats();
        manager.self_check().await;
        let after = manager.stats();
        assert_eq!(after.failover_count, before.failover_count);
        assert_eq!(after.overall.attempts, before.overall.attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_check_follows_class_intervals() {
        let (manager, _) = manager(vec![]);
        let checks = |class: TrafficClass| {
            manager
                .recent_attempts(100)
                .iter()
                .filter(|a| a.class == class)
                .count()
        };

        manager.self_check().await;
        for class in TrafficClass::ALL {
            assert_eq!(checks(class), 1);
        }

        // api, admin and monitoring run every 30s, web every 60s,
        // blockchain every 120s
        tokio::time::advance(Duration::from_secs(30)).await;
        manager.self_check().await;
        assert_eq!(checks(TrafficClass::Api), 2);
        assert_eq!(checks(TrafficClass::Monitoring), 2);
        assert_eq!(checks(TrafficClass::Web), 1);
        assert_eq!(checks(TrafficClass::Blockchain), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        manager.self_check().await;
        assert_eq!(checks(TrafficClass::Api), 3);
        assert_eq!(checks(TrafficClass::Web), 2);
        assert_eq!(checks(TrafficClass::Blockchain), 1);
    }

    #[tokio::test]
    async fn test_attempt_history_and_stats() {
        let (manager, _) = manager(vec![Transport::AnonymityNetwork]);
        manager
            .acquire_client(TrafficClass::Web, Some("https://example.org/"))
            .await
            .unwrap();

        let attempts = manager.recent_attempts(10);
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].success);
        assert_eq!(attempts[0].transport, Transport::AnonymityNetwork);
        assert!(attempts[1].success);
        assert!(attempts[1].timestamp >= attempts[0].timestamp);

        let stats = manager.stats();
        assert_eq!(stats.overall.attempts, 2);
        assert_eq!(stats.overall.success_rate, 50.0);
        assert_eq!(stats.anonymity_network.success_rate, 0.0);
        assert_eq!(stats.direct.success_rate, 100.0);
        assert_eq!(stats.direct.avg_response_time_ms, 20.0);
    }
}
