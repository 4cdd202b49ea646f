//! Single-daemon circuit manager
//!
//! Drives one Tor daemon: proxy reachability, control-port commands,
//! periodic health polling and circuit rotation, and the factory for
//! outbound clients bound to per-class isolation ports.
//!
//! ## State machine
//!
//! ```text
//! uninitialized ─▶ connecting ─▶ connected ⇄ degraded
//!                      ▲              │
//!                      │              ▼
//!   initialize() / rebind() / reconnect()  disconnected
//! ```
//!
//! A disconnected manager stays disconnected until `initialize()`,
//! `rebind()` or `reconnect()` is called. The health poll never heals it
//! on its own; the redundancy manager reconnects it once the primary
//! instance passes its probes again, or rebinds it to another daemon.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::clock::now_ms;
use crate::config::CircuitConfig;
use crate::error::{HaError, Result};
use crate::events::{EventBus, HaEvent};
use crate::network::{probe_tcp, resolve, ClientOptions, OutboundClient};
use crate::protocol::{
    count_circuits, ControlAuth, ControlSession, INFO_CIRCUIT_STATUS, INFO_TRAFFIC_READ,
    INFO_TRAFFIC_WRITTEN, SIGNAL_NEWNYM,
};
use crate::ring::BoundedRing;
use crate::scheduler::{Scheduler, TickGuard};
use crate::transport::{ConnectionStrategy, TrafficClass, Transport};

/// Timeout for clients built without a class strategy
const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries for clients built without a class strategy
const DEFAULT_CLIENT_RETRIES: u32 = 2;

/// Tor rate-limits NEWNYM to one per ten seconds
const MIN_ROTATION_SPACING: Duration = Duration::from_secs(10);

/// Deadline for an end-to-end request through a proxy port
const CONNECTIVITY_TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection state of the managed daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    /// Still connected, but a recent control operation failed
    Degraded,
    Disconnected,
}

/// One entry in the recent-errors ring
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedError {
    pub timestamp: u64,
    pub operation: String,
    pub message: String,
}

/// Counters read over the control port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Telemetry {
    pub circuit_count: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Read-only snapshot of the manager
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub state: ConnectionState,
    pub enabled: bool,
    pub proxy_port: u16,
    pub control_port: u16,
    pub onion_address: Option<String>,
    pub last_rotation: Option<u64>,
    pub rotation_count: u64,
    pub last_health_check: Option<u64>,
    pub telemetry: Telemetry,
    pub recent_errors: Vec<RecordedError>,
}

struct Inner {
    state: ConnectionState,
    initialized: bool,
    proxy_port: u16,
    control_port: u16,
    onion_address: Option<String>,
    last_rotation: Option<u64>,
    rotation_count: u64,
    last_health_check: Option<u64>,
    telemetry: Telemetry,
    recent_errors: BoundedRing<RecordedError>,
}

/// Manages one Tor daemon's control plane
pub struct CircuitManager {
    config: CircuitConfig,
    auth: ControlAuth,
    bus: EventBus,
    inner: Mutex<Inner>,
    rotation_wake: Arc<Notify>,
    rotation_guard: TickGuard,
    health_guard: TickGuard,
    scheduler: Mutex<Option<Scheduler>>,
}

impl CircuitManager {
    pub fn new(config: CircuitConfig, bus: EventBus) -> Self {
        let auth = ControlAuth::from_config(
            config.control_password.as_deref(),
            config.cookie_path.as_deref(),
        );
        let inner = Inner {
            state: ConnectionState::Uninitialized,
            initialized: false,
            proxy_port: config.proxy_port,
            control_port: config.control_port,
            onion_address: None,
            last_rotation: None,
            rotation_count: 0,
            last_health_check: None,
            telemetry: Telemetry::default(),
            recent_errors: BoundedRing::new(config.max_recent_errors),
        };

        Self {
            config,
            auth,
            bus,
            inner: Mutex::new(inner),
            rotation_wake: Arc::new(Notify::new()),
            rotation_guard: TickGuard::new(),
            health_guard: TickGuard::new(),
            scheduler: Mutex::new(None),
        }
    }

    /// Verify the proxy, read the onion address and start the periodic tasks
    ///
    /// Calling this again restarts the tasks and re-verifies the proxy.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if !self.config.enabled {
            log::info!("Tor routing disabled, clients will connect directly");
            return Ok(());
        }

        self.stop_tasks().await;
        self.set_state(ConnectionState::Connecting);

        let proxy_port = self.proxy_port();
        log::info!(
            "🔄 Connecting to Tor proxy at {}:{}...",
            self.config.proxy_host,
            proxy_port
        );

        if let Err(e) = self.check_proxy(proxy_port).await {
            log::error!("❌ Tor proxy unreachable: {}", e);
            self.record_error("initialize", &e);
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        let onion_address = self.read_onion_address().await;

        self.start_tasks();

        {
            let mut inner = self.inner.lock();
            inner.initialized = true;
            inner.state = ConnectionState::Connected;
            inner.onion_address = onion_address;
        }

        log::info!("✅ Circuit manager connected");
        log::info!(
            "  ⏱️ Health every {:?}, rotation every {:?}",
            self.config.health_check_interval(),
            self.config.rotation_interval()
        );
        self.bus.emit(HaEvent::CircuitConnected);
        Ok(())
    }

    fn start_tasks(self: &Arc<Self>) {
        let scheduler = Scheduler::new();

        let weak = Arc::downgrade(self);
        scheduler.spawn_periodic(
            "circuit-health",
            self.config.health_check_interval(),
            None,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.perform_health_check().await;
                    }
                }
            },
        );

        let weak = Arc::downgrade(self);
        scheduler.spawn_periodic(
            "circuit-rotation",
            self.config.rotation_interval(),
            Some(Arc::clone(&self.rotation_wake)),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.scheduled_rotation().await;
                    }
                }
            },
        );

        *self.scheduler.lock() = Some(scheduler);
    }

    async fn stop_tasks(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
    }

    /// Stop the periodic tasks, letting an in-flight iteration finish
    pub async fn shutdown(&self) {
        self.stop_tasks().await;
        log::info!("Circuit manager stopped");
    }

    // ===== Client factory =====

    /// Client for ad-hoc use
    ///
    /// Direct when Tor routing is disabled or the manager was never
    /// initialized; otherwise bound to the class's isolation port.
    pub fn build_client(&self, hint: Option<TrafficClass>) -> Result<OutboundClient> {
        if !self.config.enabled || !self.is_initialized() {
            let mut options = ClientOptions::direct(DEFAULT_CLIENT_TIMEOUT);
            options.class = hint;
            return OutboundClient::build(options);
        }

        let port = self.class_port(hint);
        let mut options = ClientOptions::anonymous(&self.config.proxy_host, port, DEFAULT_CLIENT_TIMEOUT)
            .with_retries(DEFAULT_CLIENT_RETRIES)
            .with_rotation(Arc::clone(&self.rotation_wake));
        options.class = hint;
        OutboundClient::build(options)
    }

    /// Client on an explicit transport, shaped by a class strategy
    pub fn build_client_for(
        &self,
        transport: Transport,
        strategy: &ConnectionStrategy,
    ) -> Result<OutboundClient> {
        let options = match transport {
            Transport::Direct => ClientOptions::direct(strategy.timeout()),
            Transport::AnonymityNetwork => {
                if !self.config.enabled {
                    return Err(HaError::NotInitialized);
                }
                let port = self.class_port(Some(strategy.class));
                ClientOptions::anonymous(&self.config.proxy_host, port, strategy.timeout())
                    .with_rotation(Arc::clone(&self.rotation_wake))
            }
        };

        OutboundClient::build(
            options
                .with_class(strategy.class)
                .with_retries(strategy.retry_count),
        )
    }

    /// SOCKS port for a class on the current proxy
    pub fn class_port(&self, class: Option<TrafficClass>) -> u16 {
        let proxy_port = self.proxy_port();
        match class {
            Some(class) => self.config.isolation.port_for(class, proxy_port),
            None => proxy_port,
        }
    }

    /// One end-to-end request through the given SOCKS port
    pub async fn test_connectivity(&self, proxy_port: u16) -> Result<Duration> {
        let client = OutboundClient::build(ClientOptions::anonymous(
            &self.config.proxy_host,
            proxy_port,
            CONNECTIVITY_TEST_TIMEOUT,
        ))?;
        client
            .probe(&self.config.check_url, CONNECTIVITY_TEST_TIMEOUT)
            .await
    }

    // ===== Circuit rotation =====

    async fn scheduled_rotation(&self) {
        let too_soon = self
            .inner
            .lock()
            .last_rotation
            .map(|t| now_ms().saturating_sub(t) < MIN_ROTATION_SPACING.as_millis() as u64)
            .unwrap_or(false);

        if too_soon {
            log::debug!("Skipping rotation, last one was under {:?} ago", MIN_ROTATION_SPACING);
            return;
        }
        self.rotate_circuit().await;
    }

    /// Ask Tor for fresh circuits
    ///
    /// Failures land in the recent-errors ring and mark the manager
    /// degraded; they are never returned.
    pub async fn rotate_circuit(&self) {
        if !self.config.enabled {
            return;
        }
        let Some(_permit) = self.rotation_guard.try_enter() else {
            log::debug!("Rotation already in progress, skipping");
            return;
        };

        log::info!("🔄 Rotating Tor circuit...");

        match self.send_signal(SIGNAL_NEWNYM).await {
            Ok(()) => {
                tokio::time::sleep(self.config.rotation_settle()).await;

                let timestamp = now_ms();
                {
                    let mut inner = self.inner.lock();
                    inner.last_rotation = Some(timestamp);
                    inner.rotation_count += 1;
                }

                log::info!("✅ Circuit rotated");
                self.bus.emit(HaEvent::CircuitRotated { timestamp });
            }
            Err(e) => {
                log::warn!("⚠️ Circuit rotation failed: {}", e);
                self.record_error("rotate_circuit", &e);

                let mut inner = self.inner.lock();
                if inner.state == ConnectionState::Connected {
                    inner.state = ConnectionState::Degraded;
                }
            }
        }
    }

    // ===== Health =====

    /// One health poll: proxy reachability plus control-port telemetry
    ///
    /// A failure marks the manager disconnected and emits
    /// `HealthCheckFailed`. The next tick is the retry.
    pub async fn perform_health_check(&self) {
        let Some(_permit) = self.health_guard.try_enter() else {
            log::debug!("Health check already running, skipping");
            return;
        };

        let state = self.state();
        if matches!(
            state,
            ConnectionState::Uninitialized | ConnectionState::Disconnected
        ) {
            log::debug!("Skipping health check while {:?}", state);
            return;
        }

        match self.collect_telemetry().await {
            Ok(telemetry) => {
                log::debug!(
                    "Tor healthy: {} circuits, {} bytes read, {} bytes written",
                    telemetry.circuit_count,
                    telemetry.bytes_read,
                    telemetry.bytes_written
                );

                let mut inner = self.inner.lock();
                inner.telemetry = telemetry;
                inner.last_health_check = Some(now_ms());
                if inner.state == ConnectionState::Degraded {
                    inner.state = ConnectionState::Connected;
                }
            }
            Err(e) => {
                log::error!("❌ Tor health check failed: {}", e);
                self.record_error("health_check", &e);

                {
                    let mut inner = self.inner.lock();
                    inner.state = ConnectionState::Disconnected;
                    inner.last_health_check = Some(now_ms());
                }

                self.bus.emit(HaEvent::HealthCheckFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    async fn collect_telemetry(&self) -> Result<Telemetry> {
        self.check_proxy(self.proxy_port()).await?;

        let mut session = self.open_control().await?;
        let info = session
            .get_info(&[INFO_CIRCUIT_STATUS, INFO_TRAFFIC_READ, INFO_TRAFFIC_WRITTEN])
            .await?;
        session.quit().await?;

        Ok(Telemetry {
            circuit_count: info
                .get(INFO_CIRCUIT_STATUS)
                .map(|s| count_circuits(s))
                .unwrap_or(0),
            bytes_read: parse_counter(&info, INFO_TRAFFIC_READ)?,
            bytes_written: parse_counter(&info, INFO_TRAFFIC_WRITTEN)?,
        })
    }

    /// Bring a disconnected manager back on its current ports
    ///
    /// Both the proxy and the control port must answer. No-op unless the
    /// manager was initialized and is currently disconnected.
    pub async fn reconnect(&self) -> Result<()> {
        if !self.config.enabled
            || !self.is_initialized()
            || self.state() != ConnectionState::Disconnected
        {
            return Ok(());
        }
        let Some(_permit) = self.health_guard.try_enter() else {
            log::debug!("Health check in progress, reconnect deferred");
            return Ok(());
        };

        match self.collect_telemetry().await {
            Ok(telemetry) => {
                {
                    let mut inner = self.inner.lock();
                    inner.telemetry = telemetry;
                    inner.last_health_check = Some(now_ms());
                    inner.state = ConnectionState::Connected;
                }
                log::info!("✅ Circuit manager reconnected on proxy {}", self.proxy_port());
                self.bus.emit(HaEvent::CircuitConnected);
                Ok(())
            }
            Err(e) => {
                log::debug!("Reconnect attempt failed: {}", e);
                self.record_error("reconnect", &e);
                Err(e)
            }
        }
    }

    // ===== Rebinding =====

    /// Point the manager at another daemon's ports
    ///
    /// An initialized manager re-verifies the new proxy and moves to
    /// connected or disconnected accordingly.
    pub async fn rebind(&self, proxy_port: u16, control_port: u16) -> Result<()> {
        let (unchanged, initialized, state) = {
            let mut inner = self.inner.lock();
            let unchanged = inner.proxy_port == proxy_port && inner.control_port == control_port;
            inner.proxy_port = proxy_port;
            inner.control_port = control_port;
            (unchanged, inner.initialized, inner.state)
        };

        if unchanged && state != ConnectionState::Disconnected {
            return Ok(());
        }
        if !unchanged {
            log::info!(
                "🔄 Rebinding circuit manager to proxy {} / control {}",
                proxy_port,
                control_port
            );
        }
        if !initialized || !self.config.enabled {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        match self.check_proxy(proxy_port).await {
            Ok(_) => {
                self.set_state(ConnectionState::Connected);
                log::info!("✅ Circuit manager connected on proxy {}", proxy_port);
                self.bus.emit(HaEvent::CircuitConnected);
                Ok(())
            }
            Err(e) => {
                log::warn!("⚠️ Rebound proxy {} unreachable: {}", proxy_port, e);
                self.record_error("rebind", &e);
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    // ===== Accessors =====

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// `initialize()` succeeded at least once
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    pub fn proxy_host(&self) -> &str {
        &self.config.proxy_host
    }

    pub fn proxy_port(&self) -> u16 {
        self.inner.lock().proxy_port
    }

    pub fn control_port(&self) -> u16 {
        self.inner.lock().control_port
    }

    pub fn onion_address(&self) -> Option<String> {
        self.inner.lock().onion_address.clone()
    }

    pub fn recent_errors(&self) -> Vec<RecordedError> {
        self.inner.lock().recent_errors.to_vec()
    }

    pub fn status(&self) -> CircuitStatus {
        let inner = self.inner.lock();
        CircuitStatus {
            state: inner.state,
            enabled: self.config.enabled,
            proxy_port: inner.proxy_port,
            control_port: inner.control_port,
            onion_address: inner.onion_address.clone(),
            last_rotation: inner.last_rotation,
            rotation_count: inner.rotation_count,
            last_health_check: inner.last_health_check,
            telemetry: inner.telemetry.clone(),
            recent_errors: inner.recent_errors.to_vec(),
        }
    }

    // ===== Internals =====

    fn set_state(&self, state: ConnectionState) {
        let mut inner = self.inner.lock();
        if inner.state != state {
            log::debug!("Circuit state {:?} -> {:?}", inner.state, state);
            inner.state = state;
        }
    }

    fn record_error(&self, operation: &str, error: &HaError) {
        self.inner.lock().recent_errors.push(RecordedError {
            timestamp: now_ms(),
            operation: operation.to_string(),
            message: error.to_string(),
        });
    }

    async fn check_proxy(&self, proxy_port: u16) -> Result<Duration> {
        let addr = resolve(&self.config.proxy_host, proxy_port).await?;
        probe_tcp(addr, self.config.proxy_probe_timeout()).await
    }

    async fn open_control(&self) -> Result<ControlSession<TcpStream>> {
        let addr = resolve(&self.config.proxy_host, self.control_port()).await?;
        let mut session = ControlSession::connect(addr, self.config.control_timeout()).await?;
        session.authenticate(&self.auth).await?;
        Ok(session)
    }

    async fn send_signal(&self, signal: &str) -> Result<()> {
        let mut session = self.open_control().await?;
        session.signal(signal).await?;
        session.quit().await
    }

    async fn read_onion_address(&self) -> Option<String> {
        let path = self.config.hostname_path.as_deref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let address = contents.trim().to_string();
                if address.is_empty() {
                    return None;
                }
                log::info!("🧅 Onion address: {}", address);
                Some(address)
            }
            Err(e) => {
                log::debug!("No onion hostname at {}: {}", path, e);
                None
            }
        }
    }
}

fn parse_counter(info: &HashMap<String, String>, key: &str) -> Result<u64> {
    match info.get(key) {
        Some(value) => value.trim().parse::<u64>().map_err(|_| {
            HaError::ControlProtocol(format!("non-numeric {}: {:?}", key, value))
        }),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn test_config(proxy_port: u16, control_port: u16) -> CircuitConfig {
        CircuitConfig {
            proxy_port,
            control_port,
            rotation_settle_ms: 0,
            hostname_path: None,
            ..CircuitConfig::default()
        }
    }

    fn web_strategy() -> ConnectionStrategy {
        ConnectionStrategy::default_table()
            .into_iter()
            .find(|s| s.class == TrafficClass::Web)
            .unwrap()
    }

    #[test]
    fn test_build_client_direct_before_initialize() {
        let manager = CircuitManager::new(CircuitConfig::default(), EventBus::new());
        let client = manager.build_client(Some(TrafficClass::Web)).unwrap();
        assert_eq!(client.transport(), Transport::Direct);
        assert_eq!(manager.state(), ConnectionState::Uninitialized);
    }

    #[test]
    fn test_build_client_for_uses_isolation_port() {
        let manager = CircuitManager::new(CircuitConfig::default(), EventBus::new());
        let client = manager
            .build_client_for(Transport::AnonymityNetwork, &web_strategy())
            .unwrap();

        assert_eq!(client.transport(), Transport::AnonymityNetwork);
        assert_eq!(client.proxy_port(), Some(9052));
        assert_eq!(client.retries(), 3);
        assert_eq!(client.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_disabled_manager_refuses_anonymity_clients() {
        let config = CircuitConfig {
            enabled: false,
            ..CircuitConfig::default()
        };
        let manager = CircuitManager::new(config, EventBus::new());
        assert!(matches!(
            manager.build_client_for(Transport::AnonymityNetwork, &web_strategy()),
            Err(HaError::NotInitialized)
        ));
        assert!(manager
            .build_client_for(Transport::Direct, &web_strategy())
            .is_ok());
    }

    #[tokio::test]
    async fn test_initialize_fails_when_proxy_unreachable() {
        let port = closed_port().await;
        let manager = Arc::new(CircuitManager::new(
            test_config(port, port),
            EventBus::new(),
        ));

        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, HaError::ProxyUnreachable { .. }));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_rotation_failure_recorded_not_thrown() {
        let port = closed_port().await;
        let manager = CircuitManager::new(test_config(port, port), EventBus::new());

        for _ in 0..7 {
            manager.rotate_circuit().await;
        }

        let errors = manager.recent_errors();
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().all(|e| e.operation == "rotate_circuit"));
        assert_eq!(manager.status().rotation_count, 0);
    }

    #[tokio::test]
    async fn test_health_check_skipped_until_initialized() {
        let port = closed_port().await;
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let manager = CircuitManager::new(test_config(port, port), bus);

        manager.perform_health_check().await;
        assert!(rx.try_recv().is_err());
        assert!(manager.recent_errors().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_is_noop_until_initialized() {
        let port = closed_port().await;
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let manager = CircuitManager::new(test_config(port, port), bus);

        manager.reconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Uninitialized);
        assert!(rx.try_recv().is_err());
        assert!(manager.recent_errors().is_empty());
    }

    #[test]
    fn test_parse_counter() {
        let mut info = HashMap::new();
        info.insert("traffic/read".to_string(), "4096".to_string());
        info.insert("traffic/written".to_string(), "lots".to_string());

        assert_eq!(parse_counter(&info, "traffic/read").unwrap(), 4096);
        assert!(parse_counter(&info, "traffic/written").is_err());
        assert_eq!(parse_counter(&info, "missing").unwrap(), 0);
    }
}
