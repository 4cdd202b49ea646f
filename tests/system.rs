//! End-to-end wiring of the three managers

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, roster_entry, FakeDaemon, ScriptedConnectivity, ScriptedProber};
use tor_ha::{
    AlertLevel, ConnectionState, HaConfig, HaEvent, HaSystem, HealthEvent, TrafficClass,
    Transport,
};

fn config_for(daemon: &FakeDaemon) -> HaConfig {
    let mut config = HaConfig::default();
    config.circuit = daemon.circuit_config();
    config.failover.self_check_interval_secs = 3600;

    let mut primary = roster_entry("primary", daemon.proxy_port, 1, false);
    primary.control_port = daemon.control_port;
    config.redundancy.instances = vec![
        primary,
        roster_entry("secondary", 19160, 2, false),
        roster_entry("tertiary", 19170, 3, false),
    ];
    config.redundancy.failure_threshold = 1;
    config.redundancy.health_check_interval_secs = 3600;
    config.redundancy.write_instance_configs = false;
    config
}

fn system_for(daemon: &FakeDaemon) -> (HaSystem, Arc<ScriptedProber>) {
    let prober = ScriptedProber::new();
    let system = HaSystem::with_probes(
        config_for(daemon),
        ScriptedConnectivity::new(),
        prober.clone(),
    )
    .unwrap();
    (system, prober)
}

/// Start and let the router drain the startup events
async fn start(system: &HaSystem) {
    system.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn transport_becomes(system: &HaSystem, class: TrafficClass, transport: Transport) -> bool {
    eventually(|| {
        let current = system.failover().active_transport(class);
        async move { current == transport }
    })
    .await
}

#[tokio::test]
async fn test_start_connects_and_elects_primary() {
    let daemon = FakeDaemon::start().await;
    let (system, _prober) = system_for(&daemon);

    start(&system).await;

    let status = system.status();
    assert_eq!(status.circuit.state, ConnectionState::Connected);
    assert_eq!(status.cluster.primary.as_deref(), Some("primary"));
    assert_eq!(status.cluster.active, 3);
    assert_eq!(
        status.failover.active.get(&TrafficClass::Web),
        Some(&Transport::AnonymityNetwork)
    );

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["circuit"]["state"], "connected");
    assert!(json["circuit"].get("control_password").is_none());

    system.shutdown().await;
}

#[tokio::test]
async fn test_anonymity_service_failure_and_recovery() {
    let daemon = FakeDaemon::start().await;
    let (system, _prober) = system_for(&daemon);
    start(&system).await;

    system.report(HealthEvent::ServiceFailed {
        service: "tor".into(),
    });
    assert!(transport_becomes(&system, TrafficClass::Web, Transport::Direct).await);
    assert_eq!(
        system.failover().active_transport(TrafficClass::Admin),
        Transport::AnonymityNetwork
    );
    assert_eq!(
        system.failover().active_transport(TrafficClass::Monitoring),
        Transport::Direct
    );

    system.report(HealthEvent::ServiceRecovered {
        service: "tor".into(),
    });
    assert!(transport_becomes(&system, TrafficClass::Web, Transport::AnonymityNetwork).await);
    assert_eq!(system.failover().stats().recovery_count, 3);

    system.shutdown().await;
}

#[tokio::test]
async fn test_critical_alert_keeps_admin_anonymous() {
    let daemon = FakeDaemon::start().await;
    let (system, _prober) = system_for(&daemon);
    start(&system).await;

    system.report(HealthEvent::CriticalAlert {
        level: AlertLevel::Warning,
        service: "disk".into(),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        system.failover().active_transport(TrafficClass::Web),
        Transport::AnonymityNetwork
    );

    system.report(HealthEvent::CriticalAlert {
        level: AlertLevel::Critical,
        service: "disk".into(),
    });
    assert!(transport_becomes(&system, TrafficClass::Blockchain, Transport::Direct).await);
    assert_eq!(
        system.failover().active_transport(TrafficClass::Admin),
        Transport::AnonymityNetwork
    );

    system.shutdown().await;
}

#[tokio::test]
async fn test_cluster_shortfall_triggers_emergency() {
    let daemon = FakeDaemon::start().await;
    let (system, prober) = system_for(&daemon);
    start(&system).await;
    let mut rx = system.subscribe();

    for id in ["primary", "secondary", "tertiary"] {
        prober.set_healthy(id, false);
    }
    system.redundancy().run_health_cycle().await.unwrap();

    let emergency = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(HaEvent::EmergencyFailover { reason, .. }) = rx.recv().await {
                break reason;
            }
        }
    })
    .await
    .unwrap();
    assert!(emergency.contains("0 active"));

    assert_eq!(
        system.failover().active_transport(TrafficClass::Api),
        Transport::Direct
    );
    assert_eq!(
        system.failover().active_transport(TrafficClass::Admin),
        Transport::AnonymityNetwork
    );

    system.shutdown().await;
}

#[tokio::test]
async fn test_circuit_health_failure_diverts_traffic() {
    let mut daemon = FakeDaemon::start().await;
    let (system, _prober) = system_for(&daemon);
    start(&system).await;

    daemon.stop_control().await;
    system.circuit().perform_health_check().await;

    assert_eq!(system.circuit().state(), ConnectionState::Disconnected);
    assert!(transport_becomes(&system, TrafficClass::Web, Transport::Direct).await);
    assert_eq!(
        system.failover().active_transport(TrafficClass::Admin),
        Transport::AnonymityNetwork
    );

    system.shutdown().await;
}

#[tokio::test]
async fn test_healthy_primary_reconnects_circuit() {
    let mut daemon = FakeDaemon::start().await;
    let (system, _prober) = system_for(&daemon);
    start(&system).await;

    daemon.stop_control().await;
    system.circuit().perform_health_check().await;
    assert!(transport_becomes(&system, TrafficClass::Web, Transport::Direct).await);

    // Still down: the cycle tries and leaves the circuit disconnected
    system.redundancy().run_health_cycle().await.unwrap();
    assert_eq!(system.circuit().state(), ConnectionState::Disconnected);

    daemon.restart_control().await;
    system.redundancy().run_health_cycle().await.unwrap();

    assert_eq!(system.circuit().state(), ConnectionState::Connected);
    assert_eq!(
        system.redundancy().primary().map(|p| p.id).as_deref(),
        Some("primary")
    );
    assert!(transport_becomes(&system, TrafficClass::Web, Transport::AnonymityNetwork).await);
    assert_eq!(
        system.failover().active_transport(TrafficClass::Api),
        Transport::AnonymityNetwork
    );

    system.shutdown().await;
}

#[tokio::test]
async fn test_cluster_recovery_lifts_emergency() {
    let daemon = FakeDaemon::start().await;
    let (system, prober) = system_for(&daemon);
    start(&system).await;

    prober.set_healthy("secondary", false);
    prober.set_healthy("tertiary", false);
    system.redundancy().run_health_cycle().await.unwrap();
    assert!(transport_becomes(&system, TrafficClass::Web, Transport::Direct).await);
    assert_eq!(
        system.redundancy().primary().map(|p| p.id).as_deref(),
        Some("primary")
    );

    prober.set_healthy("secondary", true);
    prober.set_healthy("tertiary", true);
    let snapshot = system.redundancy().run_health_cycle().await.unwrap();
    assert_eq!(snapshot.active, 3);

    for class in [TrafficClass::Web, TrafficClass::Api, TrafficClass::Blockchain] {
        assert_eq!(
            system.failover().active_transport(class),
            Transport::AnonymityNetwork
        );
    }
    assert_eq!(
        system.failover().active_transport(TrafficClass::Monitoring),
        Transport::Direct
    );

    // A later healthy cycle leaves routing alone
    let recoveries = system.failover().stats().recovery_count;
    system.redundancy().run_health_cycle().await.unwrap();
    assert_eq!(system.failover().stats().recovery_count, recoveries);

    system.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_proxy_at_start_is_not_fatal() {
    let mut daemon = FakeDaemon::start().await;
    let (system, _prober) = system_for(&daemon);
    daemon.stop().await;

    start(&system).await;

    assert_eq!(system.circuit().state(), ConnectionState::Disconnected);
    assert_eq!(
        system.failover().active_transport(TrafficClass::Web),
        Transport::Direct
    );
    assert_eq!(
        system.failover().active_transport(TrafficClass::Admin),
        Transport::AnonymityNetwork
    );

    system.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_event_routing() {
    let daemon = FakeDaemon::start().await;
    let (system, _prober) = system_for(&daemon);
    start(&system).await;
    system.shutdown().await;

    system.report(HealthEvent::CriticalAlert {
        level: AlertLevel::Critical,
        service: "disk".into(),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        system.failover().active_transport(TrafficClass::Web),
        Transport::AnonymityNetwork
    );
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let daemon = FakeDaemon::start().await;
    let mut config = config_for(&daemon);
    config.redundancy.instances[1].proxy_port = daemon.proxy_port;

    let result = HaSystem::with_probes(config, ScriptedConnectivity::new(), ScriptedProber::new());
    assert!(result.is_err());
}
