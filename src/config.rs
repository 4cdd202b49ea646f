//! Configuration for the circuit, failover and redundancy managers
//!
//! Every section deserializes with defaults, so a config file only needs
//! the keys it wants to change. Durations are whole seconds or
//! milliseconds, with accessors returning [`Duration`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{HaError, Result};
use crate::isolation::IsolationConfig;
use crate::transport::{ConnectionStrategy, TrafficClass};

/// Environment variable overriding the control-port password
pub const ENV_CONTROL_PASSWORD: &str = "TOR_CONTROL_PASSWORD";

/// Environment variable toggling the anonymity network on or off
pub const ENV_TOR_ENABLED: &str = "TOR_ENABLED";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    pub circuit: CircuitConfig,
    pub failover: FailoverConfig,
    pub redundancy: RedundancyConfig,
}

impl HaConfig {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: HaConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HaError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&text)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(ENV_CONTROL_PASSWORD).ok(),
            std::env::var(ENV_TOR_ENABLED).ok(),
        );
    }

    fn apply_overrides(&mut self, password: Option<String>, enabled: Option<String>) {
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            self.circuit.control_password = Some(password);
        }
        if let Some(enabled) = enabled {
            match enabled.trim().to_ascii_lowercase().as_str() {
                "0" | "false" | "no" | "off" => self.circuit.enabled = false,
                "1" | "true" | "yes" | "on" => self.circuit.enabled = true,
                other => log::warn!("Ignoring unrecognised {}={}", ENV_TOR_ENABLED, other),
            }
        }
    }

    /// Reject configurations the managers cannot run with
    pub fn validate(&self) -> Result<()> {
        let r = &self.redundancy;

        if r.instances.is_empty() {
            return Err(HaError::Config("instance roster is empty".into()));
        }
        if r.failure_threshold == 0 {
            return Err(HaError::Config("failure_threshold must be at least 1".into()));
        }
        if r.min_healthy_instances == 0 {
            return Err(HaError::Config(
                "min_healthy_instances must be at least 1".into(),
            ));
        }

        let mut ids = HashSet::new();
        let mut ports = HashSet::new();
        for instance in &r.instances {
            if !ids.insert(instance.id.as_str()) {
                return Err(HaError::Config(format!(
                    "duplicate instance id '{}'",
                    instance.id
                )));
            }
            for port in [instance.proxy_port, instance.control_port] {
                if !ports.insert(port) {
                    return Err(HaError::Config(format!(
                        "port {} used by more than one instance",
                        port
                    )));
                }
            }
        }

        let mut classes = HashSet::new();
        for strategy in &self.failover.strategies {
            if strategy.fallback == Some(strategy.primary) {
                return Err(HaError::Config(format!(
                    "strategy for {} falls back to its own primary",
                    strategy.class
                )));
            }
            if !classes.insert(strategy.class) {
                return Err(HaError::Config(format!(
                    "duplicate strategy for {}",
                    strategy.class
                )));
            }
        }

        Ok(())
    }
}

/// Single-daemon control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Route through Tor at all; when false every client is direct
    pub enabled: bool,

    pub proxy_host: String,
    pub proxy_port: u16,
    pub control_port: u16,

    /// Control-port password (never serialized back out)
    #[serde(skip_serializing)]
    pub control_password: Option<String>,

    /// Cookie file for COOKIE authentication, used when no password is set
    pub cookie_path: Option<String>,

    pub health_check_interval_secs: u64,
    pub rotation_interval_secs: u64,

    /// Pause after NEWNYM so Tor can build fresh circuits
    pub rotation_settle_ms: u64,

    pub control_timeout_secs: u64,
    pub proxy_probe_timeout_secs: u64,

    /// Published onion hostname, read best-effort at startup
    pub hostname_path: Option<String>,

    pub max_recent_errors: usize,

    /// Endpoint used for end-to-end connectivity tests through the proxy
    pub check_url: String,

    pub isolation: IsolationConfig,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 9050,
            control_port: 9051,
            control_password: None,
            cookie_path: None,
            health_check_interval_secs: 30,
            rotation_interval_secs: 10 * 60, // 10 minutes
            rotation_settle_ms: 3_000,
            control_timeout_secs: 10,
            proxy_probe_timeout_secs: 5,
            hostname_path: Some("/var/lib/tor/hidden_service/hostname".to_string()),
            max_recent_errors: 5,
            check_url: "https://check.torproject.org/api/ip".to_string(),
            isolation: IsolationConfig::default(),
        }
    }
}

impl CircuitConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn rotation_settle(&self) -> Duration {
        Duration::from_millis(self.rotation_settle_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    pub fn proxy_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_probe_timeout_secs)
    }
}

/// Per-class failover settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub strategies: Vec<ConnectionStrategy>,

    pub self_check_interval_secs: u64,

    /// Timeout for the probe made when a caller supplies a probe endpoint
    pub probe_timeout_secs: u64,

    /// Reliability endpoint probed through Tor by the self-check
    pub anonymity_check_endpoint: String,

    /// Reliability endpoint probed directly by the self-check
    pub direct_check_endpoint: String,

    /// Capacity of the connection-attempt history
    pub attempt_history: usize,

    /// Service names whose failure means the anonymity network is down
    pub anonymity_services: Vec<String>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            strategies: ConnectionStrategy::default_table(),
            self_check_interval_secs: 30,
            probe_timeout_secs: 5,
            anonymity_check_endpoint: "https://check.torproject.org/api/ip".to_string(),
            direct_check_endpoint: "https://www.cloudflare.com/cdn-cgi/trace".to_string(),
            attempt_history: 1_000,
            anonymity_services: vec!["tor".to_string(), "tor-proxy".to_string()],
        }
    }
}

impl FailoverConfig {
    pub fn self_check_interval(&self) -> Duration {
        Duration::from_secs(self.self_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn strategy(&self, class: TrafficClass) -> Option<&ConnectionStrategy> {
        self.strategies.iter().find(|s| s.class == class)
    }
}

/// One Tor daemon in the redundancy roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub name: String,
    pub proxy_port: u16,
    pub control_port: u16,
    pub data_dir: String,
    pub config_path: String,

    /// Lower is preferred
    pub priority: u32,

    #[serde(default)]
    pub region: Option<String>,

    /// Start in standby; only promoted when the cluster runs short
    #[serde(default)]
    pub standby: bool,

    /// Hidden services this instance publishes
    #[serde(default)]
    pub hidden_services: Vec<String>,
}

impl InstanceConfig {
    fn roster_entry(
        id: &str,
        proxy_port: u16,
        priority: u32,
        region: Option<&str>,
        standby: bool,
    ) -> Self {
        let data_dir = format!("/var/lib/tor-{}", id);
        Self {
            id: id.to_string(),
            name: format!("tor-{}", id),
            proxy_port,
            control_port: proxy_port + 1,
            config_path: format!("/etc/tor/torrc.{}", id),
            data_dir,
            priority,
            region: region.map(str::to_string),
            standby,
            hidden_services: vec!["main".to_string(), "api".to_string()],
        }
    }
}

/// A logical inbound service published as an onion address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenServiceConfig {
    pub name: String,
    pub virtual_port: u16,

    /// Local `host:port` the onion service forwards to
    pub target: String,

    /// Spread lookups across every reachable address
    #[serde(default)]
    pub load_balancing: bool,
}

/// Multi-instance supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedundancyConfig {
    pub instances: Vec<InstanceConfig>,
    pub services: Vec<HiddenServiceConfig>,

    pub health_check_interval_secs: u64,

    /// Consecutive failed cycles before an instance is marked failed
    pub failure_threshold: u32,

    pub min_healthy_instances: usize,

    pub port_probe_timeout_secs: u64,

    /// Service names whose reported failure forces an immediate re-check
    pub essential_services: Vec<String>,

    /// Path to a base torrc; the built-in template is used when absent
    pub config_template: Option<String>,

    /// Write derived torrc files during initialization
    pub write_instance_configs: bool,
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            instances: vec![
                InstanceConfig::roster_entry("primary", 9050, 1, None, false),
                InstanceConfig::roster_entry("secondary", 9060, 2, Some("us-east"), false),
                InstanceConfig::roster_entry("tertiary", 9070, 3, Some("eu-west"), false),
                InstanceConfig::roster_entry("standby", 9080, 4, None, true),
            ],
            services: vec![
                HiddenServiceConfig {
                    name: "main".to_string(),
                    virtual_port: 80,
                    target: "127.0.0.1:3000".to_string(),
                    load_balancing: false,
                },
                HiddenServiceConfig {
                    name: "api".to_string(),
                    virtual_port: 80,
                    target: "127.0.0.1:3001".to_string(),
                    load_balancing: true,
                },
            ],
            health_check_interval_secs: 30,
            failure_threshold: 3,
            min_healthy_instances: 2,
            port_probe_timeout_secs: 5,
            essential_services: vec!["tor".to_string()],
            config_template: None,
            write_instance_configs: true,
        }
    }
}

impl RedundancyConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn port_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.port_probe_timeout_secs)
    }
}
