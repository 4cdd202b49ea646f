//! Roster entries and their health state machine
//!
//! ```text
//! unknown ─▶ active ⇄ failed      (failed needs threshold consecutive errors)
//! standby ─▶ active               (promotion only)
//! ```
//!
//! A success sets `active` and takes one off the error counter. A failure
//! below the threshold drops an active instance back to `unknown`, so
//! `active` always means the latest probe passed.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::InstanceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Standby,
    Failed,
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Standby => "standby",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One supervised Tor daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnonymityInstance {
    pub id: String,
    pub name: String,
    pub proxy_port: u16,
    pub control_port: u16,
    pub data_dir: String,
    pub config_path: String,
    pub status: InstanceStatus,
    pub priority: u32,
    pub region: Option<String>,
    pub consecutive_errors: u32,
    pub last_health_check: Option<u64>,
    /// Cumulative time spent active, in milliseconds
    pub uptime_ms: u64,
    pub hidden_services: Vec<String>,
}

impl AnonymityInstance {
    pub fn from_config(config: &InstanceConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            proxy_port: config.proxy_port,
            control_port: config.control_port,
            data_dir: config.data_dir.clone(),
            config_path: config.config_path.clone(),
            status: if config.standby {
                InstanceStatus::Standby
            } else {
                InstanceStatus::Unknown
            },
            priority: config.priority,
            region: config.region.clone(),
            consecutive_errors: 0,
            last_health_check: None,
            uptime_ms: 0,
            hidden_services: config.hidden_services.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    pub fn hosts(&self, service: &str) -> bool {
        self.hidden_services.iter().any(|s| s == service)
    }

    /// Apply one probe result at time `now`
    ///
    /// Returns true when this failure pushed the instance into `failed`.
    pub fn record_probe(&mut self, healthy: bool, threshold: u32, now: u64) -> bool {
        self.accrue_uptime(now);

        if healthy {
            self.status = InstanceStatus::Active;
            self.consecutive_errors = self.consecutive_errors.saturating_sub(1);
            return false;
        }

        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.consecutive_errors >= threshold {
            let crossed = self.status != InstanceStatus::Failed;
            self.status = InstanceStatus::Failed;
            return crossed;
        }

        if self.status == InstanceStatus::Active {
            self.status = InstanceStatus::Unknown;
        }
        false
    }

    /// Bring a standby instance into service
    pub fn promote(&mut self, now: u64) {
        self.status = InstanceStatus::Active;
        self.consecutive_errors = 0;
        self.last_health_check = Some(now);
    }

    fn accrue_uptime(&mut self, now: u64) {
        if let (InstanceStatus::Active, Some(last)) = (self.status, self.last_health_check) {
            self.uptime_ms += now.saturating_sub(last);
        }
        self.last_health_check = Some(now);
    }
}
