//! Error types for the HA connectivity layer
//!
//! This module provides the error taxonomy shared by the circuit,
//! failover and redundancy managers:
//! - Detailed error variants for each failure mode
//! - Error classification (retryable vs policy violations)
//! - Error codes for programmatic handling

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{TrafficClass, Transport};

pub type Result<T> = std::result::Result<T, HaError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    ProxyUnreachable = 100,
    ConnectionTimeout = 101,
    HttpFailed = 102,

    // Control protocol errors (2xx)
    ControlAuthFailed = 200,
    ControlCommandFailed = 201,
    ControlProtocolViolation = 202,

    // Policy errors (3xx)
    NoFallbackAvailable = 300,
    FallbackProhibited = 301,
    AllTransportsFailed = 302,

    // Redundancy errors (4xx)
    InstanceNotActive = 400,
    UnknownInstance = 401,
    InsufficientHealthyInstances = 402,
    UnknownService = 403,

    // Configuration errors (8xx)
    ConfigError = 800,

    // Internal errors (9xx)
    IoError = 900,
    NotInitialized = 901,
}

/// Main error type for the HA connectivity layer
#[derive(Error, Debug, Clone)]
pub enum HaError {
    // ===== Connection Errors =====
    #[error("Proxy at {addr} unreachable: {reason}")]
    ProxyUnreachable { addr: String, reason: String },

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(String),

    // ===== Control Protocol Errors =====
    #[error("Control port authentication failed: {0}")]
    ControlAuthFailed(String),

    #[error("Control command '{command}' failed: {reply}")]
    ControlCommandFailed { command: String, reply: String },

    #[error("Control protocol error: {0}")]
    ControlProtocol(String),

    // ===== Policy Errors =====
    #[error("No fallback transport configured for {class}")]
    NoFallbackAvailable { class: TrafficClass },

    #[error("Transport {requested} prohibited for {class}")]
    FallbackProhibited {
        class: TrafficClass,
        requested: Transport,
    },

    #[error("All transports failed for {class}: primary={primary_error}, fallback={fallback_error}")]
    AllTransportsFailed {
        class: TrafficClass,
        primary_error: String,
        fallback_error: String,
    },

    // ===== Redundancy Errors =====
    #[error("Instance {id} is not active (status: {status})")]
    InstanceNotActive { id: String, status: String },

    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    #[error("Insufficient healthy instances: {active} active, {required} required")]
    InsufficientHealthyInstances { active: usize, required: usize },

    #[error("Unknown hidden service: {0}")]
    UnknownService(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    // ===== Internal Errors =====
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Circuit manager not initialized")]
    NotInitialized,
}

impl HaError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            // Connection
            HaError::ProxyUnreachable { .. } => ErrorCode::ProxyUnreachable,
            HaError::Timeout { .. } => ErrorCode::ConnectionTimeout,
            HaError::Http(_) => ErrorCode::HttpFailed,

            // Control protocol
            HaError::ControlAuthFailed(_) => ErrorCode::ControlAuthFailed,
            HaError::ControlCommandFailed { .. } => ErrorCode::ControlCommandFailed,
            HaError::ControlProtocol(_) => ErrorCode::ControlProtocolViolation,

            // Policy
            HaError::NoFallbackAvailable { .. } => ErrorCode::NoFallbackAvailable,
            HaError::FallbackProhibited { .. } => ErrorCode::FallbackProhibited,
            HaError::AllTransportsFailed { .. } => ErrorCode::AllTransportsFailed,

            // Redundancy
            HaError::InstanceNotActive { .. } => ErrorCode::InstanceNotActive,
            HaError::UnknownInstance(_) => ErrorCode::UnknownInstance,
            HaError::InsufficientHealthyInstances { .. } => {
                ErrorCode::InsufficientHealthyInstances
            }
            HaError::UnknownService(_) => ErrorCode::UnknownService,

            // Config
            HaError::Config(_) => ErrorCode::ConfigError,

            // Internal
            HaError::Io(_) => ErrorCode::IoError,
            HaError::NotInitialized => ErrorCode::NotInitialized,
        }
    }

    /// Whether the next scheduled tick may succeed where this one failed
    ///
    /// Retryable errors are transient network or daemon issues. Policy
    /// violations and configuration errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HaError::ProxyUnreachable { .. }
                | HaError::Timeout { .. }
                | HaError::Http(_)
                | HaError::ControlCommandFailed { .. }
                | HaError::ControlProtocol(_)
                | HaError::AllTransportsFailed { .. }
                | HaError::InsufficientHealthyInstances { .. }
                | HaError::Io(_)
        )
    }

    /// Whether this error is a routing-policy violation raised to the caller
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            HaError::NoFallbackAvailable { .. } | HaError::FallbackProhibited { .. }
        )
    }

    /// Build a timeout error for a named operation
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        HaError::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }
}

impl From<std::io::Error> for HaError {
    fn from(err: std::io::Error) -> Self {
        HaError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for HaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HaError::Timeout {
                operation: "HTTP request".into(),
                after_ms: 0,
            }
        } else {
            HaError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for HaError {
    fn from(err: serde_json::Error) -> Self {
        HaError::Config(err.to_string())
    }
}
