//! Outbound HTTP clients
//!
//! An [`OutboundClient`] is bound to one transport. Anonymity-network
//! clients go through a `socks5h://` proxy so name resolution also happens
//! inside Tor, and send randomized fingerprint headers.
//!
//! Connection-refused and timeout failures wake the circuit rotation task
//! (when the client carries a rotation trigger) before the request is
//! retried.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::probe::probe_http;
use super::NetworkStats;
use crate::error::{HaError, Result};
use crate::fingerprint::HeaderProfile;
use crate::transport::{TrafficClass, Transport};

/// Base delay between connection-level retries
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// How to build an [`OutboundClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub transport: Transport,
    pub class: Option<TrafficClass>,

    /// SOCKS endpoint (`host`, `port`); required for the anonymity network
    pub proxy: Option<(String, u16)>,

    pub timeout: Duration,

    /// Connection-level retries after the first attempt
    pub retries: u32,

    /// Woken on connection-refused and timeout failures
    pub rotation: Option<Arc<Notify>>,
}

impl ClientOptions {
    /// Plain direct client with no retries
    pub fn direct(timeout: Duration) -> Self {
        Self {
            transport: Transport::Direct,
            class: None,
            proxy: None,
            timeout,
            retries: 0,
            rotation: None,
        }
    }

    /// Client routed through a SOCKS port
    pub fn anonymous(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            transport: Transport::AnonymityNetwork,
            class: None,
            proxy: Some((host.into(), port)),
            timeout,
            retries: 0,
            rotation: None,
        }
    }

    pub fn with_class(mut self, class: TrafficClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_rotation(mut self, rotation: Arc<Notify>) -> Self {
        self.rotation = Some(rotation);
        self
    }
}

/// HTTP client bound to one transport
#[derive(Debug, Clone)]
pub struct OutboundClient {
    inner: reqwest::Client,
    transport: Transport,
    class: Option<TrafficClass>,
    proxy_port: Option<u16>,
    timeout: Duration,
    retries: u32,
    rotation: Option<Arc<Notify>>,
    stats: Arc<Mutex<NetworkStats>>,
}

impl OutboundClient {
    /// Build a client from options
    pub fn build(options: ClientOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.timeout);

        let proxy_port = match (options.transport, &options.proxy) {
            (Transport::AnonymityNetwork, Some((host, port))) => {
                let proxy = reqwest::Proxy::all(format!("socks5h://{}:{}", host, port))
                    .map_err(|e| HaError::Config(format!("bad SOCKS proxy: {}", e)))?;
                builder = builder
                    .proxy(proxy)
                    .default_headers(HeaderProfile::randomized_headers());
                Some(*port)
            }
            (Transport::AnonymityNetwork, None) => {
                return Err(HaError::Config(
                    "anonymity-network client needs a SOCKS port".into(),
                ))
            }
            (Transport::Direct, _) => {
                builder = builder.no_proxy();
                None
            }
        };

        let inner = builder
            .build()
            .map_err(|e| HaError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            inner,
            transport: options.transport,
            class: options.class,
            proxy_port,
            timeout: options.timeout,
            retries: options.retries,
            rotation: options.rotation,
            stats: Arc::new(Mutex::new(NetworkStats::default())),
        })
    }

    /// Plain direct client
    pub fn direct(timeout: Duration) -> Result<Self> {
        Self::build(ClientOptions::direct(timeout))
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn class(&self) -> Option<TrafficClass> {
        self.class
    }

    /// SOCKS port this client goes through, if any
    pub fn proxy_port(&self) -> Option<u16> {
        self.proxy_port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Underlying reqwest client, for requests other than GET
    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats.lock().clone()
    }

    /// GET with connection-level retries
    ///
    /// HTTP error statuses are returned as responses, not retried.
    pub async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let mut last_error = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                log::warn!("Retry attempt {} for {}", attempt, url);
                self.stats.lock().retries += 1;
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }

            self.stats.lock().requests_attempted += 1;

            match self.inner.get(url).send().await {
                Ok(response) => {
                    self.stats.lock().requests_successful += 1;
                    return Ok(response);
                }
                Err(e) => {
                    self.stats.lock().requests_failed += 1;
                    let connection_level = e.is_connect() || e.is_timeout();
                    log::warn!(
                        "Request attempt {} to {} via {} failed: {}",
                        attempt + 1,
                        url,
                        self.transport,
                        e
                    );

                    let err = if e.is_timeout() {
                        HaError::timeout(format!("GET {}", url), self.timeout)
                    } else {
                        HaError::Http(e.to_string())
                    };

                    if !connection_level {
                        return Err(err);
                    }
                    self.request_rotation();
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| HaError::Http(format!("GET {} not attempted", url))))
    }

    /// Bounded reachability probe through this client
    pub async fn probe(&self, url: &str, timeout: Duration) -> Result<Duration> {
        let result = probe_http(&self.inner, url, timeout).await;
        if let Err(HaError::Timeout { .. }) | Err(HaError::ProxyUnreachable { .. }) = &result {
            self.request_rotation();
        }
        result
    }

    fn request_rotation(&self) {
        if let Some(rotation) = &self.rotation {
            log::debug!("🔄 Requesting circuit rotation after connection failure");
            self.stats.lock().rotations_requested += 1;
            rotation.notify_one();
        }
    }
}
