//! Reachability probes
//!
//! Both probes carry their own deadline; a probe that runs past it is a
//! failure and is not retried inline.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::error::{HaError, Result};

/// Resolve `host:port` to its first socket address
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| HaError::ProxyUnreachable {
            addr: format!("{}:{}", host, port),
            reason: format!("cannot resolve: {}", e),
        })?;

    addrs.next().ok_or_else(|| HaError::ProxyUnreachable {
        addr: format!("{}:{}", host, port),
        reason: "no addresses".into(),
    })
}

/// Open (and immediately drop) a raw TCP connection
///
/// Returns the connect latency.
pub async fn probe_tcp(addr: SocketAddr, timeout: Duration) -> Result<Duration> {
    let start = Instant::now();

    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(start.elapsed())
        }
        Ok(Err(e)) => Err(HaError::ProxyUnreachable {
            addr: addr.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(HaError::ProxyUnreachable {
            addr: addr.to_string(),
            reason: format!("no answer within {}ms", timeout.as_millis()),
        }),
    }
}

/// Bounded GET; any status below 500 counts as reachable
///
/// Returns the response latency.
pub async fn probe_http(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Duration> {
    let start = Instant::now();

    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                HaError::timeout(format!("GET {}", url), timeout)
            } else if e.is_connect() {
                HaError::ProxyUnreachable {
                    addr: url.to_string(),
                    reason: e.to_string(),
                }
            } else {
                HaError::Http(e.to_string())
            }
        })?;

    let status = response.status();
    if status.is_server_error() {
        return Err(HaError::Http(format!("{} answered {}", url, status)));
    }

    Ok(start.elapsed())
}
