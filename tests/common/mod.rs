//! Shared fakes for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tor_ha::{
    AnonymityInstance, CircuitConfig, ConnectivityProbe, HaError, HaEvent, InstanceConfig,
    InstanceProber, OutboundClient, Result, Transport,
};

pub const PASSWORD: &str = "correct horse";

const GETINFO_REPLY: &str = "250+circuit-status=\r\n\
1 BUILT $AAAA~a,$BBBB~b,$CCCC~c PURPOSE=GENERAL\r\n\
2 BUILT $DDDD~d,$EEEE~e,$FFFF~f PURPOSE=GENERAL\r\n\
.\r\n\
250-traffic/read=123456\r\n\
250-traffic/written=654321\r\n\
250 OK\r\n";

/// A Tor stand-in: an accepting SOCKS port and a scripted control port
pub struct FakeDaemon {
    pub proxy_port: u16,
    pub control_port: u16,
    commands: Arc<Mutex<Vec<String>>>,
    proxy_task: Option<JoinHandle<()>>,
    control_task: Option<JoinHandle<()>>,
}

impl FakeDaemon {
    pub async fn start() -> Self {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = proxy.local_addr().unwrap().port();
        let control_port = control.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));

        let proxy_task = tokio::spawn(async move {
            while let Ok((socket, _)) = proxy.accept().await {
                drop(socket);
            }
        });

        let control_task = spawn_control(control, Arc::clone(&commands));

        Self {
            proxy_port,
            control_port,
            commands,
            proxy_task: Some(proxy_task),
            control_task: Some(control_task),
        }
    }

    /// Close the control port
    pub async fn stop_control(&mut self) {
        if let Some(task) = self.control_task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    /// Listen on the same control port again
    pub async fn restart_control(&mut self) {
        self.stop_control().await;
        let control = TcpListener::bind(("127.0.0.1", self.control_port))
            .await
            .unwrap();
        self.control_task = Some(spawn_control(control, Arc::clone(&self.commands)));
    }

    /// Close both ports
    pub async fn stop(&mut self) {
        self.stop_control().await;
        if let Some(task) = self.proxy_task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Circuit config pointing at this daemon
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            proxy_port: self.proxy_port,
            control_port: self.control_port,
            control_password: Some(PASSWORD.to_string()),
            rotation_settle_ms: 0,
            hostname_path: None,
            health_check_interval_secs: 3600,
            rotation_interval_secs: 3600,
            control_timeout_secs: 2,
            proxy_probe_timeout_secs: 2,
            ..CircuitConfig::default()
        }
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        for task in [self.proxy_task.take(), self.control_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

fn spawn_control(control: TcpListener, log: Arc<Mutex<Vec<String>>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((socket, _)) = control.accept().await {
            tokio::spawn(serve_control(socket, Arc::clone(&log)));
        }
    })
}

async fn serve_control(socket: TcpStream, log: Arc<Mutex<Vec<String>>>) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut authenticated = false;

    while let Ok(Some(line)) = lines.next_line().await {
        log.lock().push(line.clone());

        let reply = if line.starts_with("AUTHENTICATE") {
            if line == format!("AUTHENTICATE \"{}\"", PASSWORD) {
                authenticated = true;
                "250 OK\r\n"
            } else {
                "515 Authentication failed: Password did not match\r\n"
            }
        } else if line == "QUIT" {
            let _ = write.write_all(b"250 closing connection\r\n").await;
            return;
        } else if !authenticated {
            "514 Authentication required.\r\n"
        } else if line == "SIGNAL NEWNYM" {
            "250 OK\r\n"
        } else if line.starts_with("GETINFO") {
            GETINFO_REPLY
        } else {
            "510 Unrecognized command\r\n"
        };

        if write.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Port nobody listens on
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Instance prober driven by the test
#[derive(Default)]
pub struct ScriptedProber {
    unhealthy: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    end_to_end_calls: Mutex<Vec<String>>,
}

impl ScriptedProber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_healthy(&self, id: &str, healthy: bool) {
        let mut unhealthy = self.unhealthy.lock();
        if healthy {
            unhealthy.remove(id);
        } else {
            unhealthy.insert(id.to_string());
        }
    }

    pub fn set_delay(&self, id: &str, delay: Duration) {
        self.delays.lock().insert(id.to_string(), delay);
    }

    pub fn end_to_end_calls(&self) -> Vec<String> {
        self.end_to_end_calls.lock().clone()
    }

    fn check(&self, instance: &AnonymityInstance) -> Result<()> {
        if self.unhealthy.lock().contains(&instance.id) {
            return Err(HaError::ProxyUnreachable {
                addr: format!("127.0.0.1:{}", instance.proxy_port),
                reason: "scripted failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceProber for ScriptedProber {
    async fn probe_ports(&self, instance: &AnonymityInstance) -> Result<()> {
        let delay = self.delays.lock().get(&instance.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(instance)
    }

    async fn end_to_end(&self, instance: &AnonymityInstance) -> Result<()> {
        self.end_to_end_calls.lock().push(instance.id.clone());
        self.check(instance)
    }

    async fn onion_address(&self, instance: &AnonymityInstance, service: &str) -> Option<String> {
        Some(format!("{}-{}.onion", instance.id, service))
    }
}

/// Connectivity probe failing on chosen transports
#[derive(Default)]
pub struct ScriptedConnectivity {
    failing: Mutex<HashSet<Transport>>,
}

impl ScriptedConnectivity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, transport: Transport, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(transport);
        } else {
            set.remove(&transport);
        }
    }
}

#[async_trait]
impl ConnectivityProbe for ScriptedConnectivity {
    async fn probe(
        &self,
        client: &OutboundClient,
        endpoint: &str,
        _timeout: Duration,
    ) -> Result<Duration> {
        if self.failing.lock().contains(&client.transport()) {
            return Err(HaError::Http(format!("{} unreachable", endpoint)));
        }
        Ok(Duration::from_millis(15))
    }
}

/// Roster entry with made-up ports
pub fn roster_entry(id: &str, base_port: u16, priority: u32, standby: bool) -> InstanceConfig {
    InstanceConfig {
        id: id.to_string(),
        name: format!("tor-{}", id),
        proxy_port: base_port,
        control_port: base_port + 1,
        data_dir: format!("/tmp/tor-ha-test/{}", id),
        config_path: format!("/tmp/tor-ha-test/torrc.{}", id),
        priority,
        region: None,
        standby,
        hidden_services: vec!["main".to_string(), "api".to_string()],
    }
}

/// Everything currently queued on a receiver
pub fn drain(rx: &mut broadcast::Receiver<HaEvent>) -> Vec<HaEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
