//! Shared helpers for service integration tests.
//!
//! [`MemoryNetwork`] implements [`NetworkProvider`] on in-process duplex
//! pipes. Listeners are keyed by port, so `0.0.0.0:7001` and
//! `127.0.0.1:7001` reach the same listener. Ports can be made to refuse
//! connections, and connect attempts are counted per target port.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use syncrpc::{
    ClusterConfig, NetworkProvider, Node, RpcConfig, RpcService, TcpListenerTrait,
};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;

type Incoming = (DuplexStream, String);

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<u16, mpsc::UnboundedSender<Incoming>>,
    refused: HashSet<u16>,
    attempts: HashMap<u16, usize>,
    next_peer: usize,
}

/// In-memory network shared by every service of a test.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every connection to `port` until [`MemoryNetwork::allow`].
    pub fn refuse(&self, port: u16) {
        self.state.lock().expect("network state").refused.insert(port);
    }

    pub fn allow(&self, port: u16) {
        self.state.lock().expect("network state").refused.remove(&port);
    }

    /// Number of connect calls made toward `port`.
    pub fn connect_attempts(&self, port: u16) -> usize {
        self.state
            .lock()
            .expect("network state")
            .attempts
            .get(&port)
            .copied()
            .unwrap_or(0)
    }
}

fn port_of(addr: &str) -> io::Result<u16> {
    addr.rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("bad address {addr}")))
}

fn refused(addr: &str) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, format!("{addr} refused"))
}

#[async_trait]
impl NetworkProvider for MemoryNetwork {
    type TcpStream = DuplexStream;
    type TcpListener = MemoryListener;

    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener> {
        let port = port_of(addr)?;
        let mut state = self.state.lock().expect("network state");
        if state.listeners.get(&port).is_some_and(|tx| !tx.is_closed()) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(port, tx);
        Ok(MemoryListener {
            incoming: tokio::sync::Mutex::new(rx),
            addr: addr.to_string(),
        })
    }

    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream> {
        let port = port_of(addr)?;
        let mut state = self.state.lock().expect("network state");
        *state.attempts.entry(port).or_default() += 1;
        if state.refused.contains(&port) {
            return Err(refused(addr));
        }
        state.next_peer += 1;
        let peer = format!("memory:{}", state.next_peer);
        let listener = state.listeners.get(&port).ok_or_else(|| refused(addr))?;

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        listener.send((server, peer)).map_err(|_| refused(addr))?;
        Ok(client)
    }
}

/// Listener half of [`MemoryNetwork`].
pub struct MemoryListener {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    addr: String,
}

#[async_trait]
impl TcpListenerTrait for MemoryListener {
    type TcpStream = DuplexStream;

    async fn accept(&self) -> io::Result<(Self::TcpStream, String)> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::other("network dropped"))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.addr.clone())
    }
}

/// Port of node `id` in test topologies.
pub fn port(id: u16) -> u16 {
    7000 + id
}

/// Topology with every node on localhost at [`port`].
pub fn topology(local: u16, ids: &[u16]) -> ClusterConfig {
    let nodes = ids
        .iter()
        .map(|&id| Node::new(id, "127.0.0.1", port(id)))
        .collect();
    ClusterConfig::new(local, nodes).expect("valid topology")
}

pub fn test_config() -> RpcConfig {
    RpcConfig::local_network()
}

/// Start one service per id over a shared network.
pub async fn start_cluster(
    network: &MemoryNetwork,
    ids: &[u16],
    config: RpcConfig,
) -> Vec<RpcService<MemoryNetwork>> {
    let mut services = Vec::new();
    for &id in ids {
        let service = RpcService::new(topology(id, ids), network.clone(), config.clone());
        service.run().await.expect("service starts");
        services.push(service);
    }
    services
}

pub async fn shutdown_all(services: &[RpcService<MemoryNetwork>]) {
    for service in services {
        service.shutdown().await;
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Multi-threaded runtime for service tests.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
