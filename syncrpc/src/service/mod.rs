//! The sync RPC service.
//!
//! [`RpcService`] ties the pieces together: it keeps one connection to every
//! other node of the topology, gates bulk writes through [`FlowControl`] and
//! hands every received message to the application through a single
//! inbound receiver.
//!
//! # Tasks
//!
//! `run()` starts three kinds of background tasks:
//!
//! - the **accept loop**, which registers connections initiated by nodes
//!   with a lower identifier once they have introduced themselves,
//! - the **reconnection scheduler**, which periodically opens connections
//!   toward nodes with a lower identifier that are not connected,
//! - a pool of **send workers**, which drain the queue filled by
//!   [`RpcService::enqueue`].
//!
//! Each connection additionally has its own task owning the socket. All of
//! them observe the shutdown signal.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::{ConnectionRegistry, ConnectionState, NodeChannel};
use crate::{
    FlowControl, JsonCodec, MessageCodec, MessageType, NetworkProvider, NodeId, NodeMessage,
    RpcConfig, RpcError, SyncMessage, Topology,
};

/// Per-connection socket task.
pub(crate) mod driver;

/// Inbound listener and handshake.
pub(crate) mod listener;

/// Periodic reconnection to lower-numbered nodes.
pub(crate) mod reconnect;

/// Worker pool draining the send queue.
pub(crate) mod worker;

/// Resolve once the shutdown signal is raised.
pub(crate) async fn stopped(signal: &mut watch::Receiver<bool>) {
    // A dropped sender also means the service is gone.
    let _ = signal.wait_for(|stopped| *stopped).await;
}

/// Receiving end of the inbound message stream.
pub type InboundReceiver = mpsc::UnboundedReceiver<(NodeId, SyncMessage)>;

/// State shared between the service handle and its tasks.
pub(crate) struct Shared<N: NetworkProvider, C: MessageCodec> {
    pub(crate) config: RpcConfig,
    pub(crate) topology: Arc<dyn Topology>,
    pub(crate) network: N,
    pub(crate) codec: C,
    pub(crate) flow: Arc<FlowControl>,
    pub(crate) registry: ConnectionRegistry,

    transaction_id: AtomicU32,
    started: AtomicBool,
    shut_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,

    inbound_tx: mpsc::UnboundedSender<(NodeId, SyncMessage)>,
    inbound_rx: Mutex<Option<InboundReceiver>>,

    send_tx: mpsc::UnboundedSender<NodeMessage>,
    send_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeMessage>>>,

    /// Accept loop, scheduler and workers.
    service_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// One per live connection.
    connection_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<N: NetworkProvider, C: MessageCodec> Shared<N, C> {
    pub(crate) fn local_node_id(&self) -> NodeId {
        self.registry.local_node_id()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn next_transaction_id(&self) -> u32 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Hand a received message to the application.
    pub(crate) fn deliver(&self, node_id: NodeId, message: SyncMessage) {
        if let Some(acknowledged) = message.message_type.acknowledges() {
            self.flow.acknowledge(acknowledged, node_id);
        }
        if self.inbound_tx.send((node_id, message)).is_err() {
            tracing::trace!(
                "[{}] inbound receiver dropped, discarding message from node {}",
                self.local_node_id(),
                node_id
            );
        }
    }

    pub(crate) fn track_connection(&self, handle: JoinHandle<()>) {
        let mut tasks = self
            .connection_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Register an established connection unless the service is stopping.
    pub(crate) fn node_connected(&self, node_id: NodeId, channel: NodeChannel) -> bool {
        if self.is_shut_down() {
            channel.close();
            return false;
        }
        self.registry.mark_connected(node_id, channel)
    }

    /// Write one message to a node, waiting for window capacity if needed.
    pub(crate) async fn write(
        &self,
        node_id: NodeId,
        message: SyncMessage,
        max_wait: Option<Duration>,
    ) -> bool {
        let Some(channel) = self.registry.channel(node_id) else {
            tracing::trace!(
                "[{}->{}] not connected, dropping {}",
                self.local_node_id(),
                node_id,
                message.message_type
            );
            return false;
        };

        let message_type = message.message_type;
        let Some(reservation) = self.flow.reserve(message_type, node_id, max_wait).await else {
            return false;
        };

        // The connection may have been replaced or torn down while waiting.
        let current = self
            .registry
            .channel(node_id)
            .is_some_and(|c| c.id() == channel.id());
        let sent = current && channel.send(message).is_ok();
        if !sent {
            tracing::debug!(
                "[{}->{}] connection lost before {} could be written",
                self.local_node_id(),
                node_id,
                message_type
            );
            reservation.cancel();
        }
        sent
    }
}

/// Connection manager and message gateway for one node of the cluster.
///
/// The handle is cheap to clone; every clone drives the same service.
///
/// # Example
///
/// ```rust,no_run
/// use syncrpc::{ClusterConfig, Node, RpcConfig, RpcService, TokioNetworkProvider};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let topology = ClusterConfig::new(
///     2,
///     vec![Node::new(1, "10.0.0.1", 9000), Node::new(2, "10.0.0.2", 9000)],
/// )?;
/// let service = RpcService::new(topology, TokioNetworkProvider::new(), RpcConfig::default());
/// let mut inbound = service.take_receiver().expect("receiver");
///
/// service.run().await?;
/// while let Some((node_id, message)) = inbound.recv().await {
///     println!("{} from node {}", message.message_type, node_id);
/// }
/// service.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct RpcService<N: NetworkProvider, C: MessageCodec = JsonCodec> {
    shared: Arc<Shared<N, C>>,
}

impl<N: NetworkProvider, C: MessageCodec> Clone for RpcService<N, C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<N: NetworkProvider> RpcService<N, JsonCodec> {
    /// Create a service that encodes messages as JSON.
    pub fn new(topology: impl Topology, network: N, config: RpcConfig) -> Self {
        Self::with_codec(topology, network, JsonCodec, config)
    }
}

impl<N: NetworkProvider, C: MessageCodec> RpcService<N, C> {
    /// Create a service with a custom message codec.
    ///
    /// Nothing happens on the network until [`RpcService::run`].
    pub fn with_codec(topology: impl Topology, network: N, codec: C, config: RpcConfig) -> Self {
        let flow = Arc::new(FlowControl::from_config(&config));
        let registry = ConnectionRegistry::new(topology.local_node_id(), flow.clone());
        let (shutdown_tx, _) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(Shared {
                config,
                topology: Arc::new(topology),
                network,
                codec,
                flow,
                registry,
                transaction_id: AtomicU32::new(0),
                started: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                shutdown_tx,
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                send_tx,
                send_rx: Mutex::new(Some(send_rx)),
                service_tasks: Mutex::new(Vec::new()),
                connection_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Identifier of the local node.
    pub fn local_node_id(&self) -> NodeId {
        self.shared.local_node_id()
    }

    /// Take the receiver of every message arriving from any node.
    ///
    /// Returns `None` after the first call. Messages received while nobody
    /// holds the receiver are buffered; once it is dropped they are
    /// discarded.
    pub fn take_receiver(&self) -> Option<InboundReceiver> {
        self.shared
            .inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Start the listener, the reconnection scheduler and the send workers.
    ///
    /// The first reconnection pass runs immediately.
    ///
    /// # Errors
    ///
    /// - [`RpcError::AlreadyStarted`] on a second call.
    /// - [`RpcError::ShutDown`] after [`RpcService::shutdown`].
    /// - [`RpcError::Bind`] if the listen address cannot be bound.
    pub async fn run(&self) -> Result<(), RpcError> {
        let shared = &self.shared;
        if shared.is_shut_down() {
            return Err(RpcError::ShutDown);
        }
        if shared.started.swap(true, Ordering::AcqRel) {
            return Err(RpcError::AlreadyStarted);
        }

        let address = format!(
            "{}:{}",
            shared.topology.listen_address().as_deref().unwrap_or("0.0.0.0"),
            shared.topology.local_port()
        );
        let bound = shared
            .network
            .bind(&address)
            .await
            .map_err(|source| RpcError::Bind {
                address: address.clone(),
                source,
            })?;
        tracing::info!(
            "[{}] sync RPC listening on {}",
            shared.local_node_id(),
            address
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(listener::accept_loop(shared.clone(), bound)));

        let queue = shared
            .send_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(queue) = queue {
            let queue = Arc::new(tokio::sync::Mutex::new(queue));
            for worker_id in 0..shared.config.send_workers.max(1) {
                tasks.push(tokio::spawn(worker::send_worker(
                    shared.clone(),
                    worker_id,
                    queue.clone(),
                )));
            }
        }

        tasks.push(tokio::spawn(reconnect::reconnect_loop(shared.clone())));

        shared
            .service_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        Ok(())
    }

    /// Stop every task and close every connection.
    ///
    /// Waits up to the configured shutdown grace period for tasks to exit
    /// and logs a warning if some did not. Calling it again does nothing.
    /// Messages still queued for the send workers are dropped.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let local = shared.local_node_id();
        tracing::debug!("[{}] shutting down sync RPC", local);

        shared.shutdown_tx.send_replace(true);
        let closed = shared.registry.close_all();
        tracing::debug!("[{}] closed {} node connections", local, closed);

        let mut tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *shared
                .service_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        tasks.extend(std::mem::take(
            &mut *shared
                .connection_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        ));

        let grace = shared.config.shutdown_grace;
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!(
                "[{}] failed to cleanly shut down sync RPC within {:?}",
                local,
                grace
            );
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!("[{}] sync RPC shut down", local);
    }

    /// Whether [`RpcService::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Next transaction id, unique per service until it wraps around.
    pub fn next_transaction_id(&self) -> u32 {
        self.shared.next_transaction_id()
    }

    /// Write a message to a node.
    ///
    /// Messages of windowed types wait while the node's window is full.
    /// Returns `false` without waiting if the node is not connected, and
    /// `false` if the connection goes away before the message is queued on
    /// it. A `true` result means the message was handed to the connection,
    /// not that the node received it.
    pub async fn write_to_node(&self, node_id: NodeId, message: SyncMessage) -> bool {
        self.shared.write(node_id, message, None).await
    }

    /// Like [`RpcService::write_to_node`], but gives up with `false` if
    /// window capacity does not free up within `max_wait`.
    pub async fn write_to_node_within(
        &self,
        node_id: NodeId,
        message: SyncMessage,
        max_wait: Duration,
    ) -> bool {
        self.shared.write(node_id, message, Some(max_wait)).await
    }

    /// Queue a message for the send workers and return immediately.
    ///
    /// Messages queued before [`RpcService::run`] are sent once workers
    /// start. A message whose node is not connected when a worker picks it
    /// up is dropped.
    ///
    /// # Errors
    ///
    /// [`RpcError::ShutDown`] once the workers are gone.
    pub fn enqueue(&self, node_id: NodeId, message: SyncMessage) -> Result<(), RpcError> {
        if self.shared.is_shut_down() {
            return Err(RpcError::ShutDown);
        }
        self.shared
            .send_tx
            .send(NodeMessage { node_id, message })
            .map_err(|_| RpcError::ShutDown)
    }

    /// Release window capacity for a message the node has acknowledged.
    ///
    /// Acknowledgments arriving on a connection are applied automatically;
    /// this is for callers that learn about acknowledgments another way.
    pub fn message_acked(&self, message_type: MessageType, node_id: NodeId) {
        self.shared.flow.acknowledge(message_type, node_id);
    }

    /// Tear down the connection to a node.
    ///
    /// Writers waiting for window capacity toward the node are released and
    /// their writes fail. The next reconnection pass reconnects if the
    /// local node is the initiator. Returns `true` if there was anything to
    /// tear down.
    pub fn disconnect_node(&self, node_id: NodeId) -> bool {
        self.shared.registry.disconnect(node_id)
    }

    /// Register a connection established by another node.
    ///
    /// The accept loop calls this after the handshake; a channel already
    /// registered for the node is closed. Returns `false` if the service is
    /// shutting down or the connection already closed.
    pub fn node_connected(&self, node_id: NodeId, channel: NodeChannel) -> bool {
        self.shared.node_connected(node_id, channel)
    }

    /// Whether there is an open connection to the node.
    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.shared.registry.is_connected(node_id)
    }

    /// Whether every node of the topology other than this one is connected.
    pub fn is_fully_connected(&self) -> bool {
        let shared = &self.shared;
        let local = shared.local_node_id();
        let mut fully_connected = true;
        for node in shared.topology.nodes() {
            if node.node_id == local {
                continue;
            }
            if !shared.registry.is_connected(node.node_id) {
                tracing::trace!("[{}->{}] not connected", local, node.node_id);
                fully_connected = false;
            }
        }
        fully_connected
    }

    /// Connection state of a node, `None` if the registry has no entry.
    pub fn connection_state(&self, node_id: NodeId) -> Option<ConnectionState> {
        self.shared.registry.get(node_id)
    }

    /// Nodes with an open connection.
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.shared.registry.connected_nodes()
    }

    /// The service's flow controller.
    pub fn flow_control(&self) -> &FlowControl {
        &self.shared.flow
    }

    /// The service's connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    /// Run one reconnection pass now, returning the number of attempts
    /// started.
    pub fn reconnect_now(&self) -> usize {
        reconnect::reconnect_pass(&self.shared)
    }
}
