//! The connection registry: one [`NodeConnection`] per remote node.
//!
//! Every state transition happens under the registry's write lock.
//! Connectivity queries take the read lock and see the state as of the last
//! completed transition.
//!
//! Disconnecting a node also tears down its flow-control window while the
//! write lock is held, so no sender can find the node connected after its
//! window has been released. Lock order is registry, then flow control;
//! flow control never calls back into the registry.
//!
//! After [`ConnectionRegistry::close_all`] the registry stays closed: new
//! attempts are not started and late connections are closed instead of
//! registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::task::AbortHandle;

use super::channel::NodeChannel;
use super::state::{ConnectAttempt, ConnectionState, NodeConnection};
use crate::{FlowControl, Node, NodeId};

/// Map from node id to connection state.
#[derive(Debug)]
pub struct ConnectionRegistry {
    local_node_id: NodeId,
    connections: RwLock<HashMap<NodeId, NodeConnection>>,
    flow: Arc<FlowControl>,
    next_attempt_id: AtomicU64,
    /// Set by `close_all` while holding the write lock.
    closed: AtomicBool,
}

impl ConnectionRegistry {
    /// Create an empty registry for the given local node.
    pub fn new(local_node_id: NodeId, flow: Arc<FlowControl>) -> Self {
        Self {
            local_node_id,
            connections: RwLock::new(HashMap::new()),
            flow,
            next_attempt_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Identifier of the local node.
    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Whether the local node opens the connection to `node_id`.
    ///
    /// Only the node with the higher identifier of a pair initiates, so each
    /// pair ends up with exactly one connection.
    pub fn initiates_to(&self, node_id: NodeId) -> bool {
        node_id < self.local_node_id
    }

    /// Start a connect attempt toward `node` if appropriate.
    ///
    /// Does nothing unless the local node initiates toward `node` and the
    /// node is in [`ConnectionState::None`]. Otherwise calls `start` with a
    /// fresh attempt id while holding the lock, records the returned handle
    /// and moves the node to [`ConnectionState::Pending`]. `start` must only
    /// spawn the attempt, not run it.
    ///
    /// The attempt reports back through [`ConnectionRegistry::attempt_succeeded`]
    /// or [`ConnectionRegistry::attempt_failed`].
    pub fn connect<F>(&self, node: &Node, start: F) -> bool
    where
        F: FnOnce(u64) -> AbortHandle,
    {
        if !self.initiates_to(node.node_id) {
            return false;
        }

        let mut connections = self.write();
        if self.is_closed() {
            return false;
        }
        let connection = connections.entry(node.node_id).or_default();

        tracing::trace!(
            "[{}->{}] connection state: {:?}",
            self.local_node_id,
            node.node_id,
            connection.state()
        );
        if connection.state() != ConnectionState::None {
            return false;
        }

        tracing::debug!(
            "[{}->{}] attempting connection to {}",
            self.local_node_id,
            node.node_id,
            node.address()
        );
        let id = self.next_attempt_id.fetch_add(1, Ordering::Relaxed);
        let handle = start(id);
        connection.set_pending(ConnectAttempt { id, handle });
        true
    }

    /// Record the successful completion of attempt `attempt_id`.
    ///
    /// If the node was disconnected or the attempt superseded in the
    /// meantime, the new channel is closed and `false` is returned.
    pub fn attempt_succeeded(
        &self,
        node_id: NodeId,
        attempt_id: u64,
        channel: NodeChannel,
    ) -> bool {
        let mut connections = self.write();
        if self.is_closed() {
            channel.close();
            return false;
        }
        let current = connections
            .get_mut(&node_id)
            .filter(|c| c.attempt.as_ref().map(|a| a.id) == Some(attempt_id));

        match current {
            Some(_) if channel.is_closed() => {
                tracing::debug!(
                    "[{}->{}] connection closed before it was registered",
                    self.local_node_id,
                    node_id
                );
                connections.remove(&node_id);
                false
            }
            Some(connection) => {
                connection.attempt = None;
                if let Some(displaced) = connection.set_connected(channel) {
                    displaced.close();
                }
                tracing::debug!("[{}->{}] connection established", self.local_node_id, node_id);
                true
            }
            None => {
                tracing::debug!(
                    "[{}->{}] connect attempt {} completed after being superseded",
                    self.local_node_id,
                    node_id,
                    attempt_id
                );
                channel.close();
                false
            }
        }
    }

    /// Record the failure of attempt `attempt_id`, returning the node to
    /// [`ConnectionState::None`] so the next reconnection pass retries it.
    pub fn attempt_failed(&self, node_id: NodeId, attempt_id: u64) -> bool {
        let mut connections = self.write();
        let matches = connections
            .get(&node_id)
            .and_then(|c| c.attempt.as_ref())
            .is_some_and(|a| a.id == attempt_id);
        if matches {
            connections.remove(&node_id);
        }
        matches
    }

    /// Record an established connection, creating the entry if needed.
    ///
    /// Used for inbound connections, which arrive without a prior attempt.
    /// A previously registered channel for the node is closed. A channel
    /// whose connection task already exited is not registered, and neither
    /// is any channel once the registry is closed.
    pub fn mark_connected(&self, node_id: NodeId, channel: NodeChannel) -> bool {
        let mut connections = self.write();
        if self.is_closed() {
            tracing::debug!(
                "[{}->{}] registry closed, dropping connection",
                self.local_node_id,
                node_id
            );
            channel.close();
            return false;
        }
        if channel.is_closed() {
            return false;
        }
        let connection = connections.entry(node_id).or_default();
        if let Some(displaced) = connection.set_connected(channel) {
            tracing::debug!(
                "[{}->{}] replacing existing connection",
                self.local_node_id,
                node_id
            );
            displaced.close();
        }
        tracing::debug!("[{}->{}] connection established", self.local_node_id, node_id);
        true
    }

    /// Tear down everything known about a node.
    ///
    /// Releases the node's flow-control window and its waiters, cancels any
    /// connect attempt, closes any open channel and removes the entry, all
    /// under one write lock. Returns `true` if there was an entry.
    pub fn disconnect(&self, node_id: NodeId) -> bool {
        let mut connections = self.write();
        self.teardown_locked(&mut connections, node_id)
    }

    /// Disconnect the node only if `channel_id` is still its open channel.
    ///
    /// Called by a connection task when its socket closes, so a stale task
    /// cannot tear down a newer connection.
    pub fn channel_closed(&self, node_id: NodeId, channel_id: u64) -> bool {
        let mut connections = self.write();
        let current = connections
            .get(&node_id)
            .and_then(|c| c.channel())
            .is_some_and(|c| c.id() == channel_id);
        current && self.teardown_locked(&mut connections, node_id)
    }

    /// Disconnect every node and refuse new connections from now on.
    /// Returns the number of entries removed.
    pub fn close_all(&self) -> usize {
        let mut connections = self.write();
        self.closed.store(true, Ordering::Release);
        let nodes: Vec<NodeId> = connections.keys().copied().collect();
        nodes
            .into_iter()
            .filter(|node_id| self.teardown_locked(&mut connections, *node_id))
            .count()
    }

    /// Whether [`ConnectionRegistry::close_all`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the node is in [`ConnectionState::Connected`].
    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.get(node_id) == Some(ConnectionState::Connected)
    }

    /// The node's state, or `None` if the registry has no entry for it.
    pub fn get(&self, node_id: NodeId) -> Option<ConnectionState> {
        self.read().get(&node_id).map(NodeConnection::state)
    }

    /// Open channel to the node, if connected.
    pub fn channel(&self, node_id: NodeId) -> Option<NodeChannel> {
        self.read()
            .get(&node_id)
            .filter(|c| c.state() == ConnectionState::Connected)
            .and_then(|c| c.channel().cloned())
    }

    /// Nodes currently connected.
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.read()
            .iter()
            .filter(|(_, c)| c.state() == ConnectionState::Connected)
            .map(|(id, _)| *id)
            .collect()
    }

    fn teardown_locked(
        &self,
        connections: &mut HashMap<NodeId, NodeConnection>,
        node_id: NodeId,
    ) -> bool {
        self.flow.disconnect(node_id);
        match connections.remove(&node_id) {
            Some(mut connection) => {
                connection.teardown();
                tracing::debug!("[{}->{}] disconnected", self.local_node_id, node_id);
                true
            }
            None => false,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, NodeConnection>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, NodeConnection>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
