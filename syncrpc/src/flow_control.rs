//! Per-node admission windows for bulk message types.
//!
//! A window caps how many messages of the windowed types may be written to
//! a node before the node acknowledges them. Senders that find the window
//! full wait until an acknowledgment frees capacity or the node is
//! disconnected.
//!
//! The cap is soft: the capacity check and the increment are two separate
//! atomic steps, so concurrent admitters that all observed free capacity
//! may push the count past the maximum by up to their number. Only the
//! shape of backpressure depends on the cap, so exactness is not enforced.
//!
//! # Wakeups
//!
//! Acknowledgments wake every waiter of the window rather than one: an
//! acknowledgment may free room for several messages, and a disconnect must
//! release everyone. Waiters register for the wakeup before re-checking the
//! predicate, so no notification can slip between check and wait.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{MessageType, NodeId, RpcConfig};

/// Outstanding-message state for one remote node.
#[derive(Debug, Default)]
pub struct MessageWindow {
    /// Admitted but not yet acknowledged windowed messages.
    pending: AtomicUsize,

    /// Set once when the node is disconnected; releases all waiters.
    disconnected: AtomicBool,

    /// Signaled when capacity frees up or the node disconnects.
    capacity: Notify,
}

impl MessageWindow {
    /// Number of admitted, unacknowledged messages.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the window's node has been disconnected.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn admits(&self, max_pending: usize) -> bool {
        self.is_disconnected() || self.pending() < max_pending
    }

    /// Give back one unit of capacity and wake waiters if there is room.
    fn release(&self, max_pending: usize) {
        let previous = match self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                Some(p.saturating_sub(1))
            }) {
            Ok(p) | Err(p) => p,
        };

        if previous.saturating_sub(1) < max_pending {
            self.capacity.notify_waiters();
        }
    }
}

/// Capacity taken by one admitted message.
///
/// Dropping a reservation keeps the capacity in use until the node
/// acknowledges the message. [`Reservation::cancel`] returns it to the
/// exact window it was taken from, which matters once the node has been
/// disconnected and given a fresh window in the meantime.
#[derive(Debug)]
#[must_use = "dropping a reservation leaves the capacity taken"]
pub struct Reservation {
    window: Option<Arc<MessageWindow>>,
    max_pending: usize,
}

impl Reservation {
    /// Give the capacity back because the message was never sent.
    pub fn cancel(self) {
        if let Some(window) = self.window {
            window.release(self.max_pending);
        }
    }
}

/// Admission controller holding one [`MessageWindow`] per node.
///
/// Windows are created lazily on first admission and dropped on
/// [`FlowControl::disconnect`].
#[derive(Debug)]
pub struct FlowControl {
    max_pending: usize,
    windowed_types: HashSet<MessageType>,
    windows: Mutex<HashMap<NodeId, Arc<MessageWindow>>>,
}

impl FlowControl {
    /// Create a controller with the given window size and windowed types.
    pub fn new(max_pending: usize, windowed_types: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            max_pending,
            windowed_types: windowed_types.into_iter().collect(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Create a controller from the service configuration.
    pub fn from_config(config: &RpcConfig) -> Self {
        Self::new(
            config.max_pending_messages,
            config.windowed_types.iter().copied(),
        )
    }

    /// Maximum number of outstanding windowed messages per node.
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Whether messages of this type are subject to the window.
    pub fn is_windowed(&self, message_type: MessageType) -> bool {
        self.windowed_types.contains(&message_type)
    }

    /// Pending count for a node, or 0 if it has no window.
    pub fn pending(&self, node_id: NodeId) -> usize {
        self.existing(node_id).map(|w| w.pending()).unwrap_or(0)
    }

    /// Whether a window currently exists for the node.
    pub fn has_window(&self, node_id: NodeId) -> bool {
        self.existing(node_id).is_some()
    }

    /// Reserve window capacity for one message.
    ///
    /// Non-windowed types are admitted immediately. Windowed types wait
    /// while the node's window is full, unless the node is disconnected, in
    /// which case admission succeeds and the following write fails instead.
    ///
    /// Returns `false` only if `max_wait` elapses first. With `None` the
    /// wait is unbounded.
    pub async fn admit(
        &self,
        message_type: MessageType,
        node_id: NodeId,
        max_wait: Option<Duration>,
    ) -> bool {
        self.reserve(message_type, node_id, max_wait).await.is_some()
    }

    /// Like [`FlowControl::admit`], but returns the taken capacity so a
    /// message that cannot be sent can give it back.
    ///
    /// Returns `None` if `max_wait` elapses first.
    pub async fn reserve(
        &self,
        message_type: MessageType,
        node_id: NodeId,
        max_wait: Option<Duration>,
    ) -> Option<Reservation> {
        if !self.is_windowed(message_type) {
            return Some(Reservation {
                window: None,
                max_pending: self.max_pending,
            });
        }

        let window = self.window(node_id);
        let deadline = max_wait.map(|wait| Instant::now() + wait);

        loop {
            let notified = window.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if window.admits(self.max_pending) {
                break;
            }

            tracing::trace!(
                "flow control: window for node {} full ({} pending), waiting",
                node_id,
                window.pending()
            );

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        tracing::debug!(
                            "flow control: admission of {} to node {} timed out",
                            message_type,
                            node_id
                        );
                        return None;
                    }
                }
                None => notified.await,
            }
        }

        window.pending.fetch_add(1, Ordering::AcqRel);
        Some(Reservation {
            window: Some(window),
            max_pending: self.max_pending,
        })
    }

    /// Release one unit of capacity for a windowed message type.
    ///
    /// Ignored for non-windowed types and for nodes without a window. The
    /// count never drops below zero.
    pub fn acknowledge(&self, message_type: MessageType, node_id: NodeId) {
        if !self.is_windowed(message_type) {
            return;
        }
        if let Some(window) = self.existing(node_id) {
            window.release(self.max_pending);
        }
    }

    /// Drop the node's window and release every waiter on it.
    ///
    /// Returns `true` if a window existed.
    pub fn disconnect(&self, node_id: NodeId) -> bool {
        let removed = self
            .windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node_id);

        match removed {
            Some(window) => {
                window.disconnected.store(true, Ordering::Release);
                window.capacity.notify_waiters();
                tracing::trace!("flow control: released window for node {}", node_id);
                true
            }
            None => false,
        }
    }

    fn window(&self, node_id: NodeId) -> Arc<MessageWindow> {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(node_id)
            .or_default()
            .clone()
    }

    fn existing(&self, node_id: NodeId) -> Option<Arc<MessageWindow>> {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node_id)
            .cloned()
    }
}
