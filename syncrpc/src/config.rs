//! Tunables for the RPC service.

use std::collections::HashSet;
use std::time::Duration;

use crate::MessageType;

/// Default cap on unacknowledged windowed messages per node.
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 500;

/// Configuration for connection management and flow control.
#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// Maximum number of admitted but unacknowledged windowed messages per node
    pub max_pending_messages: usize,

    /// Message types subject to the per-node window
    pub windowed_types: HashSet<MessageType>,

    /// Timeout for a single outbound connect attempt
    pub connect_timeout: Duration,

    /// Delay between the end of one reconnection pass and the start of the next
    pub reconnect_interval: Duration,

    /// Time an accepted connection has to send its hello frame
    pub handshake_timeout: Duration,

    /// Number of workers draining the async send queue
    pub send_workers: usize,

    /// How long shutdown waits for connection tasks to finish closing
    pub shutdown_grace: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
            windowed_types: [MessageType::SyncValue, MessageType::SyncOffer]
                .into_iter()
                .collect(),
            connect_timeout: Duration::from_millis(500),
            reconnect_interval: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(5),
            send_workers: 2,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl RpcConfig {
    /// Set the per-node window size.
    pub fn with_max_pending_messages(mut self, max_pending: usize) -> Self {
        self.max_pending_messages = max_pending;
        self
    }

    /// Replace the set of windowed message types.
    pub fn with_windowed_types(mut self, types: impl IntoIterator<Item = MessageType>) -> Self {
        self.windowed_types = types.into_iter().collect();
        self
    }

    /// Set the connect timeout and the reconnection interval.
    pub fn with_reconnect(mut self, connect_timeout: Duration, interval: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.reconnect_interval = interval;
        self
    }

    /// Set the number of send workers.
    pub fn with_send_workers(mut self, workers: usize) -> Self {
        self.send_workers = workers;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Configuration for low-latency local networking, mostly used by tests.
    pub fn local_network() -> Self {
        Self {
            connect_timeout: Duration::from_millis(100),
            reconnect_interval: Duration::from_millis(20),
            handshake_timeout: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Whether messages of this type go through the per-node window.
    pub fn is_windowed(&self, message_type: MessageType) -> bool {
        self.windowed_types.contains(&message_type)
    }
}
