//! Per-node connection lifecycle record.

use tokio::task::AbortHandle;

use super::channel::NodeChannel;

/// Lifecycle of the connection to one node.
///
/// ```text
///           connect            connected
///   None ──────────────► Pending ─────────► Connected
///    ▲                      │                   │
///    └──── failure ─────────┘                   │
///    └────────────── disconnect ────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and no attempt in flight.
    #[default]
    None,
    /// An outbound connect attempt is in flight.
    Pending,
    /// The connection is open.
    Connected,
}

/// An outbound connect attempt in flight.
#[derive(Debug)]
pub struct ConnectAttempt {
    /// Identifier used to match the attempt's completion with this record.
    pub id: u64,
    /// Handle to cancel the attempt's task.
    pub handle: AbortHandle,
}

/// Connection record for one node; owned by the registry.
///
/// `attempt` is only set while `Pending` and `channel` only while
/// `Connected`.
#[derive(Debug, Default)]
pub struct NodeConnection {
    pub(crate) state: ConnectionState,
    pub(crate) attempt: Option<ConnectAttempt>,
    pub(crate) channel: Option<NodeChannel>,
}

impl NodeConnection {
    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Open channel, if connected.
    pub fn channel(&self) -> Option<&NodeChannel> {
        self.channel.as_ref()
    }

    pub(crate) fn set_pending(&mut self, attempt: ConnectAttempt) {
        self.state = ConnectionState::Pending;
        self.attempt = Some(attempt);
        self.channel = None;
    }

    /// Move to `Connected`, returning a displaced channel if one was open.
    ///
    /// An attempt still recorded here is cancelled; the completing attempt
    /// removes itself before calling this.
    pub(crate) fn set_connected(&mut self, channel: NodeChannel) -> Option<NodeChannel> {
        self.state = ConnectionState::Connected;
        if let Some(attempt) = self.attempt.take() {
            attempt.handle.abort();
        }
        let new_id = channel.id();
        self.channel.replace(channel).filter(|old| old.id() != new_id)
    }

    /// Cancel any attempt, close any channel and go back to `None`.
    pub(crate) fn teardown(&mut self) {
        self.state = ConnectionState::None;
        if let Some(attempt) = self.attempt.take() {
            attempt.handle.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}
