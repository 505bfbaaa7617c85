//! Handle to an open node connection.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::{NodeId, RpcError, SyncMessage};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Command sent from a [`NodeChannel`] to its connection task.
#[derive(Debug)]
pub enum ChannelCommand {
    /// Encode and write a message.
    Send(SyncMessage),
    /// Flush what is queued, then close the connection.
    Close,
}

/// Cloneable handle used to write to one node connection.
///
/// The handle does no I/O itself: messages are queued to the connection
/// task that owns the socket. A handle whose task has exited reports
/// [`RpcError::ChannelClosed`] on send.
#[derive(Debug, Clone)]
pub struct NodeChannel {
    id: u64,
    node_id: NodeId,
    commands: mpsc::UnboundedSender<ChannelCommand>,
}

impl NodeChannel {
    /// Wrap the command sender of a connection task.
    pub fn new(node_id: NodeId, commands: mpsc::UnboundedSender<ChannelCommand>) -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            node_id,
            commands,
        }
    }

    /// Create a channel together with the receiving end of its command queue.
    ///
    /// Useful for driving a connection by hand.
    pub fn pair(node_id: NodeId) -> (Self, mpsc::UnboundedReceiver<ChannelCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(node_id, tx), rx)
    }

    /// Process-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Node on the other end.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Queue a message for writing.
    pub fn send(&self, message: SyncMessage) -> Result<(), RpcError> {
        self.commands
            .send(ChannelCommand::Send(message))
            .map_err(|_| RpcError::ChannelClosed {
                node_id: self.node_id,
            })
    }

    /// Ask the connection task to close. Closing twice is harmless.
    pub fn close(&self) {
        let _ = self.commands.send(ChannelCommand::Close);
    }

    /// Whether the connection task has gone away.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
