//! Core identifiers and message types shared by every layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a cluster node.
///
/// Identifiers are unique within a cluster and totally ordered; the order
/// decides which side of a node pair initiates the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u16);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for NodeId {
    fn from(id: u16) -> Self {
        NodeId(id)
    }
}

/// A member of the cluster as described by the topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier.
    pub node_id: NodeId,
    /// Hostname or IP address other nodes use to reach this node.
    pub hostname: String,
    /// RPC port this node listens on.
    pub port: u16,
}

impl Node {
    /// Create a new node description.
    pub fn new(node_id: impl Into<NodeId>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            port,
        }
    }

    /// Address in `host:port` form, as handed to the network provider.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Kind of a sync protocol message.
///
/// Request/response pairs are correlated through the message's
/// transaction id at a layer above this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Connection handshake carrying the sender's node id.
    Hello,
    /// Error reply to a request.
    Error,
    /// Liveness probe.
    EchoRequest,
    /// Reply to [`MessageType::EchoRequest`].
    EchoReply,
    /// Read a key from a remote store.
    GetRequest,
    /// Reply to [`MessageType::GetRequest`].
    GetResponse,
    /// Write a key to a remote store.
    PutRequest,
    /// Reply to [`MessageType::PutRequest`].
    PutResponse,
    /// Delete a key from a remote store.
    DeleteRequest,
    /// Reply to [`MessageType::DeleteRequest`].
    DeleteResponse,
    /// Bulk transfer of versioned values.
    SyncValue,
    /// Acknowledges a [`MessageType::SyncValue`].
    SyncValueResponse,
    /// Advertises the versions a node holds.
    SyncOffer,
    /// Requests values named in a [`MessageType::SyncOffer`]; acknowledges the offer.
    SyncRequest,
    /// Asks a peer to start a full anti-entropy pass.
    FullSyncRequest,
    /// Opens or advances a remote iteration cursor.
    CursorRequest,
    /// Reply to [`MessageType::CursorRequest`].
    CursorResponse,
    /// Registers a store with a peer.
    RegisterRequest,
    /// Reply to [`MessageType::RegisterRequest`].
    RegisterResponse,
}

impl MessageType {
    /// The windowed message type that receiving this message acknowledges.
    ///
    /// The connection reader feeds the result into flow control before the
    /// message is handed to the application.
    pub fn acknowledges(self) -> Option<MessageType> {
        match self {
            MessageType::SyncValueResponse => Some(MessageType::SyncValue),
            MessageType::SyncRequest => Some(MessageType::SyncOffer),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A protocol message exchanged between nodes.
///
/// The payload is opaque to this crate; only the type and transaction id
/// are interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Message kind, used for flow control and dispatch.
    pub message_type: MessageType,
    /// Correlation token allocated by [`crate::RpcService::next_transaction_id`].
    pub transaction_id: u32,
    /// Application payload.
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a message with the given type, transaction id and payload.
    pub fn new(message_type: MessageType, transaction_id: u32, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            transaction_id,
            payload,
        }
    }
}

/// Payload of a [`MessageType::Hello`] message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Node id of the side that opened the connection.
    pub node_id: NodeId,
}

/// A message waiting in the send queue for the worker pool.
#[derive(Debug, Clone)]
pub struct NodeMessage {
    /// Destination node.
    pub node_id: NodeId,
    /// Message to write.
    pub message: SyncMessage,
}
