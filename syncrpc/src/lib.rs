//! # syncrpc
//!
//! Connection management and flow control for cluster sync RPC.
//!
//! Every node of a small cluster keeps one long-lived connection to every
//! other node. This crate provides:
//! - **Connection registry**: per-node lifecycle with a deterministic
//!   tie-break so each pair of nodes has exactly one connection
//! - **Reconnection**: a periodic scheduler that reopens lost connections
//! - **Flow control**: a per-node window bounding unacknowledged bulk sync
//!   messages, with blocking admission
//! - **Wire format**: length-prefixed frames with CRC32C checksums
//!
//! What the messages mean is up to the application, which receives them
//! through [`RpcService::take_receiver`].

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Pluggable message serialization.
pub mod codec;

/// Service configuration.
pub mod config;

/// Per-node connection state and channels.
pub mod connection;

/// Error types for service operations.
pub mod error;

/// Per-node flow-control windows.
pub mod flow_control;

/// Network provider abstraction.
pub mod network;

/// The sync RPC service and its background tasks.
pub mod service;

/// Cluster membership.
pub mod topology;

/// Node and message types.
pub mod types;

/// Frame format with CRC32C checksums.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use config::{RpcConfig, DEFAULT_MAX_PENDING_MESSAGES};
pub use connection::{ConnectionRegistry, ConnectionState, NodeChannel};
pub use error::RpcError;
pub use flow_control::{FlowControl, MessageWindow, Reservation};
pub use network::{NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener};
pub use service::{InboundReceiver, RpcService};
pub use topology::{ClusterConfig, ConfigError, Topology};
pub use types::{HelloMessage, MessageType, Node, NodeId, NodeMessage, SyncMessage};
pub use wire::{serialize_frame, try_deserialize_frame, WireError, HEADER_SIZE, MAX_PAYLOAD_SIZE};
