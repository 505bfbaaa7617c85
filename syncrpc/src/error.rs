//! Error types for the RPC service.

use crate::{CodecError, NodeId, WireError};

/// Errors that can occur in the RPC service.
///
/// Connection failures never show up here: they are handled by the
/// reconnection scheduler and observed through connectivity queries.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// `run()` was called more than once.
    #[error("service already started")]
    AlreadyStarted,

    /// The service has been shut down.
    #[error("service is shut down")]
    ShutDown,

    /// The listener could not be bound.
    #[error("failed to bind listener on {address}: {source}")]
    Bind {
        /// Address the service tried to bind.
        address: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The connection task behind a channel has exited.
    #[error("channel to node {node_id} is closed")]
    ChannelClosed {
        /// Node the channel pointed at.
        node_id: NodeId,
    },

    /// The first frame of an inbound connection was not a valid hello.
    #[error("handshake failed: {message}")]
    Handshake {
        /// Details about the failure.
        message: String,
    },

    /// Malformed frame on the wire.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O failure on a connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
