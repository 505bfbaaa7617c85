//! Node connection bookkeeping.
//!
//! # Connection Lifecycle
//!
//! ```text
//! ┌──────┐  connect()   ┌─────────┐  attempt ok   ┌───────────┐
//! │ None ├─────────────►│ Pending ├──────────────►│ Connected │
//! └──────┘              └────┬────┘               └─────┬─────┘
//!    ▲                       │ attempt failed           │ disconnect / socket closed
//!    └───────────────────────┴──────────────────────────┘
//! ```
//!
//! Inbound connections skip `Pending`: the listener registers them as
//! `Connected` directly once the remote node has introduced itself.

/// Handle to an open connection
pub mod channel;

/// Registry of per-node connection state
pub mod registry;

/// Per-node connection record
pub mod state;

pub use channel::{ChannelCommand, NodeChannel};
pub use registry::ConnectionRegistry;
pub use state::{ConnectAttempt, ConnectionState, NodeConnection};
