//! Network provider abstraction.
//!
//! The service never touches sockets directly: outbound connects and the
//! inbound listener go through [`NetworkProvider`], so tests can swap real
//! TCP for an in-memory network.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Source of node-to-node byte streams.
///
/// Providers are cloned into every connect attempt.
#[async_trait]
pub trait NetworkProvider: Clone + Send + Sync + 'static {
    /// Bidirectional stream produced by both `connect` and the listener.
    type TcpStream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    /// Listener produced by `bind`.
    type TcpListener: TcpListenerTrait<TcpStream = Self::TcpStream> + 'static;

    /// Start listening on `addr` (`host:port`).
    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener>;

    /// Open a stream to `addr` (`host:port`).
    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream>;
}

/// Listening side of a [`NetworkProvider`].
#[async_trait]
pub trait TcpListenerTrait: Send + Sync {
    /// Stream type handed out for each accepted connection.
    type TcpStream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next connection, returning it with the remote address.
    async fn accept(&self) -> io::Result<(Self::TcpStream, String)>;

    /// Address actually bound, useful when binding port 0.
    fn local_addr(&self) -> io::Result<String>;
}

/// [`NetworkProvider`] over tokio TCP sockets.
///
/// Sync traffic is many small frames, so `TCP_NODELAY` is set on every
/// socket unless turned off with [`TokioNetworkProvider::with_nodelay`].
#[derive(Debug, Clone)]
pub struct TokioNetworkProvider {
    nodelay: bool,
}

impl TokioNetworkProvider {
    /// Provider with `TCP_NODELAY` enabled.
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Enable or disable `TCP_NODELAY` on new sockets.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TokioNetworkProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkProvider for TokioNetworkProvider {
    type TcpStream = tokio::net::TcpStream;
    type TcpListener = TokioTcpListener;

    async fn bind(&self, addr: &str) -> io::Result<TokioTcpListener> {
        Ok(TokioTcpListener {
            listener: tokio::net::TcpListener::bind(addr).await?,
            nodelay: self.nodelay,
        })
    }

    async fn connect(&self, addr: &str) -> io::Result<tokio::net::TcpStream> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}

/// Listener returned by [`TokioNetworkProvider::bind`].
#[derive(Debug)]
pub struct TokioTcpListener {
    listener: tokio::net::TcpListener,
    nodelay: bool,
}

#[async_trait]
impl TcpListenerTrait for TokioTcpListener {
    type TcpStream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(tokio::net::TcpStream, String)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(self.nodelay)?;
        Ok((stream, remote.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        self.listener.local_addr().map(|addr| addr.to_string())
    }
}
