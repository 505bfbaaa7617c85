//! Accept loop for connections initiated by other nodes.
//!
//! The initiating node must send a hello frame naming itself before
//! anything else; only then is the connection registered.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{driver, stopped, Shared};
use crate::wire::try_deserialize_frame;
use crate::{
    HelloMessage, MessageCodec, MessageType, NetworkProvider, NodeId, RpcError, SyncMessage,
    TcpListenerTrait,
};

/// Back-off after a failed accept so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) async fn accept_loop<N, C>(shared: Arc<Shared<N, C>>, listener: N::TcpListener)
where
    N: NetworkProvider,
    C: MessageCodec,
{
    let local = shared.local_node_id();
    let mut shutdown = shared.shutdown_signal();

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!("[{}] accepted connection from {}", local, peer);
                    tokio::spawn(accept_connection(shared.clone(), stream, peer));
                }
                Err(e) => {
                    tracing::warn!("[{}] accept failed: {}", local, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    tracing::debug!("[{}] accept loop stopped", local);
}

async fn accept_connection<N, C>(shared: Arc<Shared<N, C>>, mut stream: N::TcpStream, peer: String)
where
    N: NetworkProvider,
    C: MessageCodec,
{
    let local = shared.local_node_id();
    let timeout = shared.config.handshake_timeout;

    let (node_id, leftover) =
        match tokio::time::timeout(timeout, read_hello(&shared.codec, &mut stream)).await {
            Ok(Ok(hello)) => hello,
            Ok(Err(e)) => {
                tracing::debug!("[{}] rejecting connection from {}: {}", local, peer, e);
                return;
            }
            Err(_) => {
                tracing::debug!("[{}] no hello from {} within {:?}", local, peer, timeout);
                return;
            }
        };

    if node_id == local {
        tracing::warn!("[{}] rejecting connection from {} claiming our id", local, peer);
        return;
    }

    tracing::debug!("[{}<-{}] inbound connection from {}", local, node_id, peer);
    let channel = driver::spawn_connection(&shared, node_id, stream, leftover);
    shared.node_connected(node_id, channel);
}

/// Read the hello frame, returning the announced node id and any bytes
/// received after it.
pub(crate) async fn read_hello<C, S>(
    codec: &C,
    stream: &mut S,
) -> Result<(NodeId, Vec<u8>), RpcError>
where
    C: MessageCodec,
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 512];

    loop {
        if let Some((payload, consumed)) = try_deserialize_frame(&buffer)? {
            let message: SyncMessage = codec.decode(&payload)?;
            if message.message_type != MessageType::Hello {
                return Err(RpcError::Handshake {
                    message: format!("expected hello, got {}", message.message_type),
                });
            }
            let hello: HelloMessage = codec.decode(&message.payload)?;
            buffer.drain(..consumed);
            return Ok((hello.node_id, buffer));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RpcError::Handshake {
                message: "connection closed before hello".to_string(),
            });
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::driver::encode_frame;
    use crate::JsonCodec;
    use tokio::io::AsyncWriteExt;

    fn hello_frame(node_id: u16) -> Vec<u8> {
        let codec = JsonCodec;
        let payload = codec
            .encode(&HelloMessage {
                node_id: NodeId(node_id),
            })
            .expect("encode hello");
        encode_frame(&codec, &SyncMessage::new(MessageType::Hello, 0, payload)).expect("frame")
    }

    #[tokio::test]
    async fn test_read_hello_returns_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut bytes = hello_frame(3);
        bytes.extend_from_slice(b"tail");
        client.write_all(&bytes).await.expect("write");

        let (node_id, leftover) = read_hello(&JsonCodec, &mut server).await.expect("hello");
        assert_eq!(node_id, NodeId(3));
        assert_eq!(leftover, b"tail".to_vec());
    }

    #[tokio::test]
    async fn test_read_hello_across_partial_reads() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let bytes = hello_frame(7);
        let reader = tokio::spawn(async move { read_hello(&JsonCodec, &mut server).await });

        for byte in bytes {
            client.write_all(&[byte]).await.expect("write");
            tokio::task::yield_now().await;
        }

        let (node_id, leftover) = reader.await.expect("task").expect("hello");
        assert_eq!(node_id, NodeId(7));
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_read_hello_rejects_other_first_message() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frame = encode_frame(
            &JsonCodec,
            &SyncMessage::new(MessageType::SyncValue, 1, Vec::new()),
        )
        .expect("frame");
        client.write_all(&frame).await.expect("write");

        let result = read_hello(&JsonCodec, &mut server).await;
        assert!(matches!(result, Err(RpcError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_read_hello_fails_on_early_eof() {
        let (client, mut server) = tokio::io::duplex(4096);
        drop(client);

        let result = read_hello(&JsonCodec, &mut server).await;
        assert!(matches!(result, Err(RpcError::Handshake { .. })));
    }
}
