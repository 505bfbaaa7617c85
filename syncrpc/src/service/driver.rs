//! Connection task: owns one socket, writes queued messages and reads
//! incoming frames.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::Shared;
use crate::connection::{ChannelCommand, NodeChannel};
use crate::wire::{serialize_frame, try_deserialize_frame};
use crate::{
    HelloMessage, MessageCodec, MessageType, NetworkProvider, NodeId, RpcError, SyncMessage,
};

const READ_CHUNK_SIZE: usize = 8192;

/// Encode a message into a complete frame.
pub(crate) fn encode_frame<C: MessageCodec>(
    codec: &C,
    message: &SyncMessage,
) -> Result<Vec<u8>, RpcError> {
    let payload = codec.encode(message)?;
    Ok(serialize_frame(&payload)?)
}

/// Pop every complete frame off the front of `buffer`.
pub(crate) fn drain_frames<C: MessageCodec>(
    codec: &C,
    buffer: &mut Vec<u8>,
) -> Result<Vec<SyncMessage>, RpcError> {
    let mut messages = Vec::new();
    let mut offset = 0;
    while let Some((payload, consumed)) = try_deserialize_frame(&buffer[offset..])? {
        offset += consumed;
        messages.push(codec.decode(&payload)?);
    }
    buffer.drain(..offset);
    Ok(messages)
}

/// Introduce the local node on a fresh outbound stream, then start its
/// connection task.
pub(crate) async fn open_outbound<N, C>(
    shared: &Arc<Shared<N, C>>,
    node_id: NodeId,
    mut stream: N::TcpStream,
) -> Result<NodeChannel, RpcError>
where
    N: NetworkProvider,
    C: MessageCodec,
{
    let hello = HelloMessage {
        node_id: shared.local_node_id(),
    };
    let message = SyncMessage::new(
        MessageType::Hello,
        shared.next_transaction_id(),
        shared.codec.encode(&hello)?,
    );
    let frame = encode_frame(&shared.codec, &message)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;

    Ok(spawn_connection(shared, node_id, stream, Vec::new()))
}

/// Start the task owning `stream` and return the channel feeding it.
///
/// `read_buffer` holds bytes already read from the stream, such as what
/// followed the handshake frame.
pub(crate) fn spawn_connection<N, C, S>(
    shared: &Arc<Shared<N, C>>,
    node_id: NodeId,
    stream: S,
    read_buffer: Vec<u8>,
) -> NodeChannel
where
    N: NetworkProvider,
    C: MessageCodec,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (channel, commands) = NodeChannel::pair(node_id);
    let handle = tokio::spawn(connection_task(
        shared.clone(),
        node_id,
        channel.id(),
        stream,
        read_buffer,
        commands,
    ));
    shared.track_connection(handle);
    channel
}

async fn connection_task<N, C, S>(
    shared: Arc<Shared<N, C>>,
    node_id: NodeId,
    channel_id: u64,
    stream: S,
    mut read_buffer: Vec<u8>,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
) where
    N: NetworkProvider,
    C: MessageCodec,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let local = shared.local_node_id();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    tracing::debug!("[{}->{}] connection task started", local, node_id);

    let mut open = deliver_frames(&shared, node_id, &mut read_buffer);
    while open {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ChannelCommand::Send(message)) => {
                    let frame = match encode_frame(&shared.codec, &message) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(
                                "[{}->{}] dropping unencodable {}: {}",
                                local, node_id, message.message_type, e
                            );
                            continue;
                        }
                    };
                    if let Err(e) = writer.write_all(&frame).await {
                        tracing::debug!("[{}->{}] write failed: {}", local, node_id, e);
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        tracing::debug!("[{}->{}] flush failed: {}", local, node_id, e);
                        break;
                    }
                }
                Some(ChannelCommand::Close) | None => {
                    tracing::debug!("[{}->{}] closing connection", local, node_id);
                    let _ = writer.shutdown().await;
                    break;
                }
            },
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    tracing::debug!("[{}->{}] connection closed by peer", local, node_id);
                    break;
                }
                Ok(n) => {
                    read_buffer.extend_from_slice(&chunk[..n]);
                    open = deliver_frames(&shared, node_id, &mut read_buffer);
                }
                Err(e) => {
                    tracing::debug!("[{}->{}] read failed: {}", local, node_id, e);
                    break;
                }
            },
        }
    }

    // Close the command queue before unregistering so the registry never
    // accepts this channel once the task is gone.
    commands.close();
    if shared.registry.channel_closed(node_id, channel_id) {
        tracing::debug!("[{}->{}] connection lost", local, node_id);
    }
}

/// Deliver every complete frame in `buffer`. Returns `false` if the
/// stream is corrupt and the connection must be dropped.
fn deliver_frames<N, C>(shared: &Shared<N, C>, node_id: NodeId, buffer: &mut Vec<u8>) -> bool
where
    N: NetworkProvider,
    C: MessageCodec,
{
    match drain_frames(&shared.codec, buffer) {
        Ok(messages) => {
            for message in messages {
                if message.message_type == MessageType::Hello {
                    tracing::trace!(
                        "[{}->{}] ignoring repeated hello",
                        shared.local_node_id(),
                        node_id
                    );
                    continue;
                }
                shared.deliver(node_id, message);
            }
            true
        }
        Err(e) => {
            tracing::warn!(
                "[{}->{}] dropping connection after malformed frame: {}",
                shared.local_node_id(),
                node_id,
                e
            );
            false
        }
    }
}
