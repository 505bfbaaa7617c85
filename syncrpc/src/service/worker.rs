//! Send workers draining the queue filled by `RpcService::enqueue`.
//!
//! Each message is written from its own task so a panic while writing is
//! contained to that message.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use super::{stopped, Shared};
use crate::{MessageCodec, NetworkProvider, NodeMessage};

/// Receiving end of the send queue, shared by every worker.
pub(crate) type SendQueue = Arc<Mutex<mpsc::UnboundedReceiver<NodeMessage>>>;

pub(crate) async fn send_worker<N, C>(shared: Arc<Shared<N, C>>, worker_id: usize, queue: SendQueue)
where
    N: NetworkProvider,
    C: MessageCodec,
{
    let local = shared.local_node_id();
    let mut shutdown = shared.shutdown_signal();
    tracing::trace!("[{}] send worker {} started", local, worker_id);

    loop {
        let next = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            next = async { queue.lock().await.recv().await } => next,
        };
        let Some(NodeMessage { node_id, message }) = next else {
            break;
        };

        let message_type = message.message_type;
        let mut dispatch = tokio::spawn({
            let shared = shared.clone();
            async move { shared.write(node_id, message, None).await }
        });

        tokio::select! {
            _ = stopped(&mut shutdown) => {
                dispatch.abort();
                break;
            }
            result = &mut dispatch => match result {
                Ok(true) => {}
                Ok(false) => tracing::debug!(
                    "[{}->{}] worker {} dropped {}: not connected",
                    local, node_id, worker_id, message_type
                ),
                Err(e) => tracing::error!(
                    "[{}->{}] worker {} failed writing {}: {}",
                    local, node_id, worker_id, message_type, e
                ),
            },
        }
    }

    tracing::trace!("[{}] send worker {} stopped", local, worker_id);
}
