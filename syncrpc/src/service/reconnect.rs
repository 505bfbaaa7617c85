//! Reconnection scheduler.
//!
//! A pass walks the topology and starts a connect attempt toward every
//! node the local node initiates to that has no connection and no attempt
//! in flight. Passes run back to back with a fixed delay in between; the
//! first one runs as soon as the service starts.

use std::sync::Arc;

use tokio::task::AbortHandle;

use super::{driver, stopped, Shared};
use crate::{MessageCodec, NetworkProvider, Node};

pub(crate) async fn reconnect_loop<N, C>(shared: Arc<Shared<N, C>>)
where
    N: NetworkProvider,
    C: MessageCodec,
{
    let local = shared.local_node_id();
    let interval = shared.config.reconnect_interval;
    let mut shutdown = shared.shutdown_signal();

    loop {
        // A panicking pass (for example in a topology implementation) is
        // logged and the schedule carries on.
        let pass = tokio::spawn({
            let shared = shared.clone();
            async move { reconnect_pass(&shared) }
        });
        match pass.await {
            Ok(started) if started > 0 => {
                tracing::trace!("[{}] started {} connect attempts", local, started);
            }
            Ok(_) => {}
            Err(e) => tracing::error!("[{}] reconnection pass failed: {}", local, e),
        }

        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::debug!("[{}] reconnection scheduler stopped", local);
}

/// Start connect attempts where needed. Returns the number started.
pub(crate) fn reconnect_pass<N, C>(shared: &Arc<Shared<N, C>>) -> usize
where
    N: NetworkProvider,
    C: MessageCodec,
{
    let mut started = 0;
    for node in shared.topology.nodes() {
        if shared.is_shut_down() {
            break;
        }
        let spawned = shared
            .registry
            .connect(&node, |attempt_id| spawn_attempt(shared, &node, attempt_id));
        if spawned {
            started += 1;
        }
    }
    started
}

fn spawn_attempt<N, C>(shared: &Arc<Shared<N, C>>, node: &Node, attempt_id: u64) -> AbortHandle
where
    N: NetworkProvider,
    C: MessageCodec,
{
    tokio::spawn(connect_attempt(shared.clone(), node.clone(), attempt_id)).abort_handle()
}

async fn connect_attempt<N, C>(shared: Arc<Shared<N, C>>, node: Node, attempt_id: u64)
where
    N: NetworkProvider,
    C: MessageCodec,
{
    let local = shared.local_node_id();
    let address = node.address();
    let timeout = shared.config.connect_timeout;

    let stream = match tokio::time::timeout(timeout, shared.network.connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!(
                "[{}->{}] could not connect to {}: {}",
                local,
                node.node_id,
                address,
                e
            );
            shared.registry.attempt_failed(node.node_id, attempt_id);
            return;
        }
        Err(_) => {
            tracing::debug!(
                "[{}->{}] connect to {} timed out after {:?}",
                local,
                node.node_id,
                address,
                timeout
            );
            shared.registry.attempt_failed(node.node_id, attempt_id);
            return;
        }
    };

    match driver::open_outbound(&shared, node.node_id, stream).await {
        Ok(channel) => {
            shared
                .registry
                .attempt_succeeded(node.node_id, attempt_id, channel);
        }
        Err(e) => {
            tracing::debug!(
                "[{}->{}] handshake with {} failed: {}",
                local,
                node.node_id,
                address,
                e
            );
            shared.registry.attempt_failed(node.node_id, attempt_id);
        }
    }
}
