//! Flow-control behavior observed through the service: bulk sync writes
//! wait for acknowledgments from the receiving node.

mod common;

use std::time::Duration;

use common::{
    init_tracing, runtime, shutdown_all, start_cluster, test_config, topology, wait_until,
    MemoryNetwork,
};
use syncrpc::{InboundReceiver, MessageType, NodeChannel, NodeId, RpcService, SyncMessage};

const SETTLE: Duration = Duration::from_secs(5);
const LOW: NodeId = NodeId(1);
const HIGH: NodeId = NodeId(2);

/// Two connected services with the given window size: (node 1, node 2).
async fn connected_pair(
    max_pending: usize,
) -> (RpcService<MemoryNetwork>, RpcService<MemoryNetwork>) {
    let network = MemoryNetwork::new();
    let config = test_config().with_max_pending_messages(max_pending);
    let mut services = start_cluster(&network, &[1, 2], config).await;
    assert!(
        wait_until(SETTLE, || services.iter().all(|s| s.is_fully_connected())).await,
        "pair did not connect"
    );
    let high = services.pop().expect("node 2");
    let low = services.pop().expect("node 1");
    (low, high)
}

async fn next_message(inbound: &mut InboundReceiver) -> SyncMessage {
    let (_, message) = tokio::time::timeout(SETTLE, inbound.recv())
        .await
        .expect("message arrives")
        .expect("inbound open");
    message
}

fn sync_value(transaction_id: u32) -> SyncMessage {
    SyncMessage::new(MessageType::SyncValue, transaction_id, vec![0xAB; 16])
}

#[test]
fn test_third_sync_value_waits_for_acknowledgment() {
    init_tracing();
    runtime().block_on(async {
        let (low, high) = connected_pair(2).await;
        let mut low_inbound = low.take_receiver().expect("receiver");

        assert!(high.write_to_node(LOW, sync_value(0)).await);
        assert!(high.write_to_node(LOW, sync_value(1)).await);
        assert_eq!(high.flow_control().pending(LOW), 2);

        let blocked = tokio::spawn({
            let high = high.clone();
            async move { high.write_to_node(LOW, sync_value(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!blocked.is_finished(), "window of 2 should hold the third write");

        let first = next_message(&mut low_inbound).await;
        assert_eq!(first.message_type, MessageType::SyncValue);
        let ack = SyncMessage::new(
            MessageType::SyncValueResponse,
            first.transaction_id,
            Vec::new(),
        );
        assert!(low.write_to_node(HIGH, ack).await);

        let written = tokio::time::timeout(SETTLE, blocked)
            .await
            .expect("third write released")
            .expect("write task");
        assert!(written);
        assert_eq!(high.flow_control().pending(LOW), 2);

        for _ in 0..2 {
            let value = next_message(&mut low_inbound).await;
            let ack =
                SyncMessage::new(MessageType::SyncValueResponse, value.transaction_id, Vec::new());
            assert!(low.write_to_node(HIGH, ack).await);
        }
        assert!(wait_until(SETTLE, || high.flow_control().pending(LOW) == 0).await);

        shutdown_all(&[low, high]).await;
    });
}

#[test]
fn test_sync_request_acknowledges_sync_offer() {
    init_tracing();
    runtime().block_on(async {
        let (low, high) = connected_pair(1).await;
        let mut low_inbound = low.take_receiver().expect("receiver");

        let offer =
            SyncMessage::new(MessageType::SyncOffer, high.next_transaction_id(), Vec::new());
        assert!(high.write_to_node(LOW, offer).await);
        assert_eq!(high.flow_control().pending(LOW), 1);

        let offer = next_message(&mut low_inbound).await;
        let request = SyncMessage::new(MessageType::SyncRequest, offer.transaction_id, Vec::new());
        assert!(low.write_to_node(HIGH, request).await);

        assert!(wait_until(SETTLE, || high.flow_control().pending(LOW) == 0).await);

        shutdown_all(&[low, high]).await;
    });
}

#[test]
fn test_disconnect_releases_blocked_writer() {
    init_tracing();
    runtime().block_on(async {
        let (low, high) = connected_pair(1).await;

        assert!(high.write_to_node(LOW, sync_value(0)).await);
        let blocked = tokio::spawn({
            let high = high.clone();
            async move { high.write_to_node(LOW, sync_value(1)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        assert!(high.disconnect_node(LOW));

        let written = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("writer released by disconnect")
            .expect("write task");
        assert!(!written, "write to a torn-down connection must fail");

        shutdown_all(&[low, high]).await;
    });
}

#[test]
fn test_bounded_write_gives_up() {
    init_tracing();
    runtime().block_on(async {
        let (low, high) = connected_pair(1).await;

        assert!(high.write_to_node(LOW, sync_value(0)).await);
        let written = high
            .write_to_node_within(LOW, sync_value(1), Duration::from_millis(50))
            .await;
        assert!(!written);
        assert_eq!(high.flow_control().pending(LOW), 1);

        shutdown_all(&[low, high]).await;
    });
}

#[test]
fn test_non_windowed_types_ignore_full_window() {
    init_tracing();
    runtime().block_on(async {
        let (low, high) = connected_pair(1).await;

        assert!(high.write_to_node(LOW, sync_value(0)).await);
        for i in 0..20 {
            let put = SyncMessage::new(MessageType::PutRequest, i, b"key".to_vec());
            let written = tokio::time::timeout(Duration::from_secs(1), high.write_to_node(LOW, put))
                .await
                .expect("non-windowed write does not wait");
            assert!(written);
        }
        assert_eq!(high.flow_control().pending(LOW), 1);

        shutdown_all(&[low, high]).await;
    });
}

#[test]
fn test_manual_acknowledgment_frees_window() {
    init_tracing();
    runtime().block_on(async {
        let (low, high) = connected_pair(1).await;

        assert!(high.write_to_node(LOW, sync_value(0)).await);
        high.message_acked(MessageType::SyncValue, LOW);
        assert_eq!(high.flow_control().pending(LOW), 0);

        let written = tokio::time::timeout(
            Duration::from_secs(1),
            high.write_to_node(LOW, sync_value(1)),
        )
        .await
        .expect("window has room again");
        assert!(written);

        shutdown_all(&[low, high]).await;
    });
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_after_reconnect_keeps_new_window_full() {
    let service = RpcService::new(
        topology(2, &[1, 2]),
        MemoryNetwork::new(),
        test_config().with_max_pending_messages(1),
    );
    let (first, _first_rx) = NodeChannel::pair(LOW);
    assert!(service.node_connected(LOW, first));
    assert!(service.write_to_node(LOW, sync_value(0)).await);

    let blocked = tokio::spawn({
        let service = service.clone();
        async move { service.write_to_node(LOW, sync_value(1)).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!blocked.is_finished());

    assert!(service.disconnect_node(LOW));
    let (second, _second_rx) = NodeChannel::pair(LOW);
    assert!(service.node_connected(LOW, second));
    assert!(service.write_to_node(LOW, sync_value(2)).await);
    assert_eq!(service.flow_control().pending(LOW), 1);

    let written = blocked.await.expect("write task");
    assert!(!written, "write admitted before the reconnect must fail");
    assert_eq!(service.flow_control().pending(LOW), 1);

    let extra = service
        .write_to_node_within(LOW, sync_value(3), Duration::from_millis(50))
        .await;
    assert!(!extra, "window of 1 already holds a message");
}
