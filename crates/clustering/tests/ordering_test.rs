mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::*;
use kernel_clustering::message::{Delivery, GroupMessage, ResponseOutcome, RpcRequest};
use kernel_clustering::{
    CallOptions, GroupCommunicationService, GroupTransport, InMemoryNetworkConfig,
    MarshallingContext, RpcHandler,
};
use kernel_core::KernelError;

const MESSAGES: u32 = 50;

async fn register_journal(member: &GroupCommunicationService) -> Arc<Mutex<Vec<u32>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let handler = RpcHandler::builder("journal")
        .method("append", move |entry: u32| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(entry);
                Ok::<_, String>(())
            }
        })
        .build();
    member.dispatcher().register_handler(handler).await.unwrap();
    received
}

async fn jittery_pair() -> (TestCluster, Arc<Mutex<Vec<u32>>>) {
    let cluster = TestCluster::start_with(
        &["sender", "receiver"],
        InMemoryNetworkConfig {
            max_delivery_jitter_ms: 5,
        },
        test_config(),
    )
    .await;
    let received = register_journal(cluster.member(1)).await;
    (cluster, received)
}

async fn append_sync(member: &GroupCommunicationService, entry: u32, target: &str) -> Result<(), KernelError> {
    member
        .dispatcher()
        .call_method_on_node::<_, ()>(
            "journal",
            "append",
            &entry,
            &node(target),
            CallOptions::new().with_timeout(Duration::from_secs(2)),
        )
        .await
}

#[tokio::test]
async fn test_ordered_async_calls_are_processed_in_send_order() {
    for _ in 0..5 {
        let (cluster, received) = jittery_pair().await;
        let target = node("receiver");
        for entry in 1..=MESSAGES {
            cluster
                .member(0)
                .dispatcher()
                .call_async_method_on_node("journal", "append", &entry, &target, CallOptions::new())
                .await
                .unwrap();
        }

        assert!(eventually(|| received.lock().unwrap().len() == MESSAGES as usize).await);
        let entries = received.lock().unwrap().clone();
        assert_eq!(entries, (1..=MESSAGES).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_unordered_async_calls_are_all_delivered() {
    let (cluster, received) = jittery_pair().await;
    let target = node("receiver");
    for entry in 1..=MESSAGES {
        cluster
            .member(0)
            .dispatcher()
            .call_async_method_on_node(
                "journal",
                "append",
                &entry,
                &target,
                CallOptions::new().unordered(),
            )
            .await
            .unwrap();
    }

    assert!(eventually(|| received.lock().unwrap().len() == MESSAGES as usize).await);
    let mut entries = received.lock().unwrap().clone();
    entries.sort_unstable();
    assert_eq!(entries, (1..=MESSAGES).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_ordered_sync_and_async_calls_share_one_sequence() {
    let (cluster, received) = jittery_pair().await;
    let dispatcher = cluster.member(0).dispatcher();
    let target = node("receiver");

    for entry in 1..=10u32 {
        if entry % 2 == 0 {
            dispatcher
                .call_method_on_node::<_, ()>("journal", "append", &entry, &target, CallOptions::new())
                .await
                .unwrap();
        } else {
            dispatcher
                .call_async_method_on_node("journal", "append", &entry, &target, CallOptions::new())
                .await
                .unwrap();
        }
    }

    assert!(eventually(|| received.lock().unwrap().len() == 10).await);
    assert_eq!(*received.lock().unwrap(), (1..=10).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_ordered_calls_continue_after_receiver_rejoins() {
    let (mut cluster, _) = jittery_pair().await;
    for entry in 1..=5 {
        append_sync(cluster.member(0), entry, "receiver").await.unwrap();
    }

    let receiver = cluster.rejoin(1).await;
    let received = register_journal(receiver).await;

    let started = Instant::now();
    for entry in 6..=8 {
        append_sync(cluster.member(0), entry, "receiver").await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(*received.lock().unwrap(), vec![6, 7, 8]);
}

#[tokio::test]
async fn test_ordered_calls_continue_after_sender_rejoins() {
    let (mut cluster, received) = jittery_pair().await;
    for entry in 1..=5 {
        append_sync(cluster.member(0), entry, "receiver").await.unwrap();
    }

    let sender = cluster.rejoin(0).await;
    for entry in 6..=8 {
        append_sync(sender, entry, "receiver").await.unwrap();
    }
    assert_eq!(*received.lock().unwrap(), (1..=8).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_ordered_calls_resume_after_target_is_resumed() {
    let (cluster, received) = jittery_pair().await;
    let receiver = node("receiver");
    append_sync(cluster.member(0), 1, "receiver").await.unwrap();

    cluster.network.suspend(&receiver).await;
    let err = cluster
        .member(0)
        .dispatcher()
        .call_method_on_node::<_, ()>(
            "journal",
            "append",
            &2u32,
            &receiver,
            CallOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Timeout(_)));
    cluster.network.resume(&receiver).await;

    append_sync(cluster.member(0), 3, "receiver").await.unwrap();
    assert_eq!(*received.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_duplicate_and_stale_ordered_requests_are_answered() {
    let cluster = TestCluster::start(&["receiver"]).await;
    let received = register_journal(cluster.member(0)).await;
    let raw = cluster.network.join(node("raw")).await.unwrap();
    let view = raw.current_view();
    let sender_incarnation = view.incarnation(&node("raw")).unwrap();
    let target_incarnation = view.incarnation(&node("receiver")).unwrap();

    let request = |request_id, target_incarnation, seq| {
        GroupMessage::Request(RpcRequest {
            request_id,
            sender: node("raw"),
            service: "journal".to_string(),
            method: "append".to_string(),
            signature: std::any::type_name::<u32>().to_string(),
            payload: MarshallingContext::default().to_bytes(&9u32).unwrap(),
            delivery: Delivery::Ordered {
                sender_incarnation,
                target_incarnation,
                seq,
            },
            expects_reply: true,
        })
    };
    let outcome = |message: Option<GroupMessage>| match message {
        Some(GroupMessage::Response(response)) => (response.request_id, response.outcome),
        other => panic!("unexpected message: {other:?}"),
    };

    raw.send(&node("receiver"), request(1, target_incarnation, 1)).await.unwrap();
    assert!(matches!(outcome(raw.receive().await), (1, ResponseOutcome::Value(_))));

    raw.send(&node("receiver"), request(2, target_incarnation, 1)).await.unwrap();
    assert!(matches!(outcome(raw.receive().await), (2, ResponseOutcome::Rejected(_))));

    raw.send(&node("receiver"), request(3, target_incarnation + 100, 2)).await.unwrap();
    assert!(matches!(outcome(raw.receive().await), (3, ResponseOutcome::Rejected(_))));

    assert_eq!(*received.lock().unwrap(), vec![9]);
}
