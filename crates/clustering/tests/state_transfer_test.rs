mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use common::*;
use kernel_clustering::{StateTransferProvider, StateTransferStatus};
use kernel_core::{KernelError, KernelResult};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct SessionState {
    sessions: u32,
    owner: String,
}

struct SessionProvider {
    delay: Duration,
    calls: AtomicUsize,
}

impl SessionProvider {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StateTransferProvider for SessionProvider {
    async fn current_state(&self) -> KernelResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(json!({ "sessions": 3, "owner": "a" }))
    }
}

#[tokio::test]
async fn test_joiner_receives_state_from_coordinator() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    cluster
        .member(0)
        .state_transfer()
        .register_state_transfer_provider("sessions", SessionProvider::new(Duration::ZERO))
        .await
        .unwrap();

    let future = cluster.member(1).state_transfer().get_service_state("sessions").await;
    assert_eq!(future.service(), "sessions");
    let result = future.wait().await;

    assert_eq!(result.status(), StateTransferStatus::Received);
    assert!(result.is_success());
    assert_eq!(
        result.state_as::<SessionState>().unwrap(),
        Some(SessionState {
            sessions: 3,
            owner: "a".to_string(),
        })
    );
}

#[tokio::test]
async fn test_missing_provider_fails_fast() {
    let cluster = TestCluster::start(&["a", "b"]).await;

    let started = Instant::now();
    let result = cluster
        .member(1)
        .state_transfer()
        .get_service_state("unknown")
        .await
        .wait()
        .await;

    assert_eq!(result.status(), StateTransferStatus::Failed);
    assert!(matches!(result.error(), Some(KernelError::RemoteInvocation { .. })));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_sole_member_has_no_state() {
    let cluster = TestCluster::start(&["a"]).await;
    let result = cluster
        .member(0)
        .state_transfer()
        .get_service_state("sessions")
        .await
        .wait()
        .await;

    assert_eq!(result.status(), StateTransferStatus::NoState);
    assert!(result.is_success());
    assert!(result.state().is_none());
    assert!(result.error().is_none());
}

#[tokio::test]
async fn test_coordinator_asks_next_member() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    cluster
        .member(1)
        .state_transfer()
        .register_state_transfer_provider("sessions", SessionProvider::new(Duration::ZERO))
        .await
        .unwrap();

    let result = cluster
        .member(0)
        .state_transfer()
        .get_service_state("sessions")
        .await
        .wait()
        .await;
    assert_eq!(result.status(), StateTransferStatus::Received);
}

#[tokio::test]
async fn test_caller_bounded_wait_times_out() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    cluster
        .member(0)
        .state_transfer()
        .register_state_transfer_provider("sessions", SessionProvider::new(Duration::from_secs(3)))
        .await
        .unwrap();

    let future = cluster.member(1).state_transfer().get_service_state("sessions").await;
    assert_eq!(future.status(), StateTransferStatus::Requested);
    let result = future.wait_timeout(Duration::from_millis(100)).await;

    assert_eq!(result.status(), StateTransferStatus::TimedOut);
    assert!(!result.is_success());
}

#[tokio::test]
async fn test_concurrent_requests_share_one_transfer() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    let provider = SessionProvider::new(Duration::from_millis(200));
    cluster
        .member(0)
        .state_transfer()
        .register_state_transfer_provider("sessions", provider.clone())
        .await
        .unwrap();

    let transfer = cluster.member(1).state_transfer();
    let first = transfer.get_service_state("sessions").await;
    let second = transfer.get_service_state("sessions").await;
    let (first, second) = tokio::join!(first.wait(), second.wait());

    assert_eq!(first, second);
    assert_eq!(first.status(), StateTransferStatus::Received);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_provider_registration_rules() {
    let cluster = TestCluster::start(&["a"]).await;
    let transfer = cluster.member(0).state_transfer();

    transfer
        .register_state_transfer_provider("sessions", SessionProvider::new(Duration::ZERO))
        .await
        .unwrap();
    let err = transfer
        .register_state_transfer_provider("sessions", SessionProvider::new(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::IllegalState(_)));

    assert!(transfer.unregister_state_transfer_provider("sessions").await);
    assert!(!transfer.unregister_state_transfer_provider("sessions").await);
}

struct SnapshotProvider;

#[async_trait]
impl StateTransferProvider for SnapshotProvider {
    async fn current_state(&self) -> KernelResult<Value> {
        Ok(Value::Null)
    }

    async fn current_state_bytes(&self) -> KernelResult<Option<Vec<u8>>> {
        Ok(Some(b"snapshot-v2\x00\x01\x02".to_vec()))
    }
}

#[tokio::test]
async fn test_state_can_be_read_as_stream() {
    use tokio::io::AsyncReadExt;

    let cluster = TestCluster::start(&["a", "b"]).await;
    let provider = cluster.member(0).state_transfer();
    provider
        .register_state_transfer_provider("snapshot", Arc::new(SnapshotProvider))
        .await
        .unwrap();
    provider
        .register_state_transfer_provider("sessions", SessionProvider::new(Duration::ZERO))
        .await
        .unwrap();

    let joiner = cluster.member(1).state_transfer();
    let result = joiner.get_service_state_as_stream("snapshot").await.wait().await;
    assert_eq!(result.status(), StateTransferStatus::Received);
    assert!(result.state().is_none());
    let mut stream = result.into_stream().unwrap();
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, b"snapshot-v2\x00\x01\x02");

    // 没有原始字节的提供者按编码后的状态传输
    let result = joiner.get_service_state_as_stream("sessions").await.wait().await;
    let state: SessionState = serde_json::from_slice(result.bytes().unwrap()).unwrap();
    assert_eq!(
        state,
        SessionState {
            sessions: 3,
            owner: "a".to_string()
        }
    );
}
