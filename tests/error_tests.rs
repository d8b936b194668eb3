use futures::{SinkExt, StreamExt};
use relaymq::config::UserCredential;
use relaymq::protocol::{
    ConnectRequest, DefineQueueRequest, Disposition, PutRequest, QueryRequest, QueueMessage,
};
use relaymq::{
    BrokerConfig, BrokerServer, DecodedFrame, ErrorCode, Frame, FrameCodec, RelayError, Reply,
    Request,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            framed: Framed::new(stream, FrameCodec),
        }
    }

    async fn call(&mut self, request: Request) -> Reply {
        self.framed
            .send(Frame::Request(request))
            .await
            .expect("send frame");
        self.next_reply().await
    }

    async fn next_reply(&mut self) -> Reply {
        match self.framed.next().await {
            Some(Ok(DecodedFrame::Frame(Frame::Reply(reply)))) => reply,
            other => panic!("expected reply frame, got {:?}", other),
        }
    }

    /// Inject raw bytes past the codec, as a misbehaving client would.
    async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.expect("write raw");
        stream.flush().await.expect("flush raw");
    }
}

fn test_config(repository: &std::path::Path) -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".to_string(),
        repository_dir: repository.display().to_string(),
        socket_timeout_ms: 100,
        get_poll_interval_ms: 10,
        housekeeper_interval_ms: 60_000,
        ..Default::default()
    }
}

async fn start_broker(
    config: BrokerConfig,
) -> (
    Arc<BrokerServer>,
    SocketAddr,
    tokio::task::JoinHandle<relaymq::Result<()>>,
) {
    let server = Arc::new(BrokerServer::new(config).expect("broker config"));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let runner = Arc::clone(&server);
    let handle = tokio::spawn(async move { runner.run_on(listener).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    (server, addr, handle)
}

/// A full frame whose eye-catcher is wrong. payload_len is zero so the
/// decoder has nothing extra to skip.
fn bad_eye_catcher_frame() -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(b"XXXX");
    frame.push(1); // version
    frame.push(1); // class: request
    frame.push(2); // sub: disconnect
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame
}

fn wrong_version_frame() -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(b"RMQW");
    frame.push(99); // unsupported version
    frame.push(1);
    frame.push(2);
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame
}

#[tokio::test]
async fn session_survives_corrupted_frame() {
    let repo = tempfile::tempdir().expect("tempdir");
    let (server, addr, handle) = start_broker(test_config(repo.path())).await;

    let mut client = TestClient::connect(addr).await;
    assert_eq!(
        client
            .call(Request::Connect(ConnectRequest {
                user: "app".to_string(),
                credential: String::new(),
            }))
            .await,
        Reply::Ok
    );

    client.send_raw(&bad_eye_catcher_frame()).await;
    match client.next_reply().await {
        Reply::Error(e) => assert_eq!(e.code, ErrorCode::Protocol),
        other => panic!("expected protocol error, got {:?}", other),
    }

    // The same connection still serves well-formed requests.
    let reply = client
        .call(Request::Define(DefineQueueRequest {
            name: "AFTERQ".to_string(),
            threshold: 4,
            disposition: Disposition::Temporary,
        }))
        .await;
    assert!(matches!(reply, Reply::QueueInfo(_)));

    server.shutdown();
    handle.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn session_survives_unsupported_version() {
    let repo = tempfile::tempdir().expect("tempdir");
    let (server, addr, handle) = start_broker(test_config(repo.path())).await;

    let mut client = TestClient::connect(addr).await;
    client.send_raw(&wrong_version_frame()).await;
    match client.next_reply().await {
        Reply::Error(e) => assert_eq!(e.code, ErrorCode::Protocol),
        other => panic!("expected protocol error, got {:?}", other),
    }

    assert_eq!(
        client
            .call(Request::Connect(ConnectRequest {
                user: "app".to_string(),
                credential: String::new(),
            }))
            .await,
        Reply::Ok
    );

    server.shutdown();
    handle.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn credentials_are_checked_when_anonymous_access_is_off() {
    let repo = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(repo.path());
    config.allow_anonymous = false;
    config.users = vec![UserCredential {
        user: "app".to_string(),
        credential: "secret".to_string(),
    }];
    let (server, addr, handle) = start_broker(config).await;

    let mut client = TestClient::connect(addr).await;

    // Wrong credential: rejected, session stays open but unauthenticated.
    match client
        .call(Request::Connect(ConnectRequest {
            user: "app".to_string(),
            credential: "wrong".to_string(),
        }))
        .await
    {
        Reply::Error(e) => assert_eq!(e.code, ErrorCode::Auth),
        other => panic!("expected auth error, got {:?}", other),
    }
    match client
        .call(Request::Put(PutRequest {
            queue: "APPQ".to_string(),
            message: QueueMessage::new("x"),
        }))
        .await
    {
        Reply::Error(e) => assert_eq!(e.code, ErrorCode::Auth),
        other => panic!("expected auth error, got {:?}", other),
    }

    // Unknown user: rejected outright when anonymous access is off.
    match client
        .call(Request::Connect(ConnectRequest {
            user: "stranger".to_string(),
            credential: String::new(),
        }))
        .await
    {
        Reply::Error(e) => assert_eq!(e.code, ErrorCode::Auth),
        other => panic!("expected auth error, got {:?}", other),
    }

    assert_eq!(
        client
            .call(Request::Connect(ConnectRequest {
                user: "app".to_string(),
                credential: "secret".to_string(),
            }))
            .await,
        Reply::Ok
    );

    server.shutdown();
    handle.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn operations_on_missing_queues_report_unknown_queue() {
    let repo = tempfile::tempdir().expect("tempdir");
    let (server, addr, handle) = start_broker(test_config(repo.path())).await;

    let mut client = TestClient::connect(addr).await;
    client
        .call(Request::Connect(ConnectRequest {
            user: "app".to_string(),
            credential: String::new(),
        }))
        .await;

    match client
        .call(Request::Query(QueryRequest {
            queue: "GHOST".to_string(),
        }))
        .await
    {
        Reply::Error(e) => assert_eq!(e.code, ErrorCode::UnknownQueue),
        other => panic!("expected unknown-queue error, got {:?}", other),
    }

    // PUT to a missing queue fails too, but the payload lands on the
    // dead-letter queue for inspection.
    match client
        .call(Request::Put(PutRequest {
            queue: "GHOST".to_string(),
            message: QueueMessage::new("stray"),
        }))
        .await
    {
        Reply::Error(e) => assert_eq!(e.code, ErrorCode::UnknownQueue),
        other => panic!("expected unknown-queue error, got {:?}", other),
    }
    assert_eq!(server.registry().local().dead_queue().depth(), 1);

    server.shutdown();
    handle.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn zero_threshold_define_is_a_protocol_error() {
    let repo = tempfile::tempdir().expect("tempdir");
    let (server, addr, handle) = start_broker(test_config(repo.path())).await;

    let mut client = TestClient::connect(addr).await;
    client
        .call(Request::Connect(ConnectRequest {
            user: "app".to_string(),
            credential: String::new(),
        }))
        .await;

    match client
        .call(Request::Define(DefineQueueRequest {
            name: "BADQ".to_string(),
            threshold: 0,
            disposition: Disposition::Temporary,
        }))
        .await
    {
        Reply::Error(e) => assert_eq!(e.code, ErrorCode::Protocol),
        other => panic!("expected protocol error, got {:?}", other),
    }

    server.shutdown();
    handle.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn path_like_queue_name_is_rejected_over_the_wire() {
    let repo = tempfile::tempdir().expect("tempdir");
    let (server, addr, handle) = start_broker(test_config(repo.path())).await;

    let mut client = TestClient::connect(addr).await;
    client
        .call(Request::Connect(ConnectRequest {
            user: "app".to_string(),
            credential: String::new(),
        }))
        .await;

    match client
        .call(Request::Define(DefineQueueRequest {
            name: "../../ESCAPED".to_string(),
            threshold: 4,
            disposition: Disposition::Permanent,
        }))
        .await
    {
        Reply::Error(e) => assert_eq!(e.code, ErrorCode::Protocol),
        other => panic!("expected protocol error, got {:?}", other),
    }

    server.shutdown();
    handle.await.expect("join").expect("clean shutdown");

    // Shutdown persisted nothing for the rejected name, inside the
    // repository tree or above it.
    assert!(!repo.path().join("repo").join("ESCAPED.qbk").exists());
    assert!(!repo.path().join("ESCAPED.qbk").exists());
}

#[tokio::test]
async fn unreadable_snapshot_degrades_to_missing_queue() {
    let repo = tempfile::tempdir().expect("tempdir");
    let snapshot_dir = repo.path().join("repo");
    std::fs::create_dir_all(&snapshot_dir).expect("mkdir");
    std::fs::write(snapshot_dir.join("BROKEN.qbk"), b"not a snapshot at all")
        .expect("write garbage");

    // Startup succeeds regardless; the damaged queue is simply absent.
    let (server, addr, handle) = start_broker(test_config(repo.path())).await;

    let mut client = TestClient::connect(addr).await;
    client
        .call(Request::Connect(ConnectRequest {
            user: "app".to_string(),
            credential: String::new(),
        }))
        .await;
    match client
        .call(Request::Query(QueryRequest {
            queue: "BROKEN".to_string(),
        }))
        .await
    {
        Reply::Error(e) => assert_eq!(e.code, ErrorCode::UnknownQueue),
        other => panic!("expected unknown-queue error, got {:?}", other),
    }

    server.shutdown();
    handle.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn invalid_configurations_are_rejected_before_startup() {
    let cases = [
        BrokerConfig {
            port: 0,
            ..Default::default()
        },
        BrokerConfig {
            socket_timeout_ms: 0,
            ..Default::default()
        },
        BrokerConfig {
            dead_queue_name: "   ".to_string(),
            ..Default::default()
        },
    ];
    for config in cases {
        match BrokerServer::new(config) {
            Err(RelayError::Config(_)) => {}
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }
}

#[tokio::test]
async fn malformed_peer_address_is_rejected_before_startup() {
    let config = BrokerConfig {
        peers: vec!["no-port-here".to_string()],
        ..Default::default()
    };
    assert!(BrokerServer::new(config).is_err());
}
