use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use msglane::{
    AutoReconnectClient, ByteCodec, Connector, EndpointConfig, EndpointState, ExponentialBackoff,
    NullListener, ReconnectPolicy, StreamTransport, TransportError,
};
use tokio::io::{duplex, DuplexStream};
use tokio::time::timeout;

/// 前 `refusals` 次打开被拒绝，之后返回内存管道
#[derive(Clone)]
struct FlakyConnector {
    calls: Arc<AtomicU32>,
    refusals: u32,
    peers: Arc<Mutex<Vec<DuplexStream>>>,
}

impl FlakyConnector {
    fn new(refusals: u32) -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            refusals,
            peers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    type Transport = StreamTransport<DuplexStream>;

    async fn open(&self, _config: &EndpointConfig) -> Result<Self::Transport, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.refusals {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }
        let (local, peer) = duplex(1024);
        self.peers.lock().unwrap().push(peer);
        Ok(StreamTransport::new(local))
    }

    fn protocol_name(&self) -> &'static str {
        "flaky"
    }
}

/// 记录每次给出的延迟
struct RecordingPolicy {
    backoff: ExponentialBackoff,
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl ReconnectPolicy for RecordingPolicy {
    fn next_delay(&self, attempt: u32, error: &TransportError) -> Option<Duration> {
        let delay = self.backoff.next_delay(attempt, error);
        if let Some(delay) = delay {
            self.delays.lock().unwrap().push(delay);
        }
        delay
    }
}

fn client(
    connector: FlakyConnector,
    max_retries: Option<u32>,
) -> (AutoReconnectClient<FlakyConnector, ByteCodec>, Arc<Mutex<Vec<Duration>>>) {
    let delays = Arc::new(Mutex::new(Vec::new()));
    let policy = RecordingPolicy {
        backoff: ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(100))
            .with_max_retries(max_retries),
        delays: delays.clone(),
    };
    let client = AutoReconnectClient::new(connector, || ByteCodec, EndpointConfig::default(), NullListener, policy);
    (client, delays)
}

#[tokio::test]
async fn reconnects_after_three_refusals() {
    let connector = FlakyConnector::new(3);
    let calls = connector.calls.clone();
    let (client, delays) = client(connector, None);

    timeout(Duration::from_secs(5), client.start()).await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(client.reconnect_attempts(), 3);
    assert_eq!(client.state(), EndpointState::Running);
    assert!(client.is_start());

    let delays = delays.lock().unwrap().clone();
    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));

    client.stop();
}

#[tokio::test]
async fn peer_close_triggers_fresh_endpoint() {
    let connector = FlakyConnector::new(0);
    let calls = connector.calls.clone();
    let peers = connector.peers.clone();
    let (client, _delays) = client(connector, None);

    client.start().await.unwrap();
    let first = client.current().unwrap();

    // 对端关闭：可重试错误触发重连
    peers.lock().unwrap().clear();

    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(current) = client.current() {
                if !current.ptr_eq(&first) && current.state() == EndpointState::Running {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(first.state(), EndpointState::Stopped);
    assert!(first.close_result().flatten().is_some_and(|e| e.is_retryable()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.reconnect_attempts(), 1);

    client.stop();
}

#[tokio::test]
async fn explicit_stop_does_not_reconnect() {
    let connector = FlakyConnector::new(0);
    let calls = connector.calls.clone();
    let (client, _delays) = client(connector, None);

    client.start().await.unwrap();
    let endpoint = client.current().unwrap();
    client.stop();

    assert_eq!(timeout(Duration::from_secs(5), endpoint.closed()).await.unwrap(), None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), EndpointState::Stopped);
    assert!(client.start().await.is_err());
}

#[tokio::test]
async fn gives_up_when_policy_is_exhausted() {
    let connector = FlakyConnector::new(10);
    let calls = connector.calls.clone();
    let (client, _delays) = client(connector, Some(2));

    let err = timeout(Duration::from_secs(5), client.start()).await.unwrap().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(client.reconnect_attempts(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(client.state(), EndpointState::Stopped);
}

#[tokio::test]
async fn start_again_after_giving_up() {
    let connector = FlakyConnector::new(2);
    let calls = connector.calls.clone();
    let (client, _delays) = client(connector, Some(1));

    let err = timeout(Duration::from_secs(5), client.start()).await.unwrap().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.state(), EndpointState::Stopped);

    // 放弃的那一代不再占用客户端，再次启动会重新连接
    timeout(Duration::from_secs(5), client.start()).await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(client.state(), EndpointState::Running);

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, TransportError::Configuration { ref field, .. } if field == "state"));

    client.stop();
}
