use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use msglane::{Accepted, ByteCodec, ChannelListener, Endpoint, EndpointConfig, EndpointEvent, RecvPayload, TransportError};
use parking_lot::Mutex;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn echo(endpoint: &Endpoint<ByteCodec>, event: EndpointEvent<RecvPayload>) {
    if let EndpointEvent::Received(payload) = event {
        endpoint.send(payload.to_bytes());
    }
}

#[tokio::test]
async fn endpoints_echo_large_payloads_over_small_pipe() {
    // 管道容量远小于往返的数据量，两端都必须边写边读
    let (a_side, b_side) = duplex(4096);

    let echoed = Arc::new(Mutex::new(Vec::new()));
    let sink = echoed.clone();
    let a = Endpoint::new(
        ByteCodec,
        EndpointConfig::default(),
        move |_: &Endpoint<ByteCodec>, event: EndpointEvent<RecvPayload>| {
            if let EndpointEvent::Received(payload) = event {
                sink.lock().extend_from_slice(&payload);
            }
        },
    );
    let b = Endpoint::new(ByteCodec, EndpointConfig::default(), echo);
    b.start_with(&Accepted::new(b_side)).await.unwrap();
    a.start_with(&Accepted::new(a_side)).await.unwrap();

    let mut expected = Vec::with_capacity(256 * 4096);
    for i in 0..256u32 {
        let chunk = vec![(i % 251) as u8; 4096];
        expected.extend_from_slice(&chunk);
        assert!(a.send(Bytes::from(chunk)));
    }

    timeout(WAIT, async {
        while echoed.lock().len() < expected.len() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("echoed back {} of {} bytes", echoed.lock().len(), expected.len()));

    assert!(*echoed.lock() == expected);

    assert_eq!(a.stop_and_wait().await, None);
    b.stop_and_wait().await;
    assert_eq!(a.stats().bytes_sent, expected.len() as u64);
}

#[tokio::test]
async fn silence_timeout_ends_stalled_write() {
    let (local, _peer) = duplex(4096);
    let config = EndpointConfig::default().with_silence_timeout(Some(Duration::from_millis(100)));
    let endpoint = Endpoint::new(ByteCodec, config, msglane::NullListener);
    endpoint.start_with(&Accepted::new(local)).await.unwrap();

    // 对端从不读取，写在背压下挂起
    let receipt = endpoint.send_async(Bytes::from(vec![7u8; 64 * 1024]));

    let error = timeout(Duration::from_secs(2), endpoint.closed()).await.unwrap();
    assert!(matches!(error, Some(TransportError::Timeout { ref operation, .. }) if operation == "silence"));

    let result = timeout(WAIT, receipt).await.unwrap();
    assert!(matches!(result, Err(TransportError::Timeout { .. })));
    assert_eq!(endpoint.stats().bytes_sent, 0);
}

#[tokio::test]
async fn receives_continue_while_write_is_blocked() {
    let (local, mut peer) = duplex(4096);
    let (listener, mut events) = ChannelListener::<ByteCodec>::new();
    let endpoint = Endpoint::new(ByteCodec, EndpointConfig::default(), listener);
    endpoint.start_with(&Accepted::new(local)).await.unwrap();

    let receipt = endpoint.send_async(Bytes::from(vec![1u8; 64 * 1024]));
    tokio::time::sleep(Duration::from_millis(20)).await;

    peer.write_all(b"ping").await.unwrap();
    let received = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some((_, EndpointEvent::Received(payload))) => return payload.to_bytes(),
                Some(_) => continue,
                None => panic!("listener channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(&received[..], b"ping");

    // 对端消失，挂起的写以错误结束并关闭端点
    drop(peer);
    assert!(timeout(WAIT, receipt).await.unwrap().is_err());
    assert!(timeout(WAIT, endpoint.closed()).await.unwrap().is_some());
}

#[tokio::test]
async fn stop_waits_for_in_flight_write() {
    let (local, mut peer) = duplex(4096);
    let endpoint = Endpoint::new(ByteCodec, EndpointConfig::default(), msglane::NullListener);
    endpoint.start_with(&Accepted::new(local)).await.unwrap();

    let payload = vec![3u8; 32 * 1024];
    let receipt = endpoint.send_async(Bytes::from(payload.clone()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    endpoint.stop();

    // 停止后在途的写仍然完整写出，然后连接关闭
    let mut received = Vec::new();
    timeout(WAIT, peer.read_to_end(&mut received)).await.unwrap().unwrap();
    assert_eq!(received, payload);

    assert_eq!(timeout(WAIT, receipt).await.unwrap(), Ok(payload.len()));
    assert_eq!(timeout(WAIT, endpoint.closed()).await.unwrap(), None);
}
