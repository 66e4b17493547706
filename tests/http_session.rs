#![cfg(feature = "http")]

use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use msglane::{
    ChannelListener, Endpoint, EndpointConfig, EndpointEvent, HttpCodec, HttpOutbound, ServerBuilder,
    TransportError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn respond(endpoint: &Endpoint<HttpCodec>, event: EndpointEvent<Request<Bytes>>) {
    match event {
        EndpointEvent::Received(request) => {
            let path = request.uri().path().to_string();
            if path == "/raw" {
                endpoint.send(HttpOutbound::from("HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n"));
                return;
            }
            let response = Response::builder()
                .status(StatusCode::OK)
                .header("x-path", path)
                .body(request.into_body())
                .unwrap();
            endpoint.send(response.into());
        }
        EndpointEvent::Closed(Some(error)) => {
            tracing::debug!("session closed: {}", error);
        }
        _ => {}
    }
}

async fn read_until(stream: &mut TcpStream, done: impl Fn(&str) -> bool) -> String {
    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    while !done(&String::from_utf8_lossy(&received)) {
        let n = timeout(WAIT, stream.read(&mut chunk)).await.unwrap().unwrap();
        assert!(n > 0, "connection closed early: {:?}", String::from_utf8_lossy(&received));
        received.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(received).unwrap()
}

#[tokio::test]
async fn http_session_answers_pipelined_requests() {
    let server = ServerBuilder::http().listener(respond).bind("127.0.0.1:0").await.unwrap();
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    stream
        .write_all(b"POST /echo HTTP/1.1\r\nHost: test\r\nContent-Length: 5\r\n\r\nhelloGET /raw HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let text = read_until(&mut stream, |text| text.ends_with("204 No Content\r\ncontent-length: 0\r\n\r\n")).await;
    let (first, second) = text.split_at(text.find("HTTP/1.1 204").unwrap());

    // 响应顺序与请求顺序一致
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(first.contains("x-path: /echo\r\n"));
    assert!(first.contains("content-length: 5\r\n"));
    assert!(first.ends_with("\r\n\r\nhello"));
    assert!(second.starts_with("HTTP/1.1 204 No Content"));

    server.stop_and_wait().await;
}

#[tokio::test]
async fn chunked_request_stops_the_session() {
    let server = ServerBuilder::http().listener(respond).bind("127.0.0.1:0").await.unwrap();
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    stream
        .write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n")
        .await
        .unwrap();

    // 服务端关闭连接（FIN 或 RST），不返回任何响应
    let mut rest = Vec::new();
    let read = timeout(WAIT, stream.read_to_end(&mut rest)).await.unwrap();
    assert!(read.map_or(true, |n| n == 0));
    assert!(rest.is_empty());

    timeout(WAIT, async {
        while server.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    server.stop();
}

#[tokio::test]
async fn idle_http_session_times_out() {
    let config = EndpointConfig::default().with_silence_timeout(Some(Duration::from_millis(100)));
    let (listener, mut events) = ChannelListener::<HttpCodec>::new();
    let server = ServerBuilder::http()
        .config(config)
        .listener(listener)
        .bind("127.0.0.1:0")
        .await
        .unwrap();
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    // 会话在静默超时后关闭连接
    let mut rest = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());

    let error = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some((_, EndpointEvent::Closed(error))) => return error,
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(error, Some(TransportError::Timeout { .. })));

    server.stop();
}
