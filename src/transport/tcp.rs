use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::{apply_buffer_sizes, Accepted, Connector, StreamReader, StreamWriter, Transport};
use crate::config::EndpointConfig;
use crate::error::TransportError;

/// TCP 传输
///
/// 用 `TcpStream::into_split` 拆成自有的读写半部，两半之间不共享锁。
pub struct TcpTransport {
    stream: TcpStream,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        Self {
            stream,
            local_addr,
            peer_addr,
        }
    }
}

impl Transport for TcpTransport {
    type Reader = StreamReader<OwnedReadHalf>;
    type Writer = StreamWriter<OwnedWriteHalf>;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        let (reader, writer) = self.stream.into_split();
        (StreamReader::new(reader), StreamWriter::new(writer))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// TCP 客户端连接器
///
/// 目标地址以 `host:port` 给出，解析交给 tokio。
#[derive(Debug, Clone)]
pub struct TcpConnector {
    target: String,
}

impl TcpConnector {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into() }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn open(&self, config: &EndpointConfig) -> Result<Self::Transport, TransportError> {
        tracing::debug!("🔌 TCP客户端连接到: {}", self.target);

        let stream = TcpStream::connect(self.target.as_str())
            .await
            .map_err(|e| TransportError::from(e).with_operation("connect"))?;

        tracing::debug!("✅ TCP连接建立成功: {}", self.target);
        prepare_stream(stream, config)
    }

    fn protocol_name(&self) -> &'static str {
        "tcp"
    }
}

/// 把服务端接受的 TCP 连接包装成会话连接器
pub fn tcp_session_connector(
    stream: TcpStream,
    config: &EndpointConfig,
) -> Result<Accepted<TcpTransport>, TransportError> {
    Ok(Accepted::from_transport(prepare_stream(stream, config)?, "tcp"))
}

/// 应用套接字选项并记录地址
pub(crate) fn prepare_stream(stream: TcpStream, config: &EndpointConfig) -> Result<TcpTransport, TransportError> {
    configure_tcp(&stream, config)?;
    Ok(TcpTransport::new(stream))
}

pub(crate) fn configure_tcp(stream: &TcpStream, config: &EndpointConfig) -> Result<(), TransportError> {
    stream
        .set_nodelay(config.nodelay)
        .map_err(|e| TransportError::from(e).with_operation("set_nodelay"))?;
    apply_buffer_sizes(socket2::SockRef::from(stream), config)
        .map_err(|e| TransportError::config_error("socket_options", e.to_string()))
}
