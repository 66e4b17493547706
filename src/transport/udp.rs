use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::{apply_buffer_sizes, Connector, Received, Transport, TransportReader, TransportWriter};
use crate::config::EndpointConfig;
use crate::error::TransportError;

/// UDP 传输
///
/// 发送时没有给出目标地址则使用默认对端；零长度数据报是合法的接收（心跳）。
pub struct UdpTransport {
    socket: UdpSocket,
    default_peer: Option<SocketAddr>,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket, default_peer: Option<SocketAddr>) -> Self {
        Self { socket, default_peer }
    }
}

impl Transport for UdpTransport {
    type Reader = UdpRecvHalf;
    type Writer = UdpSendHalf;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        // recv_from / send_to 只需要 &self，两半共享同一个套接字
        let socket = Arc::new(self.socket);
        (
            UdpRecvHalf { socket: socket.clone() },
            UdpSendHalf {
                socket,
                default_peer: self.default_peer,
            },
        )
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.default_peer
    }
}

pub struct UdpRecvHalf {
    socket: Arc<UdpSocket>,
}

pub struct UdpSendHalf {
    socket: Arc<UdpSocket>,
    default_peer: Option<SocketAddr>,
}

#[async_trait]
impl TransportReader for UdpRecvHalf {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<Received>> {
        let (n, from) = self.socket.recv_from(buf).await?;
        Ok(Some((n, Some(from))))
    }
}

#[async_trait]
impl TransportWriter for UdpSendHalf {
    async fn send(&mut self, data: &[u8], to: Option<SocketAddr>) -> io::Result<usize> {
        let target = to.or(self.default_peer).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "udp datagram has no destination")
        })?;
        self.socket.send_to(data, target).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        // UDP 没有连接可关闭，套接字随两个半部一起释放
        Ok(())
    }
}

/// UDP 绑定器：绑定本地地址并应用套接字选项
#[derive(Debug, Clone)]
pub struct UdpBinder {
    bind_addr: SocketAddr,
    default_peer: Option<SocketAddr>,
}

impl UdpBinder {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            default_peer: None,
        }
    }

    /// 未指定目标的数据报发往该地址
    pub fn with_default_peer(mut self, peer: SocketAddr) -> Self {
        self.default_peer = Some(peer);
        self
    }
}

#[async_trait]
impl Connector for UdpBinder {
    type Transport = UdpTransport;

    async fn open(&self, config: &EndpointConfig) -> Result<Self::Transport, TransportError> {
        let socket = Socket::new(Domain::for_address(self.bind_addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::from(e).with_operation("socket"))?;

        apply_buffer_sizes(socket2::SockRef::from(&socket), config)
            .map_err(|e| TransportError::config_error("socket_options", e.to_string()))?;

        socket
            .bind(&self.bind_addr.into())
            .map_err(|e| TransportError::from(e).with_operation("bind"))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::from(e).with_operation("bind"))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| TransportError::from(e).with_operation("bind"))?;

        tracing::debug!("✅ UDP套接字绑定在: {:?}", socket.local_addr().ok());
        Ok(UdpTransport::new(socket, self.default_peer))
    }

    fn protocol_name(&self) -> &'static str {
        "udp"
    }
}
