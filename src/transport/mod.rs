/// 传输层抽象
///
/// `Transport` 是端点执行通道独占的传输句柄；`Connector` 负责打开它
/// （连接、绑定、接受后的握手等）。二者都是窄接口，协议角色通过组合它们得到。
///
/// 执行通道拿到传输后立即把它拆成读半部与写半部：接收始终保持投递，
/// 写操作在背压下挂起时也不会阻塞接收、停止信号与静默定时器。

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::config::EndpointConfig;
use crate::error::TransportError;

pub mod tcp;
pub mod udp;
#[cfg(feature = "tls")]
pub mod tls;

pub use tcp::{tcp_session_connector, TcpConnector, TcpTransport};
pub use udp::{UdpBinder, UdpRecvHalf, UdpSendHalf, UdpTransport};
#[cfg(feature = "tls")]
pub use tls::{TlsAcceptConnector, TlsConnector};

/// 一次接收的结果：字节数与来源地址（数据报传输才有）
pub type Received = (usize, Option<SocketAddr>);

/// 传输的读半部
#[async_trait]
pub trait TransportReader: Send + 'static {
    /// 接收数据到 `buf`
    ///
    /// 返回 `Ok(None)` 表示对端关闭了流。被取消时不能丢失已经读到的数据。
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<Received>>;
}

/// 传输的写半部
#[async_trait]
pub trait TransportWriter: Send + 'static {
    /// 写出一帧完整数据；`to` 仅对数据报传输有意义
    async fn send(&mut self, data: &[u8], to: Option<SocketAddr>) -> io::Result<usize>;

    /// 关闭传输（只会被调用一次）
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// 传输句柄
///
/// 传输在打开后被移动进端点的执行通道，由通道拆分，因此只有该通道能读写它。
pub trait Transport: Send + 'static {
    type Reader: TransportReader;
    type Writer: TransportWriter;

    /// 拆成可以同时挂起的读半部与写半部
    fn into_split(self) -> (Self::Reader, Self::Writer);

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// 传输工厂
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// 打开传输
    async fn open(&self, config: &EndpointConfig) -> Result<Self::Transport, TransportError>;

    /// 日志里使用的协议名
    fn protocol_name(&self) -> &'static str;
}

/// 字节流的读半部
pub struct StreamReader<R> {
    inner: R,
}

/// 字节流的写半部
pub struct StreamWriter<W> {
    inner: W,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> TransportReader for StreamReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<Received>> {
        match self.inner.read(buf).await? {
            0 => Ok(None), // 连接关闭
            n => Ok(Some((n, None))),
        }
    }
}

#[async_trait]
impl<W> TransportWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, data: &[u8], _to: Option<SocketAddr>) -> io::Result<usize> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(data.len())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// 基于任意字节流的传输（TLS、内存管道……），用 `tokio::io::split` 拆分
pub struct StreamTransport<S> {
    stream: S,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            local_addr: None,
            peer_addr: None,
        }
    }

    pub fn with_addrs(mut self, local_addr: Option<SocketAddr>, peer_addr: Option<SocketAddr>) -> Self {
        self.local_addr = local_addr;
        self.peer_addr = peer_addr;
        self
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Reader = StreamReader<ReadHalf<S>>;
    type Writer = StreamWriter<WriteHalf<S>>;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        let (reader, writer) = tokio::io::split(self.stream);
        (StreamReader::new(reader), StreamWriter::new(writer))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// 已经建立好的传输（服务端 accept 得到的连接、测试里的内存管道）
///
/// 只能被打开一次。
pub struct Accepted<T> {
    transport: Mutex<Option<T>>,
    protocol: &'static str,
}

impl<S> Accepted<StreamTransport<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self::from_transport(StreamTransport::new(stream), "stream")
    }
}

impl<T: Transport> Accepted<T> {
    pub fn from_transport(transport: T, protocol: &'static str) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            protocol,
        }
    }
}

#[async_trait]
impl<T: Transport> Connector for Accepted<T> {
    type Transport = T;

    async fn open(&self, _config: &EndpointConfig) -> Result<Self::Transport, TransportError> {
        self.transport
            .lock()
            .take()
            .ok_or_else(|| TransportError::connection_error("accepted stream already opened", false))
    }

    fn protocol_name(&self) -> &'static str {
        self.protocol
    }
}

/// 设置 SO_SNDBUF / SO_RCVBUF
pub(crate) fn apply_buffer_sizes(socket: socket2::SockRef<'_>, config: &EndpointConfig) -> io::Result<()> {
    if let Some(size) = config.so_sndbuf {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = config.so_rcvbuf {
        socket.set_recv_buffer_size(size)?;
    }
    Ok(())
}
