/// 协议角色
///
/// 每个角色都是 `Link`：一个端点加上一个打开传输的连接器。
/// TCP / TLS / UDP 之间的差别只在连接器与编解码器，执行通道与关闭协调完全复用。

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::{ByteCodec, DatagramCodec, FrameCodec};
use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::event::Listener;
use crate::state::EndpointState;
use crate::transport::{Connector, TcpConnector, UdpBinder};
use crate::Result;

pub mod reconnect;

pub use reconnect::{AutoReconnectClient, ExponentialBackoff, ReconnectPolicy};

/// 生命周期接口
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start(&self) -> Result<()>;
    fn stop(&self);
    fn is_start(&self) -> bool;
    fn state(&self) -> EndpointState;
}

/// 端点 + 连接器
pub struct Link<K: Connector, C: FrameCodec> {
    endpoint: Endpoint<C>,
    connector: Arc<K>,
}

impl<K: Connector, C: FrameCodec> Link<K, C> {
    pub fn with_connector(connector: K, endpoint: Endpoint<C>) -> Self {
        Self {
            endpoint,
            connector: Arc::new(connector),
        }
    }

    pub fn endpoint(&self) -> &Endpoint<C> {
        &self.endpoint
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// 打开传输并启动端点
    pub async fn start(&self) -> Result<()> {
        self.endpoint.start_with(self.connector.as_ref()).await
    }
}

impl<K: Connector, C: FrameCodec> Clone for Link<K, C> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            connector: self.connector.clone(),
        }
    }
}

impl<K: Connector, C: FrameCodec> fmt::Debug for Link<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("protocol", &self.connector.protocol_name())
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl<K: Connector, C: FrameCodec> Deref for Link<K, C> {
    type Target = Endpoint<C>;

    fn deref(&self) -> &Endpoint<C> {
        &self.endpoint
    }
}

#[async_trait]
impl<K: Connector, C: FrameCodec> Lifecycle for Link<K, C> {
    async fn start(&self) -> Result<()> {
        Link::start(self).await
    }

    fn stop(&self) {
        self.endpoint.stop();
    }

    fn is_start(&self) -> bool {
        self.endpoint.is_start()
    }

    fn state(&self) -> EndpointState {
        self.endpoint.state()
    }
}

/// TCP 客户端
pub type TcpClient = Link<TcpConnector, ByteCodec>;

/// UDP 发送端
pub type UdpSender = Link<UdpBinder, DatagramCodec>;

/// TLS 客户端
#[cfg(feature = "tls")]
pub type TlsClient = Link<crate::transport::TlsConnector, ByteCodec>;

impl Link<TcpConnector, ByteCodec> {
    pub fn new(target: impl Into<String>, config: EndpointConfig, listener: impl Listener<ByteCodec>) -> Self {
        Self::with_connector(TcpConnector::new(target), Endpoint::new(ByteCodec, config, listener))
    }

    /// `tcp://host:port/?recv_buffer_size=...`
    pub fn from_url(url: &str, listener: impl Listener<ByteCodec>) -> Result<Self> {
        let (target, config) = EndpointConfig::from_url(url)?;
        if target.scheme != "tcp" {
            return Err(TransportError::config_error(
                "url",
                format!("expected tcp scheme, found '{}'", target.scheme),
            ));
        }
        Ok(Self::new(target.authority(), config, listener))
    }
}

impl Link<UdpBinder, DatagramCodec> {
    /// 绑定 `bind_addr`；端口 0 由系统分配
    pub fn bind(bind_addr: SocketAddr, config: EndpointConfig, listener: impl Listener<DatagramCodec>) -> Self {
        Self::with_connector(UdpBinder::new(bind_addr), Endpoint::new(DatagramCodec, config, listener))
    }
}

#[cfg(feature = "tls")]
impl Link<crate::transport::TlsConnector, ByteCodec> {
    pub fn new(
        target: impl Into<String>,
        server_name: impl Into<String>,
        tls: Arc<rustls::ClientConfig>,
        config: EndpointConfig,
        listener: impl Listener<ByteCodec>,
    ) -> Result<Self> {
        let connector = crate::transport::TlsConnector::new(target, server_name, tls)?;
        Ok(Self::with_connector(connector, Endpoint::new(ByteCodec, config, listener)))
    }
}
