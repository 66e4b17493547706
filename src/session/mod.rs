/// 服务端会话角色
///
/// 会话包装服务端已经接受的连接。TLS 会话在启动时完成握手；
/// HTTP 会话换用 HTTP 编解码器并默认带有静默超时。

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::client::Link;
use crate::codec::{ByteCodec, FrameCodec};
use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::event::Listener;
use crate::registry::SessionRegistry;
use crate::transport::{tcp_session_connector, Accepted, TcpTransport};
use crate::Result;

#[cfg(feature = "http")]
use crate::codec::HttpCodec;
#[cfg(feature = "http")]
use crate::config::HTTP_SILENCE_TIMEOUT;

/// 原始 TCP 会话
pub type TcpSession = Link<Accepted<TcpTransport>, ByteCodec>;

/// TLS 会话
#[cfg(feature = "tls")]
pub type TlsSession = Link<crate::transport::TlsAcceptConnector, ByteCodec>;

/// HTTP 会话
#[cfg(feature = "http")]
pub type HttpSession = Link<Accepted<TcpTransport>, HttpCodec>;

fn session_endpoint<C: FrameCodec>(
    codec: C,
    config: EndpointConfig,
    listener: Arc<dyn Listener<C>>,
    registry: Option<Arc<dyn SessionRegistry<C>>>,
) -> Endpoint<C> {
    let builder = Endpoint::builder(codec).config(config).shared_listener(listener);
    match registry {
        Some(registry) => builder.registry(registry).build(),
        None => builder.build(),
    }
}

impl Link<Accepted<TcpTransport>, ByteCodec> {
    pub fn accept(
        stream: TcpStream,
        config: EndpointConfig,
        listener: Arc<dyn Listener<ByteCodec>>,
        registry: Option<Arc<dyn SessionRegistry<ByteCodec>>>,
    ) -> Result<Self> {
        let connector = tcp_session_connector(stream, &config)?;
        Ok(Self::with_connector(
            connector,
            session_endpoint(ByteCodec, config, listener, registry),
        ))
    }
}

#[cfg(feature = "tls")]
impl Link<crate::transport::TlsAcceptConnector, ByteCodec> {
    pub fn accept(
        stream: TcpStream,
        tls: Arc<rustls::ServerConfig>,
        config: EndpointConfig,
        listener: Arc<dyn Listener<ByteCodec>>,
        registry: Option<Arc<dyn SessionRegistry<ByteCodec>>>,
    ) -> Self {
        Self::with_connector(
            crate::transport::TlsAcceptConnector::new(stream, tls),
            session_endpoint(ByteCodec, config, listener, registry),
        )
    }
}

#[cfg(feature = "http")]
impl Link<Accepted<TcpTransport>, HttpCodec> {
    /// 未设置静默超时时使用 [`HTTP_SILENCE_TIMEOUT`]
    pub fn accept(
        stream: TcpStream,
        config: EndpointConfig,
        listener: Arc<dyn Listener<HttpCodec>>,
        registry: Option<Arc<dyn SessionRegistry<HttpCodec>>>,
    ) -> Result<Self> {
        let config = http_session_config(config);
        let connector = tcp_session_connector(stream, &config)?;
        let codec = HttpCodec::from_config(&config);
        Ok(Self::with_connector(
            connector,
            session_endpoint(codec, config, listener, registry),
        ))
    }
}

/// HTTP 会话默认带有静默超时
#[cfg(feature = "http")]
pub fn http_session_config(config: EndpointConfig) -> EndpointConfig {
    if config.silence_timeout.is_some() {
        config
    } else {
        config.with_silence_timeout(Some(HTTP_SILENCE_TIMEOUT))
    }
}
