/// 会话服务器
///
/// 监听 TCP 端口，把每个接受的连接包装成会话端点（原始字节、TLS 或 HTTP），
/// 登记到会话表。停止服务器会结束接受循环并停止所有存活的会话。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{ByteCodec, FrameCodec};
use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::event::{Listener, NullListener};
use crate::registry::{SessionMap, SessionRegistry};
use crate::transport::tcp_session_connector;
use crate::Result;

type CodecFactory<C> = Arc<dyn Fn(&EndpointConfig) -> C + Send + Sync>;

/// 服务器构建器
pub struct ServerBuilder<C: FrameCodec> {
    make_codec: CodecFactory<C>,
    config: EndpointConfig,
    prepare_config: fn(EndpointConfig) -> EndpointConfig,
    listener: Arc<dyn Listener<C>>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl<C: FrameCodec> ServerBuilder<C> {
    pub fn new<F>(make_codec: F) -> Self
    where
        F: Fn(&EndpointConfig) -> C + Send + Sync + 'static,
    {
        Self {
            make_codec: Arc::new(make_codec),
            config: EndpointConfig::default(),
            prepare_config: std::convert::identity,
            listener: Arc::new(NullListener),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// 每个会话使用的端点配置
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn listener(mut self, listener: impl Listener<C>) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    pub fn shared_listener(mut self, listener: Arc<dyn Listener<C>>) -> Self {
        self.listener = listener;
        self
    }

    /// 在接受的连接上做 TLS 握手
    #[cfg(feature = "tls")]
    pub fn tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// 绑定地址并启动接受循环
    pub async fn bind(self, addr: impl ToSocketAddrs) -> Result<Server<C>> {
        let config = (self.prepare_config)(self.config);
        config.validate()?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::from(e).with_operation("bind"))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::from(e).with_operation("bind"))?;

        let inner = Arc::new(ServerInner {
            local_addr,
            sessions: Arc::new(SessionMap::new()),
            token: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        });

        let acceptor = Acceptor {
            inner: inner.clone(),
            make_codec: self.make_codec,
            config,
            listener: self.listener,
            #[cfg(feature = "tls")]
            tls: self.tls,
        };
        tokio::spawn(acceptor.run(listener));

        info!("🚀 服务器启动，监听: {}", local_addr);
        Ok(Server { inner })
    }
}

impl ServerBuilder<ByteCodec> {
    /// 原始字节会话
    pub fn tcp() -> Self {
        Self::new(|_| ByteCodec)
    }
}

#[cfg(feature = "http")]
impl ServerBuilder<crate::codec::HttpCodec> {
    /// HTTP 会话；未设置静默超时的配置使用 HTTP 默认值
    pub fn http() -> Self {
        let mut builder = Self::new(crate::codec::HttpCodec::from_config);
        builder.prepare_config = crate::session::http_session_config;
        builder
    }
}

struct ServerInner<C: FrameCodec> {
    local_addr: SocketAddr,
    sessions: Arc<SessionMap<C>>,
    token: CancellationToken,
    stopped: AtomicBool,
}

/// 运行中的服务器
pub struct Server<C: FrameCodec> {
    inner: Arc<ServerInner<C>>,
}

impl<C: FrameCodec> Clone for Server<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: FrameCodec> Server<C> {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn sessions(&self) -> &Arc<SessionMap<C>> {
        &self.inner.sessions
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn for_each_session(&self, f: impl FnMut(&Endpoint<C>)) {
        self.inner.sessions.for_each(f);
    }

    /// 停止接受新连接并停止所有会话
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("🛑 服务器停止: {} ({} 个会话)", self.inner.local_addr, self.session_count());
        self.inner.token.cancel();
        self.inner.sessions.stop_all();
    }

    /// 停止并等待所有会话关闭
    pub async fn stop_and_wait(&self) {
        self.stop();
        let sessions = self.inner.sessions.snapshot();
        join_all(sessions.iter().map(|session| session.closed())).await;
    }
}

struct Acceptor<C: FrameCodec> {
    inner: Arc<ServerInner<C>>,
    make_codec: CodecFactory<C>,
    config: EndpointConfig,
    listener: Arc<dyn Listener<C>>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl<C: FrameCodec> Acceptor<C> {
    async fn run(self, listener: TcpListener) {
        let mut accept_count = 0u64;
        loop {
            let accepted = tokio::select! {
                _ = self.inner.token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    accept_count += 1;
                    debug!("🔗 新连接 #{}: {}", accept_count, peer_addr);
                    self.spawn_session(stream);
                }
                Err(e) => {
                    error!("❌ 接受连接失败: {}", e);
                    // 文件描述符耗尽之类的错误会立刻重现，稍等再继续
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        info!("🏁 接受循环结束: {} (共接受 {} 个连接)", self.inner.local_addr, accept_count);
    }

    fn spawn_session(&self, stream: TcpStream) {
        let registry: Arc<dyn SessionRegistry<C>> = self.inner.sessions.clone();
        let endpoint = Endpoint::builder((self.make_codec)(&self.config))
            .config(self.config.clone())
            .shared_listener(self.listener.clone())
            .registry(registry)
            .build();
        let config = self.config.clone();
        let inner = self.inner.clone();
        #[cfg(feature = "tls")]
        let tls = self.tls.clone();

        tokio::spawn(async move {
            #[cfg(feature = "tls")]
            let started = match tls {
                Some(tls) => {
                    let connector = crate::transport::TlsAcceptConnector::new(stream, tls);
                    endpoint.start_with(&connector).await
                }
                None => start_plain(&endpoint, stream, &config).await,
            };
            #[cfg(not(feature = "tls"))]
            let started = start_plain(&endpoint, stream, &config).await;

            match started {
                Ok(()) => {
                    // 服务器可能在会话启动期间被停止
                    if inner.stopped.load(Ordering::Acquire) {
                        endpoint.stop();
                    }
                }
                Err(e) => warn!("⚠️ 会话 {} 启动失败: {}", endpoint.id(), e),
            }
        });
    }
}

async fn start_plain<C: FrameCodec>(endpoint: &Endpoint<C>, stream: TcpStream, config: &EndpointConfig) -> Result<()> {
    let connector = tcp_session_connector(stream, config)?;
    endpoint.start_with(&connector).await
}
