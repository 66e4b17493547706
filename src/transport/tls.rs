/// TLS-over-TCP 传输
///
/// 复用同一个 `StreamTransport` 与执行通道，只替换底层流为加密流。
/// TLS 记录层与握手完全交给 rustls。

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;

use super::tcp::configure_tcp;
use super::{Connector, StreamTransport};
use crate::config::EndpointConfig;
use crate::error::TransportError;

/// TLS 客户端连接器
#[derive(Clone)]
pub struct TlsConnector {
    target: String,
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// `server_name` 用于 SNI 与证书校验
    pub fn new(
        target: impl Into<String>,
        server_name: impl Into<String>,
        config: Arc<ClientConfig>,
    ) -> Result<Self, TransportError> {
        let server_name = ServerName::try_from(server_name.into())
            .map_err(|e| TransportError::config_error("server_name", e.to_string()))?;
        Ok(Self {
            target: target.into(),
            server_name,
            config,
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    type Transport = StreamTransport<tokio_rustls::client::TlsStream<TcpStream>>;

    async fn open(&self, config: &EndpointConfig) -> Result<Self::Transport, TransportError> {
        tracing::debug!("🔐 TLS客户端连接到: {}", self.target);

        let stream = TcpStream::connect(self.target.as_str())
            .await
            .map_err(|e| TransportError::from(e).with_operation("connect"))?;
        configure_tcp(&stream, config)?;
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();

        let stream = tokio_rustls::TlsConnector::from(self.config.clone())
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| TransportError::from(e).with_operation("tls_handshake"))?;

        tracing::debug!("✅ TLS握手完成: {}", self.target);
        Ok(StreamTransport::new(stream).with_addrs(local_addr, peer_addr))
    }

    fn protocol_name(&self) -> &'static str {
        "tls"
    }
}

/// 服务端 TLS 会话连接器：打开时在接受的 TCP 连接上完成握手
pub struct TlsAcceptConnector {
    stream: Mutex<Option<TcpStream>>,
    acceptor: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptConnector {
    pub fn new(stream: TcpStream, config: Arc<ServerConfig>) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            acceptor: tokio_rustls::TlsAcceptor::from(config),
        }
    }
}

#[async_trait]
impl Connector for TlsAcceptConnector {
    type Transport = StreamTransport<tokio_rustls::server::TlsStream<TcpStream>>;

    async fn open(&self, config: &EndpointConfig) -> Result<Self::Transport, TransportError> {
        let stream = self
            .stream
            .lock()
            .take()
            .ok_or_else(|| TransportError::connection_error("accepted stream already opened", false))?;
        configure_tcp(&stream, config)?;
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();

        let stream = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::from(e).with_operation("tls_handshake"))?;

        tracing::debug!("✅ TLS服务端握手完成: {:?}", peer_addr);
        Ok(StreamTransport::new(stream).with_addrs(local_addr, peer_addr))
    }

    fn protocol_name(&self) -> &'static str {
        "tls"
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// 使用给定根证书构建客户端配置
pub fn client_config(roots: RootCertStore) -> Result<Arc<ClientConfig>, TransportError> {
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::config_error("tls", e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// 使用内置的 webpki 根证书构建客户端配置
pub fn webpki_client_config() -> Result<Arc<ClientConfig>, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    client_config(roots)
}

/// 使用证书链与私钥构建服务端配置
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TransportError> {
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::config_error("tls", e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::config_error("tls", format!("invalid certificate or key: {}", e)))?;
    Ok(Arc::new(config))
}

/// 从 PEM 文件加载证书链与私钥
pub fn server_config_from_pem(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Arc<ServerConfig>, TransportError> {
    let certs = load_certs(cert_path.as_ref())?;
    let key = load_private_key(key_path.as_ref())?;
    server_config(certs, key)
}

/// 从 PEM 文件加载证书
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::config_error("tls_cert", format!("cannot open '{}': {}", path.display(), e))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::config_error("tls_cert", e.to_string()))?;
    if certs.is_empty() {
        return Err(TransportError::config_error(
            "tls_cert",
            format!("no certificate found in '{}'", path.display()),
        ));
    }
    Ok(certs)
}

/// 从 PEM 文件加载私钥（PKCS#8 / PKCS#1 / SEC1）
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::config_error("tls_key", format!("cannot open '{}': {}", path.display(), e))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::config_error("tls_key", e.to_string()))?
        .ok_or_else(|| {
            TransportError::config_error("tls_key", format!("no private key found in '{}'", path.display()))
        })
}
