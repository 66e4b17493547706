/// msglane - 跨协议异步网络端点框架
///
/// TCP、TLS、UDP 与 HTTP 角色共享同一套端点机制：生命周期状态机、
/// 串行化的收发通道、先排空再关闭的关闭协调，以及自适应的接收缓冲区复用。
/// 协议角色通过组合连接器与编解码器得到，而不是各自重新实现收发循环。

use std::sync::atomic::{AtomicU64, Ordering};

pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod transport;

/// 端点ID的类型安全包装器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// 分配下一个进程内唯一的ID
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "endpoint-{}", self.0)
    }
}

impl From<u64> for EndpointId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<EndpointId> for u64 {
    fn from(id: EndpointId) -> Self {
        id.0
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, TransportError>;

// 重新导出核心类型
pub use buffer::{BufferStats, BufferStatsSnapshot, RecvBuffer, RecvPayload};
pub use client::{
    AutoReconnectClient, ExponentialBackoff, Lifecycle, Link, ReconnectPolicy, TcpClient, UdpSender,
};
pub use codec::{ByteCodec, Datagram, DatagramCodec, FrameCodec};
pub use config::{EndpointConfig, EndpointTarget};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointStatsSnapshot, SendReceipt, SendResult, WeakEndpoint};
pub use error::{ErrorKind, TransportError};
pub use event::{ChannelListener, EndpointEvent, EventReceiver, Listener, NullListener};
pub use registry::{SessionMap, SessionRegistry};
pub use server::{Server, ServerBuilder};
pub use session::TcpSession;
pub use state::EndpointState;
pub use transport::{
    Accepted, Connector, StreamTransport, TcpConnector, TcpTransport, Transport, TransportReader, TransportWriter,
    UdpBinder,
};

#[cfg(feature = "tls")]
pub use client::TlsClient;
#[cfg(feature = "tls")]
pub use session::TlsSession;
#[cfg(feature = "tls")]
pub use transport::{TlsAcceptConnector, TlsConnector};

#[cfg(feature = "http")]
pub use codec::{HttpCodec, HttpOutbound};
#[cfg(feature = "http")]
pub use session::HttpSession;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_ids_are_unique() {
        let a = EndpointId::next();
        let b = EndpointId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(EndpointId::new(7).to_string(), "endpoint-7");
    }
}
