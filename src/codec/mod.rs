/// 帧编解码
///
/// 执行通道在每次接收完成后把缓冲区交给编解码器，编解码器产出零个或多个入站帧；
/// 发送时把出站帧编码进通道复用的写缓冲区。

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};

use crate::buffer::RecvPayload;
use crate::error::TransportError;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use self::http::{HttpCodec, HttpOutbound};

/// 帧编解码器
pub trait FrameCodec: Send + 'static {
    /// 交给监听器的入站帧
    type In: Send + 'static;
    /// 调用方提交的出站帧
    type Out: Send + 'static;

    /// 处理一次接收完成
    ///
    /// 产出的帧追加到 `out`。如果入站帧持有 `buf` 的克隆并在交付后被监听器保留，
    /// 缓冲区管理器会换用新的缓冲区。
    fn decode(
        &mut self,
        buf: &RecvPayload,
        from: Option<SocketAddr>,
        out: &mut Vec<Self::In>,
    ) -> Result<(), TransportError>;

    /// 编码一个出站帧；返回数据报的目标地址（流式传输返回 None）
    fn encode(&mut self, item: Self::Out, dst: &mut BytesMut) -> Result<Option<SocketAddr>, TransportError>;
}

/// 原始字节流编解码：接收缓冲区原样交给监听器
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteCodec;

impl FrameCodec for ByteCodec {
    type In = RecvPayload;
    type Out = Bytes;

    fn decode(
        &mut self,
        buf: &RecvPayload,
        _from: Option<SocketAddr>,
        out: &mut Vec<Self::In>,
    ) -> Result<(), TransportError> {
        out.push(buf.clone());
        Ok(())
    }

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<Option<SocketAddr>, TransportError> {
        dst.extend_from_slice(&item);
        Ok(None)
    }
}

/// 带对端地址的数据报
#[derive(Debug, Clone)]
pub struct Datagram<P> {
    pub peer: SocketAddr,
    pub payload: P,
}

impl<P> Datagram<P> {
    pub fn new(peer: SocketAddr, payload: P) -> Self {
        Self { peer, payload }
    }
}

impl Datagram<Bytes> {
    pub fn to(peer: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self::new(peer, payload.into())
    }
}

/// 数据报编解码：每个数据报一个帧，零长度数据报同样交付
#[derive(Debug, Default, Clone, Copy)]
pub struct DatagramCodec;

impl FrameCodec for DatagramCodec {
    type In = Datagram<RecvPayload>;
    type Out = Datagram<Bytes>;

    fn decode(
        &mut self,
        buf: &RecvPayload,
        from: Option<SocketAddr>,
        out: &mut Vec<Self::In>,
    ) -> Result<(), TransportError> {
        let peer = from.ok_or_else(|| {
            TransportError::protocol_error("udp", "datagram received without a source address")
        })?;
        out.push(Datagram::new(peer, buf.clone()));
        Ok(())
    }

    fn encode(&mut self, item: Datagram<Bytes>, dst: &mut BytesMut) -> Result<Option<SocketAddr>, TransportError> {
        dst.extend_from_slice(&item.payload);
        Ok(Some(item.peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RecvBuffer;
    use std::sync::Arc;

    #[test]
    fn byte_codec_shares_the_buffer() {
        let buf: RecvPayload = Arc::new(RecvBuffer::new(8));
        let mut out = Vec::new();
        ByteCodec.decode(&buf, None, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(Arc::ptr_eq(&out[0], &buf));
        out.clear();
        assert_eq!(Arc::strong_count(&buf), 1);
    }

    #[test]
    fn datagram_codec_requires_source() {
        let buf: RecvPayload = Arc::new(RecvBuffer::new(8));
        let mut out = Vec::new();
        let err = DatagramCodec.decode(&buf, None, &mut out).unwrap_err();
        assert!(matches!(err, TransportError::Protocol { .. }));
    }

    #[test]
    fn datagram_codec_returns_destination() {
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut dst = BytesMut::new();
        let to = DatagramCodec.encode(Datagram::to(peer, "ping"), &mut dst).unwrap();
        assert_eq!(to, Some(peer));
        assert_eq!(&dst[..], b"ping");
    }
}
