/// 端点事件与监听器
///
/// 监听器在端点的执行通道上被调用（拒绝发送时则在调用方线程上），不能阻塞。
/// 如果监听器在调用之外保留了接收载荷，下一次接收会换用新的缓冲区。

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::codec::FrameCodec;
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::EndpointId;

/// 端点事件
#[derive(Debug)]
pub enum EndpointEvent<T> {
    /// 传输已打开，端点开始接受发送
    Started,
    /// 解码出的入站帧
    Received(T),
    /// 一次发送处理完成（成功或失败）
    Sent {
        result: Result<usize, TransportError>,
        /// 数据报的目标地址
        to: Option<SocketAddr>,
    },
    /// 端点已关闭；显式停止时错误为 None。每个端点只触发一次
    Closed(Option<TransportError>),
}

impl<T> EndpointEvent<T> {
    pub fn is_closed(&self) -> bool {
        matches!(self, EndpointEvent::Closed(_))
    }

    pub fn is_received(&self) -> bool {
        matches!(self, EndpointEvent::Received(_))
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            EndpointEvent::Started => "started",
            EndpointEvent::Received(_) => "received",
            EndpointEvent::Sent { .. } => "sent",
            EndpointEvent::Closed(_) => "closed",
        }
    }
}

/// 事件监听器
pub trait Listener<C: FrameCodec>: Send + Sync + 'static {
    fn notify(&self, endpoint: &Endpoint<C>, event: EndpointEvent<C::In>);
}

impl<C, F> Listener<C> for F
where
    C: FrameCodec,
    F: Fn(&Endpoint<C>, EndpointEvent<C::In>) + Send + Sync + 'static,
{
    fn notify(&self, endpoint: &Endpoint<C>, event: EndpointEvent<C::In>) {
        self(endpoint, event)
    }
}

/// 丢弃所有事件的监听器
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl<C: FrameCodec> Listener<C> for NullListener {
    fn notify(&self, _endpoint: &Endpoint<C>, _event: EndpointEvent<C::In>) {}
}

/// 把事件转发到无界通道，由调用方在自己的任务里消费
pub struct ChannelListener<C: FrameCodec> {
    tx: mpsc::UnboundedSender<(EndpointId, EndpointEvent<C::In>)>,
}

/// `ChannelListener` 的接收端
pub type EventReceiver<C> = mpsc::UnboundedReceiver<(EndpointId, EndpointEvent<<C as FrameCodec>::In>)>;

impl<C: FrameCodec> ChannelListener<C> {
    pub fn new() -> (Self, EventReceiver<C>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<C: FrameCodec> Clone for ChannelListener<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<C: FrameCodec> Listener<C> for ChannelListener<C> {
    fn notify(&self, endpoint: &Endpoint<C>, event: EndpointEvent<C::In>) {
        if self.tx.send((endpoint.id(), event)).is_err() {
            tracing::trace!("📭 事件接收端已关闭，丢弃端点 {} 的事件", endpoint.id());
        }
    }
}
