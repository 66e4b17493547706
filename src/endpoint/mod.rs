/// 端点：生命周期状态机 + 串行化 I/O 通道 + 关闭协调
///
/// `Endpoint` 是可克隆的句柄。传输在打开后被移动进端点自己的执行通道
/// （一个 tokio 任务），发送队列、唯一的在途接收、静默定时器与停止信号都在这个任务里串行处理。
/// 执行通道持有一个强引用，因此端点在任何在途操作完成之前不会被释放；
/// 会话注册表只持有弱引用。

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::FrameCodec;
use crate::config::EndpointConfig;
use crate::error::TransportError;
use crate::event::{EndpointEvent, Listener, NullListener};
use crate::registry::SessionRegistry;
use crate::state::{EndpointState, StateCell};
use crate::transport::{Connector, Transport, TransportWriter};
use crate::{EndpointId, Result};

mod lane;
mod send;
mod stats;

pub use send::{SendReceipt, SendResult};
pub use stats::{EndpointStats, EndpointStatsSnapshot};

use send::{Completion, SendOp};

/// 执行通道启动时从端点取走的部件
pub(crate) struct LaneParts<C: FrameCodec> {
    rx: mpsc::UnboundedReceiver<SendOp<C::Out>>,
    codec: C,
}

struct Shared<C: FrameCodec> {
    id: EndpointId,
    config: EndpointConfig,
    state: StateCell,
    send_tx: mpsc::UnboundedSender<SendOp<C::Out>>,
    lane_parts: Mutex<Option<LaneParts<C>>>,
    listener: Arc<dyn Listener<C>>,
    registry: Option<Arc<dyn SessionRegistry<C>>>,
    stop_token: CancellationToken,
    /// 关闭通知的一次性保护
    close_fired: AtomicBool,
    close_result: OnceLock<Option<TransportError>>,
    closed_notify: Notify,
    open: AtomicBool,
    addrs: Mutex<(Option<SocketAddr>, Option<SocketAddr>)>,
    stats: EndpointStats,
}

/// 端点句柄
pub struct Endpoint<C: FrameCodec> {
    shared: Arc<Shared<C>>,
}

impl<C: FrameCodec> Clone for Endpoint<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: FrameCodec> fmt::Debug for Endpoint<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// 端点构建器
pub struct EndpointBuilder<C: FrameCodec> {
    codec: C,
    config: EndpointConfig,
    listener: Arc<dyn Listener<C>>,
    registry: Option<Arc<dyn SessionRegistry<C>>>,
}

impl<C: FrameCodec> EndpointBuilder<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            config: EndpointConfig::default(),
            listener: Arc::new(NullListener),
            registry: None,
        }
    }

    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn listener(mut self, listener: impl Listener<C>) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    /// 多个端点共享同一个监听器
    pub fn shared_listener(mut self, listener: Arc<dyn Listener<C>>) -> Self {
        self.listener = listener;
        self
    }

    pub fn registry(mut self, registry: Arc<dyn SessionRegistry<C>>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Endpoint<C> {
        let (send_tx, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            id: EndpointId::next(),
            config: self.config,
            state: StateCell::new(),
            send_tx,
            lane_parts: Mutex::new(Some(LaneParts { rx, codec: self.codec })),
            listener: self.listener,
            registry: self.registry,
            stop_token: CancellationToken::new(),
            close_fired: AtomicBool::new(false),
            close_result: OnceLock::new(),
            closed_notify: Notify::new(),
            open: AtomicBool::new(false),
            addrs: Mutex::new((None, None)),
            stats: EndpointStats::default(),
        };
        trace!("🆕 创建端点 {}", shared.id);
        Endpoint {
            shared: Arc::new(shared),
        }
    }
}

impl<C: FrameCodec> Endpoint<C> {
    pub fn builder(codec: C) -> EndpointBuilder<C> {
        EndpointBuilder::new(codec)
    }

    pub fn new(codec: C, config: EndpointConfig, listener: impl Listener<C>) -> Self {
        EndpointBuilder::new(codec).config(config).listener(listener).build()
    }

    pub fn id(&self) -> EndpointId {
        self.shared.id
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }

    pub fn state(&self) -> EndpointState {
        self.shared.state.get()
    }

    /// 状态不早于 started 且传输处于打开状态
    pub fn is_start(&self) -> bool {
        self.state() >= EndpointState::Started && self.shared.open.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.addrs.lock().0
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.addrs.lock().1
    }

    pub fn stats(&self) -> EndpointStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn downgrade(&self) -> WeakEndpoint<C> {
        WeakEndpoint {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// 是否是同一个端点
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// 打开传输并启动执行通道
    ///
    /// 只能在 created 状态调用一次；否则返回配置错误且不影响现有状态。
    /// 传输打开失败时端点直接进入 stopped，不触发 Closed 事件，`closed()` 返回该错误。
    pub async fn start_with<K: Connector>(&self, connector: &K) -> Result<()> {
        let shared = &self.shared;
        shared.config.validate()?;

        if !shared.state.transition(EndpointState::Created, EndpointState::Starting) {
            let state = self.state();
            warn!("⚠️ 端点 {} 重复启动，当前状态: {}", shared.id, state);
            return Err(TransportError::config_error(
                "state",
                format!("start() requires state created, found {}", state),
            ));
        }

        info!("🚀 启动端点 {} ({})", shared.id, connector.protocol_name());

        let opened = tokio::select! {
            biased;
            _ = shared.stop_token.cancelled() => None,
            result = open_transport(connector, &shared.config) => Some(result),
        };

        let transport = match opened {
            Some(Ok(transport)) => transport,
            Some(Err(error)) => {
                warn!("❌ 端点 {} 打开传输失败: {}", shared.id, error);
                self.abort_start(error.clone());
                return Err(error);
            }
            None => {
                info!("🛑 端点 {} 在打开传输时被停止", shared.id);
                self.reject_queued();
                self.finish(None);
                return Err(TransportError::not_ready(EndpointState::Stopping));
            }
        };

        *shared.addrs.lock() = (transport.local_addr(), transport.peer_addr());
        shared.open.store(true, Ordering::Release);

        if !shared.state.transition(EndpointState::Starting, EndpointState::Started) {
            info!("🛑 端点 {} 在启动过程中被停止", shared.id);
            let (_, mut writer) = transport.into_split();
            let error = match writer.shutdown().await {
                Ok(()) => None,
                Err(e) => Some(TransportError::from(e).with_operation("shutdown")),
            };
            self.reject_queued();
            self.finish(error);
            return Err(TransportError::not_ready(EndpointState::Stopping));
        }

        if let Some(registry) = &shared.registry {
            registry.add(self);
        }
        self.notify(EndpointEvent::Started);

        let parts = shared.lane_parts.lock().take();
        let Some(parts) = parts else {
            return Err(TransportError::config_error("state", "execution lane already taken"));
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(lane::run(self.clone(), transport, parts, ready_tx));
        let _ = ready_rx.await;

        info!(
            "✅ 端点 {} 已启动: local={:?} peer={:?}",
            shared.id,
            self.local_addr(),
            self.peer_addr()
        );
        Ok(())
    }

    /// 请求停止
    ///
    /// 幂等且线程安全：并发调用中只有一个会推进到 stopping，之前入队的发送会先被写出，
    /// 传输只关闭一次，Closed 事件只触发一次。created 状态下调用没有效果。
    pub fn stop(&self) {
        let shared = &self.shared;
        match shared.state.begin_stop() {
            Some(previous) => {
                debug!("🛑 端点 {} 开始停止 (之前状态: {})", shared.id, previous);
                // 屏障必须先于取消信号入队，执行通道据此判断排空的终点
                if shared.send_tx.send(SendOp::Barrier).is_err() {
                    trace!("端点 {} 的发送队列已关闭", shared.id);
                }
                shared.stop_token.cancel();
            }
            None => trace!("端点 {} 忽略 stop()，当前状态: {}", shared.id, self.state()),
        }
    }

    /// 停止并等待关闭完成，返回关闭错误
    pub async fn stop_and_wait(&self) -> Option<TransportError> {
        self.stop();
        if self.state() == EndpointState::Created {
            return None;
        }
        self.closed().await
    }

    /// 等待端点进入 stopped
    ///
    /// 返回关闭时记录的错误；显式停止返回 None。对从未启动的端点会一直等待。
    pub async fn closed(&self) -> Option<TransportError> {
        loop {
            let notified = self.shared.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.shared.close_result.get() {
                return result.clone();
            }
            notified.await;
        }
    }

    /// 已经关闭时返回关闭结果
    pub fn close_result(&self) -> Option<Option<TransportError>> {
        self.shared.close_result.get().cloned()
    }

    /// 提交发送，返回是否被接受
    pub fn send(&self, item: C::Out) -> bool {
        self.submit(item, Completion::Detached)
    }

    /// 提交发送，完成后调用 `on_complete`
    ///
    /// 未就绪时回调会在当前线程上立即以错误调用。
    pub fn send_with<F>(&self, item: C::Out, on_complete: F)
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        self.submit(item, Completion::Callback(Box::new(on_complete)));
    }

    /// 提交发送，返回完成凭据
    pub fn send_async(&self, item: C::Out) -> SendReceipt {
        let (completion, receipt) = SendReceipt::pending();
        self.submit(item, completion);
        receipt
    }

    fn submit(&self, item: C::Out, completion: Completion) -> bool {
        let state = self.state();
        if !state.accepts_sends() {
            trace!("端点 {} 拒绝发送，当前状态: {}", self.shared.id, state);
            self.reject(completion, TransportError::not_ready(state));
            return false;
        }

        match self.shared.send_tx.send(SendOp::Frame { item, completion }) {
            Ok(()) => true,
            Err(mpsc::error::SendError(op)) => {
                if let SendOp::Frame { completion, .. } = op {
                    self.reject(completion, TransportError::not_ready(self.state()));
                }
                false
            }
        }
    }

    fn reject(&self, completion: Completion, error: TransportError) {
        completion.complete(Err(error.clone()));
        self.notify(EndpointEvent::Sent {
            result: Err(error),
            to: None,
        });
    }

    fn notify(&self, event: EndpointEvent<C::In>) {
        self.shared.listener.notify(self, event);
    }

    /// 拒绝仍留在未启动队列中的发送
    fn reject_queued(&self) {
        let parts = self.shared.lane_parts.lock().take();
        if let Some(mut parts) = parts {
            self.reject_pending(&mut parts.rx);
        }
    }

    fn reject_pending(&self, rx: &mut mpsc::UnboundedReceiver<SendOp<C::Out>>) {
        rx.close();
        while let Ok(op) = rx.try_recv() {
            if let SendOp::Frame { completion, .. } = op {
                self.reject(completion, TransportError::not_ready(EndpointState::Stopping));
            }
        }
    }

    /// 传输未能打开：直接进入 stopped，不触发 Closed 事件
    fn abort_start(&self, error: TransportError) {
        let shared = &self.shared;
        shared.close_fired.store(true, Ordering::Release);
        shared.state.mark_stopped();
        self.reject_queued();
        let _ = shared.close_result.set(Some(error));
        shared.closed_notify.notify_waiters();
    }

    /// 关闭协调的最后一步
    fn finish(&self, error: Option<TransportError>) {
        let shared = &self.shared;
        shared.open.store(false, Ordering::Release);
        shared.state.mark_stopped();

        if let Some(registry) = &shared.registry {
            registry.remove(self);
        }

        if !shared.close_fired.swap(true, Ordering::AcqRel) {
            match &error {
                Some(e) => warn!("🔌 端点 {} 已关闭: {}", shared.id, e),
                None => info!("🔌 端点 {} 已关闭", shared.id),
            }
            self.notify(EndpointEvent::Closed(error.clone()));
        }

        let _ = shared.close_result.set(error);
        shared.closed_notify.notify_waiters();
    }
}

async fn open_transport<K: Connector>(connector: &K, config: &EndpointConfig) -> Result<K::Transport> {
    match config.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, connector.open(config))
            .await
            .unwrap_or_else(|_| Err(TransportError::timeout_error("connect", limit))),
        None => connector.open(config).await,
    }
}

/// 不延长端点生命周期的弱句柄
pub struct WeakEndpoint<C: FrameCodec> {
    shared: Weak<Shared<C>>,
}

impl<C: FrameCodec> WeakEndpoint<C> {
    pub fn upgrade(&self) -> Option<Endpoint<C>> {
        self.shared.upgrade().map(|shared| Endpoint { shared })
    }
}

impl<C: FrameCodec> Clone for WeakEndpoint<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteCodec;
    use bytes::Bytes;

    #[tokio::test]
    async fn send_before_start_is_rejected() {
        let endpoint = Endpoint::new(ByteCodec, EndpointConfig::default(), NullListener);
        assert!(!endpoint.send(Bytes::from_static(b"early")));
        let result = endpoint.send_async(Bytes::new()).await;
        assert!(matches!(result, Err(TransportError::NotReady { ref state }) if state == "created"));
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let endpoint = Endpoint::new(ByteCodec, EndpointConfig::default(), NullListener);
        assert_eq!(endpoint.stop_and_wait().await, None);
        assert_eq!(endpoint.state(), EndpointState::Created);
        assert!(endpoint.close_result().is_none());
    }

    #[test]
    fn weak_handle_does_not_keep_endpoint_alive() {
        let endpoint = Endpoint::new(ByteCodec, EndpointConfig::default(), NullListener);
        let weak = endpoint.downgrade();
        assert!(weak.upgrade().is_some_and(|e| e.ptr_eq(&endpoint)));
        drop(endpoint);
        assert!(weak.upgrade().is_none());
    }
}
