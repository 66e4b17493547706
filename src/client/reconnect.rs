/// 自动重连客户端
///
/// 每次连接尝试都使用全新构造的端点，旧端点完全关闭后不会被复用。
/// 可重试的关闭错误交给重连策略决定下一次尝试的延迟；策略放弃或错误不可重试时停止重连。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Lifecycle;
use crate::codec::FrameCodec;
use crate::config::EndpointConfig;
use crate::endpoint::{Endpoint, SendReceipt};
use crate::error::TransportError;
use crate::event::Listener;
use crate::state::EndpointState;
use crate::transport::Connector;
use crate::Result;

/// 重连策略
pub trait ReconnectPolicy: Send + Sync + 'static {
    /// 第 `attempt` 次重连（从 1 开始）之前的等待时长；返回 None 表示放弃
    fn next_delay(&self, attempt: u32, error: &TransportError) -> Option<Duration>;
}

/// 指数退避
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExponentialBackoff {
    /// 第一次重连前的等待
    pub initial_delay: Duration,
    /// 等待上限
    pub max_delay: Duration,
    /// 指数退避系数
    pub multiplier: f64,
    /// 最大重试次数，None 表示不限
    pub max_retries: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: Some(10),
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32, error: &TransportError) -> Option<Duration> {
        if !error.is_retryable() {
            return None;
        }
        if self.max_retries.is_some_and(|max| attempt > max) {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Some(Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64())))
    }
}

struct Inner<K: Connector, C: FrameCodec> {
    connector: K,
    make_codec: Box<dyn Fn() -> C + Send + Sync>,
    config: EndpointConfig,
    listener: Arc<dyn Listener<C>>,
    policy: Arc<dyn ReconnectPolicy>,
    current: Mutex<Option<Endpoint<C>>>,
    /// 正在连接或监视某一代端点
    active: AtomicBool,
    stopped: AtomicBool,
    reconnect_attempts: AtomicU32,
    token: CancellationToken,
}

/// 自动重连客户端
pub struct AutoReconnectClient<K: Connector, C: FrameCodec> {
    inner: Arc<Inner<K, C>>,
}

impl<K: Connector, C: FrameCodec> Clone for AutoReconnectClient<K, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Connector, C: FrameCodec> AutoReconnectClient<K, C> {
    pub fn new<F>(
        connector: K,
        make_codec: F,
        config: EndpointConfig,
        listener: impl Listener<C>,
        policy: impl ReconnectPolicy,
    ) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                connector,
                make_codec: Box::new(make_codec),
                config,
                listener: Arc::new(listener),
                policy: Arc::new(policy),
                current: Mutex::new(None),
                active: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                token: CancellationToken::new(),
            }),
        }
    }

    /// 连接直到成功（按策略重试），随后在后台监视关闭并自动重连
    ///
    /// 策略放弃后（或最后一代以不可重试的错误关闭后）可以再次调用。
    pub async fn start(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(TransportError::not_ready(EndpointState::Stopped));
        }
        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::config_error("state", "client already started"));
        }

        let endpoint = match connect(&self.inner, None).await {
            Ok(endpoint) => endpoint,
            Err(error) => {
                self.inner.active.store(false, Ordering::Release);
                return Err(error);
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            supervise(&inner, endpoint).await;
            inner.active.store(false, Ordering::Release);
        });
        Ok(())
    }

    /// 停止重连并停止当前端点
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("🛑 停止自动重连客户端");
        self.inner.token.cancel();
        if let Some(endpoint) = self.current() {
            endpoint.stop();
        }
    }

    /// 当前代的端点
    pub fn current(&self) -> Option<Endpoint<C>> {
        self.inner.current.lock().clone()
    }

    pub fn state(&self) -> EndpointState {
        self.current()
            .map(|endpoint| endpoint.state())
            .unwrap_or(EndpointState::Created)
    }

    pub fn is_start(&self) -> bool {
        self.current().is_some_and(|endpoint| endpoint.is_start())
    }

    /// 累计重连次数（不含第一次连接）
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn send(&self, item: C::Out) -> bool {
        match self.current() {
            Some(endpoint) => endpoint.send(item),
            None => false,
        }
    }

    pub fn send_async(&self, item: C::Out) -> Option<SendReceipt> {
        self.current().map(|endpoint| endpoint.send_async(item))
    }
}

#[async_trait]
impl<K: Connector, C: FrameCodec> Lifecycle for AutoReconnectClient<K, C> {
    async fn start(&self) -> Result<()> {
        AutoReconnectClient::start(self).await
    }

    fn stop(&self) {
        AutoReconnectClient::stop(self)
    }

    fn is_start(&self) -> bool {
        AutoReconnectClient::is_start(self)
    }

    fn state(&self) -> EndpointState {
        AutoReconnectClient::state(self)
    }
}

/// 建立一代新的连接
///
/// `last_error` 不为空表示这是重连：先按策略等待。
async fn connect<K: Connector, C: FrameCodec>(
    inner: &Inner<K, C>,
    mut last_error: Option<TransportError>,
) -> Result<Endpoint<C>> {
    let mut attempt = 0u32;
    loop {
        if let Some(error) = last_error.take() {
            attempt += 1;
            let Some(delay) = inner.policy.next_delay(attempt, &error) else {
                warn!("❌ 放弃重连 (第 {} 次): {}", attempt, error);
                return Err(error);
            };
            inner.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            info!("🔄 第 {} 次重连将在 {:?} 后进行: {}", attempt, delay, error);
            tokio::select! {
                _ = inner.token.cancelled() => return Err(TransportError::not_ready(EndpointState::Stopped)),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if inner.stopped.load(Ordering::Acquire) {
            return Err(TransportError::not_ready(EndpointState::Stopped));
        }

        let endpoint = Endpoint::builder((inner.make_codec)())
            .config(inner.config.clone())
            .shared_listener(inner.listener.clone())
            .build();
        *inner.current.lock() = Some(endpoint.clone());

        match endpoint.start_with(&inner.connector).await {
            Ok(()) => {
                if attempt > 0 {
                    info!("✅ 重连成功 (第 {} 次): {}", attempt, endpoint.id());
                }
                // stop() 可能在启动期间发生，新一代端点需要被停止
                if inner.stopped.load(Ordering::Acquire) {
                    endpoint.stop();
                }
                return Ok(endpoint);
            }
            Err(error) => {
                debug!("连接尝试失败: {}", error);
                last_error = Some(error);
            }
        }
    }
}

/// 监视当前代端点，可重试的关闭触发重连
async fn supervise<K: Connector, C: FrameCodec>(inner: &Inner<K, C>, mut endpoint: Endpoint<C>) {
    loop {
        let error = tokio::select! {
            error = endpoint.closed() => error,
            _ = inner.token.cancelled() => return,
        };

        if inner.stopped.load(Ordering::Acquire) {
            return;
        }
        let Some(error) = error.filter(TransportError::is_retryable) else {
            debug!("端点 {} 关闭且不需要重连", endpoint.id());
            return;
        };

        match connect(inner, Some(error)).await {
            Ok(next) => endpoint = next,
            Err(error) => {
                warn!("❌ 自动重连结束: {}", error);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused() -> TransportError {
        TransportError::connection_error("refused", true)
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.next_delay(1, &refused()), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2, &refused()), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3, &refused()), Some(Duration::from_millis(350)));
    }

    #[test]
    fn backoff_respects_retry_limit() {
        let policy = ExponentialBackoff::default().with_max_retries(Some(2));
        assert!(policy.next_delay(2, &refused()).is_some());
        assert!(policy.next_delay(3, &refused()).is_none());
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let policy = ExponentialBackoff::default();
        let fatal = TransportError::config_error("recv_buffer_size", "zero");
        assert!(policy.next_delay(1, &fatal).is_none());
    }
}
