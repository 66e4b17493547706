/// 端点执行通道
///
/// 一个 tokio 任务独占传输，并把它拆成读写两个半部。接收始终保持投递；
/// 一帧的写出作为挂起中的 future 与接收、停止信号、静默定时器一起被轮询，
/// 写在背压下等待时接收照常进行。同一时刻最多一个写在途，保证发送按入队顺序写出。
///
/// 停止分两阶段：
/// 1. 不再投递新的接收，排空发送队列直到 `stop()` 放入的屏障，屏障之前入队的发送全部写出
/// 2. 关闭写半部（只在这里关闭一次），拒绝屏障之后的发送，触发关闭通知
///
/// 写失败或静默超时会放弃排空：在途的写被丢弃，剩余发送以错误完成。

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::future::OptionFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::send::{Completion, SendOp};
use super::{Endpoint, LaneParts};
use crate::buffer::BufferManager;
use crate::codec::FrameCodec;
use crate::error::TransportError;
use crate::event::EndpointEvent;
use crate::state::EndpointState;
use crate::transport::{Transport, TransportReader, TransportWriter};

/// 静默定时器关闭时的占位时长，此时定时器分支不会被轮询
const IDLE_PLACEHOLDER: Duration = Duration::from_secs(3600);

/// 关闭写半部的时限（TLS 需要写出 close_notify，对端不读时可能一直挂起）
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

type WriteFuture<W> = Pin<Box<dyn Future<Output = (W, BytesMut, io::Result<usize>)> + Send>>;

/// 在途的一次写：写半部和写缓冲区随 future 移走，完成后归还
struct InFlight<W> {
    write: WriteFuture<W>,
    completion: Completion,
    to: Option<SocketAddr>,
}

/// 主循环的退出方式
enum Exit {
    /// 到达停止屏障，之前入队的发送都已写出
    Drained,
    /// 写失败或静默超时，放弃排空
    Abandoned,
}

struct Lane<C: FrameCodec, T: Transport> {
    endpoint: Endpoint<C>,
    reader: T::Reader,
    /// 有写在途时为 `None`
    writer: Option<T::Writer>,
    codec: C,
    write_buf: BytesMut,
    /// 第一个记录的错误成为关闭错误
    close_error: Option<TransportError>,
}

pub(super) async fn run<C, T>(
    endpoint: Endpoint<C>,
    transport: T,
    parts: LaneParts<C>,
    ready: oneshot::Sender<()>,
) where
    C: FrameCodec,
    T: Transport,
{
    let LaneParts { rx, codec } = parts;
    let write_capacity = endpoint.config().init_buffer_size;
    let (reader, writer) = transport.into_split();
    let lane: Lane<C, T> = Lane {
        endpoint,
        reader,
        writer: Some(writer),
        codec,
        write_buf: BytesMut::with_capacity(write_capacity),
        close_error: None,
    };
    lane.run(rx, ready).await;
}

impl<C, T> Lane<C, T>
where
    C: FrameCodec,
    T: Transport,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SendOp<C::Out>>, ready: oneshot::Sender<()>) {
        let id = self.endpoint.id();
        if !self
            .endpoint
            .shared
            .state
            .transition(EndpointState::Started, EndpointState::Running)
        {
            debug!("端点 {} 在进入 running 之前被停止", id);
        }
        let _ = ready.send(());
        debug!("🏃 端点 {} 执行通道启动", id);

        let mut pending: Option<InFlight<T::Writer>> = None;
        let exit = self.serve(&mut rx, &mut pending).await;
        self.endpoint.stop();

        if let Exit::Abandoned = exit {
            debug!("端点 {} 放弃排空发送队列", id);
        }
        if let Some(in_flight) = pending.take() {
            // 丢弃 future 即丢弃写半部，连接随之关闭
            let error = self
                .close_error
                .clone()
                .unwrap_or_else(|| TransportError::not_ready(EndpointState::Stopping));
            self.endpoint.reject(in_flight.completion, error);
        }

        // 阶段二：关闭写半部
        if let Some(mut writer) = self.writer.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("⚠️ 端点 {} 关闭传输失败: {}", id, e);
                    self.record(TransportError::from(e).with_operation("shutdown"));
                }
                Err(_) => {
                    warn!("⏰ 端点 {} 关闭传输超时", id);
                    self.record(TransportError::timeout_error("shutdown", SHUTDOWN_TIMEOUT));
                }
            }
        }
        self.endpoint.reject_pending(&mut rx);

        debug!("🏁 端点 {} 执行通道退出", id);
        let Lane {
            endpoint,
            reader,
            close_error,
            ..
        } = self;
        drop(reader);
        endpoint.finish(close_error);
    }

    async fn serve(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<SendOp<C::Out>>,
        pending: &mut Option<InFlight<T::Writer>>,
    ) -> Exit {
        let id = self.endpoint.id();
        let config = self.endpoint.config().clone();
        let stop = self.endpoint.shared.stop_token.clone();

        let mut buffers = BufferManager::new(
            config.recv_buffer_size,
            config.max_tracked_buffers,
            self.endpoint.shared.stats.buffers.clone(),
        );
        let mut recv_buf = buffers.acquire();
        let mut frames: Vec<C::In> = Vec::new();

        let silence = config.silence_timeout;
        let idle = tokio::time::sleep(silence.unwrap_or(IDLE_PLACEHOLDER));
        tokio::pin!(idle);

        // 停止后不再投递新的接收，只排空发送
        let mut draining = false;

        loop {
            let Some(buf) = Arc::get_mut(&mut recv_buf) else {
                recv_buf = buffers.acquire();
                continue;
            };
            if buf.remaining() == 0 && !draining {
                error!("❌ 端点 {} 的接收缓冲区没有剩余容量", id);
                self.record(TransportError::config_error(
                    "recv_buffer_size",
                    "receive buffer has no remaining capacity",
                ));
                draining = self.begin_drain();
                continue;
            }
            let unfilled = buf.unfilled_mut();
            let writing = pending.is_some();

            tokio::select! {
                biased;

                _ = stop.cancelled(), if !draining => {
                    draining = true;
                }

                done = OptionFuture::from(pending.as_mut().map(|in_flight| &mut in_flight.write)), if writing => {
                    let (Some((writer, written_buf, result)), Some(in_flight)) = (done, pending.take()) else {
                        continue;
                    };
                    self.writer = Some(writer);
                    self.write_buf = written_buf;
                    if !self.complete_write(result, in_flight) {
                        return Exit::Abandoned;
                    }
                    if let Some(limit) = silence {
                        idle.as_mut().reset(Instant::now() + limit);
                    }
                }

                op = rx.recv(), if !writing => match op {
                    Some(SendOp::Frame { item, completion }) => match self.start_write(item, completion) {
                        Some(in_flight) => *pending = Some(in_flight),
                        None => return Exit::Abandoned,
                    },
                    Some(SendOp::Barrier) => return Exit::Drained,
                    None => return Exit::Abandoned,
                },

                received = self.reader.recv(unfilled), if !draining => match received {
                    Ok(Some((n, from))) => {
                        buf.commit(n);
                        self.endpoint.shared.stats.record_received(n);
                        trace!("📥 端点 {} 接收 {} 字节", id, n);
                        if let Some(limit) = silence {
                            idle.as_mut().reset(Instant::now() + limit);
                        }

                        let shares_before = Arc::strong_count(&recv_buf);
                        let decoded = self.codec.decode(&recv_buf, from, &mut frames);
                        self.endpoint.shared.stats.record_frames(frames.len());
                        for frame in frames.drain(..) {
                            self.endpoint.notify(EndpointEvent::Received(frame));
                        }
                        recv_buf = buffers.recycle(recv_buf, shares_before);

                        if let Err(e) = decoded {
                            warn!("❌ 端点 {} 解码失败: {}", id, e);
                            self.record(e);
                            draining = self.begin_drain();
                        }
                    }
                    Ok(None) => {
                        debug!("🔚 端点 {} 对端关闭连接", id);
                        self.record(TransportError::connection_error("closed by peer", true));
                        draining = self.begin_drain();
                    }
                    Err(e) => {
                        warn!("❌ 端点 {} 接收失败: {}", id, e);
                        self.record(TransportError::from(e).with_operation("recv"));
                        draining = self.begin_drain();
                    }
                },

                _ = &mut idle, if silence.is_some() => {
                    let limit = silence.unwrap_or(IDLE_PLACEHOLDER);
                    warn!("⏰ 端点 {} 静默超过 {:?}", id, limit);
                    self.record(TransportError::timeout_error("silence", limit));
                    return Exit::Abandoned;
                }
            }
        }
    }

    /// 接收侧出错后进入停止：屏障入队，之前的发送照常写出
    fn begin_drain(&self) -> bool {
        self.endpoint.stop();
        true
    }

    /// 编码一帧并把写操作交给在途 future；编码失败时返回 `None`
    fn start_write(&mut self, item: C::Out, completion: Completion) -> Option<InFlight<T::Writer>> {
        let Some(mut writer) = self.writer.take() else {
            let error = TransportError::connection_error("transport is no longer writable", false);
            self.endpoint.reject(completion, error);
            return None;
        };

        let config = self.endpoint.config();
        let mut buf = std::mem::take(&mut self.write_buf);
        if buf.capacity() > config.max_buffer_size {
            buf = BytesMut::with_capacity(config.init_buffer_size);
        }
        buf.clear();

        let to = match self.codec.encode(item, &mut buf) {
            Ok(to) => to,
            Err(e) => {
                warn!("❌ 端点 {} 编码失败: {}", self.endpoint.id(), e);
                self.writer = Some(writer);
                self.write_buf = buf;
                self.record(e.clone());
                self.endpoint.reject(completion, e);
                return None;
            }
        };

        let write: WriteFuture<T::Writer> = Box::pin(async move {
            let result = writer.send(&buf, to).await;
            (writer, buf, result)
        });
        Some(InFlight { write, completion, to })
    }

    /// 写完成：更新统计并通知；写失败时返回 false
    fn complete_write(&mut self, result: io::Result<usize>, in_flight: InFlight<T::Writer>) -> bool {
        let result = result.map_err(|e| TransportError::from(e).with_operation("send"));
        let ok = match &result {
            Ok(n) => {
                self.endpoint.shared.stats.record_sent(*n);
                trace!("📤 端点 {} 发送 {} 字节", self.endpoint.id(), n);
                true
            }
            Err(e) => {
                warn!("❌ 端点 {} 发送失败: {}", self.endpoint.id(), e);
                self.record(e.clone());
                false
            }
        };

        let InFlight { completion, to, .. } = in_flight;
        completion.complete(result.clone());
        self.endpoint.notify(EndpointEvent::Sent { result, to });
        ok
    }

    fn record(&mut self, error: TransportError) {
        if self.close_error.is_none() {
            self.close_error = Some(error);
        }
    }
}
