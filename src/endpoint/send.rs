use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::TransportError;

/// 发送结果
pub type SendResult = Result<usize, TransportError>;

/// 发送队列中的操作
pub(crate) enum SendOp<T> {
    Frame { item: T, completion: Completion },
    /// 停止屏障：执行到它意味着之前入队的发送都已处理
    Barrier,
}

/// 发送完成后的续体
pub(crate) enum Completion {
    Detached,
    Callback(Box<dyn FnOnce(SendResult) + Send + 'static>),
    Reply(oneshot::Sender<SendResult>),
}

impl Completion {
    pub(crate) fn complete(self, result: SendResult) {
        match self {
            Completion::Detached => {}
            Completion::Callback(callback) => callback(result),
            Completion::Reply(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

/// `send_async` 返回的完成凭据
///
/// 既可以 `.await`，也可以在非异步线程上调用 [`SendReceipt::wait`]。
#[must_use = "a receipt does nothing unless awaited"]
pub struct SendReceipt {
    rx: oneshot::Receiver<SendResult>,
}

impl SendReceipt {
    pub(crate) fn pending() -> (Completion, Self) {
        let (tx, rx) = oneshot::channel();
        (Completion::Reply(tx), Self { rx })
    }

    /// 阻塞等待完成；不能在异步运行时的工作线程上调用
    pub fn wait(self) -> SendResult {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }
}

impl Future for SendReceipt {
    type Output = SendResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(dropped())))
    }
}

fn dropped() -> TransportError {
    TransportError::not_ready("stopped")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn completed_receipt_resolves() {
        let (completion, receipt) = SendReceipt::pending();
        completion.complete(Ok(3));
        assert_eq!(receipt.await, Ok(3));
    }

    #[tokio::test]
    async fn dropped_completion_reports_not_ready() {
        let (completion, receipt) = SendReceipt::pending();
        drop(completion);
        assert!(matches!(receipt.await, Err(TransportError::NotReady { .. })));
    }

    #[test]
    fn callback_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let completion = Completion::Callback(Box::new(move |result| {
            assert_eq!(result, Ok(0));
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        completion.complete(Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
