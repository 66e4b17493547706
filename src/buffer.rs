/// 自适应接收缓冲区管理
///
/// 接收循环在把缓冲区交给监听器之前记录其共享计数（`Arc::strong_count`），
/// 监听器返回后再比较：
/// - 计数不变：监听器没有保留缓冲区，原地重置游标并复用（零分配）
/// - 计数增加：监听器保留了缓冲区，为下一次接收换一个缓冲区
///
/// 被保留的缓冲区会被跟踪（有上限）。监听器释放后，它们会在需要新缓冲区时被回收，
/// 因此分配速率受限于消费者的保留速率而不是消息速率。

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

/// 交给监听器的接收载荷
pub type RecvPayload = Arc<RecvBuffer>;

/// 带读写游标的定长字节区域
pub struct RecvBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
}

impl RecvBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// 可读字节数
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 剩余可写容量
    pub fn remaining(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// 可读区域
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// 复制可读区域
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_slice())
    }

    /// 可写区域
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// 推进写游标
    pub fn commit(&mut self, n: usize) {
        self.write_pos = (self.write_pos + n).min(self.data.len());
    }

    /// 推进读游标
    pub fn consume(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n).min(self.write_pos);
    }

    /// 重置游标，保留内存
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

impl AsRef<[u8]> for RecvBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::ops::Deref for RecvBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for RecvBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvBuffer")
            .field("capacity", &self.capacity())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .finish()
    }
}

/// 缓冲区统计
#[derive(Debug, Default)]
pub struct BufferStats {
    /// 新分配的缓冲区数
    pub allocations: AtomicU64,
    /// 原地复用次数
    pub reuses: AtomicU64,
    /// 被监听器保留的次数
    pub retained: AtomicU64,
    /// 从已释放的保留缓冲区中回收的次数
    pub reclaims: AtomicU64,
}

/// 缓冲区统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStatsSnapshot {
    pub allocations: u64,
    pub reuses: u64,
    pub retained: u64,
    pub reclaims: u64,
}

impl BufferStats {
    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            retained: self.retained.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
        }
    }
}

/// 接收缓冲区管理器
///
/// 由端点的执行通道独占，不需要锁。
pub struct BufferManager {
    buffer_size: usize,
    max_tracked: usize,
    tracked: VecDeque<RecvPayload>,
    stats: Arc<BufferStats>,
}

impl BufferManager {
    pub fn new(buffer_size: usize, max_tracked: usize, stats: Arc<BufferStats>) -> Self {
        Self {
            buffer_size,
            max_tracked,
            tracked: VecDeque::new(),
            stats,
        }
    }

    /// 获取一个独占的缓冲区：优先回收已被释放的保留缓冲区，否则新分配
    pub fn acquire(&mut self) -> RecvPayload {
        let released = self
            .tracked
            .iter()
            .position(|buf| Arc::strong_count(buf) == 1 && Arc::weak_count(buf) == 0);

        if let Some(mut buf) = released.and_then(|pos| self.tracked.remove(pos)) {
            match Arc::get_mut(&mut buf) {
                Some(inner) => {
                    inner.reset();
                    self.stats.reclaims.fetch_add(1, Ordering::Relaxed);
                    return buf;
                }
                None => self.tracked.push_back(buf),
            }
        }

        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        Arc::new(RecvBuffer::new(self.buffer_size))
    }

    /// 监听器返回后决定下一次接收使用的缓冲区
    ///
    /// `shares_before` 是交付前记录的共享计数。
    pub fn recycle(&mut self, mut buf: RecvPayload, shares_before: usize) -> RecvPayload {
        if Arc::strong_count(&buf) == shares_before {
            if let Some(inner) = Arc::get_mut(&mut buf) {
                inner.reset();
                self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                return buf;
            }
        }

        self.stats.retained.fetch_add(1, Ordering::Relaxed);
        self.track(buf);
        self.acquire()
    }

    fn track(&mut self, buf: RecvPayload) {
        if self.max_tracked == 0 {
            return;
        }
        self.tracked.push_back(buf);
        while self.tracked.len() > self.max_tracked {
            // 不再跟踪最老的缓冲区，它完全归监听器所有
            self.tracked.pop_front();
        }
    }

    pub fn stats(&self) -> &Arc<BufferStats> {
        &self.stats
    }
}
