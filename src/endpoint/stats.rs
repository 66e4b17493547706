use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::{BufferStats, BufferStatsSnapshot};

/// 端点统计
#[derive(Debug, Default)]
pub struct EndpointStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub buffers: Arc<BufferStats>,
}

/// 端点统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub buffers: BufferStatsSnapshot,
}

impl EndpointStats {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_frames(&self, frames: usize) {
        self.frames_received.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EndpointStatsSnapshot {
        EndpointStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            buffers: self.buffers.snapshot(),
        }
    }
}
