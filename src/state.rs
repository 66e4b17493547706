/// Endpoint lifecycle state management
///
/// created → starting → started → running → stopping → stopped
///
/// 读取是无锁的原子操作；迁移通过 compare-and-swap 完成，
/// 因此并发的 stop() 只会有一个赢得 → stopping 的迁移。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 端点生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EndpointState {
    Created = 0,
    Starting = 1,
    Started = 2,
    Running = 3,
    Stopping = 4,
    Stopped = 5,
}

impl EndpointState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EndpointState::Created,
            1 => EndpointState::Starting,
            2 => EndpointState::Started,
            3 => EndpointState::Running,
            4 => EndpointState::Stopping,
            _ => EndpointState::Stopped,
        }
    }

    /// 是否处于可接收发送请求的状态
    pub fn accepts_sends(self) -> bool {
        matches!(self, EndpointState::Started | EndpointState::Running)
    }

    /// stop() 只对 starting 及之后、且尚未开始停止的状态生效
    pub fn can_stop(self) -> bool {
        matches!(
            self,
            EndpointState::Starting | EndpointState::Started | EndpointState::Running
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointState::Created => "created",
            EndpointState::Starting => "starting",
            EndpointState::Started => "started",
            EndpointState::Running => "running",
            EndpointState::Stopping => "stopping",
            EndpointState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 原子状态单元
pub struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EndpointState::Created as u8),
        }
    }

    /// 获取当前状态
    pub fn get(&self) -> EndpointState {
        EndpointState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 尝试从 `from` 迁移到 `to`
    ///
    /// Returns false (and leaves the state untouched) if the current state is not `from`.
    pub fn transition(&self, from: EndpointState, to: EndpointState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 尝试开始停止
    ///
    /// 返回停止前的状态；如果当前状态不允许停止（created / stopping / stopped）则返回 None。
    pub fn begin_stop(&self) -> Option<EndpointState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = EndpointState::from_u8(current);
            if !state.can_stop() {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                EndpointState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(state),
                Err(actual) => current = actual,
            }
        }
    }

    /// 标记为已停止（关闭协调器完成后调用）
    pub fn mark_stopped(&self) {
        self.state.store(EndpointState::Stopped as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateCell").field(&self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn follows_lifecycle() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), EndpointState::Created);
        assert!(cell.transition(EndpointState::Created, EndpointState::Starting));
        assert!(!cell.transition(EndpointState::Created, EndpointState::Starting));
        assert!(cell.transition(EndpointState::Starting, EndpointState::Started));
        assert!(cell.transition(EndpointState::Started, EndpointState::Running));
        assert_eq!(cell.begin_stop(), Some(EndpointState::Running));
        assert_eq!(cell.get(), EndpointState::Stopping);
        cell.mark_stopped();
        assert_eq!(cell.get(), EndpointState::Stopped);
    }

    #[test]
    fn stop_before_start_is_noop() {
        let cell = StateCell::new();
        assert_eq!(cell.begin_stop(), None);
        assert_eq!(cell.get(), EndpointState::Created);
    }

    #[test]
    fn concurrent_stop_has_single_winner() {
        let cell = Arc::new(StateCell::new());
        cell.transition(EndpointState::Created, EndpointState::Starting);
        cell.transition(EndpointState::Starting, EndpointState::Started);
        cell.transition(EndpointState::Started, EndpointState::Running);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || cell.begin_stop().is_some())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn ordering_matches_lifecycle() {
        assert!(EndpointState::Started < EndpointState::Running);
        assert!(EndpointState::Running < EndpointState::Stopping);
        assert!(EndpointState::Running.accepts_sends());
        assert!(!EndpointState::Stopping.accepts_sends());
    }
}
