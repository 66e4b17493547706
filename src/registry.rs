/// 会话注册表
///
/// 端点启动成功时 `add`，关闭完成时 `remove`。注册表只保存弱引用，
/// 不会延长端点的生命周期。

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::codec::FrameCodec;
use crate::endpoint::{Endpoint, WeakEndpoint};
use crate::EndpointId;

/// 会话注册表接口
pub trait SessionRegistry<C: FrameCodec>: Send + Sync + 'static {
    fn add(&self, endpoint: &Endpoint<C>);
    fn remove(&self, endpoint: &Endpoint<C>);
}

/// 内存会话表
pub struct SessionMap<C: FrameCodec> {
    sessions: RwLock<HashMap<EndpointId, WeakEndpoint<C>>>,
}

impl<C: FrameCodec> SessionMap<C> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn get(&self, id: EndpointId) -> Option<Endpoint<C>> {
        self.sessions.read().get(&id).and_then(WeakEndpoint::upgrade)
    }

    /// 仍然存活的会话快照
    pub fn snapshot(&self) -> Vec<Endpoint<C>> {
        self.sessions
            .read()
            .values()
            .filter_map(WeakEndpoint::upgrade)
            .collect()
    }

    /// 对每个存活会话调用 `f`（不持有锁）
    pub fn for_each(&self, mut f: impl FnMut(&Endpoint<C>)) {
        for endpoint in self.snapshot() {
            f(&endpoint);
        }
    }

    /// 停止所有会话
    pub fn stop_all(&self) {
        self.for_each(|endpoint| endpoint.stop());
    }
}

impl<C: FrameCodec> Default for SessionMap<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: FrameCodec> SessionRegistry<C> for SessionMap<C> {
    fn add(&self, endpoint: &Endpoint<C>) {
        self.sessions.write().insert(endpoint.id(), endpoint.downgrade());
        tracing::debug!("📋 会话 {} 已注册", endpoint.id());
    }

    fn remove(&self, endpoint: &Endpoint<C>) {
        if self.sessions.write().remove(&endpoint.id()).is_some() {
            tracing::debug!("📋 会话 {} 已注销", endpoint.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteCodec;
    use crate::config::EndpointConfig;
    use crate::event::NullListener;

    #[test]
    fn holds_weak_references_only() {
        let map = SessionMap::new();
        let endpoint = Endpoint::new(ByteCodec, EndpointConfig::default(), NullListener);
        map.add(&endpoint);
        assert_eq!(map.len(), 1);
        assert!(map.get(endpoint.id()).is_some());

        let id = endpoint.id();
        drop(endpoint);
        assert!(map.get(id).is_none());
        assert!(map.snapshot().is_empty());
    }

    #[test]
    fn remove_by_endpoint() {
        let map = SessionMap::new();
        let endpoint = Endpoint::new(ByteCodec, EndpointConfig::default(), NullListener);
        map.add(&endpoint);
        map.remove(&endpoint);
        assert!(map.is_empty());
    }
}
