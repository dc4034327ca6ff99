//! # filter 模块说明
//!
//! ## 角色定位（Why）
//! - 每个会话拥有一条有序、可变的拦截器链；协议层在会话上安装/移除自己的过滤器，
//!   既不需要知道上层是谁，也不需要知道下层如何写出；
//! - 入站事件自链头流向链尾后交给处理器，出站写/关闭请求自链尾流向链头后交给 processor。
//!
//! ## 契约（What）
//! - 链在事件开始时取快照（`Arc<[FilterEntry]>`），事件处理过程中增删过滤器只影响下一次事件；
//! - 过滤器拿到的 [`NextFilter`] 只能向后传递一次（按值消费），需要延后交付的过滤器
//!   应自行缓存事件，稍后通过会话重新触发。
//!
//! ## 风险提示（Trade-offs）
//! - 写时复制的快照让每次修改都分配一次切片；过滤器增删只发生在会话建立阶段，代价可接受。

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use super::{BridgeSession, IdleStatus};
use crate::buffer::PendingWrite;
use crate::error::{BridgeError, Result};

/// 会话拦截器。
///
/// 所有方法默认原样向后传递。
pub trait SessionFilter: Send + Sync + 'static {
    fn session_created(&self, next: NextFilter<'_>, session: &BridgeSession) {
        next.session_created(session);
    }

    fn session_opened(&self, next: NextFilter<'_>, session: &BridgeSession) {
        next.session_opened(session);
    }

    fn message_received(&self, next: NextFilter<'_>, session: &BridgeSession, message: Bytes) {
        next.message_received(session, message);
    }

    fn session_idle(&self, next: NextFilter<'_>, session: &BridgeSession, status: IdleStatus) {
        next.session_idle(session, status);
    }

    fn exception_caught(&self, next: NextFilter<'_>, session: &BridgeSession, error: BridgeError) {
        next.exception_caught(session, error);
    }

    fn session_closed(&self, next: NextFilter<'_>, session: &BridgeSession) {
        next.session_closed(session);
    }

    fn filter_write(
        &self,
        next: NextFilter<'_>,
        session: &BridgeSession,
        payload: PendingWrite,
    ) -> Result<()> {
        next.filter_write(session, payload)
    }

    fn filter_close(&self, next: NextFilter<'_>, session: &BridgeSession) {
        next.filter_close(session);
    }
}

#[derive(Clone)]
pub(crate) struct FilterEntry {
    name: Cow<'static, str>,
    filter: Arc<dyn SessionFilter>,
}

/// 链上剩余部分的游标。
pub struct NextFilter<'a> {
    rest: &'a [FilterEntry],
}

impl<'a> NextFilter<'a> {
    pub(crate) fn new(entries: &'a [FilterEntry]) -> Self {
        Self { rest: entries }
    }

    pub fn session_created(self, session: &BridgeSession) {
        match self.rest.split_first() {
            Some((head, rest)) => head.filter.session_created(NextFilter { rest }, session),
            None => session.deliver_created(),
        }
    }

    pub fn session_opened(self, session: &BridgeSession) {
        match self.rest.split_first() {
            Some((head, rest)) => head.filter.session_opened(NextFilter { rest }, session),
            None => session.deliver_opened(),
        }
    }

    pub fn message_received(self, session: &BridgeSession, message: Bytes) {
        match self.rest.split_first() {
            Some((head, rest)) => head
                .filter
                .message_received(NextFilter { rest }, session, message),
            None => session.deliver_message(message),
        }
    }

    pub fn session_idle(self, session: &BridgeSession, status: IdleStatus) {
        match self.rest.split_first() {
            Some((head, rest)) => head.filter.session_idle(NextFilter { rest }, session, status),
            None => session.deliver_idle(status),
        }
    }

    pub fn exception_caught(self, session: &BridgeSession, error: BridgeError) {
        match self.rest.split_first() {
            Some((head, rest)) => head
                .filter
                .exception_caught(NextFilter { rest }, session, error),
            None => session.deliver_exception(&error),
        }
    }

    pub fn session_closed(self, session: &BridgeSession) {
        match self.rest.split_first() {
            Some((head, rest)) => head.filter.session_closed(NextFilter { rest }, session),
            None => session.deliver_closed(),
        }
    }

    pub fn filter_write(self, session: &BridgeSession, payload: PendingWrite) -> Result<()> {
        match self.rest.split_last() {
            Some((tail, rest)) => tail.filter.filter_write(NextFilter { rest }, session, payload),
            None => session.processor_write(payload),
        }
    }

    pub fn filter_close(self, session: &BridgeSession) {
        match self.rest.split_last() {
            Some((tail, rest)) => tail.filter.filter_close(NextFilter { rest }, session),
            None => session.processor_close(),
        }
    }
}

/// 会话的过滤器链。
pub struct FilterChain {
    entries: RwLock<Arc<[FilterEntry]>>,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Arc::from(Vec::new())),
        }
    }
}

impl FilterChain {
    pub(crate) fn snapshot(&self) -> Arc<[FilterEntry]> {
        Arc::clone(&self.entries.read())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<FilterEntry>) -> R) -> R {
        let mut guard = self.entries.write();
        let mut entries = guard.to_vec();
        let result = f(&mut entries);
        *guard = Arc::from(entries);
        result
    }

    /// 链头插入；同名过滤器已存在时返回 `false`。
    pub fn add_first(&self, name: impl Into<Cow<'static, str>>, filter: Arc<dyn SessionFilter>) -> bool {
        let name = name.into();
        self.mutate(|entries| {
            if entries.iter().any(|e| e.name == name) {
                return false;
            }
            entries.insert(0, FilterEntry { name, filter });
            true
        })
    }

    /// 链尾追加；同名过滤器已存在时返回 `false`。
    pub fn add_last(&self, name: impl Into<Cow<'static, str>>, filter: Arc<dyn SessionFilter>) -> bool {
        let name = name.into();
        self.mutate(|entries| {
            if entries.iter().any(|e| e.name == name) {
                return false;
            }
            entries.push(FilterEntry { name, filter });
            true
        })
    }

    /// 插入到 `base` 之前；`base` 不存在或名称重复时返回 `false`。
    pub fn add_before(
        &self,
        base: &str,
        name: impl Into<Cow<'static, str>>,
        filter: Arc<dyn SessionFilter>,
    ) -> bool {
        let name = name.into();
        self.mutate(|entries| {
            if entries.iter().any(|e| e.name == name) {
                return false;
            }
            match entries.iter().position(|e| e.name == base) {
                Some(index) => {
                    entries.insert(index, FilterEntry { name, filter });
                    true
                }
                None => false,
            }
        })
    }

    /// 插入到 `base` 之后；`base` 不存在或名称重复时返回 `false`。
    pub fn add_after(
        &self,
        base: &str,
        name: impl Into<Cow<'static, str>>,
        filter: Arc<dyn SessionFilter>,
    ) -> bool {
        let name = name.into();
        self.mutate(|entries| {
            if entries.iter().any(|e| e.name == name) {
                return false;
            }
            match entries.iter().position(|e| e.name == base) {
                Some(index) => {
                    entries.insert(index + 1, FilterEntry { name, filter });
                    true
                }
                None => false,
            }
        })
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn SessionFilter>> {
        self.mutate(|entries| {
            let index = entries.iter().position(|e| e.name == name)?;
            Some(entries.remove(index).filter)
        })
    }

    /// 原位替换，返回旧过滤器。
    pub fn replace(&self, name: &str, filter: Arc<dyn SessionFilter>) -> Option<Arc<dyn SessionFilter>> {
        self.mutate(|entries| {
            let entry = entries.iter_mut().find(|e| e.name == name)?;
            Some(std::mem::replace(&mut entry.filter, filter))
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SessionFilter>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.name == name)
            .map(|e| Arc::clone(&e.filter))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().iter().any(|e| e.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.name.to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        *self.entries.write() = Arc::from(Vec::new());
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
