//! # session 模块说明：桥接会话链
//!
//! ## 角色定位（Why）
//! - 每个被接入或发起的连接，在每一个协议层上都对应一个 [`BridgeSession`]：
//!   物理层会话由 I/O 驱动创建，逻辑层会话（TLS、HTTP、WebSocket 变体）由协议层在父会话之上创建；
//! - 子会话持有父会话的强引用，父会话只以弱引用记录子会话，生命周期关系因此总是单向的。
//!
//! ## 契约（What）
//! - 事件顺序：`created → opened → (idle | exception | message)* → closed`，`closed` 恰好一次；
//! - 父会话关闭时，先关闭全部存活子会话：仍处于协商期的子会话先收到
//!   [`BridgeError::ConnectionReset`] 再收到 `closed`；
//! - 会话一旦开始关闭，不再向处理器交付任何消息；`closed` 交付后释放协议层属性与缓存地址。
//!
//! ## 实现要点（How）
//! - 入站事件通过 [`FilterChain`] 快照从链头走到处理器；出站请求从链尾走到 [`SessionProcessor`]；
//! - 处理器可在运行期替换（协议分发解析完成后挂上真正的业务处理器）。

mod filter;
mod handler;
mod processor;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::address::{ResourceAddress, Scheme};
use crate::buffer::PendingWrite;
use crate::error::{BridgeError, Result};
use crate::observability::TARGET_SESSION as TARGET;

pub use filter::{FilterChain, NextFilter, SessionFilter};
pub use handler::{BridgeHandler, IdleStatus, SessionInitializer};
pub(crate) use handler::PendingHandler;
pub use processor::{ParentProcessor, SessionProcessor};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的会话编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 会话在处理器视角下的生命周期阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// 已构造，`created` 尚未交付给处理器（例如仍在嗅探或握手）。
    Negotiating,
    Created,
    Opened,
    Closed,
}

type Attributes = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

struct SessionInner {
    id: SessionId,
    scheme: Scheme,
    service: Arc<str>,
    processor: Arc<dyn SessionProcessor>,
    parent: Option<BridgeSession>,
    children: Mutex<Vec<Weak<SessionInner>>>,
    chain: FilterChain,
    handler: RwLock<Arc<dyn BridgeHandler>>,
    local: RwLock<Option<ResourceAddress>>,
    remote: RwLock<Option<ResourceAddress>>,
    state: Mutex<SessionState>,
    closing: AtomicBool,
    attributes: Mutex<Attributes>,
    close_waiters: Mutex<Option<Vec<oneshot::Sender<()>>>>,
}

/// 某一协议层上的会话句柄，克隆成本为一次引用计数。
#[derive(Clone)]
pub struct BridgeSession {
    inner: Arc<SessionInner>,
}

/// 不延长会话生命周期的弱句柄，供定时任务等延迟回调使用。
#[derive(Clone)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<BridgeSession> {
        self.0.upgrade().map(|inner| BridgeSession { inner })
    }
}

/// [`BridgeSession`] 构造器。
pub struct SessionBuilder {
    scheme: Scheme,
    processor: Arc<dyn SessionProcessor>,
    service: Option<Arc<str>>,
    parent: Option<BridgeSession>,
    local: Option<ResourceAddress>,
    remote: Option<ResourceAddress>,
    handler: Option<Arc<dyn BridgeHandler>>,
}

impl SessionBuilder {
    /// 服务标签，仅用于日志。
    pub fn service(mut self, service: impl Into<Arc<str>>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn parent(mut self, parent: &BridgeSession) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn local_address(mut self, address: ResourceAddress) -> Self {
        self.local = Some(address);
        self
    }

    pub fn remote_address(mut self, address: Option<ResourceAddress>) -> Self {
        self.remote = address;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn BridgeHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// 构造会话并登记到父会话。
    ///
    /// 父会话已经开始关闭时，返回的会话同样立即处于关闭状态。
    pub fn build(self) -> BridgeSession {
        let service = self
            .service
            .unwrap_or_else(|| Arc::from(self.scheme.as_str()));
        let handler = self
            .handler
            .unwrap_or_else(|| Arc::new(PendingHandler) as Arc<dyn BridgeHandler>);
        let session = BridgeSession {
            inner: Arc::new(SessionInner {
                id: SessionId::next(),
                scheme: self.scheme,
                service,
                processor: self.processor,
                parent: self.parent,
                children: Mutex::new(Vec::new()),
                chain: FilterChain::default(),
                handler: RwLock::new(handler),
                local: RwLock::new(self.local),
                remote: RwLock::new(self.remote),
                state: Mutex::new(SessionState::Negotiating),
                closing: AtomicBool::new(false),
                attributes: Mutex::new(HashMap::new()),
                close_waiters: Mutex::new(Some(Vec::new())),
            }),
        };
        if let Some(parent) = session.parent() {
            parent.attach_child(&session);
            if parent.is_closed() {
                session.fire_session_closed();
            }
        }
        trace!(target: TARGET, session = %session.id(), scheme = %session.scheme(), "session constructed");
        session
    }
}

impl BridgeSession {
    pub fn builder(scheme: Scheme, processor: Arc<dyn SessionProcessor>) -> SessionBuilder {
        SessionBuilder {
            scheme,
            processor,
            service: None,
            parent: None,
            local: None,
            remote: None,
            handler: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn scheme(&self) -> Scheme {
        self.inner.scheme
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn parent(&self) -> Option<&BridgeSession> {
        self.inner.parent.as_ref()
    }

    /// 仍存活的子会话快照。
    pub fn children(&self) -> Vec<BridgeSession> {
        self.inner
            .children
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| BridgeSession { inner })
            .filter(|child| !child.is_closed())
            .collect()
    }

    pub fn local_address(&self) -> Option<ResourceAddress> {
        self.inner.local.read().clone()
    }

    pub fn set_local_address(&self, address: ResourceAddress) {
        *self.inner.local.write() = Some(address);
    }

    pub fn remote_address(&self) -> Option<ResourceAddress> {
        self.inner.remote.read().clone()
    }

    pub fn set_remote_address(&self, address: ResourceAddress) {
        *self.inner.remote.write() = Some(address);
    }

    pub fn filter_chain(&self) -> &FilterChain {
        &self.inner.chain
    }

    pub fn handler(&self) -> Arc<dyn BridgeHandler> {
        Arc::clone(&self.inner.handler.read())
    }

    pub fn set_handler(&self, handler: Arc<dyn BridgeHandler>) {
        *self.inner.handler.write() = handler;
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// 是否已开始关闭。
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// `created` 尚未交付给处理器且会话仍存活。
    pub fn is_pending(&self) -> bool {
        !self.is_closed() && self.state() == SessionState::Negotiating
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    pub fn ptr_eq(&self, other: &BridgeSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 写入会话属性，返回同类型的旧值。
    pub fn insert_attribute<T: Any + Send + Sync>(&self, value: T) -> Option<T> {
        self.inner
            .attributes
            .lock()
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn attribute<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.inner
            .attributes
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn remove_attribute<T: Any + Send + Sync>(&self) -> Option<T> {
        self.inner
            .attributes
            .lock()
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// 发起侧会话的启动序列：初始化器 → `created` → `opened`。
    ///
    /// 初始化器或处理器拒绝会话时会话被关闭并返回对应错误。
    pub fn open(&self, initializer: Option<&Arc<dyn SessionInitializer>>) -> Result<()> {
        if let Some(initializer) = initializer
            && let Err(error) = initializer.initialize(self)
        {
            self.fire_exception_caught(error.clone());
            self.close();
            return Err(error);
        }
        self.fire_session_created();
        if self.is_closed() {
            return Err(BridgeError::SessionClosed {
                session: self.id().get(),
            });
        }
        self.fire_session_opened();
        Ok(())
    }

    pub fn fire_session_created(&self) {
        let chain = self.inner.chain.snapshot();
        NextFilter::new(&chain).session_created(self);
    }

    pub fn fire_session_opened(&self) {
        let chain = self.inner.chain.snapshot();
        NextFilter::new(&chain).session_opened(self);
    }

    pub fn fire_message_received(&self, message: Bytes) {
        if self.is_closed() {
            trace!(target: TARGET, session = %self.id(), len = message.len(), "dropping message after close");
            return;
        }
        let chain = self.inner.chain.snapshot();
        NextFilter::new(&chain).message_received(self, message);
    }

    pub fn fire_session_idle(&self, status: IdleStatus) {
        let chain = self.inner.chain.snapshot();
        NextFilter::new(&chain).session_idle(self, status);
    }

    pub fn fire_exception_caught(&self, error: BridgeError) {
        let chain = self.inner.chain.snapshot();
        NextFilter::new(&chain).exception_caught(self, error);
    }

    /// 触发关闭事件；重复调用无效果。
    ///
    /// 先关闭全部存活子会话（协商期的子会话先被重置），再沿本会话的过滤器链交付 `closed`，
    /// 最后释放属性、缓存地址并从父会话摘除。
    pub fn fire_session_closed(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        for child in self.children() {
            if child.is_pending() {
                child.fire_exception_caught(BridgeError::ConnectionReset {
                    detail: format!("parent session {} closed during negotiation", self.id()),
                });
            }
            child.fire_session_closed();
        }
        let chain = self.inner.chain.snapshot();
        NextFilter::new(&chain).session_closed(self);
        self.release();
    }

    /// 沿过滤器链出站写入。
    pub fn write(&self, payload: PendingWrite) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::SessionClosed {
                session: self.id().get(),
            });
        }
        let chain = self.inner.chain.snapshot();
        NextFilter::new(&chain).filter_write(self, payload)
    }

    /// 写入一段私有负载。
    pub fn write_bytes(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.write(PendingWrite::Private(bytes.into()))
    }

    /// 请求有序关闭。
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        let chain = self.inner.chain.snapshot();
        NextFilter::new(&chain).filter_close(self);
    }

    /// 非正常终止：上报 `error` 后关闭。
    pub fn reset(&self, error: BridgeError) {
        if self.is_closed() {
            return;
        }
        self.inner.processor.reset(self, error);
    }

    /// 会话完成关闭（`closed` 已交付、资源已释放）时就绪的 future。
    pub fn close_future(&self) -> BoxFuture<'static, ()> {
        let receiver = {
            let mut waiters = self.inner.close_waiters.lock();
            match waiters.as_mut() {
                None => return futures::future::ready(()).boxed(),
                Some(waiters) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    receiver
                }
            }
        };
        async move {
            let _ = receiver.await;
        }
        .boxed()
    }

    pub(crate) fn deliver_created(&self) {
        if self.is_closed() {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Negotiating {
                return;
            }
            *state = SessionState::Created;
        }
        if let Err(error) = self.handler().session_created(self) {
            debug!(target: TARGET, session = %self.id(), code = error.code(), %error, "handler rejected session");
            self.fire_exception_caught(error);
            self.close();
        }
    }

    pub(crate) fn deliver_opened(&self) {
        if self.is_closed() {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Created {
                return;
            }
            *state = SessionState::Opened;
        }
        self.handler().session_opened(self);
    }

    pub(crate) fn deliver_message(&self, message: Bytes) {
        if self.is_closed() || self.state() == SessionState::Negotiating {
            trace!(target: TARGET, session = %self.id(), len = message.len(), "message not deliverable");
            return;
        }
        self.handler().message_received(self, message);
    }

    pub(crate) fn deliver_idle(&self, status: IdleStatus) {
        if self.is_closed() || self.state() == SessionState::Negotiating {
            return;
        }
        self.handler().session_idle(self, status);
    }

    pub(crate) fn deliver_exception(&self, error: &BridgeError) {
        if matches!(self.state(), SessionState::Negotiating | SessionState::Closed) {
            trace!(target: TARGET, session = %self.id(), code = error.code(), "exception not deliverable");
            return;
        }
        self.handler().exception_caught(self, error);
    }

    pub(crate) fn deliver_closed(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), SessionState::Closed);
        match previous {
            SessionState::Closed => {}
            SessionState::Negotiating => {
                trace!(target: TARGET, session = %self.id(), "closed before created was delivered");
            }
            SessionState::Created | SessionState::Opened => {
                self.handler().session_closed(self);
            }
        }
    }

    pub(crate) fn processor_write(&self, payload: PendingWrite) -> Result<()> {
        self.inner.processor.write(self, payload)
    }

    pub(crate) fn processor_close(&self) {
        self.inner.processor.close(self)
    }

    fn attach_child(&self, child: &BridgeSession) {
        let mut children = self.inner.children.lock();
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
    }

    fn detach_child(&self, child: &BridgeSession) {
        let target = Arc::as_ptr(&child.inner);
        self.inner
            .children
            .lock()
            .retain(|weak| weak.strong_count() > 0 && weak.as_ptr() != target);
    }

    fn release(&self) {
        let attributes = std::mem::take(&mut *self.inner.attributes.lock());
        drop(attributes);
        self.inner.local.write().take();
        self.inner.remote.write().take();
        if let Some(parent) = self.parent() {
            parent.detach_child(self);
        }
        let waiters = self.inner.close_waiters.lock().take();
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(());
        }
        debug!(target: TARGET, session = %self.id(), scheme = %self.scheme(), service = %self.service(), "session released");
    }
}

impl fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeSession")
            .field("id", &self.id())
            .field("scheme", &self.scheme())
            .field("service", &self.service())
            .field("state", &self.state())
            .field("closing", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::test_stubs::{HandlerEvent, MemoryProcessor, RecordingFilter, RecordingHandler};

    fn physical(handler: &Arc<RecordingHandler>) -> (BridgeSession, Arc<MemoryProcessor>) {
        let processor = Arc::new(MemoryProcessor::default());
        let session = BridgeSession::builder(Scheme::Tcp, processor.clone())
            .handler(handler.clone())
            .build();
        session.open(None).expect("会话应能打开");
        (session, processor)
    }

    #[test]
    fn events_reach_handler_in_lifecycle_order() {
        let handler = Arc::new(RecordingHandler::new());
        let (session, _) = physical(&handler);
        session.fire_message_received(Bytes::from_static(b"ping"));
        session.fire_session_closed();
        session.fire_message_received(Bytes::from_static(b"late"));
        assert_eq!(
            handler.events_for(session.id()),
            vec![
                HandlerEvent::Created,
                HandlerEvent::Opened,
                HandlerEvent::Message(Bytes::from_static(b"ping")),
                HandlerEvent::Closed,
            ],
            "关闭后的消息不得交付"
        );
    }

    #[test]
    fn closing_parent_resets_pending_child_and_closes_established_one() {
        let parent_handler = Arc::new(RecordingHandler::new());
        let (parent, _) = physical(&parent_handler);

        let child_handler = Arc::new(RecordingHandler::new());
        let established = BridgeSession::builder(Scheme::Http, Arc::new(ParentProcessor))
            .parent(&parent)
            .handler(child_handler.clone())
            .build();
        established.open(None).expect("子会话应能打开");

        let pending = BridgeSession::builder(Scheme::Ssl, Arc::new(ParentProcessor))
            .parent(&parent)
            .build();
        let probe = Arc::new(RecordingFilter::new());
        pending.filter_chain().add_last("probe", probe.clone());
        assert!(pending.is_pending());
        established.insert_attribute(7_u32);

        parent.fire_session_closed();

        assert_eq!(
            child_handler.events_for(established.id()).last(),
            Some(&HandlerEvent::Closed)
        );
        assert_eq!(
            probe.events_for(pending.id()),
            vec![HandlerEvent::Exception(codes::CONNECTION_RESET), HandlerEvent::Closed],
            "协商期的子会话必须先被重置再关闭"
        );
        assert!(parent.children().is_empty());
        assert_eq!(established.attribute::<u32>(), None, "关闭后属性必须释放");
    }

    #[test]
    fn child_close_closes_parent_when_it_was_the_last_child() {
        let handler = Arc::new(RecordingHandler::new());
        let (parent, processor) = physical(&handler);
        let first = BridgeSession::builder(Scheme::Http, Arc::new(ParentProcessor))
            .parent(&parent)
            .build();
        let second = BridgeSession::builder(Scheme::Http, Arc::new(ParentProcessor))
            .parent(&parent)
            .build();

        first.close();
        assert!(!parent.is_closed(), "仍有其它子会话时父会话保持打开");
        second.close();
        assert!(parent.is_closed());
        assert!(processor.is_closed());
    }

    #[test]
    fn writes_after_close_are_rejected() {
        let handler = Arc::new(RecordingHandler::new());
        let (session, processor) = physical(&handler);
        session.write_bytes(&b"hello"[..]).expect("打开状态可写");
        session.close();
        let error = session.write_bytes(&b"again"[..]).expect_err("关闭后写入必须失败");
        assert_eq!(error.code(), codes::SESSION_CLOSED);
        assert_eq!(processor.written(), b"hello");
    }

    #[test]
    fn handler_rejection_closes_session() {
        struct Reject;
        impl BridgeHandler for Reject {
            fn session_created(&self, _session: &BridgeSession) -> Result<()> {
                Err(BridgeError::Config {
                    detail: "rejected".into(),
                })
            }
        }
        let processor = Arc::new(MemoryProcessor::default());
        let session = BridgeSession::builder(Scheme::Tcp, processor.clone())
            .handler(Arc::new(Reject))
            .build();
        let error = session.open(None).expect_err("处理器拒绝后 open 应失败");
        assert_eq!(error.code(), codes::SESSION_CLOSED);
        assert!(processor.is_closed());
    }

    #[test]
    fn close_future_resolves_after_release() {
        let handler = Arc::new(RecordingHandler::new());
        let (session, _) = physical(&handler);
        let mut pending = session.close_future();
        assert!((&mut pending).now_or_never().is_none());
        session.close();
        assert!(pending.now_or_never().is_some());
        assert!(session.close_future().now_or_never().is_some());
    }
}
