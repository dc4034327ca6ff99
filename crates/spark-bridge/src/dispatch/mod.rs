//! # dispatch 模块说明：下一协议分发
//!
//! ## 核心意图（Why）
//! - 同一物理地址上可能同时绑定了 `ssl`、`http`、原始 TCP 等多个下一协议；
//!   连接刚接入时无从得知对端要说哪种协议，只能缓冲最前面的字节并交给各协议的嗅探器判定；
//! - 判定期间到达的生命周期事件必须延后，待真正的业务处理器挂上之后按原顺序补发。
//!
//! ## 行为契约（What）
//! - 分组里只有一个候选时直接解析，不做任何嗅探；
//! - 多个候选时，首个给出“命中”的嗅探器胜出；同一批字节上多个命中按协议名字典序取第一个；
//! - 全部排除时：存在原始绑定则回退到原始绑定，否则关闭连接；
//! - 字节预算耗尽或时间预算到期仍未判定：同样先尝试原始绑定，否则关闭连接；
//! - 解析完成后：构造候选地址 → 查找具体绑定（查不到视为解绑竞态，关闭连接）→ 更新本地地址与
//!   处理器 → 运行初始化器 → 移除分发过滤器 → 按原顺序补发 `created`、`opened`、缓冲数据与其它事件。
//!
//! ## 实现要点（How）
//! - 分发过滤器安装在链头，持有一把短临界区的互斥锁；补发总是在释放锁之后进行，
//!   因而处理器在回调中关闭会话或再次写入都不会重入死锁；
//! - 定时器回调只持有会话与过滤器的弱引用，会话先行关闭时回调自然失效。

pub mod sniff;

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::address::ResourceAddressFactory;
use crate::config::DispatchConfig;
use crate::error::BridgeError;
use crate::observability::TARGET_DISPATCH;
use crate::registry::{BindingRegistry, NextProtocolBinding};
use crate::runtime::{TimerHandle, TimerService};
use crate::session::{BridgeSession, IdleStatus, NextFilter, SessionFilter};

pub use sniff::{ProtocolSniffer, SniffVerdict, SnifferTable};

/// 分发过滤器在会话链上的名称。
pub const DISPATCH_FILTER: &str = "spark.dispatch";

/// 会话属性：分发结果。`None` 表示原始绑定。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedProtocol(pub Option<Arc<str>>);

/// 下一协议分发器，每个接入器（物理或逻辑层）各持一个。
#[derive(Clone)]
pub struct NextProtocolDispatcher {
    shared: Arc<DispatcherShared>,
}

struct DispatcherShared {
    registry: Arc<BindingRegistry>,
    factory: ResourceAddressFactory,
    sniffers: Arc<SnifferTable>,
    timer: Arc<dyn TimerService>,
    budget_bytes: usize,
    timeout: Duration,
}

impl NextProtocolDispatcher {
    pub fn new(
        registry: Arc<BindingRegistry>,
        sniffers: Arc<SnifferTable>,
        timer: Arc<dyn TimerService>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            shared: Arc::new(DispatcherShared {
                registry,
                factory: ResourceAddressFactory::new(),
                sniffers,
                timer,
                budget_bytes: config.sniff_budget_bytes,
                timeout: config.sniff_timeout(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<BindingRegistry> {
        &self.shared.registry
    }

    /// 在会话链头安装分发过滤器。必须在 `fire_session_created` 之前调用。
    pub fn attach(&self, session: &BridgeSession) {
        let core = Arc::new(DispatchCore {
            shared: Arc::clone(&self.shared),
            state: Mutex::new(DispatchState::default()),
        });
        session
            .filter_chain()
            .add_first(DISPATCH_FILTER, Arc::new(DispatchFilter(core)));
    }
}

enum DeferredEvent {
    Created,
    Opened,
    Message(Bytes),
    Idle(IdleStatus),
    Exception(BridgeError),
}

#[derive(Default)]
struct DispatchState {
    /// 已解析或已失败，不再拦截任何事件。
    settled: bool,
    group: Option<NextProtocolBinding>,
    sniffed: BytesMut,
    queued: Vec<DeferredEvent>,
    timer: Option<TimerHandle>,
}

enum Decision {
    Resolve(NextProtocolBinding, Option<Arc<str>>),
    Fail(BridgeError),
    Wait,
}

struct DispatchCore {
    shared: Arc<DispatcherShared>,
    state: Mutex<DispatchState>,
}

impl DispatchCore {
    /// 未决期间把事件排队；已判定时原样交还调用方继续传递。
    fn defer(&self, event: DeferredEvent) -> Option<DeferredEvent> {
        let mut state = self.state.lock();
        if state.settled {
            return Some(event);
        }
        state.queued.push(event);
        None
    }

    /// 对已缓冲的字节做一次判定。
    fn evaluate(&self, group: &NextProtocolBinding, prefix: &[u8]) -> Decision {
        let mut waiting = false;
        for protocol in group.named_protocols() {
            match self.shared.sniffers.sniff(protocol, prefix) {
                SniffVerdict::Match => {
                    return Decision::Resolve(group.clone(), Some(Arc::from(protocol)));
                }
                SniffVerdict::NeedMore => waiting = true,
                SniffVerdict::NoMatch => {}
            }
        }
        if waiting && prefix.len() < self.shared.budget_bytes {
            return Decision::Wait;
        }
        let reason = if waiting {
            "sniff byte budget exhausted"
        } else {
            "no sniffer matched"
        };
        if group.has_raw() {
            trace!(target: TARGET_DISPATCH, reason, "falling back to raw binding");
            Decision::Resolve(group.clone(), None)
        } else {
            Decision::Fail(BridgeError::SniffFailed {
                address: group.bind_address().to_string(),
                reason: reason.into(),
            })
        }
    }

    fn apply(&self, session: &BridgeSession, decision: Decision) {
        match decision {
            Decision::Wait => {}
            Decision::Resolve(group, protocol) => self.resolve(session, &group, protocol),
            Decision::Fail(error) => self.fail(session, error),
        }
    }

    /// 结束分发期，返回排队的事件；已经结束过时返回 `None`。
    fn settle(&self) -> Option<Vec<DeferredEvent>> {
        let mut state = self.state.lock();
        if state.settled {
            return None;
        }
        state.settled = true;
        state.group = None;
        state.sniffed.clear();
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        Some(std::mem::take(&mut state.queued))
    }

    fn resolve(&self, session: &BridgeSession, group: &NextProtocolBinding, protocol: Option<Arc<str>>) {
        let Some(queued) = self.settle() else {
            return;
        };
        session.filter_chain().remove(DISPATCH_FILTER);
        let observed = session
            .local_address()
            .and_then(|local| local.transport().cloned());
        let candidate = self.shared.factory.resolve_candidate(
            group.bind_address(),
            protocol.as_deref(),
            observed.as_ref(),
        );
        let Some(binding) = self.shared.registry.get_binding(&candidate) else {
            debug!(
                target: TARGET_DISPATCH,
                session = %session.id(),
                candidate = %candidate,
                "binding vanished during resolution, closing"
            );
            session.close();
            return;
        };

        debug!(
            target: TARGET_DISPATCH,
            session = %session.id(),
            protocol = protocol.as_deref().unwrap_or("<raw>"),
            "next protocol resolved"
        );
        session.set_local_address(candidate);
        session.insert_attribute(ResolvedProtocol(protocol));
        session.set_handler(Arc::clone(binding.handler()));
        if let Some(initializer) = binding.initializer()
            && let Err(error) = initializer.initialize(session)
        {
            debug!(target: TARGET_DISPATCH, session = %session.id(), %error, "session initializer failed, closing");
            session.close();
            return;
        }
        replay(session, queued);
    }

    fn fail(&self, session: &BridgeSession, error: BridgeError) {
        if self.settle().is_none() {
            return;
        }
        session.filter_chain().remove(DISPATCH_FILTER);
        debug!(
            target: TARGET_DISPATCH,
            session = %session.id(),
            code = error.code(),
            %error,
            "next protocol dispatch failed, closing"
        );
        session.close();
    }

    fn on_timeout(&self, session: &BridgeSession) {
        let group = {
            let state = self.state.lock();
            if state.settled {
                return;
            }
            state.group.clone()
        };
        let Some(group) = group else {
            return;
        };
        if group.has_raw() {
            trace!(target: TARGET_DISPATCH, session = %session.id(), "sniff timed out, falling back to raw binding");
            self.resolve(session, &group, None);
        } else {
            self.fail(
                session,
                BridgeError::Timeout {
                    operation: "next protocol sniffing",
                    elapsed: self.shared.timeout,
                },
            );
        }
    }
}

fn replay(session: &BridgeSession, queued: Vec<DeferredEvent>) {
    for event in queued {
        match event {
            DeferredEvent::Created => session.fire_session_created(),
            DeferredEvent::Opened => session.fire_session_opened(),
            DeferredEvent::Message(message) => session.fire_message_received(message),
            DeferredEvent::Idle(status) => session.fire_session_idle(status),
            DeferredEvent::Exception(error) => session.fire_exception_caught(error),
        }
    }
}

/// 链上登记的分发过滤器。
struct DispatchFilter(Arc<DispatchCore>);

impl DispatchFilter {
    fn arm_timer(&self, session: &BridgeSession) {
        let core: Weak<DispatchCore> = Arc::downgrade(&self.0);
        let weak_session = session.downgrade();
        let handle = self.0.shared.timer.schedule(
            self.0.shared.timeout,
            Box::new(move || {
                if let (Some(core), Some(session)) = (core.upgrade(), weak_session.upgrade()) {
                    core.on_timeout(&session);
                }
            }),
        );
        let mut state = self.0.state.lock();
        if state.settled {
            drop(state);
            handle.cancel();
        } else {
            state.timer = Some(handle);
        }
    }
}

impl SessionFilter for DispatchFilter {
    fn session_created(&self, next: NextFilter<'_>, session: &BridgeSession) {
        let core = &self.0;
        if core.defer(DeferredEvent::Created).is_some() {
            next.session_created(session);
            return;
        }
        let group = session
            .local_address()
            .and_then(|local| core.shared.registry.get_binding0(&local));
        let Some(group) = group else {
            core.fail(
                session,
                BridgeError::BindingMissing {
                    address: session
                        .local_address()
                        .map_or_else(|| "<unbound>".to_owned(), |local| local.to_string()),
                },
            );
            return;
        };

        if group.candidate_count() == 1 {
            let protocol = group.protocols().into_iter().next().flatten();
            core.resolve(session, &group, protocol);
            return;
        }

        trace!(
            target: TARGET_DISPATCH,
            session = %session.id(),
            candidates = group.candidate_count(),
            "sniffing next protocol"
        );
        core.state.lock().group = Some(group);
        self.arm_timer(session);
    }

    fn session_opened(&self, next: NextFilter<'_>, session: &BridgeSession) {
        if self.0.defer(DeferredEvent::Opened).is_some() {
            next.session_opened(session);
        }
    }

    fn message_received(&self, next: NextFilter<'_>, session: &BridgeSession, message: Bytes) {
        let core = &self.0;
        let (group, prefix) = {
            let mut state = core.state.lock();
            if state.settled {
                drop(state);
                next.message_received(session, message);
                return;
            }
            state.sniffed.extend_from_slice(&message);
            state.queued.push(DeferredEvent::Message(message));
            match state.group.clone() {
                Some(group) => (group, Bytes::copy_from_slice(&state.sniffed)),
                None => return,
            }
        };
        let decision = core.evaluate(&group, &prefix);
        core.apply(session, decision);
    }

    fn session_idle(&self, next: NextFilter<'_>, session: &BridgeSession, status: IdleStatus) {
        if self.0.defer(DeferredEvent::Idle(status)).is_some() {
            next.session_idle(session, status);
        }
    }

    fn exception_caught(&self, next: NextFilter<'_>, session: &BridgeSession, error: BridgeError) {
        if let Some(DeferredEvent::Exception(error)) = self.0.defer(DeferredEvent::Exception(error)) {
            next.exception_caught(session, error);
        }
    }

    fn session_closed(&self, next: NextFilter<'_>, session: &BridgeSession) {
        drop(self.0.settle());
        next.session_closed(session);
    }
}
