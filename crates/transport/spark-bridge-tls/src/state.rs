//! 每条连接的 TLS 状态，以及 TLS 层会话的出站终点。

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use rustls::sign::CertifiedKey;
use spark_bridge::buffer::PendingWrite;
use spark_bridge::session::SessionProcessor;
use spark_bridge::{BridgeError, BridgeSession, NextProtocolBinding, Result, TimerHandle, TimerService};
use tracing::{debug, trace};

use crate::TARGET_LAYER;
use crate::engine::{Inbound, TlsEngine};
use crate::error::handshake_timeout;
use crate::key_store::KeyMaterial;

/// 接入侧等待完整 ClientHello 期间持有的材料。
pub(crate) struct PendingHello {
    pub buffered: BytesMut,
    pub identity: Arc<CertifiedKey>,
    pub material: Arc<KeyMaterial>,
    pub groups: Vec<NextProtocolBinding>,
}

pub(crate) enum Phase {
    AwaitingHello(PendingHello),
    /// `group` 只在接入侧存在：握手完成后子会话挂到这个分组上。
    Handshaking {
        engine: TlsEngine,
        group: Option<NextProtocolBinding>,
    },
    /// `engine` 为 `None` 表示该地址关闭了加密，字节原样透传。
    Established {
        engine: Option<TlsEngine>,
        child: BridgeSession,
    },
    Closed,
}

pub(crate) struct Link {
    pub phase: Phase,
    timer: Option<TimerHandle>,
}

/// 父会话与 TLS 层子会话共享的连接状态。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 引擎只在锁内被访问，发往父会话的记录也在锁内写出，多个写者之间记录顺序不会交错；
///   - 向子会话交付事件（`created`、消息、关闭）一律在释放锁之后进行，
///     子会话的处理器在回调里再次写入或关闭都不会重入死锁；
///   - 进入 `Established` 或 `Closed` 时取消握手定时器。
#[derive(Clone)]
pub(crate) struct SharedLink(Arc<Mutex<Link>>);

impl SharedLink {
    pub fn new(phase: Phase) -> Self {
        Self(Arc::new(Mutex::new(Link { phase, timer: None })))
    }

    pub fn lock(&self) -> MutexGuard<'_, Link> {
        self.0.lock()
    }

    /// 握手在 `timeout` 内未完成时重置 `parent`。
    pub fn arm_timer(&self, timer: &Arc<dyn TimerService>, timeout: Duration, parent: &BridgeSession) {
        let link: Weak<Mutex<Link>> = Arc::downgrade(&self.0);
        let weak_parent = parent.downgrade();
        let handle = timer.schedule(
            timeout,
            Box::new(move || {
                let (Some(link), Some(parent)) = (link.upgrade(), weak_parent.upgrade()) else {
                    return;
                };
                let expired = {
                    let mut link = link.lock();
                    let expired = matches!(link.phase, Phase::AwaitingHello(_) | Phase::Handshaking { .. });
                    if expired {
                        link.phase = Phase::Closed;
                        link.timer = None;
                    }
                    expired
                };
                if expired {
                    debug!(target: TARGET_LAYER, session = %parent.id(), ?timeout, "tls handshake timed out");
                    parent.reset(handshake_timeout(timeout));
                }
            }),
        );
        let mut link = self.0.lock();
        if matches!(link.phase, Phase::Established { .. } | Phase::Closed) {
            drop(link);
            handle.cancel();
        } else {
            link.timer = Some(handle);
        }
    }

    /// 已建立的子会话。
    pub fn child(&self) -> Option<BridgeSession> {
        match &self.0.lock().phase {
            Phase::Established { child, .. } => Some(child.clone()),
            _ => None,
        }
    }

    /// 结束本连接的 TLS 状态；重复调用无效果。
    pub fn close(&self) {
        let timer = {
            let mut link = self.0.lock();
            link.phase = Phase::Closed;
            link.timer.take()
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
    }

    pub fn processor(&self) -> Arc<dyn SessionProcessor> {
        Arc::new(TlsProcessor { link: self.clone() })
    }
}

impl Link {
    /// 进入 `Established`，返回需要在锁外取消的定时器。
    pub fn establish(&mut self, engine: Option<TlsEngine>, child: BridgeSession) -> Option<TimerHandle> {
        self.phase = Phase::Established { engine, child };
        self.timer.take()
    }
}

/// 锁外要对子会话完成的交付。
pub(crate) struct Delivery {
    pub child: BridgeSession,
    /// 子会话刚刚建立，先交付 `created` 与 `opened`。
    pub fresh: bool,
    pub inbound: Inbound,
}

impl Delivery {
    pub fn deliver(self) {
        let Self {
            child,
            fresh,
            inbound,
        } = self;
        if fresh {
            child.fire_session_created();
            child.fire_session_opened();
        }
        if let Some(plaintext) = inbound.plaintext {
            child.fire_message_received(plaintext);
        }
        if inbound.peer_closed {
            trace!(target: TARGET_LAYER, session = %child.id(), "peer sent close_notify");
            child.close();
        }
    }
}

/// TLS 层会话的 [`SessionProcessor`]。
///
/// - 加密开启时，写入（包括共享负载）被加密为记录后以私有负载写给父会话；
///   关闭加密时原样交给父会话，共享负载保持共享；
/// - 关闭先发出 `close_notify`，再触发子会话 `closed`，父会话上没有其它子会话时一并关闭。
struct TlsProcessor {
    link: SharedLink,
}

impl SessionProcessor for TlsProcessor {
    fn write(&self, session: &BridgeSession, payload: PendingWrite) -> Result<()> {
        let Some(parent) = session.parent() else {
            return Err(BridgeError::SessionClosed {
                session: session.id().get(),
            });
        };
        let mut link = self.link.lock();
        match &mut link.phase {
            Phase::Established {
                engine: Some(engine),
                ..
            } => {
                let plaintext: Bytes = match payload {
                    PendingWrite::Private(bytes) => bytes,
                    PendingWrite::Shared { payload, .. } => payload,
                };
                engine.encrypt(parent, &plaintext)
            }
            Phase::Established { engine: None, .. } => parent.write(payload),
            _ => Err(BridgeError::SessionClosed {
                session: session.id().get(),
            }),
        }
    }

    fn close(&self, session: &BridgeSession) {
        let (records, timer) = {
            let mut link = self.link.lock();
            let records = match &mut link.phase {
                Phase::Established {
                    engine: Some(engine),
                    ..
                } => engine.close_notify().unwrap_or_default(),
                _ => None,
            };
            link.phase = Phase::Closed;
            (records, link.timer.take())
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(parent) = session.parent()
            && let Some(records) = records
        {
            let _ = parent.write_bytes(records);
        }
        session.fire_session_closed();
        if let Some(parent) = session.parent()
            && parent.children().is_empty()
        {
            parent.close();
        }
    }
}
