//! 接入侧 TLS 层。

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::MutexGuard;
use spark_bridge::address::{KeySelectionContext, KeySelector, keys};
use spark_bridge::bridge::LayerContext;
use spark_bridge::{BridgeError, BridgeHandler, BridgeSession, IdleStatus, NextProtocolBinding, Result};
use tracing::{debug, trace};

use crate::TARGET_LAYER;
use crate::client_hello::{self, Scan};
use crate::engine::{Inbound, TlsEngine};
use crate::error::{CLIENT_HELLO, misconfigured, rejected};
use crate::key_store::KeyStore;
use crate::policy::TlsPolicy;
use crate::profile;
use crate::state::{Delivery, Link, PendingHello, Phase, SharedLink};

/// 父会话属性：本连接的 TLS 状态。
#[derive(Clone)]
struct TlsLink(SharedLink);

fn link_of(parent: &BridgeSession) -> Option<SharedLink> {
    parent.attribute::<TlsLink>().map(|TlsLink(link)| link)
}

/// 接入侧 TLS 层：作为物理会话（或任意下层会话）的处理器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同一下层端点上可能登记了多个 `ssl` 虚拟主机；证书必须在读到任何客户端数据之前确定，
///   因此按端点上全部主机名选择；
/// - 即便地址关闭了加密，本层仍然要在下层之上建立一层会话并交给本层分发器，
///   以便继续判定 `ssl` 之上的下一协议。
///
/// ## 流程（How）
/// 1. `session_created`：收集分组；加密开启时取密钥快照、选择身份并启动握手定时器，
///    关闭加密时立即以首个分组建立明文子会话；
/// 2. `message_received`：缓冲直到 ClientHello 完整（受字节预算约束），按 SNI 选定分组，
///    以该分组的套件/版本白名单预检，然后交给握手引擎；
/// 3. 握手完成：在选定分组上构造子会话，附上 [`TlsSessionInfo`](crate::TlsSessionInfo)，
///    依次触发 `created`、`opened` 与已解密的明文；
/// 4. 任一步失败：写出告警（若有），以错误重置父会话。
///
/// ## 契约（What）
/// - 父会话在握手完成前关闭时，没有任何 TLS 层会话被交付给业务处理器；
/// - 证书选择只使用本层选项与密钥库，不读取 ClientHello。
pub struct TlsLayer {
    context: LayerContext,
    store: Arc<KeyStore>,
    selector: Arc<dyn KeySelector>,
}

impl TlsLayer {
    pub fn new(context: LayerContext, store: Arc<KeyStore>, selector: Arc<dyn KeySelector>) -> Self {
        Self {
            context,
            store,
            selector,
        }
    }

    fn start_plaintext(&self, parent: &BridgeSession, group: &NextProtocolBinding) {
        let link = SharedLink::new(Phase::Closed);
        let child = self.context.new_child(parent, group, link.processor());
        drop(link.lock().establish(None, child.clone()));
        parent.insert_attribute(TlsLink(link));
        trace!(target: TARGET_LAYER, session = %parent.id(), "encryption disabled, plaintext child created");
        child.fire_session_created();
    }

    fn start_handshake(&self, parent: &BridgeSession, groups: Vec<NextProtocolBinding>) -> Result<()> {
        let material = self.store.snapshot();
        let mut hosts: Vec<Arc<str>> = groups
            .iter()
            .filter_map(|group| group.bind_address().host())
            .map(Arc::from)
            .collect();
        hosts.sort();
        hosts.dedup();
        let aliases = material.aliases();
        let selector = groups
            .first()
            .and_then(|group| group.bind_address().option(keys::SSL_KEY_SELECTOR))
            .unwrap_or_else(|| Arc::clone(&self.selector));
        let identity = selector
            .select(&KeySelectionContext {
                hosts: &hosts,
                aliases: &aliases,
                server: true,
            })
            .and_then(|alias| material.identity(&alias))
            .ok_or_else(|| misconfigured(format!("no identity in the key store matches hosts [{}]", hosts.join(","))))?;

        let link = SharedLink::new(Phase::AwaitingHello(PendingHello {
            buffered: BytesMut::new(),
            identity,
            material,
            groups,
        }));
        parent.insert_attribute(TlsLink(link.clone()));
        link.arm_timer(
            self.context.timer(),
            self.context.config().tls.handshake_timeout(),
            parent,
        );
        Ok(())
    }

    /// 锁内推进状态机；返回需要在锁外完成的交付。
    fn receive(&self, link: &SharedLink, parent: &BridgeSession, message: Bytes) -> Result<Option<Delivery>> {
        let mut guard = link.lock();
        match std::mem::replace(&mut guard.phase, Phase::Closed) {
            Phase::AwaitingHello(mut pending) => {
                pending.buffered.extend_from_slice(&message);
                match client_hello::scan(&pending.buffered) {
                    Scan::NeedMore => {
                        let budget = self.context.config().tls.client_hello_budget_bytes;
                        if pending.buffered.len() >= budget {
                            return Err(rejected(
                                CLIENT_HELLO,
                                format!("client hello exceeds {budget} bytes"),
                            ));
                        }
                        guard.phase = Phase::AwaitingHello(pending);
                        Ok(None)
                    }
                    Scan::Invalid(reason) => Err(rejected(CLIENT_HELLO, reason)),
                    Scan::Complete(hello) => {
                        let group = select_group(&pending.groups, hello.server_name.as_deref())
                            .ok_or_else(|| misconfigured("tls layer lost its bindings"))?;
                        let address = group.bind_address();
                        let policy = TlsPolicy::resolve(
                            &address.option(keys::SSL_CIPHERS),
                            &address.option(keys::SSL_PROTOCOLS),
                        )?;
                        policy
                            .admit(&hello)
                            .map_err(|reason| rejected(CLIENT_HELLO, reason))?;
                        trace!(
                            target: TARGET_LAYER,
                            session = %parent.id(),
                            sni = hello.server_name.as_deref().unwrap_or("<none>"),
                            group = %address,
                            "client hello admitted"
                        );
                        let config = profile::server_config(&policy, &pending.material, pending.identity, address)?;
                        let mut engine = TlsEngine::server(config)?;
                        let inbound = engine.exchange(parent, &pending.buffered)?;
                        self.progress(guard, link, parent, engine, group, inbound)
                    }
                }
            }
            Phase::Handshaking {
                mut engine,
                group: Some(group),
            } => {
                let inbound = engine.exchange(parent, &message)?;
                self.progress(guard, link, parent, engine, group, inbound)
            }
            Phase::Established {
                engine: Some(mut engine),
                child,
            } => {
                let inbound = engine.exchange(parent, &message);
                guard.phase = Phase::Established {
                    engine: Some(engine),
                    child: child.clone(),
                };
                Ok(Some(Delivery {
                    child,
                    fresh: false,
                    inbound: inbound?,
                }))
            }
            Phase::Established { engine: None, child } => {
                guard.phase = Phase::Established {
                    engine: None,
                    child: child.clone(),
                };
                Ok(Some(Delivery {
                    child,
                    fresh: false,
                    inbound: Inbound {
                        plaintext: Some(message),
                        peer_closed: false,
                    },
                }))
            }
            Phase::Handshaking { group: None, .. } | Phase::Closed => Ok(None),
        }
    }

    fn progress(
        &self,
        mut guard: MutexGuard<'_, Link>,
        link: &SharedLink,
        parent: &BridgeSession,
        engine: TlsEngine,
        group: NextProtocolBinding,
        inbound: Inbound,
    ) -> Result<Option<Delivery>> {
        if engine.is_handshaking() {
            if inbound.peer_closed {
                return Err(BridgeError::ConnectionReset {
                    detail: "peer closed during tls handshake".into(),
                });
            }
            guard.phase = Phase::Handshaking {
                engine,
                group: Some(group),
            };
            return Ok(None);
        }
        let info = engine.info();
        let child = self.context.new_child(parent, &group, link.processor());
        debug!(
            target: TARGET_LAYER,
            session = %parent.id(),
            child = %child.id(),
            sni = info.server_name.as_deref().unwrap_or("<none>"),
            version = ?info.protocol_version,
            suite = ?info.cipher_suite,
            "tls session established"
        );
        child.insert_attribute(info);
        let timer = guard.establish(Some(engine), child.clone());
        drop(guard);
        if let Some(timer) = timer {
            timer.cancel();
        }
        Ok(Some(Delivery {
            child,
            fresh: true,
            inbound,
        }))
    }
}

/// 按 SNI 选择分组：主机名相同者优先，否则取绑定键最小的分组。
fn select_group(groups: &[NextProtocolBinding], server_name: Option<&str>) -> Option<NextProtocolBinding> {
    server_name
        .and_then(|name| {
            groups.iter().find(|group| {
                group
                    .bind_address()
                    .host()
                    .is_some_and(|host| host.eq_ignore_ascii_case(name))
            })
        })
        .or_else(|| groups.first())
        .cloned()
}

impl BridgeHandler for TlsLayer {
    fn session_created(&self, parent: &BridgeSession) -> Result<()> {
        let groups = self.context.candidates(parent);
        let Some(first) = groups.first() else {
            debug!(target: TARGET_LAYER, session = %parent.id(), "no ssl binding above transport, closing");
            parent.close();
            return Ok(());
        };
        if !first.bind_address().option(keys::SSL_ENCRYPTION_ENABLED) {
            let first = first.clone();
            self.start_plaintext(parent, &first);
            return Ok(());
        }
        self.start_handshake(parent, groups)
    }

    fn session_opened(&self, parent: &BridgeSession) {
        if let Some(child) = link_of(parent).and_then(|link| link.child()) {
            child.fire_session_opened();
        }
    }

    fn message_received(&self, parent: &BridgeSession, message: Bytes) {
        let Some(link) = link_of(parent) else {
            return;
        };
        match self.receive(&link, parent, message) {
            Ok(Some(delivery)) => delivery.deliver(),
            Ok(None) => {}
            Err(error) => {
                debug!(target: TARGET_LAYER, session = %parent.id(), code = error.code(), %error, "tls negotiation failed");
                link.close();
                parent.reset(error);
            }
        }
    }

    fn session_idle(&self, parent: &BridgeSession, status: IdleStatus) {
        if let Some(child) = link_of(parent).and_then(|link| link.child()) {
            child.fire_session_idle(status);
        }
    }

    fn exception_caught(&self, parent: &BridgeSession, error: &BridgeError) {
        if let Some(child) = link_of(parent).and_then(|link| link.child()) {
            child.fire_exception_caught(error.clone());
        }
    }

    fn session_closed(&self, parent: &BridgeSession) {
        if let Some(link) = link_of(parent) {
            link.close();
        }
    }
}
