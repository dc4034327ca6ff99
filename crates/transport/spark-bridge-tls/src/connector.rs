//! 发起侧 TLS 层。

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::channel::oneshot;
use parking_lot::Mutex;
use rustls::ClientConfig;
use spark_bridge::address::{KeySelectionContext, KeySelector, keys};
use spark_bridge::bridge::{BridgeConnector, ConnectorContext, ConnectorTable};
use spark_bridge::{
    BridgeError, BridgeHandler, BridgeSession, ConnectFuture, IdleStatus, ResourceAddress, Result, Scheme,
    SessionInitializer,
};
use tracing::debug;

use crate::TARGET_CONNECTOR;
use crate::engine::{Inbound, TlsEngine};
use crate::key_store::KeyStore;
use crate::policy::TlsPolicy;
use crate::profile;
use crate::state::{Delivery, Phase, SharedLink};

/// 发起侧 TLS 层连接器。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 先在下层连接器上连接 `address.transport()`，下层会话建立后在其上完成握手，
///     握手完成才构造 TLS 层会话、运行初始化器并以它完成 future；
///   - 服务端证书以密钥库的信任锚校验，主机名取自目标地址；
///     密钥选择器（选项或默认选择器）为目标主机选中身份时，服务端要求客户端证书时出示它；
///   - 配置错误（无信任锚、白名单非法）在发起连接之前同步失败；
///   - 下层会话在握手完成前关闭时以 [`BridgeError::ConnectionFailed`] 失败，
///     握手失败或超时则以对应错误失败。
pub struct TlsConnector {
    context: ConnectorContext,
    store: Arc<KeyStore>,
    selector: Arc<dyn KeySelector>,
}

impl TlsConnector {
    pub fn new(context: ConnectorContext, store: Arc<KeyStore>, selector: Arc<dyn KeySelector>) -> Self {
        Self {
            context,
            store,
            selector,
        }
    }

    fn client_config(&self, address: &ResourceAddress, host: &str) -> Result<Arc<ClientConfig>> {
        let material = self.store.snapshot();
        let policy = TlsPolicy::resolve(
            &address.option(keys::SSL_CIPHERS),
            &address.option(keys::SSL_PROTOCOLS),
        )?;
        let hosts = [Arc::<str>::from(host)];
        let aliases = material.aliases();
        let selector = address
            .option(keys::SSL_KEY_SELECTOR)
            .unwrap_or_else(|| Arc::clone(&self.selector));
        let identity = selector
            .select(&KeySelectionContext {
                hosts: &hosts,
                aliases: &aliases,
                server: false,
            })
            .and_then(|alias| material.identity(&alias));
        profile::client_config(&policy, &material, identity)
    }
}

impl BridgeConnector for TlsConnector {
    fn scheme(&self) -> Scheme {
        self.context.scheme()
    }

    fn connect(
        &self,
        connectors: &ConnectorTable,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> ConnectFuture {
        let scheme = self.context.scheme();
        let (lower, transport) = match connectors.lower_of(address) {
            Ok(found) => found,
            Err(error) => return futures::future::ready(Err(error)).boxed(),
        };
        let host = address.host().unwrap_or_default().to_owned();
        let config = if address.option(keys::SSL_ENCRYPTION_ENABLED) {
            match self.client_config(address, &host) {
                Ok(config) => Some(config),
                Err(error) => return futures::future::ready(Err(error)).boxed(),
            }
        } else {
            None
        };
        let (sender, receiver) = oneshot::channel();
        let bridge = Arc::new(TlsConnectHandler {
            context: self.context.clone(),
            target: address.clone(),
            host,
            config,
            handler,
            initializer,
            link: SharedLink::new(Phase::Closed),
            completion: Mutex::new(Some(sender)),
        });
        let pending = lower.connect(connectors, &transport, bridge, None);
        async move {
            let parent = pending.await?;
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::ConnectionFailed {
                    detail: format!(
                        "{} session {} ended before {scheme} was established",
                        parent.scheme(),
                        parent.id()
                    ),
                }),
            }
        }
        .boxed()
    }
}

type Completion = oneshot::Sender<Result<BridgeSession>>;

/// 发起侧下层会话的处理器，每次连接一个实例。
struct TlsConnectHandler {
    context: ConnectorContext,
    target: ResourceAddress,
    host: String,
    /// `None` 表示目标地址关闭了加密。
    config: Option<Arc<ClientConfig>>,
    handler: Arc<dyn BridgeHandler>,
    initializer: Option<Arc<dyn SessionInitializer>>,
    link: SharedLink,
    completion: Mutex<Option<Completion>>,
}

impl TlsConnectHandler {
    fn complete(&self, result: Result<BridgeSession>) {
        if let Some(sender) = self.completion.lock().take() {
            let _ = sender.send(result);
        }
    }

    fn new_child(&self, parent: &BridgeSession) -> BridgeSession {
        let scheme = self.context.scheme();
        let mut builder = BridgeSession::builder(scheme, self.link.processor())
            .service(format!("{scheme}-connector"))
            .parent(parent)
            .remote_address(Some(self.target.clone()))
            .handler(Arc::clone(&self.handler));
        if let Some(local) = self.context.local_of(parent) {
            builder = builder.local_address(local);
        }
        builder.build()
    }

    /// 启动子会话并完成 future；启动失败会连带关闭父会话，先取走完成通知以保留原始错误。
    fn open_child(&self, child: &BridgeSession) -> bool {
        let completion = self.completion.lock().take();
        let result = child.open(self.initializer.as_ref()).map(|()| child.clone());
        let opened = result.is_ok();
        if let Some(sender) = completion {
            let _ = sender.send(result);
        }
        opened
    }

    fn fail(&self, parent: &BridgeSession, error: BridgeError) {
        debug!(target: TARGET_CONNECTOR, session = %parent.id(), code = error.code(), %error, "tls connect failed");
        self.link.close();
        self.complete(Err(error.clone()));
        parent.reset(error);
    }

    fn receive(&self, parent: &BridgeSession, message: Bytes) -> Result<Option<Delivery>> {
        let mut guard = self.link.lock();
        match std::mem::replace(&mut guard.phase, Phase::Closed) {
            Phase::Handshaking { mut engine, group } => {
                let inbound = engine.exchange(parent, &message)?;
                if engine.is_handshaking() {
                    if inbound.peer_closed {
                        return Err(BridgeError::ConnectionReset {
                            detail: "peer closed during tls handshake".into(),
                        });
                    }
                    guard.phase = Phase::Handshaking { engine, group };
                    return Ok(None);
                }
                let mut info = engine.info();
                info.server_name = Some(self.host.clone());
                let child = self.new_child(parent);
                debug!(
                    target: TARGET_CONNECTOR,
                    session = %parent.id(),
                    child = %child.id(),
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
                if !self.open_child(&child) {
                    return Ok(None);
                }
                Ok(Some(Delivery {
                    child,
                    fresh: false,
                    inbound,
                }))
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
            Phase::AwaitingHello(_) | Phase::Closed => Ok(None),
        }
    }
}

impl BridgeHandler for TlsConnectHandler {
    fn session_created(&self, parent: &BridgeSession) -> Result<()> {
        let Some(config) = self.config.clone() else {
            let child = self.new_child(parent);
            drop(self.link.lock().establish(None, child.clone()));
            self.open_child(&child);
            return Ok(());
        };
        match TlsEngine::client(config, &self.host) {
            Ok(engine) => {
                self.link.lock().phase = Phase::Handshaking {
                    engine,
                    group: None,
                };
                self.link.arm_timer(
                    self.context.timer(),
                    self.context.config().tls.handshake_timeout(),
                    parent,
                );
                Ok(())
            }
            Err(error) => {
                self.complete(Err(error.clone()));
                Err(error)
            }
        }
    }

    fn session_opened(&self, parent: &BridgeSession) {
        let flushed = match &mut self.link.lock().phase {
            Phase::Handshaking { engine, .. } => engine.flush(parent),
            _ => Ok(()),
        };
        if let Err(error) = flushed {
            self.fail(parent, error);
        }
    }

    fn message_received(&self, parent: &BridgeSession, message: Bytes) {
        match self.receive(parent, message) {
            Ok(Some(delivery)) => delivery.deliver(),
            Ok(None) => {}
            Err(error) => self.fail(parent, error),
        }
    }

    fn session_idle(&self, _parent: &BridgeSession, status: IdleStatus) {
        if let Some(child) = self.link.child() {
            child.fire_session_idle(status);
        }
    }

    fn exception_caught(&self, parent: &BridgeSession, error: &BridgeError) {
        match self.link.child() {
            Some(child) => child.fire_exception_caught(error.clone()),
            None => {
                debug!(target: TARGET_CONNECTOR, session = %parent.id(), code = error.code(), "transport failed during tls handshake");
                self.complete(Err(error.clone()));
            }
        }
    }

    fn session_closed(&self, parent: &BridgeSession) {
        self.link.close();
        self.complete(Err(BridgeError::ConnectionFailed {
            detail: format!(
                "{} session {} closed before {} was established",
                parent.scheme(),
                parent.id(),
                self.context.scheme()
            ),
        }));
    }
}
