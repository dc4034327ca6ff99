//! 接入器：物理层与协议层两种实现。
//!
//! - [`PhysicalAcceptor`]：绑定键上的第一条绑定触发真实监听，最后一条解绑触发释放；
//! - [`LayerAcceptor`]：在自己的注册表登记后，以本层桥接处理器在下层接入器上绑定下层地址，
//!   下层失败时撤销本层登记，保证两层注册表要么都有这条绑定、要么都没有。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::physical::{ConnectionSink, PhysicalBinder};
use crate::address::{ResourceAddress, ResourceAddressFactory, Scheme};
use crate::dispatch::NextProtocolDispatcher;
use crate::error::{BridgeError, Result};
use crate::observability::TARGET_BINDING;
use crate::registry::{AddOutcome, Binding, BindingRegistry, RemoveOutcome};
use crate::runtime::UnbindFuture;
use crate::session::{BridgeHandler, BridgeSession, SessionInitializer, SessionProcessor};

/// 某个 scheme 的接入器。
pub trait BridgeAcceptor: Send + Sync + 'static {
    fn scheme(&self) -> Scheme;

    fn registry(&self) -> &Arc<BindingRegistry>;

    fn bind(
        &self,
        acceptors: &AcceptorTable,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> Result<()>;

    /// 解绑；地址未绑定时返回立即就绪的 `Ok(())`。
    fn unbind(&self, acceptors: &AcceptorTable, address: &ResourceAddress) -> UnbindFuture;
}

/// scheme → 接入器。
#[derive(Clone, Default)]
pub struct AcceptorTable {
    acceptors: HashMap<Scheme, Arc<dyn BridgeAcceptor>>,
}

impl AcceptorTable {
    pub(crate) fn insert(&mut self, acceptor: Arc<dyn BridgeAcceptor>) {
        self.acceptors.insert(acceptor.scheme(), acceptor);
    }

    pub fn get(&self, scheme: Scheme) -> Option<&Arc<dyn BridgeAcceptor>> {
        self.acceptors.get(&scheme)
    }

    pub(crate) fn require(&self, address: &ResourceAddress) -> Result<&Arc<dyn BridgeAcceptor>> {
        self.get(address.scheme())
            .ok_or_else(|| BridgeError::UnsupportedScheme {
                scheme: address.scheme().to_string(),
                uri: address.external_uri().to_string(),
            })
    }
}

impl fmt::Debug for AcceptorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.acceptors.keys().collect();
        schemes.sort();
        f.debug_struct("AcceptorTable").field("schemes", &schemes).finish()
    }
}

fn conflict(address: &ResourceAddress, existing: &Binding) -> BridgeError {
    BridgeError::BindingConflict {
        address: address.to_string(),
        existing: existing.address().to_string(),
    }
}

fn ready(result: Result<()>) -> UnbindFuture {
    futures::future::ready(result).boxed()
}

/// 物理层接入器。
///
/// 登记与物理监听必须同时成立：`bind_gate` 把“登记 + 打开监听”与“注销 + 关闭监听”
/// 串行化，并发的同处理器绑定只会在监听确实打开之后才共享它，监听失败时后来者自行重试。
pub struct PhysicalAcceptor {
    scheme: Scheme,
    binder: Arc<dyn PhysicalBinder>,
    dispatcher: NextProtocolDispatcher,
    bind_gate: Mutex<()>,
}

impl PhysicalAcceptor {
    pub fn new(scheme: Scheme, binder: Arc<dyn PhysicalBinder>, dispatcher: NextProtocolDispatcher) -> Self {
        Self {
            scheme,
            binder,
            dispatcher,
            bind_gate: Mutex::new(()),
        }
    }
}

impl BridgeAcceptor for PhysicalAcceptor {
    fn scheme(&self) -> Scheme {
        self.scheme
    }

    fn registry(&self) -> &Arc<BindingRegistry> {
        self.dispatcher.registry()
    }

    fn bind(
        &self,
        _acceptors: &AcceptorTable,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> Result<()> {
        let binding = Binding::new(address.clone(), Arc::clone(&handler), initializer);
        let _gate = self.bind_gate.lock();
        match self.registry().try_add(binding) {
            Err(existing) => Err(conflict(address, &existing)),
            Ok(AddOutcome::Created {
                first_on_bind_key: true,
            }) => {
                let sink = Arc::new(DispatchingSink {
                    bound: address.clone(),
                    dispatcher: self.dispatcher.clone(),
                    factory: ResourceAddressFactory::new(),
                });
                if let Err(error) = self.binder.bind(address, sink) {
                    self.registry().try_remove(address, Some(&handler));
                    warn!(target: TARGET_BINDING, %address, %error, "physical bind failed");
                    return Err(error);
                }
                debug!(target: TARGET_BINDING, %address, "physical endpoint bound");
                Ok(())
            }
            Ok(_) => Ok(()),
        }
    }

    fn unbind(&self, _acceptors: &AcceptorTable, address: &ResourceAddress) -> UnbindFuture {
        let _gate = self.bind_gate.lock();
        match self.registry().try_remove(address, None) {
            RemoveOutcome::Removed {
                bind_key_released: true,
            } => {
                debug!(target: TARGET_BINDING, %address, "releasing physical endpoint");
                self.binder.unbind(address)
            }
            _ => ready(Ok(())),
        }
    }
}

/// 物理接入回调：构造会话并交给分发器。
struct DispatchingSink {
    bound: ResourceAddress,
    dispatcher: NextProtocolDispatcher,
    factory: ResourceAddressFactory,
}

impl ConnectionSink for DispatchingSink {
    fn accept(&self, processor: Arc<dyn SessionProcessor>, peer: &str) -> BridgeSession {
        let scheme = self.bound.scheme();
        let remote = self.factory.peer_address(scheme, peer, None).ok();
        let session = BridgeSession::builder(scheme, processor)
            .service(format!("{scheme}-acceptor"))
            .local_address(self.bound.clone())
            .remote_address(remote)
            .build();
        self.dispatcher.attach(&session);
        session.fire_session_created();
        session.fire_session_opened();
        session
    }
}

/// 协议层接入器。
pub struct LayerAcceptor {
    scheme: Scheme,
    registry: Arc<BindingRegistry>,
    bridge_handler: Arc<dyn BridgeHandler>,
}

impl LayerAcceptor {
    pub fn new(scheme: Scheme, registry: Arc<BindingRegistry>, bridge_handler: Arc<dyn BridgeHandler>) -> Self {
        Self {
            scheme,
            registry,
            bridge_handler,
        }
    }
}

impl BridgeAcceptor for LayerAcceptor {
    fn scheme(&self) -> Scheme {
        self.scheme
    }

    fn registry(&self) -> &Arc<BindingRegistry> {
        &self.registry
    }

    fn bind(
        &self,
        acceptors: &AcceptorTable,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> Result<()> {
        let transport = address.transport().ok_or_else(|| BridgeError::BindFailed {
            address: address.to_string(),
            detail: "layer address has no transport".into(),
        })?;
        let binding = Binding::new(address.clone(), Arc::clone(&handler), initializer);
        if let Err(existing) = self.registry.try_add(binding) {
            return Err(conflict(address, &existing));
        }
        let lower = acceptors
            .require(transport)
            .and_then(|lower| lower.bind(acceptors, transport, Arc::clone(&self.bridge_handler), None));
        if let Err(error) = lower {
            self.registry.try_remove(address, Some(&handler));
            debug!(target: TARGET_BINDING, %address, %error, "transport bind failed, layer binding rolled back");
            return Err(error);
        }
        Ok(())
    }

    fn unbind(&self, acceptors: &AcceptorTable, address: &ResourceAddress) -> UnbindFuture {
        if self.registry.try_remove(address, None) == RemoveOutcome::NotBound {
            return ready(Ok(()));
        }
        match address.transport() {
            Some(transport) => match acceptors.get(transport.scheme()) {
                Some(lower) => lower.unbind(acceptors, transport),
                None => ready(Ok(())),
            },
            None => ready(Ok(())),
        }
    }
}
