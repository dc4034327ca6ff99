//! 协议层实现者可用的上下文。
//!
//! 协议层（透传层、TLS 层）本身只是父会话上的 [`BridgeHandler`](crate::session::BridgeHandler)；
//! 它们通过 [`LayerContext`] 查找本层的绑定、构造子会话并挂上本层的分发器。

use std::sync::Arc;

use crate::address::{ResourceAddress, ResourceAddressFactory, Scheme};
use crate::config::BridgeConfig;
use crate::dispatch::NextProtocolDispatcher;
use crate::registry::{BindingRegistry, NextProtocolBinding};
use crate::runtime::TimerService;
use crate::session::{BridgeSession, SessionProcessor};

/// 接入侧协议层上下文。
#[derive(Clone)]
pub struct LayerContext {
    scheme: Scheme,
    dispatcher: NextProtocolDispatcher,
    factory: ResourceAddressFactory,
    config: Arc<BridgeConfig>,
    timer: Arc<dyn TimerService>,
}

impl LayerContext {
    pub(crate) fn new(
        scheme: Scheme,
        dispatcher: NextProtocolDispatcher,
        config: Arc<BridgeConfig>,
        timer: Arc<dyn TimerService>,
    ) -> Self {
        Self {
            scheme,
            dispatcher,
            factory: ResourceAddressFactory::new(),
            config,
            timer,
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn registry(&self) -> &Arc<BindingRegistry> {
        self.dispatcher.registry()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn timer(&self) -> &Arc<dyn TimerService> {
        &self.timer
    }

    pub fn factory(&self) -> ResourceAddressFactory {
        self.factory
    }

    /// 以父会话本地地址为下层的全部本层绑定分组，按绑定键排序。
    ///
    /// 多于一个分组意味着多个虚拟主机共享同一物理端点。
    pub fn candidates(&self, parent: &BridgeSession) -> Vec<NextProtocolBinding> {
        match parent.local_address() {
            Some(local) => self.registry().bindings_on_transport(local.bind_key()),
            None => Vec::new(),
        }
    }

    /// 在父会话之上为 `group` 构造本层子会话并挂上分发器。
    ///
    /// 调用方负责随后触发子会话的 `created` 与 `opened`。
    pub fn new_child(
        &self,
        parent: &BridgeSession,
        group: &NextProtocolBinding,
        processor: Arc<dyn SessionProcessor>,
    ) -> BridgeSession {
        let parent_local = parent.local_address();
        let local = self
            .factory
            .resolve_candidate(group.bind_address(), None, parent_local.as_ref());
        let remote = parent
            .remote_address()
            .and_then(|remote| self.peer_of(&remote));
        let child = BridgeSession::builder(self.scheme, processor)
            .service(format!("{}-acceptor", self.scheme))
            .parent(parent)
            .local_address(local)
            .remote_address(remote)
            .build();
        self.dispatcher.attach(&child);
        child
    }

    /// 以下层对端地址为下层、同一 authority 的本层对端地址。
    pub fn peer_of(&self, lower: &ResourceAddress) -> Option<ResourceAddress> {
        self.factory
            .peer_address(
                self.scheme,
                &lower.resource_uri().authority(),
                Some(lower.clone()),
            )
            .ok()
    }
}

/// 发起侧协议层上下文。
#[derive(Clone)]
pub struct ConnectorContext {
    scheme: Scheme,
    factory: ResourceAddressFactory,
    config: Arc<BridgeConfig>,
    timer: Arc<dyn TimerService>,
}

impl ConnectorContext {
    pub(crate) fn new(scheme: Scheme, config: Arc<BridgeConfig>, timer: Arc<dyn TimerService>) -> Self {
        Self {
            scheme,
            factory: ResourceAddressFactory::new(),
            config,
            timer,
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn timer(&self) -> &Arc<dyn TimerService> {
        &self.timer
    }

    /// 发起侧子会话的本地地址：父会话本地 authority + 本层 scheme。
    pub fn local_of(&self, parent: &BridgeSession) -> Option<ResourceAddress> {
        let lower = parent.local_address()?;
        self.factory
            .peer_address(self.scheme, &lower.resource_uri().authority(), Some(lower))
            .ok()
    }
}
