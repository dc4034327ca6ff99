//! # bridge 模块说明：传输桥门面
//!
//! ## 角色定位（Why）
//! - [`Bridge`] 把地址工厂、各 scheme 的接入器与连接器组装在一起，对外只暴露
//!   `bind` / `unbind` / `connect` / `broadcast` / `shutdown`；
//! - 物理传输与协议层都以插件形式注册：物理层提供 [`PhysicalBinder`] / [`PhysicalConnector`]，
//!   协议层提供一个以 [`LayerContext`] 构造的桥接处理器。
//!
//! ## 契约（What）
//! - `bind`：沿替代地址链逐个绑定，任一失败则逆序撤销已完成的部分并返回原始错误；
//! - `unbind`：沿替代地址链逐个解绑，幂等；返回的 future 在全部物理释放完成后就绪；
//! - `connect`：按替代地址链顺序尝试，首个成功者胜出，全部失败时返回最后一个错误；
//! - `shutdown`：解绑经由本门面完成的全部绑定。
//!
//! ## 风险提示（Trade-offs）
//! - 回滚路径丢弃解绑 future：物理释放在 `unbind` 调用时已经发起，丢弃只意味着不等待完成。

mod acceptor;
mod connector;
mod layer;
mod passthrough;
mod physical;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::address::{ResourceAddress, ResourceAddressFactory, ResourceOptions, Scheme};
use crate::buffer::PendingWrite;
use crate::config::BridgeConfig;
use crate::dispatch::{NextProtocolDispatcher, SnifferTable};
use crate::error::{BridgeError, Result};
use crate::observability::{TARGET_BINDING, TARGET_CONNECT};
use crate::registry::BindingRegistry;
use crate::runtime::{ConnectFuture, TimerService, UnbindFuture};
use crate::session::{BridgeHandler, BridgeSession, SessionInitializer};

pub use acceptor::{AcceptorTable, BridgeAcceptor, LayerAcceptor, PhysicalAcceptor};
pub use connector::{BridgeConnector, ConnectorTable, PhysicalConnectorAdapter};
pub use layer::{ConnectorContext, LayerContext};
pub use passthrough::{ChildSession, PassthroughConnector, PassthroughLayer};
pub use physical::{ConnectionSink, PhysicalBinder, PhysicalConnector};

type LayerFactory = Box<dyn FnOnce(LayerContext) -> Arc<dyn BridgeHandler> + Send>;
type ConnectorFactory = Box<dyn FnOnce(ConnectorContext) -> Arc<dyn BridgeConnector> + Send>;

const PASSTHROUGH_SCHEMES: [Scheme; 4] = [Scheme::Http, Scheme::Ws, Scheme::Wse, Scheme::Wsx];

/// [`Bridge`] 构造器。
///
/// 缺省注册 `http`、`ws`、`wse`、`wsx` 的透传层；物理传输与 TLS 层由调用方注册。
pub struct BridgeBuilder {
    config: BridgeConfig,
    timer: Arc<dyn TimerService>,
    sniffers: SnifferTable,
    binders: Vec<(Scheme, Arc<dyn PhysicalBinder>)>,
    physical_connectors: Vec<(Scheme, Arc<dyn PhysicalConnector>)>,
    layers: HashMap<Scheme, LayerFactory>,
    layer_connectors: HashMap<Scheme, ConnectorFactory>,
}

impl BridgeBuilder {
    pub fn new(config: BridgeConfig, timer: Arc<dyn TimerService>) -> Self {
        let mut builder = Self {
            config,
            timer,
            sniffers: SnifferTable::new(),
            binders: Vec::new(),
            physical_connectors: Vec::new(),
            layers: HashMap::new(),
            layer_connectors: HashMap::new(),
        };
        for scheme in PASSTHROUGH_SCHEMES {
            builder = builder
                .layer(scheme, |context| Arc::new(PassthroughLayer::new(context)))
                .layer_connector(scheme, |context| Arc::new(PassthroughConnector::new(context)));
        }
        builder
    }

    pub fn sniffers(mut self, sniffers: SnifferTable) -> Self {
        self.sniffers = sniffers;
        self
    }

    /// 注册物理监听实现。
    pub fn physical(mut self, scheme: Scheme, binder: Arc<dyn PhysicalBinder>) -> Self {
        self.binders.push((scheme, binder));
        self
    }

    /// 注册物理连接实现。
    pub fn physical_connector(mut self, scheme: Scheme, connector: Arc<dyn PhysicalConnector>) -> Self {
        self.physical_connectors.push((scheme, connector));
        self
    }

    /// 注册（或替换）接入侧协议层。
    pub fn layer<F>(mut self, scheme: Scheme, factory: F) -> Self
    where
        F: FnOnce(LayerContext) -> Arc<dyn BridgeHandler> + Send + 'static,
    {
        self.layers.insert(scheme, Box::new(factory));
        self
    }

    /// 注册（或替换）发起侧协议层。
    pub fn layer_connector<F>(mut self, scheme: Scheme, factory: F) -> Self
    where
        F: FnOnce(ConnectorContext) -> Arc<dyn BridgeConnector> + Send + 'static,
    {
        self.layer_connectors.insert(scheme, Box::new(factory));
        self
    }

    pub fn build(self) -> Result<Bridge> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let sniffers = Arc::new(self.sniffers);
        let dispatcher = |registry: Arc<BindingRegistry>| {
            NextProtocolDispatcher::new(
                registry,
                Arc::clone(&sniffers),
                Arc::clone(&self.timer),
                &config.dispatch,
            )
        };

        let mut acceptors = AcceptorTable::default();
        for (scheme, binder) in self.binders {
            if !scheme.is_physical() {
                return Err(BridgeError::Config {
                    detail: format!("`{scheme}` is not a physical scheme"),
                });
            }
            let registry = Arc::new(BindingRegistry::new());
            acceptors.insert(Arc::new(PhysicalAcceptor::new(scheme, binder, dispatcher(registry))));
        }
        for (scheme, factory) in self.layers {
            let registry = Arc::new(BindingRegistry::new());
            let context = LayerContext::new(
                scheme,
                dispatcher(Arc::clone(&registry)),
                Arc::clone(&config),
                Arc::clone(&self.timer),
            );
            acceptors.insert(Arc::new(LayerAcceptor::new(scheme, registry, factory(context))));
        }

        let mut connectors = ConnectorTable::default();
        for (scheme, connector) in self.physical_connectors {
            connectors.insert(Arc::new(PhysicalConnectorAdapter::new(scheme, connector)));
        }
        for (scheme, factory) in self.layer_connectors {
            let context = ConnectorContext::new(scheme, Arc::clone(&config), Arc::clone(&self.timer));
            connectors.insert(factory(context));
        }

        Ok(Bridge {
            inner: Arc::new(BridgeInner {
                config,
                factory: ResourceAddressFactory::new(),
                acceptors,
                connectors,
                bound: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct BridgeInner {
    config: Arc<BridgeConfig>,
    factory: ResourceAddressFactory,
    acceptors: AcceptorTable,
    connectors: ConnectorTable,
    /// 经由本门面成功完成的绑定，每次 `bind` 一条。
    bound: Mutex<Vec<ResourceAddress>>,
}

/// 传输桥门面。克隆共享同一组接入器与连接器。
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn builder(config: BridgeConfig, timer: Arc<dyn TimerService>) -> BridgeBuilder {
        BridgeBuilder::new(config, timer)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn address_factory(&self) -> ResourceAddressFactory {
        self.inner.factory
    }

    /// 以本门面的工厂构造地址。
    pub fn new_address(&self, uri: &str, options: ResourceOptions) -> Result<ResourceAddress> {
        self.inner.factory.new_resource_address(uri, options)
    }

    /// 某个 scheme 接入器的注册表。
    pub fn registry(&self, scheme: Scheme) -> Option<Arc<BindingRegistry>> {
        self.inner
            .acceptors
            .get(scheme)
            .map(|acceptor| Arc::clone(acceptor.registry()))
    }

    /// 绑定地址及其全部替代地址。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 每个替代地址交给其 scheme 的接入器，协议层接入器递归绑定下层；
    ///   - 任一替代地址失败：已绑定的替代地址逆序解绑，返回该替代地址的原始错误；
    ///   - 同一处理器重复绑定同一地址只增加引用计数，需要同样次数的 `unbind`。
    pub fn bind(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> Result<()> {
        let acceptors = &self.inner.acceptors;
        let mut completed: Vec<&ResourceAddress> = Vec::new();
        for alternate in address.alternates() {
            let result = acceptors.require(alternate).and_then(|acceptor| {
                acceptor.bind(acceptors, alternate, Arc::clone(&handler), initializer.clone())
            });
            if let Err(error) = result {
                warn!(
                    target: TARGET_BINDING,
                    %alternate,
                    code = error.code(),
                    %error,
                    rolled_back = completed.len(),
                    "bind failed, rolling back alternates"
                );
                for done in completed.into_iter().rev() {
                    if let Some(acceptor) = acceptors.get(done.scheme()) {
                        drop(acceptor.unbind(acceptors, done));
                    }
                }
                return Err(error);
            }
            completed.push(alternate);
        }
        info!(target: TARGET_BINDING, %address, alternates = completed.len(), "bound");
        self.inner.bound.lock().push(address.clone());
        Ok(())
    }

    /// 解绑地址及其全部替代地址；未绑定的地址直接成功。
    pub fn unbind(&self, address: &ResourceAddress) -> UnbindFuture {
        {
            let mut bound = self.inner.bound.lock();
            if let Some(index) = bound.iter().position(|entry| entry == address) {
                bound.remove(index);
            }
        }
        let acceptors = &self.inner.acceptors;
        let pending: Vec<UnbindFuture> = address
            .alternates()
            .filter_map(|alternate| {
                acceptors
                    .get(alternate.scheme())
                    .map(|acceptor| acceptor.unbind(acceptors, alternate))
            })
            .collect();
        debug!(target: TARGET_BINDING, %address, "unbind initiated");
        join_unbinds(pending)
    }

    /// 连接地址；首选地址失败时按替代地址链依次回退。
    pub fn connect(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> ConnectFuture {
        let inner = Arc::clone(&self.inner);
        let attempts: Vec<ResourceAddress> = address.alternates().cloned().collect();
        async move {
            let mut last_error = None;
            for candidate in attempts {
                let attempt = match inner.connectors.require(&candidate) {
                    Ok(connector) => {
                        connector.connect(&inner.connectors, &candidate, Arc::clone(&handler), initializer.clone())
                    }
                    Err(error) => {
                        last_error = Some(error);
                        continue;
                    }
                };
                match attempt.await {
                    Ok(session) => return Ok(session),
                    Err(error) => {
                        debug!(target: TARGET_CONNECT, %candidate, %error, "connect attempt failed");
                        last_error = Some(error);
                    }
                }
            }
            Err(last_error.unwrap_or_else(|| BridgeError::ConnectionFailed {
                detail: "address has no connectable alternates".into(),
            }))
        }
        .boxed()
    }

    /// 把同一负载写给多个会话，负载以共享写缓冲方式交给各自的 worker。
    ///
    /// 返回成功排队的会话数；已关闭的会话被跳过。
    pub fn broadcast(&self, sessions: &[BridgeSession], payload: Bytes) -> usize {
        sessions
            .iter()
            .filter(|session| {
                session
                    .write(PendingWrite::Shared {
                        layer: session.scheme().layer_id(),
                        payload: payload.clone(),
                    })
                    .is_ok()
            })
            .count()
    }

    /// 解绑经由本门面完成的全部绑定。
    pub fn shutdown(&self) -> UnbindFuture {
        let bound = std::mem::take(&mut *self.inner.bound.lock());
        info!(target: TARGET_BINDING, bindings = bound.len(), "shutting down bridge");
        let acceptors = &self.inner.acceptors;
        let pending: Vec<UnbindFuture> = bound
            .iter()
            .flat_map(|address| address.alternates())
            .filter_map(|alternate| {
                acceptors
                    .get(alternate.scheme())
                    .map(|acceptor| acceptor.unbind(acceptors, alternate))
            })
            .collect();
        join_unbinds(pending)
    }
}

fn join_unbinds(pending: Vec<UnbindFuture>) -> UnbindFuture {
    futures::future::join_all(pending)
        .map(|results| results.into_iter().collect::<Result<Vec<()>>>().map(|_| ()))
        .boxed()
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("acceptors", &self.inner.acceptors)
            .field("connectors", &self.inner.connectors)
            .field("bound", &self.inner.bound.lock().len())
            .finish()
    }
}
