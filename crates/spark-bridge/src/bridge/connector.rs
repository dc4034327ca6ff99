//! 发起侧连接器。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::physical::PhysicalConnector;
use crate::address::{ResourceAddress, Scheme};
use crate::error::{BridgeError, Result};
use crate::runtime::ConnectFuture;
use crate::session::{BridgeHandler, SessionInitializer};

/// 某个 scheme 的连接器。
///
/// - 物理连接器直接建立传输；协议层连接器先在下层连接器上连接 `address.transport()`，
///   再在下层会话之上建立本层会话；
/// - 下层会话在本层会话建立前终止时，future 以 [`BridgeError::ConnectionFailed`] 失败。
pub trait BridgeConnector: Send + Sync + 'static {
    fn scheme(&self) -> Scheme;

    fn connect(
        &self,
        connectors: &ConnectorTable,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> ConnectFuture;
}

/// scheme → 连接器。
#[derive(Clone, Default)]
pub struct ConnectorTable {
    connectors: HashMap<Scheme, Arc<dyn BridgeConnector>>,
}

impl ConnectorTable {
    pub(crate) fn insert(&mut self, connector: Arc<dyn BridgeConnector>) {
        self.connectors.insert(connector.scheme(), connector);
    }

    pub fn get(&self, scheme: Scheme) -> Option<&Arc<dyn BridgeConnector>> {
        self.connectors.get(&scheme)
    }

    pub(crate) fn require(&self, address: &ResourceAddress) -> Result<&Arc<dyn BridgeConnector>> {
        self.get(address.scheme())
            .ok_or_else(|| BridgeError::UnsupportedScheme {
                scheme: address.scheme().to_string(),
                uri: address.external_uri().to_string(),
            })
    }

    /// 协议层地址的下层地址及其连接器。
    pub fn lower_of(&self, address: &ResourceAddress) -> Result<(Arc<dyn BridgeConnector>, ResourceAddress)> {
        let transport = address
            .transport()
            .ok_or_else(|| BridgeError::ConnectionFailed {
                detail: format!("`{address}` has no transport to connect over"),
            })?;
        let connector = self.require(transport)?;
        Ok((Arc::clone(connector), transport.clone()))
    }
}

impl fmt::Debug for ConnectorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.connectors.keys().collect();
        schemes.sort();
        f.debug_struct("ConnectorTable").field("schemes", &schemes).finish()
    }
}

/// 把 [`PhysicalConnector`] 适配为 [`BridgeConnector`]。
pub struct PhysicalConnectorAdapter {
    scheme: Scheme,
    connector: Arc<dyn PhysicalConnector>,
}

impl PhysicalConnectorAdapter {
    pub fn new(scheme: Scheme, connector: Arc<dyn PhysicalConnector>) -> Self {
        Self { scheme, connector }
    }
}

impl BridgeConnector for PhysicalConnectorAdapter {
    fn scheme(&self) -> Scheme {
        self.scheme
    }

    fn connect(
        &self,
        _connectors: &ConnectorTable,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> ConnectFuture {
        self.connector.connect(address, handler, initializer)
    }
}
