#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-bridge-tls: 传输桥的 TLS 协议层。"]
#![doc = ""]
#![doc = "== 教案级说明 =="]
#![doc = "- **职责 (Why)**：在任意下层会话之上终结或发起 TLS，并在解密后的字节流上继续做下一协议分发；"]
#![doc = "  地址关闭加密时本层仍然建立一层会话，分发语义与加密时完全一致；"]
#![doc = "- **结构 (How)**：`rustls` 以 sans-IO 方式驱动，密文经父会话收发；证书与信任锚存放在可热更新的"]
#![doc = "  [`KeyStore`] 中，虚拟主机证书由 [`KeySelector`](spark_bridge::address::KeySelector) 在握手前选定；"]
#![doc = "  ClientHello 先按地址的套件/版本白名单预检，再交给握手引擎；"]
#![doc = "- **使用 (What)**：`TlsBridge::new(store).install(builder)` 为构造器注册 `ssl` 的接入与发起能力。"]

mod client_hello;
mod connector;
mod engine;
mod error;
mod key_store;
mod layer;
mod policy;
mod profile;
mod selector;
mod state;

use std::sync::Arc;

use spark_bridge::address::KeySelector;
use spark_bridge::{BridgeBuilder, Scheme};

pub use client_hello::{ClientHello, Scan, TLS12, TLS13, scan as scan_client_hello};
pub use connector::TlsConnector;
pub use engine::TlsSessionInfo;
pub use key_store::{KeyMaterial, KeyStore};
pub use layer::TlsLayer;
pub use policy::TlsPolicy;
pub use selector::VirtualHostKeySelector;

/// 接入侧握手与证书选择。
pub const TARGET_LAYER: &str = "spark_bridge_tls::layer";
/// 发起侧握手。
pub const TARGET_CONNECTOR: &str = "spark_bridge_tls::connector";

/// 共享同一密钥库的 TLS 接入与发起组件。
#[derive(Clone)]
pub struct TlsBridge {
    store: Arc<KeyStore>,
    selector: Arc<dyn KeySelector>,
}

impl TlsBridge {
    /// 以 [`VirtualHostKeySelector`] 作为默认选择器。
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self {
            store,
            selector: Arc::new(VirtualHostKeySelector::new()),
        }
    }

    /// 替换默认选择器；地址上的 `ssl.keySelector` 选项仍然优先。
    pub fn with_selector(mut self, selector: Arc<dyn KeySelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// 为构造器注册 `ssl` 的接入层与发起层。
    pub fn install(&self, builder: BridgeBuilder) -> BridgeBuilder {
        let (layer_store, layer_selector) = (Arc::clone(&self.store), Arc::clone(&self.selector));
        let (store, selector) = (Arc::clone(&self.store), Arc::clone(&self.selector));
        builder
            .layer(Scheme::Ssl, move |context| {
                Arc::new(TlsLayer::new(context, layer_store, layer_selector))
            })
            .layer_connector(Scheme::Ssl, move |context| {
                Arc::new(TlsConnector::new(context, store, selector))
            })
    }
}
