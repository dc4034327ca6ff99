//! 集成测试共用的内存网关装配。
//!
//! 每个测试文件各自 `mod common;`，并非每个文件都用到全部辅助函数。
#![allow(dead_code)]

use std::sync::Arc;

use futures::FutureExt;
use spark_bridge::address::keys;
use spark_bridge::test_stubs::{ManualTimer, MockPhysicalBinder, MockPhysicalConnector};
use spark_bridge::{Bridge, BridgeConfig, ResourceAddress, ResourceOptions, Scheme, SnifferTable};

pub struct Gateway {
    pub bridge: Bridge,
    pub binder: Arc<MockPhysicalBinder>,
    pub connector: Arc<MockPhysicalConnector>,
    pub timer: ManualTimer,
}

impl Gateway {
    pub fn new() -> Self {
        Self::with(BridgeConfig::default(), SnifferTable::new())
    }

    pub fn with_sniffers(sniffers: SnifferTable) -> Self {
        Self::with(BridgeConfig::default(), sniffers)
    }

    pub fn with(config: BridgeConfig, sniffers: SnifferTable) -> Self {
        let binder = Arc::new(MockPhysicalBinder::new());
        let connector = Arc::new(MockPhysicalConnector::new());
        let timer = ManualTimer::new();
        let bridge = Bridge::builder(config, Arc::new(timer.clone()))
            .sniffers(sniffers)
            .physical(Scheme::Tcp, binder.clone())
            .physical_connector(Scheme::Tcp, connector.clone())
            .build()
            .expect("内存网关应能构造");
        Self {
            bridge,
            binder,
            connector,
            timer,
        }
    }

    pub fn address(&self, uri: &str) -> ResourceAddress {
        self.bridge
            .new_address(uri, ResourceOptions::new())
            .expect("测试地址必须合法")
    }

    /// 带 `nextProtocol` 选项的地址。
    pub fn address_for(&self, uri: &str, next_protocol: &str) -> ResourceAddress {
        let options = ResourceOptions::new().with(keys::NEXT_PROTOCOL, Some(Arc::from(next_protocol)));
        self.bridge
            .new_address(uri, options)
            .expect("测试地址必须合法")
    }

    /// 解绑并断言 future 同步就绪且成功。
    pub fn unbind(&self, address: &ResourceAddress) {
        self.bridge
            .unbind(address)
            .now_or_never()
            .expect("内存解绑应同步完成")
            .expect("解绑不应失败");
    }
}
