#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-bridge-tcp: 传输桥的 Tokio TCP 物理层。"]
#![doc = ""]
#![doc = "== 教案级说明 =="]
#![doc = "- **职责 (Why)**：为 `spark-bridge` 的物理层接缝提供真实实现：I/O worker 池、监听、主动连接与定时器；"]
#![doc = "- **结构 (How)**：每个 worker 是一个专属线程上的 current-thread 运行时，连接在其上读、写并交付事件；"]
#![doc = "  写路径由 worker 的写循环独占执行，共享写缓冲的主缓冲 arena 因此无需任何同步；"]
#![doc = "- **使用 (What)**：`TcpTransport::start(&config)?.bridge_builder(config)` 得到已注册 `tcp` 的构造器。"]

mod connection;
mod connector;
mod error;
mod listener;
mod socket;
mod timer;
mod worker;

use std::sync::Arc;

use spark_bridge::{BridgeBuilder, BridgeConfig, Result, Scheme};

pub use connection::TcpProcessor;
pub use connector::TcpConnector;
pub use listener::TcpBinder;
pub use socket::TcpSocketConfig;
pub use timer::TokioTimer;
pub use worker::IoWorkerPool;

/// worker 写循环与读循环。
pub const TARGET_WORKER: &str = "spark_bridge_tcp::worker";
/// 监听与接入。
pub const TARGET_LISTENER: &str = "spark_bridge_tcp::listener";
/// 主动连接。
pub const TARGET_CONNECTOR: &str = "spark_bridge_tcp::connector";

/// 一组共享同一 worker 池的 TCP 物理层组件。
#[derive(Clone)]
pub struct TcpTransport {
    pool: IoWorkerPool,
    binder: Arc<TcpBinder>,
    connector: Arc<TcpConnector>,
    timer: TokioTimer,
}

impl TcpTransport {
    /// 按 `config.io` 启动 worker 池。
    pub fn start(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let pool = IoWorkerPool::new(&config.io)?;
        Ok(Self {
            binder: Arc::new(TcpBinder::new(pool.clone())),
            connector: Arc::new(TcpConnector::new(pool.clone())),
            timer: TokioTimer::new(pool.handle()),
            pool,
        })
    }

    pub fn pool(&self) -> &IoWorkerPool {
        &self.pool
    }

    pub fn binder(&self) -> &Arc<TcpBinder> {
        &self.binder
    }

    pub fn connector(&self) -> &Arc<TcpConnector> {
        &self.connector
    }

    pub fn timer(&self) -> &TokioTimer {
        &self.timer
    }

    /// 在已有构造器上注册 `tcp` 的监听与连接能力。
    pub fn install(&self, builder: BridgeBuilder) -> BridgeBuilder {
        builder
            .physical(Scheme::Tcp, self.binder.clone())
            .physical_connector(Scheme::Tcp, self.connector.clone())
    }

    /// 以本组件的定时器创建构造器并注册 `tcp`。
    pub fn bridge_builder(&self, config: BridgeConfig) -> BridgeBuilder {
        self.install(BridgeBuilder::new(config, Arc::new(self.timer.clone())))
    }

    /// 通知 worker 池退出。
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
