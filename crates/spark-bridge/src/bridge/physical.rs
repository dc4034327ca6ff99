//! 物理传输的接缝：监听、接入回调与主动连接。
//!
//! 核心 crate 只定义契约，tokio 实现位于 `spark-bridge-tcp`，测试使用 `test_stubs` 中的内存实现。

use std::sync::Arc;

use crate::address::ResourceAddress;
use crate::error::Result;
use crate::runtime::{ConnectFuture, UnbindFuture};
use crate::session::{BridgeHandler, BridgeSession, SessionInitializer, SessionProcessor};

/// 物理连接接入回调。
///
/// 每次物理监听建立时由接入器提供一个实例；驱动为每个新连接调用一次 [`ConnectionSink::accept`]。
pub trait ConnectionSink: Send + Sync + 'static {
    /// 创建物理会话并开始下一协议分发。
    ///
    /// - `peer`：对端 authority，例如 `127.0.0.1:50312` 或 `[::1]:50312`；
    /// - 返回时会话已经触发过 `created` 与 `opened`，驱动随后开始读循环。
    fn accept(&self, processor: Arc<dyn SessionProcessor>, peer: &str) -> BridgeSession;
}

/// 物理监听能力。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `bind` 同步完成监听（端口占用等错误立即返回），接入循环可以在后台运行；
///   - `unbind` 在返回 future 之前就必须发起释放，future 仅用于等待完成；
///     因此调用方丢弃 future（例如回滚路径）不会泄漏监听。
pub trait PhysicalBinder: Send + Sync + 'static {
    fn bind(&self, address: &ResourceAddress, sink: Arc<dyn ConnectionSink>) -> Result<()>;

    fn unbind(&self, address: &ResourceAddress) -> UnbindFuture;
}

/// 物理连接发起能力。
///
/// 成功时返回的会话已挂上 `handler`，并按 “初始化器 → created → opened” 完成启动
/// （参见 [`BridgeSession::open`]）。
pub trait PhysicalConnector: Send + Sync + 'static {
    fn connect(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> ConnectFuture;
}
