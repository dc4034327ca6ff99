//! 运行时接缝：定时器与异步结果类型。
//!
//! 核心 crate 不绑定任何执行器；tokio 实现位于 `spark-bridge-tcp`，测试使用
//! [`crate::test_stubs::ManualTimer`] 手动推进时间。

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::session::BridgeSession;

/// 解绑完成的 future；物理释放在返回前已经发起。
pub type UnbindFuture = BoxFuture<'static, Result<()>>;

/// 发起连接的 future，成功时给出最上层逻辑会话。
pub type ConnectFuture = BoxFuture<'static, Result<BridgeSession>>;

/// 一次性定时任务。
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// 延迟执行能力。
///
/// # 教案式说明
/// - **意图 (Why)**：嗅探与握手都必须有时间上限，超时后在会话所属 worker 上关闭连接；
/// - **契约 (What)**：`schedule` 不得同步执行 `task`；返回的句柄取消后任务不再运行，
///   取消一个已经运行的任务无效果。
pub trait TimerService: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// 定时任务句柄；丢弃句柄不会取消任务。
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// 无法取消的句柄。
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}
