//! [`TimerService`] 的 Tokio 实现。

use std::time::Duration;

use spark_bridge::runtime::{TimerHandle, TimerService, TimerTask};
use spark_bridge::{BridgeError, Result};
use tokio::runtime::Handle;

/// 在指定运行时上以 `sleep` 实现的一次性定时器。
///
/// 任务总是在运行时的任务里执行，从不在 `schedule` 的调用栈上同步执行；
/// 取消即 `abort` 对应任务。
#[derive(Clone, Debug)]
pub struct TokioTimer {
    handle: Handle,
}

impl TokioTimer {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// 使用当前所在的 Tokio 运行时。
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|error| BridgeError::Config {
                detail: format!("tokio timer requires a runtime: {error}"),
            })
    }
}

impl TimerService for TokioTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimerHandle::new(move || join.abort())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduled_task_runs_once_after_delay() {
        let timer = TokioTimer::current().expect("处于运行时内");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _handle = timer.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 0, "不得同步执行");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_task_never_runs() {
        let timer = TokioTimer::current().expect("处于运行时内");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let handle = timer.schedule(
            Duration::from_millis(20),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn outside_a_runtime_is_a_configuration_error() {
        let error = TokioTimer::current().expect_err("没有运行时");
        assert!(error.is_configuration());
    }
}
