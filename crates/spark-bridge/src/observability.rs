//! 日志目标常量与可选的订阅器安装入口。
//!
//! 本 crate 只通过 `tracing` 宏产生事件，是否输出、输出到哪里由宿主进程决定。
//! 启用 `subscriber` feature 后可调用 [`install_subscriber`] 快速获得 `EnvFilter + fmt` 的组合。

/// 绑定、解绑与回滚。
pub const TARGET_BINDING: &str = "spark_bridge::binding";
/// 下一协议嗅探与分发。
pub const TARGET_DISPATCH: &str = "spark_bridge::dispatch";
/// 会话生命周期。
pub const TARGET_SESSION: &str = "spark_bridge::session";
/// 发起侧连接。
pub const TARGET_CONNECT: &str = "spark_bridge::connect";

#[cfg(feature = "subscriber")]
mod install {
    use std::sync::OnceLock;

    use tracing::dispatcher;
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

    use crate::error::{BridgeError, Result};

    static INSTALLED: OnceLock<()> = OnceLock::new();

    /// 安装全局订阅器：`RUST_LOG` 优先，缺省 `info`。
    ///
    /// - 重复调用直接返回 `Ok(())`；
    /// - 外部已经设置过全局订阅器时返回 [`BridgeError::Config`]，不覆盖宿主的选择。
    pub fn install_subscriber() -> Result<()> {
        if INSTALLED.get().is_some() {
            return Ok(());
        }
        if dispatcher::has_been_set() {
            return Err(BridgeError::Config {
                detail: "a global tracing subscriber is already installed".into(),
            });
        }
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer());
        tracing::subscriber::set_global_default(subscriber).map_err(|error| BridgeError::Config {
            detail: error.to_string(),
        })?;
        let _ = INSTALLED.set(());
        Ok(())
    }
}

#[cfg(feature = "subscriber")]
pub use install::install_subscriber;
