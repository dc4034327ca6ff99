//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 把嗅探预算、握手超时与 I/O worker 参数集中到一处，二进制入口从 TOML 读取，
//!   测试直接构造默认值后按需覆盖；
//! - 所有字段都带默认值，空文件即为合法配置。
//!
//! ## 契约（What）
//! - [`BridgeConfig::from_toml_str`] 解析后立即执行 [`BridgeConfig::validate`]，
//!   任何为零的预算都会被拒绝：零预算意味着永远等待或立即失败，两者都不是有意义的配置；
//! - 时间字段以毫秒整数表示，访问器返回 [`Duration`]。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// 下一协议分发的预算。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// 嗅探期最多缓冲的字节数。
    pub sniff_budget_bytes: usize,
    /// 嗅探期最长等待时间。
    pub sniff_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            sniff_budget_bytes: 8 * 1024,
            sniff_timeout_ms: 5_000,
        }
    }
}

impl DispatchConfig {
    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }
}

/// TLS 层的时间与字节预算。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    pub handshake_timeout_ms: u64,
    /// 等待完整 ClientHello 时最多缓冲的字节数。
    pub client_hello_budget_bytes: usize,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            client_hello_budget_bytes: 16 * 1024,
        }
    }
}

impl TlsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// I/O worker 参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IoConfig {
    /// worker 线程数；缺省为可用并行度。
    pub workers: Option<usize>,
    pub read_buffer_size: usize,
    /// 单次写系统调用的最大字节数。
    pub max_write_length: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            workers: None,
            read_buffer_size: 16 * 1024,
            max_write_length: 64 * 1024,
        }
    }
}

impl IoConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// 桥接层完整配置。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub dispatch: DispatchConfig,
    pub tls: TlsConfig,
    pub io: IoConfig,
}

impl BridgeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BridgeConfig = toml::from_str(text).map_err(|error| BridgeError::Config {
            detail: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|error| BridgeError::Config {
            detail: format!("{}: {error}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("dispatch.sniff_budget_bytes", self.dispatch.sniff_budget_bytes as u64),
            ("dispatch.sniff_timeout_ms", self.dispatch.sniff_timeout_ms),
            ("tls.handshake_timeout_ms", self.tls.handshake_timeout_ms),
            ("tls.client_hello_budget_bytes", self.tls.client_hello_budget_bytes as u64),
            ("io.read_buffer_size", self.io.read_buffer_size as u64),
            ("io.max_write_length", self.io.max_write_length as u64),
            ("io.workers", self.io.workers.map_or(1, |n| n as u64)),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(BridgeError::Config {
                detail: format!("`{field}` must be greater than zero"),
            }),
            None => Ok(()),
        }
    }
}
