//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为传输桥对外暴露的错误语义提供集中定义：配置冲突、解析竞态、嗅探失败、握手失败、传输失败；
//! - 每个变体都带有稳定错误码与分类，便于日志检索与告警路由。
//!
//! ## 设计要求（What）
//! - 所有变体派生 [`thiserror::Error`]，并保持 `Clone`，同一失败可以扇出给多个挂起的完成通知；
//! - I/O 错误以 `kind + message` 形式保存，避免 `std::io::Error` 不可克隆的限制；
//! - 配置冲突必须携带冲突地址，满足“启动失败时明确指出地址”的运维要求。
//!
//! ## 扩展建议（How）
//! - 传输实现 crate 通过 [`BridgeError::io`] 把底层 I/O 错误映射进来，错误码沿用各自的 `OperationKind` 表。

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// 稳定错误码常量。
///
/// 错误码一经发布不得修改，日志与告警规则均以此为索引。
pub mod codes {
    pub const INVALID_ADDRESS: &str = "bridge.address.invalid";
    pub const UNSUPPORTED_SCHEME: &str = "bridge.address.unsupported_scheme";
    pub const BINDING_CONFLICT: &str = "bridge.binding.conflict";
    pub const BIND_FAILED: &str = "bridge.binding.bind_failed";
    pub const BINDING_MISSING: &str = "bridge.binding.missing";
    pub const SNIFF_FAILED: &str = "bridge.dispatch.sniff_failed";
    pub const TIMEOUT: &str = "bridge.timeout";
    pub const HANDSHAKE: &str = "bridge.tls.handshake_failed";
    pub const CONNECTION_FAILED: &str = "bridge.session.connection_failed";
    pub const CONNECTION_RESET: &str = "bridge.session.connection_reset";
    pub const SESSION_CLOSED: &str = "bridge.session.closed";
    pub const IO: &str = "bridge.io";
    pub const CONFIG: &str = "bridge.config.invalid";
}

/// 错误分类，对应运维视角的处置策略。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    /// 绑定期配置问题，调用方必须中止该服务的启动。
    Configuration,
    /// 解绑与接入并发造成的查找失败，只关闭当前连接。
    ResolutionRace,
    /// 协议嗅探或协商失败/超时。
    Negotiation,
    /// TLS 握手、证书或套件选择失败。
    Security,
    /// 底层传输失败。
    Transport,
    /// 会话已经关闭，后续操作被拒绝。
    Closed,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::ResolutionRace => "resolution-race",
            ErrorCategory::Negotiation => "negotiation",
            ErrorCategory::Security => "security",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// 传输桥错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把绑定、分发、会话链、TLS 各层的失败统一成一个可 `?` 传播的枚举，
///   同时保留足够的上下文（地址、操作名、耗时）帮助排障。
/// - **契约 (What)**：
///   - 变体均为 `Send + Sync + 'static + Clone`；
///   - [`BridgeError::code`] 返回稳定错误码，[`BridgeError::category`] 返回处置分类；
///   - 配置冲突类错误在 `Display` 中同时列出请求地址与已存在的绑定。
/// - **设计权衡 (Trade-offs)**：上下文使用 `String`，牺牲少量分配换取可读性；热路径上的
///   失败（嗅探、竞态）本就伴随连接关闭，分配成本可以忽略。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BridgeError {
    /// URI 缺少该 scheme 要求的组成部分，或选项取值非法。
    #[error("invalid resource address `{uri}`: {reason}")]
    InvalidAddress {
        uri: String,
        reason: Cow<'static, str>,
    },

    /// 地址使用了未注册工厂的 scheme。
    #[error("unsupported scheme `{scheme}` in `{uri}`")]
    UnsupportedScheme { scheme: String, uri: String },

    /// 同一（物理地址，下一协议）已绑定到不同的处理器。
    ///
    /// - **契约 (What)**：`address` 为本次请求的地址，`existing` 为注册表中已存在绑定的地址；
    ///   返回该错误时注册表未发生任何修改。
    #[error("address `{address}` conflicts with existing binding `{existing}` owned by another handler")]
    BindingConflict { address: String, existing: String },

    /// 绑定过程失败（包括替代地址链中途失败后的整体回滚）。
    #[error("failed to bind `{address}`: {detail}")]
    BindFailed { address: String, detail: String },

    /// 解析期查不到绑定，通常是解绑与接入竞态。
    #[error("no binding registered for `{address}`")]
    BindingMissing { address: String },

    /// 在字节预算内没有任何嗅探器命中。
    #[error("no next protocol matched on `{address}`: {reason}")]
    SniffFailed {
        address: String,
        reason: Cow<'static, str>,
    },

    /// 依赖对端输入的步骤超过了时间预算。
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// TLS 握手或协商失败。
    #[error("handshake failed: {detail}")]
    Handshake { detail: String },

    /// 逻辑层尚未构造完成时底层会话已终止（连接侧）。
    #[error("connection failed: {detail}")]
    ConnectionFailed { detail: String },

    /// 握手中途父会话关闭，挂起的逻辑会话被显式重置。
    #[error("connection reset: {detail}")]
    ConnectionReset { detail: String },

    /// 对已关闭的会话执行写入或关闭以外的操作。
    #[error("session {session} is closed")]
    SessionClosed { session: u64 },

    /// 底层 I/O 失败。
    #[error("{operation}: {message}")]
    Io {
        operation: &'static str,
        kind: io::ErrorKind,
        message: String,
    },

    /// 配置文件解析或校验失败。
    #[error("invalid configuration: {detail}")]
    Config { detail: String },
}

impl BridgeError {
    /// 以 `operation` 作为上下文包装一个 I/O 错误。
    pub fn io(operation: &'static str, error: io::Error) -> Self {
        BridgeError::Io {
            operation,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// 构造地址非法错误。
    pub fn invalid_address(uri: impl Into<String>, reason: impl Into<Cow<'static, str>>) -> Self {
        BridgeError::InvalidAddress {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::InvalidAddress { .. } => codes::INVALID_ADDRESS,
            BridgeError::UnsupportedScheme { .. } => codes::UNSUPPORTED_SCHEME,
            BridgeError::BindingConflict { .. } => codes::BINDING_CONFLICT,
            BridgeError::BindFailed { .. } => codes::BIND_FAILED,
            BridgeError::BindingMissing { .. } => codes::BINDING_MISSING,
            BridgeError::SniffFailed { .. } => codes::SNIFF_FAILED,
            BridgeError::Timeout { .. } => codes::TIMEOUT,
            BridgeError::Handshake { .. } => codes::HANDSHAKE,
            BridgeError::ConnectionFailed { .. } => codes::CONNECTION_FAILED,
            BridgeError::ConnectionReset { .. } => codes::CONNECTION_RESET,
            BridgeError::SessionClosed { .. } => codes::SESSION_CLOSED,
            BridgeError::Io { .. } => codes::IO,
            BridgeError::Config { .. } => codes::CONFIG,
        }
    }

    /// 处置分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::InvalidAddress { .. }
            | BridgeError::UnsupportedScheme { .. }
            | BridgeError::BindingConflict { .. }
            | BridgeError::BindFailed { .. }
            | BridgeError::Config { .. } => ErrorCategory::Configuration,
            BridgeError::BindingMissing { .. } => ErrorCategory::ResolutionRace,
            BridgeError::SniffFailed { .. } | BridgeError::Timeout { .. } => {
                ErrorCategory::Negotiation
            }
            BridgeError::Handshake { .. } => ErrorCategory::Security,
            BridgeError::ConnectionFailed { .. }
            | BridgeError::ConnectionReset { .. }
            | BridgeError::Io { .. } => ErrorCategory::Transport,
            BridgeError::SessionClosed { .. } => ErrorCategory::Closed,
        }
    }

    /// 是否属于绑定期致命错误。
    pub fn is_configuration(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }
}

/// crate 级 `Result` 别名。
pub type Result<T, E = BridgeError> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_both_addresses() {
        let err = BridgeError::BindingConflict {
            address: "tcp://localhost:8000 [ssl]".into(),
            existing: "tcp://localhost:8000 [ssl]".into(),
        };
        let text = err.to_string();
        assert!(text.contains("tcp://localhost:8000"), "冲突信息必须包含地址: {text}");
        assert_eq!(err.code(), codes::BINDING_CONFLICT);
        assert!(err.is_configuration());
    }

    #[test]
    fn io_errors_keep_kind_and_are_cloneable() {
        let err = BridgeError::io(
            "tcp bind",
            io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        );
        let cloned = err.clone();
        assert_eq!(err, cloned);
        assert_eq!(err.category(), ErrorCategory::Transport);
        match cloned {
            BridgeError::Io { kind, .. } => assert_eq!(kind, io::ErrorKind::AddrInUse),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn race_and_negotiation_categories() {
        let race = BridgeError::BindingMissing {
            address: "tcp://h:1".into(),
        };
        assert_eq!(race.category(), ErrorCategory::ResolutionRace);
        let timeout = BridgeError::Timeout {
            operation: "protocol sniffing",
            elapsed: Duration::from_millis(10),
        };
        assert_eq!(timeout.category(), ErrorCategory::Negotiation);
        assert_eq!(timeout.code(), codes::TIMEOUT);
    }
}
