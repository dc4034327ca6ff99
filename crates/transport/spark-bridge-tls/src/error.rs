use std::io;
use std::time::Duration;

use rustls::{AlertDescription, Error as RustlsError};
use spark_bridge::BridgeError;

/// TLS 层错误映射。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把 `rustls` 的握手/记录层错误、ClientHello 预检失败与证书缺失统一映射进 [`BridgeError`]，
///   上层只需按 `code()` 与 `category()` 决策；
/// - 日志里额外携带本层的 `OperationKind::code`，定位到具体阶段而不必解析底层错误文本。
///
/// ## 契约（What）
/// - 协商类失败（证书、套件、版本、对端告警）一律映射为 [`BridgeError::Handshake`]，分类 `Security`；
/// - 握手超时映射为 [`BridgeError::Timeout`]，与嗅探超时同属 `Negotiation`；
/// - 记录层在握手完成后出错同样视为 `Handshake`，因为此时连接已无法安全继续。
///
/// ## 风险与权衡（Trade-offs）
/// - `Display` 只保留 `rustls` 错误文本，具体告警类型通过 [`describe_rustls_error`] 拼入 detail。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const CLIENT_HELLO: OperationKind = OperationKind {
    code: "spark.bridge.tls.client_hello_rejected",
    message: "tls client hello",
};

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.bridge.tls.handshake_failed",
    message: "tls handshake",
};

pub(crate) const RECORD: OperationKind = OperationKind {
    code: "spark.bridge.tls.record_failed",
    message: "tls record",
};

pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.bridge.tls.configure_failed",
    message: "tls configure",
};

/// 将 `rustls` 错误映射为握手失败。
pub(crate) fn map_tls_error(kind: OperationKind, error: &RustlsError) -> BridgeError {
    BridgeError::Handshake {
        detail: format!("{}: {}", kind.message, describe_rustls_error(error)),
    }
}

/// 明文读写失败（通常是缓冲区约束被破坏）。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> BridgeError {
    BridgeError::io(kind.message, error)
}

/// 预检阶段拒绝连接。
pub(crate) fn rejected(kind: OperationKind, reason: impl Into<String>) -> BridgeError {
    BridgeError::Handshake {
        detail: format!("{}: {}", kind.message, reason.into()),
    }
}

/// 密钥库或选项组合无法构成可用的 TLS 配置。
pub(crate) fn misconfigured(reason: impl Into<String>) -> BridgeError {
    BridgeError::Config {
        detail: format!("{}: {}", CONFIGURE.message, reason.into()),
    }
}

pub(crate) fn handshake_timeout(elapsed: Duration) -> BridgeError {
    BridgeError::Timeout {
        operation: HANDSHAKE.message,
        elapsed,
    }
}

/// 为常见失败补充可读的阶段说明。
pub(crate) fn describe_rustls_error(error: &RustlsError) -> String {
    match error {
        RustlsError::AlertReceived(alert) => format!("peer sent alert {}", alert_label(*alert)),
        RustlsError::NoCertificatesPresented => "peer presented no certificate".to_owned(),
        RustlsError::InvalidCertificate(reason) => format!("invalid peer certificate: {reason:?}"),
        RustlsError::PeerIncompatible(reason) => format!("peer incompatible: {reason:?}"),
        other => other.to_string(),
    }
}

fn alert_label(alert: AlertDescription) -> String {
    match alert {
        AlertDescription::HandshakeFailure => "handshake_failure".to_owned(),
        AlertDescription::ProtocolVersion => "protocol_version".to_owned(),
        AlertDescription::UnknownCA => "unknown_ca".to_owned(),
        AlertDescription::BadCertificate => "bad_certificate".to_owned(),
        AlertDescription::CertificateRequired => "certificate_required".to_owned(),
        AlertDescription::UnrecognisedName => "unrecognised_name".to_owned(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_bridge::ErrorCategory;
    use spark_bridge::error::codes;

    #[test]
    fn alerts_are_security_failures() {
        let error = map_tls_error(
            HANDSHAKE,
            &RustlsError::AlertReceived(AlertDescription::HandshakeFailure),
        );
        assert_eq!(error.code(), codes::HANDSHAKE);
        assert_eq!(error.category(), ErrorCategory::Security);
        assert!(
            error.to_string().contains("handshake_failure"),
            "告警名称应出现在错误文本中: {error}"
        );
    }

    #[test]
    fn timeouts_are_negotiation_failures() {
        let error = handshake_timeout(Duration::from_secs(10));
        assert_eq!(error.code(), codes::TIMEOUT);
        assert_eq!(error.category(), ErrorCategory::Negotiation);
    }

    #[test]
    fn misconfiguration_is_a_configuration_error() {
        let error = misconfigured("no identity for hosts [a.test]");
        assert!(error.is_configuration());
        assert!(error.to_string().contains("a.test"));
    }
}
