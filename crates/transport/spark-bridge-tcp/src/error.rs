//! I/O 错误到 [`BridgeError`] 的映射表。
//!
//! 每类底层操作有一个 [`OperationKind`]：`code` 写入日志字段便于检索，`message` 作为错误上下文。

use std::io;

use spark_bridge::BridgeError;
use spark_bridge::ResourceAddress;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.bridge.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.bridge.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.bridge.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.bridge.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.bridge.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.bridge.tcp.configure_failed",
    message: "tcp configure",
};

/// 将 IO 错误映射为 [`BridgeError::Io`]。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> BridgeError {
    BridgeError::io(kind.message, error)
}

/// 监听失败：归入配置类错误，启动流程据此中止。
pub(crate) fn bind_failed(address: &ResourceAddress, error: io::Error) -> BridgeError {
    BridgeError::BindFailed {
        address: address.to_string(),
        detail: format!("{}: {error}", BIND.message),
    }
}

/// 建连失败：带上目标地址，连接侧按替代地址链重试。
pub(crate) fn connect_failed(address: &ResourceAddress, error: io::Error) -> BridgeError {
    BridgeError::ConnectionFailed {
        detail: format!("{} {}: {error}", CONNECT.message, address.resource_uri().authority()),
    }
}

/// 地址缺少主机或端口，无法落到套接字地址。
pub(crate) fn unresolvable(address: &ResourceAddress, reason: &'static str) -> BridgeError {
    BridgeError::invalid_address(address.to_string(), reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_bridge::ResourceAddressFactory;
    use spark_bridge::error::{ErrorCategory, codes};

    fn address() -> ResourceAddress {
        ResourceAddressFactory::new()
            .new_resource_address("tcp://127.0.0.1:9", Default::default())
            .expect("地址合法")
    }

    #[test]
    fn io_errors_keep_kind_and_operation() {
        let error = map_io_error(READ, io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
        assert_eq!(error.code(), codes::IO);
        assert_eq!(error.category(), ErrorCategory::Transport);
        assert!(error.to_string().starts_with("tcp read"));
    }

    #[test]
    fn bind_and_connect_failures_name_the_address() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let error = connect_failed(&address(), refused);
        assert_eq!(error.code(), codes::CONNECTION_FAILED);
        assert!(error.to_string().contains("127.0.0.1:9"));

        let in_use = io::Error::from(io::ErrorKind::AddrInUse);
        let error = bind_failed(&address(), in_use);
        assert!(error.is_configuration());
        assert!(error.to_string().contains("tcp://127.0.0.1:9"));
    }
}
