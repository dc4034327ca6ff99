//! # scheme 模块说明
//!
//! ## 角色定位（Why）
//! - 网关支持的地址 scheme 是封闭集合，用枚举表达后注册表、分发器可以穷举匹配，
//!   不再依赖按传输类型派生子类的多态；
//! - 每个 scheme 对应一张静态能力表（默认下层、URI 约束、嗅探函数），在构造地址时一次性选定。
//!
//! ## 契约（What）
//! - [`Scheme::capabilities`] 返回 `'static` 能力表，调用方不得假设表项可变；
//! - 物理传输 scheme（tcp/udp/mcp/pipe）没有默认下层；协议层 scheme 都有且仅有一个默认下层。

use std::fmt;

use crate::buffer::LayerId;
use crate::dispatch::sniff::{self, SniffVerdict};

/// 物理传输种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Tcp,
    Udp,
    Multicast,
    Pipe,
}

/// 协议层种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerKind {
    /// 无协议分层，字节原样透传。
    Raw,
    Tls,
    Http,
    Ws,
    /// WebSocket 长轮询模拟（`wse` 与 `wsx` 共享）。
    Wse,
}

/// 字节前缀嗅探函数签名。
pub type SniffFn = fn(&[u8]) -> SniffVerdict;

/// 单个 scheme 的静态能力表。
#[derive(Clone, Copy, Debug)]
pub struct SchemeCapabilities {
    /// 物理传输 scheme 填写其传输种类；协议层为 `None`。
    pub physical: Option<TransportKind>,
    pub layer: LayerKind,
    /// 未显式指定 transport 时委托的下层 scheme。
    pub default_transport: Option<Scheme>,
    pub requires_host: bool,
    pub requires_port: bool,
    /// `requires_port == false` 时缺省端口的回填值。
    pub default_port: Option<u16>,
    /// 该 scheme 作为“下一协议”出现时使用的内建嗅探器。
    pub sniff: Option<SniffFn>,
}

/// 网关地址 scheme。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    Tcp,
    Udp,
    Mcp,
    Pipe,
    Ssl,
    Http,
    Ws,
    Wse,
    Wsx,
}

const TCP: SchemeCapabilities = SchemeCapabilities {
    physical: Some(TransportKind::Tcp),
    layer: LayerKind::Raw,
    default_transport: None,
    requires_host: true,
    requires_port: true,
    default_port: None,
    sniff: None,
};

const UDP: SchemeCapabilities = SchemeCapabilities {
    physical: Some(TransportKind::Udp),
    ..TCP
};

const MCP: SchemeCapabilities = SchemeCapabilities {
    physical: Some(TransportKind::Multicast),
    ..TCP
};

const PIPE: SchemeCapabilities = SchemeCapabilities {
    physical: Some(TransportKind::Pipe),
    requires_port: false,
    ..TCP
};

const SSL: SchemeCapabilities = SchemeCapabilities {
    physical: None,
    layer: LayerKind::Tls,
    default_transport: Some(Scheme::Tcp),
    requires_host: true,
    requires_port: false,
    default_port: Some(443),
    sniff: Some(sniff::tls_client_hello),
};

const HTTP: SchemeCapabilities = SchemeCapabilities {
    layer: LayerKind::Http,
    default_port: Some(80),
    sniff: Some(sniff::http_request_line),
    ..SSL
};

const WS: SchemeCapabilities = SchemeCapabilities {
    layer: LayerKind::Ws,
    default_transport: Some(Scheme::Http),
    sniff: Some(sniff::websocket_upgrade),
    ..HTTP
};

const WSE: SchemeCapabilities = SchemeCapabilities {
    layer: LayerKind::Wse,
    sniff: Some(sniff::wse_emulation),
    ..WS
};

const WSX: SchemeCapabilities = SchemeCapabilities {
    sniff: Some(sniff::wsx_emulation),
    ..WSE
};

impl Scheme {
    /// 全部 scheme，按声明顺序。
    pub const ALL: [Scheme; 9] = [
        Scheme::Tcp,
        Scheme::Udp,
        Scheme::Mcp,
        Scheme::Pipe,
        Scheme::Ssl,
        Scheme::Http,
        Scheme::Ws,
        Scheme::Wse,
        Scheme::Wsx,
    ];

    /// 大小写不敏感地解析 scheme 名称。
    pub fn parse(name: &str) -> Option<Self> {
        Scheme::ALL
            .into_iter()
            .find(|scheme| scheme.as_str().eq_ignore_ascii_case(name))
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Udp => "udp",
            Scheme::Mcp => "mcp",
            Scheme::Pipe => "pipe",
            Scheme::Ssl => "ssl",
            Scheme::Http => "http",
            Scheme::Ws => "ws",
            Scheme::Wse => "wse",
            Scheme::Wsx => "wsx",
        }
    }

    /// 作为下层地址 `nextProtocol` 标签时使用的名称。
    pub const fn protocol_name(self) -> &'static str {
        self.as_str()
    }

    pub const fn capabilities(self) -> &'static SchemeCapabilities {
        match self {
            Scheme::Tcp => &TCP,
            Scheme::Udp => &UDP,
            Scheme::Mcp => &MCP,
            Scheme::Pipe => &PIPE,
            Scheme::Ssl => &SSL,
            Scheme::Http => &HTTP,
            Scheme::Ws => &WS,
            Scheme::Wse => &WSE,
            Scheme::Wsx => &WSX,
        }
    }

    pub const fn is_physical(self) -> bool {
        self.capabilities().physical.is_some()
    }

    pub const fn layer(self) -> LayerKind {
        self.capabilities().layer
    }

    pub const fn default_transport(self) -> Option<Scheme> {
        self.capabilities().default_transport
    }

    /// 该 scheme 在写缓冲 arena 中对应的槽位。
    pub const fn layer_id(self) -> LayerId {
        LayerId::new(self as u32)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_chain_ends_at_a_physical_scheme() {
        for scheme in Scheme::ALL {
            let mut current = scheme;
            let mut depth = 0;
            while let Some(lower) = current.default_transport() {
                assert_ne!(lower, current, "下层不能指向自身");
                current = lower;
                depth += 1;
                assert!(depth < Scheme::ALL.len(), "transport 链必须有限");
            }
            assert!(current.is_physical(), "{scheme} 的链底必须是物理传输");
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Scheme::parse("SSL"), Some(Scheme::Ssl));
        assert_eq!(Scheme::parse("wsx"), Some(Scheme::Wsx));
        assert_eq!(Scheme::parse("quic"), None);
    }

    #[test]
    fn emulation_variants_share_layer_kind() {
        assert_eq!(Scheme::Wse.layer(), LayerKind::Wse);
        assert_eq!(Scheme::Wsx.layer(), LayerKind::Wse);
        assert_eq!(Scheme::Ws.default_transport(), Some(Scheme::Http));
    }
}
