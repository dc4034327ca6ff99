//! 协议嗅探器。
//!
//! 嗅探器只看连接最前面的字节，给出三值结论：命中、排除、需要更多字节。
//! 内建嗅探器挂在 scheme 能力表上；[`SnifferTable`] 允许按协议名覆盖，测试与自定义协议都走这里。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::address::Scheme;

/// 嗅探结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SniffVerdict {
    Match,
    NoMatch,
    NeedMore,
}

/// 按字节前缀判断协议的能力。
pub trait ProtocolSniffer: Send + Sync + 'static {
    fn sniff(&self, prefix: &[u8]) -> SniffVerdict;
}

impl<F> ProtocolSniffer for F
where
    F: Fn(&[u8]) -> SniffVerdict + Send + Sync + 'static,
{
    fn sniff(&self, prefix: &[u8]) -> SniffVerdict {
        self(prefix)
    }
}

/// 协议名 → 嗅探器。
///
/// 查找顺序：显式注册的覆盖项 → 同名 scheme 的内建嗅探器 → 无嗅探器（视为排除）。
#[derive(Clone, Default)]
pub struct SnifferTable {
    overrides: HashMap<Arc<str>, Arc<dyn ProtocolSniffer>>,
}

impl SnifferTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sniffer(mut self, protocol: &str, sniffer: Arc<dyn ProtocolSniffer>) -> Self {
        self.register(protocol, sniffer);
        self
    }

    pub fn register(&mut self, protocol: &str, sniffer: Arc<dyn ProtocolSniffer>) {
        self.overrides.insert(Arc::from(protocol), sniffer);
    }

    pub fn sniff(&self, protocol: &str, prefix: &[u8]) -> SniffVerdict {
        if let Some(sniffer) = self.overrides.get(protocol) {
            return sniffer.sniff(prefix);
        }
        match Scheme::parse(protocol).and_then(|scheme| scheme.capabilities().sniff) {
            Some(sniff) => sniff(prefix),
            None => SniffVerdict::NoMatch,
        }
    }
}

impl fmt::Debug for SnifferTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.overrides.keys().collect();
        names.sort();
        f.debug_struct("SnifferTable").field("overrides", &names).finish()
    }
}

const HANDSHAKE_RECORD: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;

/// TLS ClientHello：记录类型 0x16、主版本 3、握手类型 1。
pub fn tls_client_hello(prefix: &[u8]) -> SniffVerdict {
    let checks: [(usize, fn(u8) -> bool); 4] = [
        (0, |b| b == HANDSHAKE_RECORD),
        (1, |b| b == 0x03),
        (2, |b| b <= 0x04),
        (5, |b| b == CLIENT_HELLO),
    ];
    for (index, check) in checks {
        match prefix.get(index) {
            None => return SniffVerdict::NeedMore,
            Some(&byte) if !check(byte) => return SniffVerdict::NoMatch,
            Some(_) => {}
        }
    }
    SniffVerdict::Match
}

const METHODS: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"TRACE ",
    b"CONNECT ",
];

/// HTTP 请求行：以已知方法名加空格开头。
pub fn http_request_line(prefix: &[u8]) -> SniffVerdict {
    if prefix.is_empty() {
        return SniffVerdict::NeedMore;
    }
    let mut possible = false;
    for method in METHODS {
        if prefix.starts_with(method) {
            return SniffVerdict::Match;
        }
        if method.starts_with(prefix) {
            possible = true;
        }
    }
    if possible {
        SniffVerdict::NeedMore
    } else {
        SniffVerdict::NoMatch
    }
}

/// WebSocket 升级请求：HTTP 请求且头部包含 `Upgrade: websocket`。
pub fn websocket_upgrade(prefix: &[u8]) -> SniffVerdict {
    with_request_head(prefix, |head| {
        head.target.contains("/;e/") || !head.has_header("upgrade", "websocket")
    })
}

/// WebSocket 长轮询模拟：目标路径含 `/;e/` 且未声明 `X-Next-Protocol: wsx`。
pub fn wse_emulation(prefix: &[u8]) -> SniffVerdict {
    with_request_head(prefix, |head| {
        !head.target.contains("/;e/") || head.has_header("x-next-protocol", "wsx")
    })
}

/// `wsx` 变体：目标路径含 `/;e/` 且声明 `X-Next-Protocol: wsx`。
pub fn wsx_emulation(prefix: &[u8]) -> SniffVerdict {
    with_request_head(prefix, |head| {
        !head.target.contains("/;e/") || !head.has_header("x-next-protocol", "wsx")
    })
}

struct RequestHead {
    target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn has_header(&self, name: &str, value: &str) -> bool {
        self.headers.iter().any(|(n, v)| {
            n == name && v.split(',').any(|item| item.trim().eq_ignore_ascii_case(value))
        })
    }
}

/// 先确认是 HTTP 请求，再等完整头部到达后交给 `reject` 判定；`reject` 返回 true 表示排除。
fn with_request_head(prefix: &[u8], reject: impl Fn(&RequestHead) -> bool) -> SniffVerdict {
    match http_request_line(prefix) {
        SniffVerdict::Match => {}
        other => return other,
    }
    let Some(end) = find(prefix, b"\r\n\r\n") else {
        return SniffVerdict::NeedMore;
    };
    let Ok(text) = std::str::from_utf8(&prefix[..end]) else {
        return SniffVerdict::NoMatch;
    };
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let target = request_line.split(' ').nth(1).unwrap_or_default().to_owned();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim().to_owned()))
        .collect();
    let head = RequestHead { target, headers };
    if reject(&head) {
        SniffVerdict::NoMatch
    } else {
        SniffVerdict::Match
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_sniffer_needs_six_bytes() {
        assert_eq!(tls_client_hello(&[]), SniffVerdict::NeedMore);
        assert_eq!(tls_client_hello(&[0x16, 0x03, 0x01]), SniffVerdict::NeedMore);
        assert_eq!(
            tls_client_hello(&[0x16, 0x03, 0x01, 0x00, 0x40, 0x01]),
            SniffVerdict::Match
        );
        assert_eq!(tls_client_hello(b"GET / HTTP/1.1"), SniffVerdict::NoMatch);
    }

    #[test]
    fn http_sniffer_handles_partial_methods() {
        assert_eq!(http_request_line(b"GE"), SniffVerdict::NeedMore);
        assert_eq!(http_request_line(b"GET /"), SniffVerdict::Match);
        assert_eq!(http_request_line(b"\x16\x03"), SniffVerdict::NoMatch);
        assert_eq!(http_request_line(b"GETX"), SniffVerdict::NoMatch);
    }

    #[test]
    fn websocket_variants_are_mutually_exclusive() {
        let ws = b"GET /echo HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let wse = b"POST /echo/;e/cb HTTP/1.1\r\nHost: h\r\n\r\n";
        let wsx = b"POST /echo/;e/cb HTTP/1.1\r\nHost: h\r\nX-Next-Protocol: wsx\r\n\r\n";

        assert_eq!(websocket_upgrade(ws), SniffVerdict::Match);
        assert_eq!(wse_emulation(ws), SniffVerdict::NoMatch);
        assert_eq!(wse_emulation(wse), SniffVerdict::Match);
        assert_eq!(wsx_emulation(wse), SniffVerdict::NoMatch);
        assert_eq!(wsx_emulation(wsx), SniffVerdict::Match);
        assert_eq!(wse_emulation(wsx), SniffVerdict::NoMatch);
        assert_eq!(
            websocket_upgrade(b"GET /echo HTTP/1.1\r\nHost"),
            SniffVerdict::NeedMore
        );
    }

    #[test]
    fn table_overrides_take_precedence() {
        let table = SnifferTable::new().with_sniffer("ssl", Arc::new(|_: &[u8]| SniffVerdict::Match));
        assert_eq!(table.sniff("ssl", b"GET /"), SniffVerdict::Match);
        assert_eq!(table.sniff("http", b"GET /"), SniffVerdict::Match);
        assert_eq!(table.sniff("unknown", b"GET /"), SniffVerdict::NoMatch);
    }
}
