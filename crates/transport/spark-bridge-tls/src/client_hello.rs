//! ClientHello 预解析。
//!
//! 握手引擎接手之前，接入侧需要从对端首批字节中读出客户端提供的套件、版本与 SNI，
//! 以便按地址的白名单先行拒绝不可能协商成功的连接。这里只做只读解析，不改变字节流，
//! 解析完成后原始字节完整交给 `rustls`。

const CONTENT_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const RECORD_HEADER: usize = 5;
const HANDSHAKE_HEADER: usize = 4;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

/// TLS 1.2 / 1.3 的线上版本号。
pub const TLS12: u16 = 0x0303;
pub const TLS13: u16 = 0x0304;

/// 从 ClientHello 中读出的协商参数。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub legacy_version: u16,
    pub cipher_suites: Vec<u16>,
    pub server_name: Option<String>,
    /// `supported_versions` 扩展；缺失时为空。
    pub supported_versions: Vec<u16>,
    pub alpn: Vec<Vec<u8>>,
}

impl ClientHello {
    /// 客户端愿意协商的版本：优先取扩展，否则按 legacy 版本推断。
    pub fn offered_versions(&self) -> Vec<u16> {
        if self.supported_versions.is_empty() {
            vec![self.legacy_version]
        } else {
            self.supported_versions.clone()
        }
    }
}

/// 一次扫描的结论。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scan {
    /// 字节尚不足以完成判断。
    NeedMore,
    /// 不是 TLS 握手，或结构非法。
    Invalid(&'static str),
    Complete(ClientHello),
}

/// 扫描 `bytes` 开头的 ClientHello，可跨多个握手记录。
pub fn scan(bytes: &[u8]) -> Scan {
    let mut handshake = Vec::new();
    let mut offset = 0;
    loop {
        if let Some(needed) = handshake_length(&handshake)
            && handshake.len() >= needed
        {
            return match parse_client_hello(&handshake[HANDSHAKE_HEADER..needed]) {
                Some(hello) => Scan::Complete(hello),
                None => Scan::Invalid("malformed client hello"),
            };
        }
        let Some(header) = bytes.get(offset..offset + RECORD_HEADER) else {
            return Scan::NeedMore;
        };
        if header[0] != CONTENT_HANDSHAKE {
            return Scan::Invalid("not a tls handshake record");
        }
        if header[1] != 0x03 {
            return Scan::Invalid("unsupported record version");
        }
        let length = u16::from_be_bytes([header[3], header[4]]) as usize;
        if length == 0 {
            return Scan::Invalid("empty handshake record");
        }
        let Some(fragment) = bytes.get(offset + RECORD_HEADER..offset + RECORD_HEADER + length)
        else {
            return Scan::NeedMore;
        };
        handshake.extend_from_slice(fragment);
        offset += RECORD_HEADER + length;
        if handshake[0] != HANDSHAKE_CLIENT_HELLO {
            return Scan::Invalid("first handshake message is not a client hello");
        }
    }
}

fn handshake_length(handshake: &[u8]) -> Option<usize> {
    let header = handshake.get(..HANDSHAKE_HEADER)?;
    let body = (usize::from(header[1]) << 16) | (usize::from(header[2]) << 8) | usize::from(header[3]);
    Some(HANDSHAKE_HEADER + body)
}

/// 大端字节游标，任何越界读取都返回 `None`。
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < len {
            return None;
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn vec8(&mut self) -> Option<Reader<'a>> {
        let len = usize::from(self.u8()?);
        self.take(len).map(Reader::new)
    }

    fn vec16(&mut self) -> Option<Reader<'a>> {
        let len = usize::from(self.u16()?);
        self.take(len).map(Reader::new)
    }
}

fn parse_client_hello(body: &[u8]) -> Option<ClientHello> {
    let mut reader = Reader::new(body);
    let legacy_version = reader.u16()?;
    reader.take(32)?;
    reader.vec8()?;
    let mut suites = reader.vec16()?;
    let mut cipher_suites = Vec::new();
    while !suites.is_empty() {
        cipher_suites.push(suites.u16()?);
    }
    reader.vec8()?;

    let mut hello = ClientHello {
        legacy_version,
        cipher_suites,
        ..ClientHello::default()
    };
    if reader.is_empty() {
        return Some(hello);
    }
    let mut extensions = reader.vec16()?;
    while !extensions.is_empty() {
        let kind = extensions.u16()?;
        let mut data = extensions.vec16()?;
        match kind {
            EXT_SERVER_NAME => hello.server_name = parse_server_name(&mut data)?,
            EXT_SUPPORTED_VERSIONS => {
                let mut versions = data.vec8()?;
                while !versions.is_empty() {
                    hello.supported_versions.push(versions.u16()?);
                }
            }
            EXT_ALPN => {
                let mut protocols = data.vec16()?;
                while !protocols.is_empty() {
                    let protocol = protocols.vec8()?;
                    hello.alpn.push(protocol.bytes.to_vec());
                }
            }
            _ => {}
        }
    }
    Some(hello)
}

fn parse_server_name(data: &mut Reader<'_>) -> Option<Option<String>> {
    let mut names = data.vec16()?;
    while !names.is_empty() {
        let name_type = names.u8()?;
        let name = names.vec16()?;
        // host_name(0) 之外的类型目前没有定义
        if name_type == 0 {
            let host = std::str::from_utf8(name.bytes).ok()?;
            return Some(Some(host.to_ascii_lowercase()));
        }
    }
    Some(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(kind: u16, data: &[u8]) -> Vec<u8> {
        let mut out = kind.to_be_bytes().to_vec();
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
        out
    }

    fn sni(host: &str) -> Vec<u8> {
        let mut entry = vec![0u8];
        entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
        entry.extend_from_slice(host.as_bytes());
        let mut list = (entry.len() as u16).to_be_bytes().to_vec();
        list.extend_from_slice(&entry);
        extension(EXT_SERVER_NAME, &list)
    }

    fn hello_body(suites: &[u16], extensions: &[u8]) -> Vec<u8> {
        let mut body = TLS12.to_be_bytes().to_vec();
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
        for suite in suites {
            body.extend_from_slice(&suite.to_be_bytes());
        }
        body.extend_from_slice(&[1, 0]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(extensions);
        body
    }

    fn records(body: &[u8], split: usize) -> Vec<u8> {
        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(body);
        let mut out = Vec::new();
        for fragment in handshake.chunks(split) {
            out.extend_from_slice(&[CONTENT_HANDSHAKE, 0x03, 0x01]);
            out.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
            out.extend_from_slice(fragment);
        }
        out
    }

    #[test]
    fn reads_suites_sni_and_versions() {
        let mut extensions = sni("Alpha.Test");
        extensions.extend(extension(EXT_SUPPORTED_VERSIONS, &[4, 0x03, 0x04, 0x03, 0x03]));
        let bytes = records(&hello_body(&[0x1301, 0xc02f], &extensions), usize::MAX);
        let Scan::Complete(hello) = scan(&bytes) else {
            panic!("完整 ClientHello 应被解析");
        };
        assert_eq!(hello.cipher_suites, vec![0x1301, 0xc02f]);
        assert_eq!(hello.server_name.as_deref(), Some("alpha.test"), "SNI 统一小写");
        assert_eq!(hello.offered_versions(), vec![TLS13, TLS12]);
    }

    #[test]
    fn handshake_may_span_several_records() {
        let bytes = records(&hello_body(&[0x1301], &sni("beta.test")), 16);
        assert!(matches!(scan(&bytes), Scan::Complete(ref hello) if hello.server_name.as_deref() == Some("beta.test")));
        assert_eq!(scan(&bytes[..bytes.len() - 1]), Scan::NeedMore, "缺最后一个字节时继续等待");
    }

    #[test]
    fn non_tls_bytes_are_rejected_immediately() {
        assert!(matches!(scan(b"GET / HTTP/1.1\r\n"), Scan::Invalid(_)));
        assert_eq!(scan(&[CONTENT_HANDSHAKE, 0x03]), Scan::NeedMore);
    }

    #[test]
    fn legacy_version_is_used_without_extension() {
        let bytes = records(&hello_body(&[0xc02f], &[]), usize::MAX);
        let Scan::Complete(hello) = scan(&bytes) else {
            panic!("应解析成功");
        };
        assert_eq!(hello.offered_versions(), vec![TLS12]);
        assert_eq!(hello.server_name, None);
    }
}
