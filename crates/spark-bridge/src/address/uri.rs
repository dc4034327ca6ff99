//! 资源 URI 的最小解析器。
//!
//! 只覆盖网关地址需要的子集：`scheme://host[:port][/path][?query]`，支持 IPv6 方括号写法；
//! 不支持 userinfo 与 fragment，出现即判定为非法地址。

use std::fmt;
use std::str::FromStr;

use crate::error::{BridgeError, Result};

/// 解析后的资源 URI。
///
/// - scheme 与 host 统一转为小写，保证绑定键比较时不受大小写影响；
/// - `path` 为空时规范化为 `/`，与 `tcp://h:1` 与 `tcp://h:1/` 视为同一端点的约定一致。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceUri {
    scheme: String,
    host: Option<String>,
    port: Option<u16>,
    path: String,
    query: Option<String>,
}

impl ResourceUri {
    /// 解析字符串形式的 URI。
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| BridgeError::invalid_address(input, "missing `://` separator"))?;
        if !is_valid_scheme(scheme) {
            return Err(BridgeError::invalid_address(input, "malformed scheme"));
        }
        if rest.contains('#') {
            return Err(BridgeError::invalid_address(input, "fragments are not supported"));
        }

        let (before_query, query) = match rest.split_once('?') {
            Some((head, q)) => (head, Some(q.to_owned())),
            None => (rest, None),
        };
        let (authority, path) = match before_query.find('/') {
            Some(index) => (&before_query[..index], &before_query[index..]),
            None => (before_query, ""),
        };
        if authority.contains('@') {
            return Err(BridgeError::invalid_address(input, "userinfo is not supported"));
        }
        let (host, port) = split_authority(input, authority)?;

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.map(|h| h.to_ascii_lowercase()),
            port,
            path: if path.is_empty() {
                "/".to_owned()
            } else {
                path.to_owned()
            },
            query,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// `host[:port]`，IPv6 主机带方括号。
    pub fn authority(&self) -> String {
        let mut out = String::new();
        if let Some(host) = &self.host {
            push_host(&mut out, host);
        }
        if let Some(port) = self.port {
            out.push(':');
            out.push_str(&port.to_string());
        }
        out
    }

    /// 替换 scheme，其余部分保持不变。
    pub fn with_scheme(&self, scheme: &str) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            ..self.clone()
        }
    }

    /// 替换 authority。
    pub fn with_authority(&self, host: Option<&str>, port: Option<u16>) -> Self {
        Self {
            host: host.map(|h| h.to_ascii_lowercase()),
            port,
            ..self.clone()
        }
    }

    /// 替换 path；空串规范化为 `/`。
    pub fn with_path(&self, path: &str) -> Self {
        let path = if path.is_empty() {
            "/".to_owned()
        } else if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };
        Self {
            path,
            ..self.clone()
        }
    }
}

impl FromStr for ResourceUri {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority(), self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn push_host(out: &mut String, host: &str) {
    if host.contains(':') {
        out.push('[');
        out.push_str(host);
        out.push(']');
    } else {
        out.push_str(host);
    }
}

fn split_authority<'a>(input: &str, authority: &'a str) -> Result<(Option<&'a str>, Option<u16>)> {
    if authority.is_empty() {
        return Ok((None, None));
    }

    let (host, port_text) = if let Some(stripped) = authority.strip_prefix('[') {
        let (host, tail) = stripped
            .split_once(']')
            .ok_or_else(|| BridgeError::invalid_address(input, "unterminated IPv6 literal"))?;
        match tail {
            "" => (host, None),
            _ => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => {
                    return Err(BridgeError::invalid_address(
                        input,
                        "unexpected characters after IPv6 literal",
                    ));
                }
            },
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match port_text {
        None => None,
        Some(text) => Some(
            text.parse::<u16>()
                .map_err(|_| BridgeError::invalid_address(input, "port is not a valid u16"))?,
        ),
    };
    let host = if host.is_empty() { None } else { Some(host) };
    Ok((host, port))
}
