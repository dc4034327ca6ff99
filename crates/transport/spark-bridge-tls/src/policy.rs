//! 套件与协议版本白名单。

use std::fmt;
use std::sync::Arc;

use rustls::SupportedCipherSuite;
use rustls::SupportedProtocolVersion;
use rustls::crypto::{CryptoProvider, ring};
use spark_bridge::Result;

use crate::client_hello::ClientHello;
use crate::error::misconfigured;

/// 由地址选项解析出的协商策略。
///
/// # 教案式说明
/// - **意图 (Why)**：地址上配置的是名称与别名（`HIGH`、`!CHACHA20`、`TLSv1.2`……），
///   握手引擎需要的是具体的套件对象；解析结果同时用于 ClientHello 预检，
///   保证“预检通过”与“引擎可协商”使用同一份集合；
/// - **契约 (What)**：
///   - 套件列表按配置顺序排列，保持服务端偏好；空配置等价于 `DEFAULT`；
///   - 名称大小写不敏感，接受 `rustls` 命名（`TLS13_AES_128_GCM_SHA256`）与
///     IANA 命名（`TLS_AES_128_GCM_SHA256`）；`!name` / `-name` 从结果中剔除；
///   - 未知名称、最终为空的集合都是配置错误；
///   - 版本白名单中的 `SSLv3`、`TLSv1`、`TLSv1.1` 被识别但忽略，引擎不支持这些版本；
///     只保留至少有一个可用套件的版本。
/// - **风险 (Trade-offs)**：别名集合刻意保持很小，复杂的 OpenSSL 表达式（`+`、`@STRENGTH`）不支持。
#[derive(Clone)]
pub struct TlsPolicy {
    provider: Arc<CryptoProvider>,
    versions: Vec<&'static SupportedProtocolVersion>,
}

impl TlsPolicy {
    /// 引擎全部默认套件与两个版本。
    pub fn engine_default() -> Self {
        let provider = ring::default_provider();
        Self {
            versions: versions_with_suites(&provider.cipher_suites, rustls::ALL_VERSIONS.to_vec()),
            provider: Arc::new(provider),
        }
    }

    pub fn resolve(ciphers: &[Arc<str>], protocols: &[Arc<str>]) -> Result<Self> {
        let base = ring::default_provider();
        let suites = if ciphers.is_empty() {
            base.cipher_suites.clone()
        } else {
            resolve_suites(&base.cipher_suites, ciphers)?
        };
        if suites.is_empty() {
            return Err(misconfigured(format!(
                "cipher list [{}] selects no supported suite",
                join(ciphers)
            )));
        }
        let requested = if protocols.is_empty() {
            rustls::ALL_VERSIONS.to_vec()
        } else {
            resolve_versions(protocols)?
        };
        let versions = versions_with_suites(&suites, requested);
        if versions.is_empty() {
            return Err(misconfigured(format!(
                "protocols [{}] share no suite with ciphers [{}]",
                join(protocols),
                join(ciphers)
            )));
        }
        Ok(Self {
            provider: Arc::new(CryptoProvider {
                cipher_suites: suites,
                ..base
            }),
            versions,
        })
    }

    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }

    pub fn versions(&self) -> &[&'static SupportedProtocolVersion] {
        &self.versions
    }

    pub fn suite_names(&self) -> Vec<String> {
        self.provider.cipher_suites.iter().map(suite_name).collect()
    }

    /// 客户端提供的参数与白名单至少各有一项交集时放行。
    pub fn admit(&self, hello: &ClientHello) -> std::result::Result<(), String> {
        let offered = hello.offered_versions();
        let version_ok = self
            .versions
            .iter()
            .any(|version| offered.contains(&u16::from(version.version)));
        if !version_ok {
            return Err(format!(
                "client offers versions {offered:04x?}, none of them allowed"
            ));
        }
        let suite_ok = self
            .provider
            .cipher_suites
            .iter()
            .any(|suite| hello.cipher_suites.contains(&u16::from(suite.suite())));
        if !suite_ok {
            return Err(format!(
                "no common cipher suite among {} offered",
                hello.cipher_suites.len()
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsPolicy")
            .field("suites", &self.suite_names())
            .field("versions", &self.versions.iter().map(|v| v.version).collect::<Vec<_>>())
            .finish()
    }
}

fn versions_with_suites(
    suites: &[SupportedCipherSuite],
    requested: Vec<&'static SupportedProtocolVersion>,
) -> Vec<&'static SupportedProtocolVersion> {
    requested
        .into_iter()
        .filter(|version| suites.iter().any(|suite| suite.version() == *version))
        .collect()
}

fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

fn join(names: &[Arc<str>]) -> String {
    names.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",")
}

fn resolve_suites(
    available: &[SupportedCipherSuite],
    names: &[Arc<str>],
) -> Result<Vec<SupportedCipherSuite>> {
    let mut selected: Vec<SupportedCipherSuite> = Vec::new();
    for raw in names {
        let token = raw.trim();
        let (exclude, token) = match token.strip_prefix(['!', '-']) {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        let matched: Vec<SupportedCipherSuite> = available
            .iter()
            .copied()
            .filter(|suite| matches_token(suite, token))
            .collect();
        if matched.is_empty() && !is_known_alias(token) {
            return Err(misconfigured(format!("unknown cipher suite `{token}`")));
        }
        if exclude {
            selected.retain(|suite| !matched.contains(suite));
        } else {
            for suite in matched {
                if !selected.contains(&suite) {
                    selected.push(suite);
                }
            }
        }
    }
    Ok(selected)
}

fn is_known_alias(token: &str) -> bool {
    ["DEFAULT", "ALL", "HIGH", "TLSv1.3", "TLSv1.2", "AESGCM", "CHACHA20", "ECDSA", "RSA"]
        .iter()
        .any(|alias| alias.eq_ignore_ascii_case(token))
}

fn matches_token(suite: &SupportedCipherSuite, token: &str) -> bool {
    let name = suite_name(suite);
    let upper = token.to_ascii_uppercase();
    match upper.as_str() {
        "DEFAULT" | "ALL" | "HIGH" => true,
        "TLSV1.3" => suite.version() == &rustls::version::TLS13,
        "TLSV1.2" => suite.version() == &rustls::version::TLS12,
        "AESGCM" => name.contains("_AES_") && name.contains("_GCM_"),
        "CHACHA20" => name.contains("CHACHA20"),
        "ECDSA" => name.contains("_ECDSA_"),
        "RSA" => name.contains("_RSA_"),
        _ => {
            name == upper
                || upper
                    .strip_prefix("TLS_")
                    .is_some_and(|rest| name == format!("TLS13_{rest}"))
        }
    }
}

fn resolve_versions(names: &[Arc<str>]) -> Result<Vec<&'static SupportedProtocolVersion>> {
    let mut versions = Vec::new();
    for name in names {
        let version: &'static SupportedProtocolVersion = match name.trim().to_ascii_uppercase().as_str() {
            "TLSV1.3" | "TLS1.3" => &rustls::version::TLS13,
            "TLSV1.2" | "TLS1.2" => &rustls::version::TLS12,
            "TLSV1.1" | "TLSV1" | "SSLV3" | "SSLV2HELLO" => continue,
            other => return Err(misconfigured(format!("unknown protocol version `{other}`"))),
        };
        if !versions.contains(&version) {
            versions.push(version);
        }
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_hello::{TLS12, TLS13};

    fn names(list: &[&str]) -> Vec<Arc<str>> {
        list.iter().map(|name| Arc::from(*name)).collect()
    }

    #[test]
    fn empty_lists_mean_engine_defaults() {
        let policy = TlsPolicy::resolve(&[], &[]).expect("默认策略");
        assert_eq!(policy.versions().len(), 2);
        assert_eq!(
            policy.suite_names(),
            TlsPolicy::engine_default().suite_names()
        );
    }

    #[test]
    fn iana_and_engine_names_are_both_accepted() {
        let policy = TlsPolicy::resolve(
            &names(&["TLS_AES_128_GCM_SHA256", "tls13_chacha20_poly1305_sha256"]),
            &[],
        )
        .expect("名称应能解析");
        assert_eq!(
            policy.suite_names(),
            vec!["TLS13_AES_128_GCM_SHA256", "TLS13_CHACHA20_POLY1305_SHA256"]
        );
        assert_eq!(policy.versions(), &[&rustls::version::TLS13], "只有 1.3 套件时只保留 1.3");
    }

    #[test]
    fn exclusions_remove_previous_matches() {
        let policy = TlsPolicy::resolve(&names(&["HIGH", "!CHACHA20"]), &[]).expect("别名应能解析");
        assert!(policy.suite_names().iter().all(|name| !name.contains("CHACHA20")));
        assert!(!policy.suite_names().is_empty());
    }

    #[test]
    fn unknown_names_are_configuration_errors() {
        let error = TlsPolicy::resolve(&names(&["RC4-MD5"]), &[]).expect_err("未知套件");
        assert!(error.is_configuration());
        let error = TlsPolicy::resolve(&[], &names(&["TLSv9"])).expect_err("未知版本");
        assert!(error.to_string().contains("TLSV9"));
    }

    #[test]
    fn legacy_versions_are_ignored_but_cannot_stand_alone() {
        let policy = TlsPolicy::resolve(&[], &names(&["TLSv1", "TLSv1.2"])).expect("忽略旧版本");
        assert_eq!(policy.versions(), &[&rustls::version::TLS12]);
        assert!(TlsPolicy::resolve(&[], &names(&["SSLv3"])).is_err(), "没有可用版本");
    }

    #[test]
    fn admission_requires_a_common_version_and_suite() {
        let policy = TlsPolicy::resolve(&names(&["TLSv1.2"]), &names(&["TLSv1.2"])).expect("策略");
        let tls13_only = ClientHello {
            legacy_version: TLS12,
            cipher_suites: vec![0x1301],
            supported_versions: vec![TLS13],
            ..ClientHello::default()
        };
        assert!(policy.admit(&tls13_only).is_err(), "版本没有交集");

        let wrong_suite = ClientHello {
            legacy_version: TLS12,
            cipher_suites: vec![0x1301],
            ..ClientHello::default()
        };
        assert!(policy.admit(&wrong_suite).is_err(), "套件没有交集");

        let compatible = ClientHello {
            legacy_version: TLS12,
            cipher_suites: vec![0xc02f],
            ..ClientHello::default()
        };
        assert!(policy.admit(&compatible).is_ok());
    }
}
