//! 由策略、密钥快照与地址选项构造 `rustls` 配置。

use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::server::{ClientHello as EngineClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig, SignatureScheme};
use spark_bridge::address::keys;
use spark_bridge::{ResourceAddress, Result};

use crate::error::misconfigured;
use crate::key_store::KeyMaterial;
use crate::policy::TlsPolicy;

/// 握手前已经选定的身份；不依据任何客户端数据改变选择。
#[derive(Debug)]
struct SelectedIdentity(Arc<CertifiedKey>);

impl ResolvesServerCert for SelectedIdentity {
    fn resolve(&self, _client_hello: EngineClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

impl ResolvesClientCert for SelectedIdentity {
    fn resolve(&self, _root_hint_subjects: &[&[u8]], _sigschemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// 接入侧配置。
///
/// `ssl.needClientAuth` 优先于 `ssl.wantClientAuth`；两者都要求密钥库中至少有一个信任锚。
pub(crate) fn server_config(
    policy: &TlsPolicy,
    material: &KeyMaterial,
    identity: Arc<CertifiedKey>,
    address: &ResourceAddress,
) -> Result<Arc<ServerConfig>> {
    let need = address.option(keys::SSL_NEED_CLIENT_AUTH);
    let want = address.option(keys::SSL_WANT_CLIENT_AUTH);
    let builder = ServerConfig::builder_with_provider(Arc::clone(policy.provider()))
        .with_protocol_versions(policy.versions())
        .map_err(|error| misconfigured(format!("protocol versions: {error}")))?;
    let builder = if need || want {
        let roots = Arc::new(material.root_store()?);
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(policy.provider()));
        let verifier = if need {
            verifier
        } else {
            verifier.allow_unauthenticated()
        };
        let verifier = verifier
            .build()
            .map_err(|error| misconfigured(format!("client verifier for `{address}`: {error}")))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };
    Ok(Arc::new(
        builder.with_cert_resolver(Arc::new(SelectedIdentity(identity))),
    ))
}

/// 发起侧配置：以信任锚校验服务端，`identity` 存在时在服务端要求时出示。
pub(crate) fn client_config(
    policy: &TlsPolicy,
    material: &KeyMaterial,
    identity: Option<Arc<CertifiedKey>>,
) -> Result<Arc<ClientConfig>> {
    if material.trust_anchors().is_empty() {
        return Err(misconfigured("key store holds no trust anchor to verify servers"));
    }
    let builder = ClientConfig::builder_with_provider(Arc::clone(policy.provider()))
        .with_protocol_versions(policy.versions())
        .map_err(|error| misconfigured(format!("protocol versions: {error}")))?
        .with_root_certificates(material.root_store()?);
    let config = match identity {
        Some(identity) => builder.with_client_cert_resolver(Arc::new(SelectedIdentity(identity))),
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}
