//! 证书与信任锚存储，支持热更新。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::RootCertStore;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use spark_bridge::Result;
use tracing::info;

use crate::TARGET_LAYER;
use crate::error::misconfigured;

/// 某一时刻的全部密钥材料。
///
/// 握手开始时取一次快照，握手与之后的整个连接生命周期都只使用这份快照。
#[derive(Clone, Default)]
pub struct KeyMaterial {
    identities: BTreeMap<Arc<str>, Arc<CertifiedKey>>,
    trust_anchors: Vec<CertificateDer<'static>>,
    generation: u64,
}

impl KeyMaterial {
    /// 别名按字典序排列。
    pub fn aliases(&self) -> Vec<Arc<str>> {
        self.identities.keys().cloned().collect()
    }

    pub fn identity(&self, alias: &str) -> Option<Arc<CertifiedKey>> {
        self.identities.get(alias).cloned()
    }

    pub fn trust_anchors(&self) -> &[CertificateDer<'static>] {
        &self.trust_anchors
    }

    /// 每次修改递增，便于日志关联“哪一版证书参与了握手”。
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 由信任锚构造根证书库；任何一张证书无法解析都视为配置错误。
    pub fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for anchor in &self.trust_anchors {
            roots
                .add(anchor.clone())
                .map_err(|error| misconfigured(format!("invalid trust anchor: {error}")))?;
        }
        Ok(roots)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("aliases", &self.aliases())
            .field("trust_anchors", &self.trust_anchors.len())
            .field("generation", &self.generation)
            .finish()
    }
}

/// 进程内密钥库。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 证书轮换不能中断已有连接：读路径经 [`ArcSwap`] 无锁取得快照，写路径以 RCU 方式整体替换；
/// - 服务端身份（别名 → 证书链 + 私钥）与客户端信任锚放在同一份材料里，
///   接入侧与发起侧共享同一套轮换机制。
///
/// ## 契约（What）
/// - 修改只影响之后开始的握手，已经建立或正在握手的连接继续持有旧快照；
/// - 私钥在插入时即解析为签名密钥，格式不受支持时返回配置错误，库内容不变。
///
/// ## 风险与权衡（Trade-offs）
/// - 每次修改复制整份材料，适合“偶尔轮换、频繁读取”的负载。
pub struct KeyStore {
    material: ArcSwap<KeyMaterial>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            material: ArcSwap::from_pointee(KeyMaterial::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<KeyMaterial> {
        self.material.load_full()
    }

    pub fn aliases(&self) -> Vec<Arc<str>> {
        self.material.load().aliases()
    }

    /// 以 `alias` 登记一个身份；同名身份被替换。
    pub fn insert_identity(
        &self,
        alias: &str,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<()> {
        if chain.is_empty() {
            return Err(misconfigured(format!("identity `{alias}` has an empty chain")));
        }
        let signing_key = any_supported_type(&key)
            .map_err(|error| misconfigured(format!("identity `{alias}`: {error}")))?;
        let certified = Arc::new(CertifiedKey::new(chain, signing_key));
        let alias: Arc<str> = Arc::from(alias);
        self.update(|material| {
            material
                .identities
                .insert(Arc::clone(&alias), Arc::clone(&certified));
        });
        info!(target: TARGET_LAYER, %alias, "tls identity installed");
        Ok(())
    }

    pub fn remove_identity(&self, alias: &str) -> bool {
        let mut removed = false;
        self.update(|material| removed = material.identities.remove(alias).is_some());
        removed
    }

    pub fn add_trust_anchor(&self, certificate: CertificateDer<'static>) {
        self.update(|material| {
            if !material.trust_anchors.contains(&certificate) {
                material.trust_anchors.push(certificate.clone());
            }
        });
    }

    /// 整体替换信任锚。
    pub fn replace_trust_anchors(&self, anchors: Vec<CertificateDer<'static>>) {
        self.update(|material| material.trust_anchors = anchors.clone());
    }

    fn update(&self, mut change: impl FnMut(&mut KeyMaterial)) {
        self.material.rcu(|current| {
            let mut next = KeyMaterial::clone(current);
            change(&mut next);
            next.generation = current.generation + 1;
            next
        });
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyStore").field(&self.snapshot()).finish()
    }
}
