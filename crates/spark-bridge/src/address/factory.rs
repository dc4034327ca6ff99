//! # ResourceAddressFactory：资源地址工厂
//!
//! ## 核心意图（Why）
//! - 地址只能由工厂构造：工厂是唯一知道“某 scheme 需要哪些 URI 组成部分、下层是谁、
//!   有哪些替代路径”的地方；
//! - 下层地址通过递归委托给下层 scheme 的规则生成（`ssl` → `tcp`，`ws` → `http` → `tcp`）。
//!
//! ## 行为契约（What）
//! - `new_resource_address`：校验 URI，缺失必需的 host/port 时返回
//!   [`BridgeError::InvalidAddress`]；可选端口按能力表回填默认值；
//! - 下层地址的 `nextProtocol` 固定为本层协议名，上层选项（去掉身份相关键）向下继承；
//! - 替代地址链从“最保守的回退”开始构造并逐个前插，最终链表首个元素是首选路径。
//!
//! ## 风险提示（Trade-offs）
//! - 工厂无状态，可随处 `Copy`；若将来需要可插拔 scheme，应改为持有规则表而不是扩展枚举。

use std::sync::Arc;

use super::{ResourceAddress, ResourceOptions, ResourceUri, Scheme, keys};
use crate::error::{BridgeError, Result};

/// 资源地址工厂。
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceAddressFactory;

impl ResourceAddressFactory {
    pub fn new() -> Self {
        Self
    }

    /// 从 URI 文本与选项构造地址。
    pub fn new_resource_address(&self, uri: &str, options: ResourceOptions) -> Result<ResourceAddress> {
        let parsed = ResourceUri::parse(uri)?;
        self.from_uri(&parsed, options)
    }

    /// 从已解析的 URI 构造地址。
    pub fn from_uri(&self, uri: &ResourceUri, options: ResourceOptions) -> Result<ResourceAddress> {
        self.build(uri, uri.clone(), options, true)
    }

    /// 以相同端点派生一个 `nextProtocol` 不同的地址。
    pub fn with_next_protocol(&self, address: &ResourceAddress, next_protocol: Option<&str>) -> ResourceAddress {
        let mut options = address.options().clone();
        options.set(keys::NEXT_PROTOCOL, next_protocol.map(Arc::from));
        ResourceAddress::assemble(
            address.scheme(),
            address.external_uri().clone(),
            address.resource_uri().clone(),
            options,
            address.transport().cloned(),
            address.alternate().cloned(),
        )
    }

    /// 协议解析完成后构造候选地址：原绑定地址 + 已解析的下一协议 + 实际观测到的下层。
    ///
    /// 候选地址不携带替代链，它只用于查找具体绑定与作为会话本地地址。
    pub fn resolve_candidate(
        &self,
        bind_address: &ResourceAddress,
        next_protocol: Option<&str>,
        observed_transport: Option<&ResourceAddress>,
    ) -> ResourceAddress {
        let mut options = bind_address.options().clone();
        options.set(keys::NEXT_PROTOCOL, next_protocol.map(Arc::from));
        options.remove(keys::ALTERNATE);
        let transport = observed_transport
            .or_else(|| bind_address.transport())
            .cloned();
        ResourceAddress::assemble(
            bind_address.scheme(),
            bind_address.external_uri().clone(),
            bind_address.resource_uri().clone(),
            options,
            transport,
            None,
        )
    }

    /// 构造对端地址，例如 `tcp://127.0.0.1:50312` 或其上的 `ssl://127.0.0.1:50312`。
    pub fn peer_address(
        &self,
        scheme: Scheme,
        authority: &str,
        transport: Option<ResourceAddress>,
    ) -> Result<ResourceAddress> {
        let uri = ResourceUri::parse(&format!("{scheme}://{authority}"))?;
        Ok(ResourceAddress::assemble(
            scheme,
            uri.clone(),
            uri,
            ResourceOptions::new(),
            transport,
            None,
        ))
    }

    fn build(
        &self,
        external: &ResourceUri,
        uri: ResourceUri,
        options: ResourceOptions,
        with_alternates: bool,
    ) -> Result<ResourceAddress> {
        let scheme = Scheme::parse(uri.scheme()).ok_or_else(|| BridgeError::UnsupportedScheme {
            scheme: uri.scheme().to_owned(),
            uri: uri.to_string(),
        })?;
        let capabilities = scheme.capabilities();

        let mut uri = uri;
        if capabilities.requires_host && uri.host().is_none() {
            return Err(BridgeError::invalid_address(uri.to_string(), "missing host"));
        }
        if uri.port().is_none() {
            if capabilities.requires_port {
                return Err(BridgeError::invalid_address(uri.to_string(), "missing port"));
            }
            if let Some(port) = capabilities.default_port {
                uri = uri.with_authority(uri.host(), Some(port));
            }
        }

        let resource = match options.get(keys::BIND) {
            Some(bind) if scheme.is_physical() => apply_bind(&uri, &bind)?,
            _ => uri,
        };

        let transport = self.transport_for(scheme, external, &resource, &options)?;
        let alternate = match options.get(keys::ALTERNATE) {
            Some(explicit) => Some(explicit),
            None if with_alternates => self.default_alternates(scheme, external, &resource, &options)?,
            None => None,
        };

        Ok(ResourceAddress::assemble(
            scheme,
            external.clone(),
            resource,
            options,
            transport,
            alternate,
        ))
    }

    fn transport_for(
        &self,
        scheme: Scheme,
        external: &ResourceUri,
        resource: &ResourceUri,
        options: &ResourceOptions,
    ) -> Result<Option<ResourceAddress>> {
        if let Some(explicit) = options.get(keys::TRANSPORT) {
            ensure_lower(scheme, &explicit, resource)?;
            return Ok(Some(
                self.with_next_protocol(&explicit, Some(scheme.protocol_name())),
            ));
        }

        let mut lower_options = options.for_lower_layer();
        lower_options.set(
            keys::NEXT_PROTOCOL,
            Some(Arc::from(scheme.protocol_name())),
        );

        if let Some(text) = options.get(keys::TRANSPORT_URI) {
            let lower_uri = ResourceUri::parse(&text)?;
            let lower = self.build(external, lower_uri, lower_options, false)?;
            ensure_lower(scheme, &lower, resource)?;
            return Ok(Some(lower));
        }

        match scheme.default_transport() {
            None => Ok(None),
            Some(lower_scheme) => {
                let mut lower_uri = resource.with_scheme(lower_scheme.as_str());
                if lower_scheme.is_physical() {
                    lower_uri = lower_uri.with_path("/");
                }
                self.build(external, lower_uri, lower_options, false).map(Some)
            }
        }
    }

    fn default_alternates(
        &self,
        scheme: Scheme,
        external: &ResourceUri,
        resource: &ResourceUri,
        options: &ResourceOptions,
    ) -> Result<Option<ResourceAddress>> {
        match scheme {
            Scheme::Ws if options.get(keys::WS_FALLBACK) => {
                let mut head: Option<ResourceAddress> = None;
                // 从最保守的回退开始，逐个前插
                for fallback in [Scheme::Wsx, Scheme::Wse] {
                    let mut fallback_options = options.clone();
                    fallback_options.set(keys::ALTERNATE, head.take());
                    let address = self.build(
                        external,
                        resource.with_scheme(fallback.as_str()),
                        fallback_options,
                        false,
                    )?;
                    head = Some(address);
                }
                Ok(head)
            }
            _ => Ok(None),
        }
    }
}

fn ensure_lower(scheme: Scheme, lower: &ResourceAddress, resource: &ResourceUri) -> Result<()> {
    if lower.transport_chain().any(|address| address.scheme() == scheme) {
        return Err(BridgeError::invalid_address(
            resource.to_string(),
            "transport must be strictly lower than the address itself",
        ));
    }
    Ok(())
}

/// 解析 `bind` 覆盖：支持 `host:port`、`:port`、`port` 与 `[v6]:port`。
fn apply_bind(uri: &ResourceUri, bind: &str) -> Result<ResourceUri> {
    let bind = bind.trim();
    let authority = if bind.chars().all(|c| c.is_ascii_digit()) {
        format!("0.0.0.0:{bind}")
    } else if let Some(port) = bind.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        bind.to_owned()
    };
    let parsed = ResourceUri::parse(&format!("{}://{authority}", uri.scheme()))?;
    if parsed.port().is_none() {
        return Err(BridgeError::invalid_address(
            uri.to_string(),
            "bind override must include a port",
        ));
    }
    Ok(uri.with_authority(parsed.host(), parsed.port()))
}
