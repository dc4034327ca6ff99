//! # address 模块说明
//!
//! ## 角色定位（Why）
//! - 资源地址是传输桥的“叶子”概念：描述一个端点的 scheme、外部 URI、选项、下层地址、替代地址
//!   以及运行在其上的下一协议；
//! - 绑定注册表、分发器、会话链都以 [`ResourceAddress`] 而非裸套接字地址交流，
//!   上层因此能看到带协议语义的本地/远端地址。
//!
//! ## 契约（What）
//! - 地址构造后不可变，内部用 `Arc` 共享，克隆只增加引用计数；
//! - 只能通过 [`ResourceAddressFactory`] 构造，工厂负责校验 URI、委托下层、附加替代地址；
//! - 两个地址“绑定相等”当且仅当 [`BindKey`] 相等：scheme、物理 authority/path、
//!   影响绑定的选项子集以及下层绑定键一致，与 `nextProtocol` 无关。

mod factory;
mod options;
mod scheme;
mod uri;

use std::fmt;
use std::sync::Arc;

pub use factory::ResourceAddressFactory;
pub use options::{
    KeySelectionContext, KeySelector, OptionKey, OptionType, OptionValue, ResourceOptions, keys,
};
pub use scheme::{LayerKind, Scheme, SchemeCapabilities, SniffFn, TransportKind};
pub use uri::ResourceUri;

/// 物理层面的绑定身份。
///
/// 作为注册表的键使用；`Ord` 保证虚拟主机索引的遍历顺序稳定。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindKey(Arc<BindKeyInner>);

#[derive(PartialEq, Eq, Hash, PartialOrd, Ord)]
struct BindKeyInner {
    scheme: Scheme,
    authority: String,
    path: String,
    qualifiers: Vec<(String, String)>,
    transport: Option<BindKey>,
}

impl BindKey {
    pub fn scheme(&self) -> Scheme {
        self.0.scheme
    }

    pub fn transport(&self) -> Option<&BindKey> {
        self.0.transport.as_ref()
    }
}

impl fmt::Display for BindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.0.scheme, self.0.authority, self.0.path)?;
        for (name, value) in &self.0.qualifiers {
            write!(f, ";{name}={value}")?;
        }
        if let Some(transport) = &self.0.transport {
            write!(f, " over {transport}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BindKey({self})")
    }
}

/// 不可变的资源地址。
///
/// # 教案式说明
/// - **意图 (Why)**：把一个服务端点在各协议层的完整描述固化下来，绑定、分发、会话构造都基于同一份快照；
/// - **契约 (What)**：
///   - `external_uri` 为服务配置时的原始 URI，沿下层链向下继承；
///   - `resource_uri` 为本层自己的 URI（例如 `ssl://h:443` 的下层为 `tcp://h:443`，
///     若设置了 `bind` 选项则物理层 URI 被改写为监听端点）；
///   - `transport` 链有限且无环，链底一定是物理传输 scheme；
///   - `alternate` 构成单链表，首个元素是首选路径。
/// - **设计权衡 (Trade-offs)**：绑定键在构造时预先计算，避免注册表热路径上重复拼接字符串。
#[derive(Clone)]
pub struct ResourceAddress {
    inner: Arc<AddressInner>,
}

struct AddressInner {
    scheme: Scheme,
    external_uri: ResourceUri,
    resource_uri: ResourceUri,
    options: ResourceOptions,
    transport: Option<ResourceAddress>,
    alternate: Option<ResourceAddress>,
    next_protocol: Option<Arc<str>>,
    bind_key: BindKey,
}

impl ResourceAddress {
    pub(crate) fn assemble(
        scheme: Scheme,
        external_uri: ResourceUri,
        resource_uri: ResourceUri,
        options: ResourceOptions,
        transport: Option<ResourceAddress>,
        alternate: Option<ResourceAddress>,
    ) -> Self {
        let next_protocol = options.get(keys::NEXT_PROTOCOL);
        let path = if scheme.is_physical() {
            "/".to_owned()
        } else {
            resource_uri.path().to_owned()
        };
        let bind_key = BindKey(Arc::new(BindKeyInner {
            scheme,
            authority: resource_uri.authority(),
            path,
            qualifiers: options.bind_qualifiers(),
            transport: transport.as_ref().map(|t| t.bind_key().clone()),
        }));
        Self {
            inner: Arc::new(AddressInner {
                scheme,
                external_uri,
                resource_uri,
                options,
                transport,
                alternate,
                next_protocol,
                bind_key,
            }),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.inner.scheme
    }

    pub fn external_uri(&self) -> &ResourceUri {
        &self.inner.external_uri
    }

    pub fn resource_uri(&self) -> &ResourceUri {
        &self.inner.resource_uri
    }

    pub fn host(&self) -> Option<&str> {
        self.inner.resource_uri.host()
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.resource_uri.port()
    }

    pub fn options(&self) -> &ResourceOptions {
        &self.inner.options
    }

    /// 读取选项，未设置时返回默认值。
    pub fn option<T: OptionType>(&self, key: OptionKey<T>) -> T {
        self.inner.options.get(key)
    }

    pub fn transport(&self) -> Option<&ResourceAddress> {
        self.inner.transport.as_ref()
    }

    pub fn alternate(&self) -> Option<&ResourceAddress> {
        self.inner.alternate.as_ref()
    }

    pub fn next_protocol(&self) -> Option<&str> {
        self.inner.next_protocol.as_deref()
    }

    pub fn bind_key(&self) -> &BindKey {
        &self.inner.bind_key
    }

    /// 物理层面是否为同一端点。
    pub fn is_bind_equal(&self, other: &ResourceAddress) -> bool {
        self.inner.bind_key == other.inner.bind_key
    }

    /// 自身及后续全部替代地址，首选在前。
    pub fn alternates(&self) -> Alternates<'_> {
        Alternates {
            next: Some(self),
        }
    }

    /// 自身及全部下层地址，自上而下。
    pub fn transport_chain(&self) -> TransportChain<'_> {
        TransportChain {
            next: Some(self),
        }
    }

    /// 链底的物理传输地址。
    pub fn lowest_transport(&self) -> &ResourceAddress {
        let mut current = self;
        while let Some(lower) = current.transport() {
            current = lower;
        }
        current
    }

    pub(crate) fn same_instance(&self, other: &ResourceAddress) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ResourceAddress {
    fn eq(&self, other: &Self) -> bool {
        if self.same_instance(other) {
            return true;
        }
        let (a, b) = (&*self.inner, &*other.inner);
        a.scheme == b.scheme
            && a.resource_uri == b.resource_uri
            && a.external_uri == b.external_uri
            && a.next_protocol == b.next_protocol
            && a.transport == b.transport
            && a.options == b.options
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.resource_uri)?;
        if let Some(next) = &self.inner.next_protocol {
            write!(f, " [{next}]")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAddress")
            .field("uri", &self.inner.resource_uri.to_string())
            .field("external", &self.inner.external_uri.to_string())
            .field("next_protocol", &self.inner.next_protocol)
            .field("transport", &self.inner.transport)
            .field("has_alternate", &self.inner.alternate.is_some())
            .finish()
    }
}

/// 替代地址迭代器。
pub struct Alternates<'a> {
    next: Option<&'a ResourceAddress>,
}

impl<'a> Iterator for Alternates<'a> {
    type Item = &'a ResourceAddress;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.alternate();
        Some(current)
    }
}

/// 下层地址迭代器。
pub struct TransportChain<'a> {
    next: Option<&'a ResourceAddress>,
}

impl<'a> Iterator for TransportChain<'a> {
    type Item = &'a ResourceAddress;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.transport();
        Some(current)
    }
}
