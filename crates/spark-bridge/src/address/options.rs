//! # options 模块说明
//!
//! ## 角色定位（Why）
//! - 资源地址携带一个强类型选项袋：键是编译期常量 [`OptionKey<T>`]，值统一存放为 [`OptionValue`]；
//! - 读取未设置的键永远返回该键声明的默认值，不会失败。
//!
//! ## 契约（What）
//! - 选项在地址构造时确定，之后只读；只有地址工厂会基于已有选项派生新的选项袋；
//! - 标记了 `affects_bind` 的键参与绑定键计算，其余键（如 TLS 套件列表）不影响“物理同一性”。
//!
//! ## 风险提示（Trade-offs）
//! - 值类型不匹配时读取返回默认值而非报错，调用方若需要严格校验应在构造前自行检查。

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::ResourceAddress;

/// 证书别名选择上下文。
#[derive(Debug)]
pub struct KeySelectionContext<'a> {
    /// 服务端：绑定在同一物理端点上的全部虚拟主机名（字典序）；客户端：目标主机名。
    pub hosts: &'a [Arc<str>],
    /// 密钥库中当前可用的别名。
    pub aliases: &'a [Arc<str>],
    /// 是否服务端选择。
    pub server: bool,
}

/// 依据连接上下文挑选证书别名的能力。
pub trait KeySelector: Send + Sync + fmt::Debug + 'static {
    /// 返回选中的别名；`None` 表示无可用证书。
    fn select(&self, context: &KeySelectionContext<'_>) -> Option<Arc<str>>;
}

/// 选项值的统一存储形态。
#[derive(Clone, Debug)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Duration(Duration),
    Text(Arc<str>),
    List(Arc<[Arc<str>]>),
    Address(ResourceAddress),
    KeySelector(Arc<dyn KeySelector>),
}

impl PartialEq for OptionValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OptionValue::Bool(a), OptionValue::Bool(b)) => a == b,
            (OptionValue::Int(a), OptionValue::Int(b)) => a == b,
            (OptionValue::Duration(a), OptionValue::Duration(b)) => a == b,
            (OptionValue::Text(a), OptionValue::Text(b)) => a == b,
            (OptionValue::List(a), OptionValue::List(b)) => a == b,
            (OptionValue::Address(a), OptionValue::Address(b)) => a == b,
            (OptionValue::KeySelector(a), OptionValue::KeySelector(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(v) => write!(f, "{v}"),
            OptionValue::Int(v) => write!(f, "{v}"),
            OptionValue::Duration(v) => write!(f, "{}ms", v.as_millis()),
            OptionValue::Text(v) => f.write_str(v),
            OptionValue::List(items) => {
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(",")?;
                    }
                    f.write_str(item)?;
                }
                Ok(())
            }
            OptionValue::Address(address) => write!(f, "{address}"),
            OptionValue::KeySelector(selector) => write!(f, "{selector:?}"),
        }
    }
}

/// 可存入选项袋的 Rust 类型。
pub trait OptionType: Sized + Clone {
    /// `None` 表示“未设置”，写入时会移除该键。
    fn into_value(self) -> Option<OptionValue>;
    fn from_value(value: &OptionValue) -> Option<Self>;
}

impl OptionType for bool {
    fn into_value(self) -> Option<OptionValue> {
        Some(OptionValue::Bool(self))
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl OptionType for i64 {
    fn into_value(self) -> Option<OptionValue> {
        Some(OptionValue::Int(self))
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl OptionType for Duration {
    fn into_value(self) -> Option<OptionValue> {
        Some(OptionValue::Duration(self))
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::Duration(v) => Some(*v),
            _ => None,
        }
    }
}

impl OptionType for Arc<str> {
    fn into_value(self) -> Option<OptionValue> {
        Some(OptionValue::Text(self))
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::Text(v) => Some(Arc::clone(v)),
            _ => None,
        }
    }
}

impl OptionType for Vec<Arc<str>> {
    fn into_value(self) -> Option<OptionValue> {
        Some(OptionValue::List(self.into()))
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::List(items) => Some(items.to_vec()),
            _ => None,
        }
    }
}

impl OptionType for ResourceAddress {
    fn into_value(self) -> Option<OptionValue> {
        Some(OptionValue::Address(self))
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::Address(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl OptionType for Arc<dyn KeySelector> {
    fn into_value(self) -> Option<OptionValue> {
        Some(OptionValue::KeySelector(self))
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::KeySelector(v) => Some(Arc::clone(v)),
            _ => None,
        }
    }
}

impl<T: OptionType> OptionType for Option<T> {
    fn into_value(self) -> Option<OptionValue> {
        self.and_then(T::into_value)
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        T::from_value(value).map(Some)
    }
}

/// 强类型选项键。
///
/// # 教案式说明
/// - **意图 (Why)**：把“键名 + 值类型 + 默认值 + 是否影响绑定”绑在一个编译期常量上，
///   读写两侧不会出现类型漂移；
/// - **契约 (What)**：`default` 为函数指针，保证常量可以在 `const` 上下文中声明；
/// - **设计权衡 (Trade-offs)**：选项袋内部按名称存储，两个同名不同类型的键会互相覆盖，
///   因此全部内建键集中在 [`keys`] 模块声明。
pub struct OptionKey<T> {
    name: &'static str,
    default: fn() -> T,
    affects_bind: bool,
}

impl<T> Clone for OptionKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for OptionKey<T> {}

impl<T> fmt::Debug for OptionKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionKey")
            .field("name", &self.name)
            .field("affects_bind", &self.affects_bind)
            .finish()
    }
}

impl<T: OptionType> OptionKey<T> {
    pub const fn new(name: &'static str, default: fn() -> T) -> Self {
        Self {
            name,
            default,
            affects_bind: false,
        }
    }

    /// 标记该键参与绑定键计算。
    pub const fn affecting_bind(self) -> Self {
        Self {
            affects_bind: true,
            ..self
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn affects_bind(&self) -> bool {
        self.affects_bind
    }

    pub fn default_value(&self) -> T {
        (self.default)()
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Entry {
    value: OptionValue,
    affects_bind: bool,
}

/// 地址的选项袋。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceOptions {
    entries: BTreeMap<Cow<'static, str>, Entry>,
}

impl ResourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 构造器风格写入。
    pub fn with<T: OptionType>(mut self, key: OptionKey<T>, value: T) -> Self {
        self.set(key, value);
        self
    }

    /// 写入；`value` 转换为“未设置”时移除该键。
    pub fn set<T: OptionType>(&mut self, key: OptionKey<T>, value: T) {
        match value.into_value() {
            Some(value) => {
                self.entries.insert(
                    Cow::Borrowed(key.name),
                    Entry {
                        value,
                        affects_bind: key.affects_bind,
                    },
                );
            }
            None => {
                self.entries.remove(key.name);
            }
        }
    }

    /// 读取；未设置或类型不匹配时返回键声明的默认值。
    pub fn get<T: OptionType>(&self, key: OptionKey<T>) -> T {
        self.entries
            .get(key.name)
            .and_then(|entry| T::from_value(&entry.value))
            .unwrap_or_else(|| key.default_value())
    }

    pub fn contains<T>(&self, key: OptionKey<T>) -> bool {
        self.entries.contains_key(key.name)
    }

    pub fn remove<T>(&mut self, key: OptionKey<T>) {
        self.entries.remove(key.name);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.as_ref(), &entry.value))
    }

    /// 参与绑定键计算的 `(名称, 取值)` 列表，按名称排序。
    pub(crate) fn bind_qualifiers(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.affects_bind)
            .map(|(name, entry)| (name.to_string(), entry.value.to_string()))
            .collect()
    }

    /// 派生下层地址使用的选项：去掉本层身份相关的键。
    pub(crate) fn for_lower_layer(&self) -> Self {
        let mut lower = self.clone();
        lower.remove(keys::NEXT_PROTOCOL);
        lower.remove(keys::TRANSPORT);
        lower.remove(keys::TRANSPORT_URI);
        lower.remove(keys::ALTERNATE);
        lower
    }
}

fn none<T>() -> Option<T> {
    None
}

fn no() -> bool {
    false
}

fn yes() -> bool {
    true
}

fn empty<T>() -> Vec<T> {
    Vec::new()
}

/// 内建选项键。
pub mod keys {
    use std::sync::Arc;

    use super::{KeySelector, OptionKey, empty, no, none, yes};
    use crate::address::ResourceAddress;

    /// 本地址之上运行的协议标签。
    pub const NEXT_PROTOCOL: OptionKey<Option<Arc<str>>> = OptionKey::new("nextProtocol", none);
    /// 显式指定的下层地址。
    pub const TRANSPORT: OptionKey<Option<ResourceAddress>> = OptionKey::new("transport", none);
    /// 以 URI 形式指定下层地址，工厂会按该 URI 构造下层。
    pub const TRANSPORT_URI: OptionKey<Option<Arc<str>>> =
        OptionKey::new("transport.uri", none).affecting_bind();
    /// 显式指定的替代地址。
    pub const ALTERNATE: OptionKey<Option<ResourceAddress>> = OptionKey::new("alternate", none);
    /// 物理绑定覆盖：`host:port`，使外部 URI 与实际监听端点解耦。
    pub const BIND: OptionKey<Option<Arc<str>>> = OptionKey::new("bind", none).affecting_bind();
    pub const KEEP_ALIVE: OptionKey<bool> = OptionKey::new("tcp.keepAlive", no);
    pub const REALM_NAME: OptionKey<Option<Arc<str>>> = OptionKey::new("http.realmName", none);
    pub const REQUIRED_ROLES: OptionKey<Vec<Arc<str>>> =
        OptionKey::new("http.requiredRoles", empty);
    pub const SSL_ENCRYPTION_ENABLED: OptionKey<bool> =
        OptionKey::new("ssl.encryptionEnabled", yes);
    pub const SSL_WANT_CLIENT_AUTH: OptionKey<bool> = OptionKey::new("ssl.wantClientAuth", no);
    pub const SSL_NEED_CLIENT_AUTH: OptionKey<bool> = OptionKey::new("ssl.needClientAuth", no);
    /// 有序的套件名称/别名列表；空列表表示引擎默认集合。
    pub const SSL_CIPHERS: OptionKey<Vec<Arc<str>>> = OptionKey::new("ssl.ciphers", empty);
    /// 协议版本白名单（`TLSv1.2`、`TLSv1.3`）；空列表表示引擎默认集合。
    pub const SSL_PROTOCOLS: OptionKey<Vec<Arc<str>>> = OptionKey::new("ssl.protocols", empty);
    pub const SSL_KEY_SELECTOR: OptionKey<Option<Arc<dyn KeySelector>>> =
        OptionKey::new("ssl.keySelector", none);
    /// `ws` 地址是否自动附加 `wse`/`wsx` 替代地址。
    pub const WS_FALLBACK: OptionKey<bool> = OptionKey::new("ws.fallback", yes);
}
