//! 单条绑定与“同一物理地址上的下一协议分组”。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::address::ResourceAddress;
use crate::session::{BridgeHandler, SessionInitializer};

/// 一条绑定：地址 + 处理器 + 可选初始化器 + 引用计数。
///
/// 处理器身份按 `Arc` 指针比较：同一处理器实例重复绑定同一地址只增加引用计数。
#[derive(Clone)]
pub struct Binding {
    address: ResourceAddress,
    handler: Arc<dyn BridgeHandler>,
    initializer: Option<Arc<dyn SessionInitializer>>,
    ref_count: usize,
}

impl Binding {
    pub fn new(
        address: ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> Self {
        Self {
            address,
            handler,
            initializer,
            ref_count: 1,
        }
    }

    pub fn address(&self) -> &ResourceAddress {
        &self.address
    }

    pub fn handler(&self) -> &Arc<dyn BridgeHandler> {
        &self.handler
    }

    pub fn initializer(&self) -> Option<&Arc<dyn SessionInitializer>> {
        self.initializer.as_ref()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn next_protocol(&self) -> Option<&str> {
        self.address.next_protocol()
    }

    /// 是否由同一处理器实例持有。
    pub fn same_handler(&self, handler: &Arc<dyn BridgeHandler>) -> bool {
        Arc::ptr_eq(&self.handler, handler)
    }

    pub(crate) fn retain(&mut self) -> usize {
        self.ref_count += 1;
        self.ref_count
    }

    pub(crate) fn release(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("address", &self.address)
            .field("ref_count", &self.ref_count)
            .field("initializer", &self.initializer.is_some())
            .finish()
    }
}

/// 同一绑定键（物理地址）上按下一协议分组的绑定。
///
/// - 键为 `None` 表示不声明下一协议的原始绑定，排序在所有具名协议之前；
/// - 具名协议按字典序排列，协议分发的并列裁决依赖这一顺序。
#[derive(Clone)]
pub struct NextProtocolBinding {
    bind_address: ResourceAddress,
    bindings: BTreeMap<Option<Arc<str>>, Binding>,
}

impl NextProtocolBinding {
    pub(crate) fn new(binding: Binding) -> Self {
        let bind_address = binding.address().clone();
        let mut bindings = BTreeMap::new();
        bindings.insert(binding.next_protocol().map(Arc::from), binding);
        Self {
            bind_address,
            bindings,
        }
    }

    /// 代表该物理地址的任意一条绑定地址，用于构造候选地址。
    pub fn bind_address(&self) -> &ResourceAddress {
        &self.bind_address
    }

    /// 全部下一协议，原始绑定在前，其余按字典序。
    pub fn protocols(&self) -> Vec<Option<Arc<str>>> {
        self.bindings.keys().cloned().collect()
    }

    /// 具名下一协议，按字典序。
    pub fn named_protocols(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().filter_map(|key| key.as_deref())
    }

    pub fn has_raw(&self) -> bool {
        self.bindings.contains_key(&None)
    }

    pub fn candidate_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn binding(&self, next_protocol: Option<&str>) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|(key, _)| key.as_deref() == next_protocol)
            .map(|(_, binding)| binding)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.values()
    }

    pub(crate) fn binding_mut(&mut self, next_protocol: Option<&str>) -> Option<&mut Binding> {
        self.bindings
            .iter_mut()
            .find(|(key, _)| key.as_deref() == next_protocol)
            .map(|(_, binding)| binding)
    }

    pub(crate) fn insert(&mut self, binding: Binding) {
        self.bindings
            .insert(binding.next_protocol().map(Arc::from), binding);
    }

    /// 移除某个下一协议的绑定；若它正是代表地址，则改用剩余绑定中的第一条。
    pub(crate) fn remove(&mut self, next_protocol: Option<&str>) -> Option<Binding> {
        let key = self
            .bindings
            .keys()
            .find(|key| key.as_deref() == next_protocol)
            .cloned()?;
        let removed = self.bindings.remove(&key)?;
        if removed.address().same_instance(&self.bind_address)
            && let Some(first) = self.bindings.values().next()
        {
            self.bind_address = first.address().clone();
        }
        Some(removed)
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for NextProtocolBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextProtocolBinding")
            .field("bind_key", self.bind_address.bind_key())
            .field("protocols", &self.protocols())
            .finish()
    }
}
