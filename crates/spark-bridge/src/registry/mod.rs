//! # registry 模块说明：绑定注册表
//!
//! ## 核心意图（Why）
//! - 每个 scheme 的接入器各持一张注册表，记录“物理地址 + 下一协议 → 处理器”；
//! - 多个服务可以共享同一个物理监听端口，只要它们的下一协议不同；同一处理器重复绑定只增加引用计数。
//!
//! ## 行为契约（What）
//! - [`BindingRegistry::add_binding`]：成功返回 `None`；（物理地址，下一协议）已被其它处理器占用时
//!   返回已存在的绑定且不修改注册表；
//! - [`BindingRegistry::remove_binding`]：引用计数减一，仅在归零并移除时返回 `true`；
//! - [`BindingRegistry::get_binding0`]：按绑定键查找，不关心下一协议，供分发器在嗅探前枚举候选；
//! - [`BindingRegistry::bindings_on_transport`]：按下层绑定键枚举上层分组，虚拟主机据此选择证书。
//!
//! ## 并发模型（How）
//! - 主表为 `DashMap`，增删在 `Entry` 守卫内原子完成；
//! - 下层索引在主表守卫内更新，锁顺序固定为“主表 → 索引”，只读路径从不嵌套持有两把锁。

mod binding;

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

use crate::address::{BindKey, ResourceAddress};
use crate::observability::TARGET_BINDING;
use crate::session::BridgeHandler;

pub use binding::{Binding, NextProtocolBinding};

/// `add_binding` 的详细结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// 新建了一条绑定；`first_on_bind_key` 表示该物理地址此前没有任何绑定。
    Created { first_on_bind_key: bool },
    /// 同一处理器重复绑定，引用计数增加。
    Shared { ref_count: usize },
}

/// `remove_binding` 的详细结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// 不存在匹配的绑定。
    NotBound,
    /// 引用计数减一后仍大于零。
    Released { remaining: usize },
    /// 绑定已移除；`bind_key_released` 表示该物理地址上已没有任何绑定。
    Removed { bind_key_released: bool },
}

/// 并发安全的绑定注册表。
#[derive(Debug, Default)]
pub struct BindingRegistry {
    bindings: DashMap<BindKey, NextProtocolBinding>,
    transport_index: DashMap<BindKey, BTreeSet<BindKey>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加绑定；冲突时返回已存在的绑定。
    pub fn add_binding(&self, binding: Binding) -> Option<Binding> {
        self.try_add(binding).err()
    }

    /// 添加绑定并给出详细结果。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 同一（绑定键，下一协议）上是同一处理器实例：引用计数加一，返回 [`AddOutcome::Shared`]；
    ///   - 是不同处理器：返回 `Err(existing)`，注册表保持不变；
    ///   - 否则插入新绑定，返回 [`AddOutcome::Created`]。
    pub fn try_add(&self, binding: Binding) -> Result<AddOutcome, Binding> {
        let key = binding.address().bind_key().clone();
        let transport_key = key.transport().cloned();
        match self.bindings.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(NextProtocolBinding::new(binding));
                if let Some(transport_key) = transport_key {
                    self.transport_index
                        .entry(transport_key)
                        .or_default()
                        .insert(key.clone());
                }
                trace!(target: TARGET_BINDING, %key, "bind key registered");
                Ok(AddOutcome::Created {
                    first_on_bind_key: true,
                })
            }
            Entry::Occupied(mut occupied) => {
                let group = occupied.get_mut();
                match group.binding_mut(binding.next_protocol()) {
                    Some(existing) if existing.same_handler(binding.handler()) => {
                        Ok(AddOutcome::Shared {
                            ref_count: existing.retain(),
                        })
                    }
                    Some(existing) => Err(existing.clone()),
                    None => {
                        group.insert(binding);
                        Ok(AddOutcome::Created {
                            first_on_bind_key: false,
                        })
                    }
                }
            }
        }
    }

    /// 引用计数减一；仅当绑定被移除时返回 `true`。
    pub fn remove_binding(&self, address: &ResourceAddress, handler: &Arc<dyn BridgeHandler>) -> bool {
        matches!(
            self.try_remove(address, Some(handler)),
            RemoveOutcome::Removed { .. }
        )
    }

    /// 移除绑定并给出详细结果。
    ///
    /// `handler` 为 `None` 时不校验处理器身份（用于按地址解绑）。
    pub fn try_remove(
        &self,
        address: &ResourceAddress,
        handler: Option<&Arc<dyn BridgeHandler>>,
    ) -> RemoveOutcome {
        let key = address.bind_key();
        let Entry::Occupied(mut occupied) = self.bindings.entry(key.clone()) else {
            return RemoveOutcome::NotBound;
        };
        let next = address.next_protocol();
        let group = occupied.get_mut();
        let Some(existing) = group.binding_mut(next) else {
            return RemoveOutcome::NotBound;
        };
        if handler.is_some_and(|handler| !existing.same_handler(handler)) {
            return RemoveOutcome::NotBound;
        }
        let remaining = existing.release();
        if remaining > 0 {
            return RemoveOutcome::Released { remaining };
        }
        group.remove(next);
        if !group.is_empty() {
            return RemoveOutcome::Removed {
                bind_key_released: false,
            };
        }
        occupied.remove();
        if let Some(transport_key) = key.transport()
            && let Entry::Occupied(mut index) = self.transport_index.entry(transport_key.clone())
        {
            index.get_mut().remove(key);
            if index.get().is_empty() {
                index.remove();
            }
        }
        trace!(target: TARGET_BINDING, %key, "bind key released");
        RemoveOutcome::Removed {
            bind_key_released: true,
        }
    }

    /// 按绑定键查找分组（忽略下一协议）。
    pub fn get_binding0(&self, address: &ResourceAddress) -> Option<NextProtocolBinding> {
        self.bindings
            .get(address.bind_key())
            .map(|group| group.value().clone())
    }

    /// 按候选地址（绑定键 + 下一协议）查找具体绑定。
    pub fn get_binding(&self, candidate: &ResourceAddress) -> Option<Binding> {
        self.bindings
            .get(candidate.bind_key())
            .and_then(|group| group.binding(candidate.next_protocol()).cloned())
    }

    /// 以 `transport` 为下层的全部分组，按绑定键排序。
    pub fn bindings_on_transport(&self, transport: &BindKey) -> Vec<NextProtocolBinding> {
        let keys: Vec<BindKey> = match self.transport_index.get(transport) {
            Some(index) => index.iter().cloned().collect(),
            None => return Vec::new(),
        };
        keys.iter()
            .filter_map(|key| self.bindings.get(key).map(|group| group.value().clone()))
            .collect()
    }

    /// 全部绑定的快照。
    pub fn snapshot(&self) -> Vec<Binding> {
        self.bindings
            .iter()
            .flat_map(|group| group.value().bindings().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// 已登记的绑定键数量。
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
