#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-bridge: 多协议边缘网关的传输桥核心。"]
#![doc = ""]
#![doc = "== 分层模型 =="]
#![doc = "每个被接入或发起的连接在每个协议层（物理 TCP/UDP/管道 → TLS → HTTP/WebSocket 变体）上都对应一个会话；"]
#![doc = "同一物理端点可以同时承载多个下一协议与多个虚拟主机，接入时靠协议嗅探决定把连接交给谁。"]
#![doc = ""]
#![doc = "== 模块地图 =="]
#![doc = "- [`address`]：资源地址模型与工厂；"]
#![doc = "- [`registry`]：按绑定键分组、带引用计数的绑定注册表；"]
#![doc = "- [`dispatch`]：下一协议嗅探、事件排队与补发；"]
#![doc = "- [`session`]：会话链、过滤器链与父子关闭传播；"]
#![doc = "- [`buffer`]：同一 worker 内多会话共享一份负载的写缓冲协议；"]
#![doc = "- [`bridge`]：把上述部件组装为 `bind` / `unbind` / `connect` 门面。"]
#![doc = ""]
#![doc = "== 运行时 =="]
#![doc = "本 crate 不依赖任何执行器：物理 I/O 与定时器通过 [`bridge::PhysicalBinder`]、"]
#![doc = "[`runtime::TimerService`] 注入，tokio 实现位于 `spark-bridge-tcp`，TLS 层位于 `spark-bridge-tls`。"]

pub mod address;
pub mod bridge;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod registry;
pub mod runtime;
pub mod session;
/// 测试桩命名空间：内存物理传输、记录型处理器、手动定时器。
///
/// 集成测试与下游传输 crate 的测试共用这些桩，契约演进时在此单点适配。
pub mod test_stubs;

pub use address::{BindKey, ResourceAddress, ResourceAddressFactory, ResourceOptions, Scheme};
pub use bridge::{Bridge, BridgeBuilder, ConnectionSink, PhysicalBinder, PhysicalConnector};
pub use buffer::{LayerId, PendingWrite, SessionWriteState, SharedWriteBuffer, WriteArena};
pub use config::BridgeConfig;
pub use dispatch::{NextProtocolDispatcher, ProtocolSniffer, SniffVerdict, SnifferTable};
pub use error::{BridgeError, ErrorCategory, Result};
pub use registry::{Binding, BindingRegistry, NextProtocolBinding};
pub use runtime::{ConnectFuture, TimerHandle, TimerService, UnbindFuture};
pub use session::{
    BridgeHandler, BridgeSession, FilterChain, IdleStatus, SessionFilter, SessionInitializer,
    SessionProcessor, SessionState,
};

#[cfg(feature = "subscriber")]
pub use observability::install_subscriber;
