//! 绑定生命周期：引用计数、冲突检测、替代地址链回滚与物理监听的按需开闭。
//!
//! # 教案级注释概览
//! - **核心目标 (Why)**：物理监听只在绑定键上的第一条绑定出现时打开、最后一条消失时关闭；
//!   协议层绑定失败时，已经完成的下层与替代地址必须全部撤销；
//! - **手法 (How)**：以内存监听器统计 `bind` / `unbind` 次数，直接观察各 scheme 注册表；
//! - **边界 (What)**：不涉及真实 socket，解绑 future 在内存实现下同步就绪。

mod common;

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use common::Gateway;
use futures::FutureExt;
use parking_lot::Mutex;
use spark_bridge::error::codes;
use spark_bridge::test_stubs::{ManualTimer, MockPhysicalBinder, RecordingHandler};
use spark_bridge::{
    Bridge, BridgeConfig, BridgeHandler, ConnectionSink, PhysicalBinder, ResourceAddress, ResourceOptions, Result, Scheme,
    UnbindFuture,
};

fn handler() -> Arc<dyn BridgeHandler> {
    Arc::new(RecordingHandler::new())
}

#[test]
fn rebinding_with_the_same_handler_shares_one_listener() {
    let gateway = Gateway::new();
    let address = gateway.address("tcp://127.0.0.1:7000");
    let service = handler();

    gateway.bridge.bind(&address, service.clone(), None).expect("首次绑定");
    gateway.bridge.bind(&address, service.clone(), None).expect("同一处理器重复绑定");
    assert_eq!(gateway.binder.bind_count(), 1, "物理监听只打开一次");

    let registry = gateway.bridge.registry(Scheme::Tcp).expect("tcp 接入器已注册");
    assert_eq!(registry.get_binding(&address).map(|b| b.ref_count()), Some(2));

    gateway.unbind(&address);
    assert!(gateway.binder.is_bound(&address), "引用计数未归零前监听保持");
    gateway.unbind(&address);
    assert!(!gateway.binder.is_bound(&address));
    assert_eq!(gateway.binder.unbind_count(), 1);
    assert!(registry.is_empty());
}

#[test]
fn another_handler_on_the_same_protocol_conflicts() {
    let gateway = Gateway::new();
    let address = gateway.address("tcp://127.0.0.1:7001");
    gateway.bridge.bind(&address, handler(), None).expect("首次绑定");

    let error = gateway
        .bridge
        .bind(&address, handler(), None)
        .expect_err("不同处理器必须冲突");
    assert_eq!(error.code(), codes::BINDING_CONFLICT);
    assert!(error.is_configuration());
    assert!(error.to_string().contains("127.0.0.1:7001"), "错误信息必须指出冲突地址");
    assert_eq!(gateway.binder.bind_count(), 1);
}

#[test]
fn layered_bindings_share_the_physical_listener_with_raw() {
    let gateway = Gateway::new();
    let raw = gateway.address("tcp://127.0.0.1:7002");
    let http = gateway.address("http://127.0.0.1:7002/");

    gateway.bridge.bind(&raw, handler(), None).expect("原始绑定");
    gateway.bridge.bind(&http, handler(), None).expect("http 绑定");
    assert_eq!(gateway.binder.bind_count(), 1, "同一端口只监听一次");

    let tcp = gateway.bridge.registry(Scheme::Tcp).expect("tcp 注册表");
    let group = tcp.get_binding0(&raw).expect("端口上应有分组");
    assert_eq!(group.candidate_count(), 2);
    assert_eq!(group.named_protocols().collect::<Vec<_>>(), vec!["http"]);

    gateway.unbind(&http);
    assert!(gateway.binder.is_bound(&raw), "原始绑定仍持有监听");
    assert!(gateway.bridge.registry(Scheme::Http).expect("http 注册表").is_empty());
    gateway.unbind(&raw);
    assert!(!gateway.binder.is_bound(&raw));
}

#[test]
fn failed_alternate_rolls_back_the_whole_chain() {
    let gateway = Gateway::new();
    let occupant = gateway.address("wsx://127.0.0.1:7003/chat");
    gateway.bridge.bind(&occupant, handler(), None).expect("预先占用 wsx");

    let ws = gateway.address("ws://127.0.0.1:7003/chat");
    assert_eq!(
        ws.alternates().map(|a| a.scheme()).collect::<Vec<_>>(),
        vec![Scheme::Ws, Scheme::Wse, Scheme::Wsx]
    );
    let error = gateway
        .bridge
        .bind(&ws, handler(), None)
        .expect_err("wsx 替代地址冲突时整体失败");
    assert_eq!(error.code(), codes::BINDING_CONFLICT);

    assert!(gateway.bridge.registry(Scheme::Ws).expect("ws").is_empty(), "ws 必须撤销");
    assert!(gateway.bridge.registry(Scheme::Wse).expect("wse").is_empty(), "wse 必须撤销");
    let http = gateway.bridge.registry(Scheme::Http).expect("http");
    assert_eq!(http.snapshot().len(), 1, "http 层只剩占用者的下层绑定");
    let tcp = gateway.bridge.registry(Scheme::Tcp).expect("tcp");
    assert_eq!(
        tcp.snapshot().first().map(|b| b.ref_count()),
        Some(1),
        "回滚后物理绑定的引用计数恢复"
    );
    assert_eq!(gateway.binder.bind_count(), 1);
}

#[test]
fn physical_bind_failure_leaves_no_layer_binding() {
    let gateway = Gateway::new();
    let http = gateway.address("http://127.0.0.1:7004/");
    let transport = http.transport().expect("http 有下层").clone();
    gateway.binder.fail_on(&transport);

    let error = gateway
        .bridge
        .bind(&http, handler(), None)
        .expect_err("端口占用时绑定失败");
    assert_eq!(error.code(), codes::BIND_FAILED);
    assert!(gateway.bridge.registry(Scheme::Http).expect("http").is_empty());
    assert!(gateway.bridge.registry(Scheme::Tcp).expect("tcp").is_empty());

    gateway.bridge.bind(&http, handler(), None).expect("端口释放后可再次绑定");
    assert!(gateway.binder.is_bound(&transport));
}

#[test]
fn unsupported_scheme_is_reported() {
    let gateway = Gateway::new();
    let address = gateway.address("udp://127.0.0.1:7005");
    let error = gateway
        .bridge
        .bind(&address, handler(), None)
        .expect_err("未注册 udp 接入器");
    assert_eq!(error.code(), codes::UNSUPPORTED_SCHEME);
}

#[test]
fn unbinding_an_unknown_address_succeeds() {
    let gateway = Gateway::new();
    let address = gateway.address("tcp://127.0.0.1:7006");
    gateway.unbind(&address);
    assert_eq!(gateway.binder.unbind_count(), 0);
}

#[test]
fn shutdown_releases_every_bound_address() {
    let gateway = Gateway::new();
    let raw = gateway.address("tcp://127.0.0.1:7007");
    let ws = gateway.address("ws://127.0.0.1:7008/echo");
    gateway.bridge.bind(&raw, handler(), None).expect("原始绑定");
    gateway.bridge.bind(&ws, handler(), None).expect("ws 绑定");
    assert_eq!(gateway.binder.active().len(), 2);

    gateway
        .bridge
        .shutdown()
        .now_or_never()
        .expect("内存解绑同步完成")
        .expect("关闭不应失败");
    assert!(gateway.binder.active().is_empty());
    for scheme in [Scheme::Tcp, Scheme::Http, Scheme::Ws, Scheme::Wse, Scheme::Wsx] {
        assert!(
            gateway.bridge.registry(scheme).expect("接入器已注册").is_empty(),
            "{scheme} 注册表应为空"
        );
    }
}

/// 在 `bind` 中停住、直到测试放行的监听器，用来制造“监听尚未打开”的时间窗。
struct GatedBinder {
    inner: MockPhysicalBinder,
    entered: Sender<()>,
    release: Mutex<Receiver<()>>,
}

impl PhysicalBinder for GatedBinder {
    fn bind(&self, address: &ResourceAddress, sink: Arc<dyn ConnectionSink>) -> Result<()> {
        let _ = self.entered.send(());
        let _ = self.release.lock().recv();
        self.inner.bind(address, sink)
    }

    fn unbind(&self, address: &ResourceAddress) -> UnbindFuture {
        self.inner.unbind(address)
    }
}

#[test]
fn concurrent_rebind_waits_for_the_physical_listener() {
    let (entered_tx, entered) = mpsc::channel();
    let (release, release_rx) = mpsc::channel();
    let binder = Arc::new(GatedBinder {
        inner: MockPhysicalBinder::new(),
        entered: entered_tx,
        release: Mutex::new(release_rx),
    });
    let bridge = Bridge::builder(BridgeConfig::default(), Arc::new(ManualTimer::new()))
        .physical(Scheme::Tcp, binder.clone())
        .build()
        .expect("网关应能构造");
    let address = bridge
        .new_address("tcp://127.0.0.1:7009", ResourceOptions::new())
        .expect("地址");
    binder.inner.fail_on(&address);
    let service = handler();

    let first = {
        let (bridge, address, service) = (bridge.clone(), address.clone(), service.clone());
        thread::spawn(move || bridge.bind(&address, service, None))
    };
    entered.recv().expect("第一次绑定进入物理监听");
    let second = {
        let (bridge, address, service) = (bridge.clone(), address.clone(), service.clone());
        thread::spawn(move || bridge.bind(&address, service, None))
    };
    thread::sleep(Duration::from_millis(50));
    release.send(()).expect("放行第一次绑定");
    release.send(()).expect("放行第二次绑定");

    let first = first.join().expect("线程不应 panic");
    let second = second.join().expect("线程不应 panic");
    assert_eq!(first.expect_err("端口被占用").code(), codes::BIND_FAILED);
    second.expect("监听失败后，后来者自行打开监听");

    assert!(binder.inner.is_bound(&address), "注册表中的绑定必须有真实监听");
    assert_eq!(binder.inner.bind_count(), 1);
    let registry = bridge.registry(Scheme::Tcp).expect("tcp 接入器已注册");
    assert_eq!(registry.get_binding(&address).map(|b| b.ref_count()), Some(1));
}
