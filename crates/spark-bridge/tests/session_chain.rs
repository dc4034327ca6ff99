//! 会话链：跨层关闭传播、共享广播与回写路径。

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::Gateway;
use futures::FutureExt;
use spark_bridge::dispatch::ResolvedProtocol;
use spark_bridge::test_stubs::{HandlerEvent, RecordingHandler};
use spark_bridge::{BridgeSession, Scheme};

const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";

#[test]
fn echo_handler_writes_back_through_the_physical_session() {
    let gateway = Gateway::new();
    let address = gateway.address("tcp://127.0.0.1:7400");
    gateway
        .bridge
        .bind(&address, Arc::new(RecordingHandler::echo()), None)
        .expect("绑定");

    let connection = gateway.binder.accept(&address).expect("监听已打开");
    connection.send(b"ping");
    assert_eq!(connection.written(), b"ping");
}

#[test]
fn broadcast_shares_one_payload_across_sessions() {
    let gateway = Gateway::new();
    let address = gateway.address("tcp://127.0.0.1:7401");
    let handler = Arc::new(RecordingHandler::new());
    gateway.bridge.bind(&address, handler.clone(), None).expect("绑定");

    let connections: Vec<_> = (0..3)
        .map(|_| gateway.binder.accept(&address).expect("监听已打开"))
        .collect();
    let sessions = handler.sessions();
    assert_eq!(sessions.len(), 3);

    let payload = Bytes::from_static(b"tick");
    assert_eq!(gateway.bridge.broadcast(&sessions, payload.clone()), 3);
    for connection in &connections {
        assert_eq!(connection.shared_writes(), 1, "广播负载以共享方式下发");
        assert_eq!(connection.written(), b"tick");
    }

    connections[0].disconnect();
    assert_eq!(
        gateway.bridge.broadcast(&sessions, payload),
        2,
        "已关闭的会话被跳过"
    );
}

#[test]
fn physical_disconnect_closes_the_layered_session() {
    let gateway = Gateway::new();
    let address = gateway.address("http://127.0.0.1:7402/");
    let handler = Arc::new(RecordingHandler::new());
    gateway.bridge.bind(&address, handler.clone(), None).expect("绑定");

    let connection = gateway.binder.accept(&address).expect("监听已打开");
    connection.send(REQUEST);
    let child: BridgeSession = handler.last_session().expect("http 会话已建立");
    assert_eq!(child.scheme(), Scheme::Http);
    assert!(child.attribute::<ResolvedProtocol>().is_some());
    let closed = child.close_future();

    connection.disconnect();

    assert!(child.is_closed());
    assert!(closed.now_or_never().is_some(), "关闭完成通知已就绪");
    assert_eq!(
        handler.events_for(child.id()),
        vec![
            HandlerEvent::Created,
            HandlerEvent::Opened,
            HandlerEvent::Message(Bytes::from_static(REQUEST)),
            HandlerEvent::Closed,
        ]
    );
    assert_eq!(child.attribute::<ResolvedProtocol>(), None, "关闭后协议层属性被释放");
    assert!(child.local_address().is_none());
    assert!(connection.session().children().is_empty());
}

#[test]
fn layered_broadcast_reaches_the_physical_writer() {
    let gateway = Gateway::new();
    let address = gateway.address("http://127.0.0.1:7403/");
    let handler = Arc::new(RecordingHandler::new());
    gateway.bridge.bind(&address, handler.clone(), None).expect("绑定");

    let first = gateway.binder.accept(&address).expect("监听已打开");
    let second = gateway.binder.accept(&address).expect("监听已打开");
    first.send(REQUEST);
    second.send(REQUEST);
    let sessions = handler.sessions();
    assert!(sessions.iter().all(|session| session.scheme() == Scheme::Http));

    let delivered = gateway
        .bridge
        .broadcast(&sessions, Bytes::from_static(b"event: ping\n\n"));
    assert_eq!(delivered, 2);
    assert_eq!(first.written(), b"event: ping\n\n");
    assert_eq!(second.shared_writes(), 1);
}

#[test]
fn closing_the_last_layered_session_closes_the_connection() {
    let gateway = Gateway::new();
    let address = gateway.address("http://127.0.0.1:7404/");
    let handler = Arc::new(RecordingHandler::new());
    gateway.bridge.bind(&address, handler.clone(), None).expect("绑定");

    let connection = gateway.binder.accept(&address).expect("监听已打开");
    connection.send(REQUEST);
    let child = handler.last_session().expect("http 会话已建立");
    child.close();

    assert!(connection.is_closed());
    assert_eq!(handler.events_for(child.id()).last(), Some(&HandlerEvent::Closed));
    assert!(child.write_bytes(&b"late"[..]).is_err(), "关闭后写入被拒绝");
}
