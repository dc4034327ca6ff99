//! 回环 socket 上的端到端行为：接入、分发、回写、广播、断开与解绑。
//!
//! # 教案级注释概览
//! - **目标 (Why)**：内存桩覆盖不到的部分只有真实的 worker 线程、读循环与写循环，
//!   这里用 127.0.0.1 上的端口 0 监听把它们串起来；
//! - **手法 (How)**：服务端走 `Bridge`，客户端直接使用 Tokio `TcpStream`；
//!   事件到达是异步的，断言统一经 `eventually` 轮询；
//! - **边界 (What)**：TLS 层不在本文件覆盖范围内。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use spark_bridge::error::codes;
use spark_bridge::session::SessionId;
use spark_bridge::test_stubs::{HandlerEvent, RecordingHandler};
use spark_bridge::{Bridge, BridgeConfig, ResourceAddress, ResourceOptions};
use spark_bridge_tcp::TcpTransport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Server {
    transport: TcpTransport,
    bridge: Bridge,
}

impl Server {
    fn start() -> Self {
        let mut config = BridgeConfig::default();
        config.io.workers = Some(2);
        let transport = TcpTransport::start(&config).expect("worker 池启动");
        let bridge = transport
            .bridge_builder(config)
            .build()
            .expect("构造 bridge");
        Self { transport, bridge }
    }

    fn address(&self, uri: &str) -> ResourceAddress {
        self.bridge
            .new_address(uri, ResourceOptions::new())
            .expect("地址合法")
    }

    fn local_addr(&self, address: &ResourceAddress) -> SocketAddr {
        self.transport
            .binder()
            .local_addr(address.lowest_transport())
            .expect("已监听")
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.transport.shutdown();
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("等待超时：{what}");
}

fn received(handler: &RecordingHandler, session: SessionId) -> Vec<u8> {
    handler
        .events_for(session)
        .into_iter()
        .filter_map(|event| match event {
            HandlerEvent::Message(bytes) => Some(bytes.to_vec()),
            _ => None,
        })
        .flatten()
        .collect()
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buffer))
        .await
        .expect("读取超时")
        .expect("读取成功");
    buffer
}

#[tokio::test(flavor = "multi_thread")]
async fn accepted_connection_echoes_through_the_worker() {
    let server = Server::start();
    let address = server.address("tcp://127.0.0.1:0");
    server
        .bridge
        .bind(&address, Arc::new(RecordingHandler::echo()), None)
        .expect("绑定");

    let mut client = TcpStream::connect(server.local_addr(&address)).await.expect("建连");
    client.write_all(b"hello bridge").await.expect("写入");
    assert_eq!(read_exact(&mut client, 12).await, b"hello bridge");
}

#[tokio::test(flavor = "multi_thread")]
async fn one_port_serves_http_and_raw_by_sniffing() {
    let server = Server::start();
    let raw = server.address("tcp://127.0.0.1:0");
    let http = server.address("http://127.0.0.1:0/");
    let raw_handler = Arc::new(RecordingHandler::new());
    let http_handler = Arc::new(RecordingHandler::new());
    server.bridge.bind(&raw, raw_handler.clone(), None).expect("绑定 raw");
    server.bridge.bind(&http, http_handler.clone(), None).expect("绑定 http");
    let endpoint = server.local_addr(&raw);
    assert_eq!(server.transport.binder().listener_count(), 1, "两者共享一个监听");

    let mut browser = TcpStream::connect(endpoint).await.expect("建连");
    browser
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .expect("写入");
    let mut device = TcpStream::connect(endpoint).await.expect("建连");
    device.write_all(&[0x00, 0x01, 0x02, 0x03]).await.expect("写入");

    eventually("http 会话建立", || http_handler.last_session().is_some()).await;
    eventually("raw 会话建立", || raw_handler.last_session().is_some()).await;
    let http_session = http_handler.last_session().expect("已建立");
    let raw_session = raw_handler.last_session().expect("已建立");
    eventually("http 请求到达", || {
        received(&http_handler, http_session.id()).ends_with(b"\r\n\r\n")
    })
    .await;
    eventually("raw 数据到达", || received(&raw_handler, raw_session.id()).len() == 4).await;
    assert_eq!(http_session.scheme(), spark_bridge::Scheme::Http);
    assert_eq!(raw_session.scheme(), spark_bridge::Scheme::Tcp);
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_reaches_every_connection() {
    let server = Server::start();
    let address = server.address("tcp://127.0.0.1:0");
    let handler = Arc::new(RecordingHandler::new());
    server.bridge.bind(&address, handler.clone(), None).expect("绑定");
    let endpoint = server.local_addr(&address);

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(TcpStream::connect(endpoint).await.expect("建连"));
    }
    eventually("四个会话建立", || handler.sessions().len() == 4).await;

    let payload = Bytes::from(vec![b'x'; 256 * 1024]);
    let delivered = server.bridge.broadcast(&handler.sessions(), payload.clone());
    assert_eq!(delivered, 4);
    for client in &mut clients {
        assert_eq!(read_exact(client, payload.len()).await, payload.as_ref());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_disconnect_closes_the_session() {
    let server = Server::start();
    let address = server.address("tcp://127.0.0.1:0");
    let handler = Arc::new(RecordingHandler::new());
    server.bridge.bind(&address, handler.clone(), None).expect("绑定");

    let client = TcpStream::connect(server.local_addr(&address)).await.expect("建连");
    eventually("会话建立", || handler.last_session().is_some()).await;
    let session = handler.last_session().expect("已建立");
    drop(client);

    eventually("会话关闭", || session.is_closed()).await;
    eventually("closed 交付", || {
        handler.events_for(session.id()).last() == Some(&HandlerEvent::Closed)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn server_close_flushes_then_disconnects() {
    let server = Server::start();
    let address = server.address("tcp://127.0.0.1:0");
    let handler = Arc::new(RecordingHandler::new());
    server.bridge.bind(&address, handler.clone(), None).expect("绑定");

    let mut client = TcpStream::connect(server.local_addr(&address)).await.expect("建连");
    eventually("会话建立", || handler.last_session().is_some()).await;
    let session = handler.last_session().expect("已建立");
    session.write_bytes(Bytes::from_static(b"bye")).expect("写入");
    session.close();

    let mut everything = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut everything))
        .await
        .expect("读取超时")
        .expect("读取成功");
    assert_eq!(everything, b"bye", "有序关闭先写完队列");
    assert!(session.write_bytes(Bytes::from_static(b"late")).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn bridge_connect_talks_to_a_bridge_listener() {
    let server = Server::start();
    let listening = server.address("tcp://127.0.0.1:0");
    server
        .bridge
        .bind(&listening, Arc::new(RecordingHandler::echo()), None)
        .expect("绑定");
    let endpoint = server.local_addr(&listening);

    let client = Server::start();
    let target = client.address(&format!("tcp://{endpoint}"));
    let handler = Arc::new(RecordingHandler::new());
    let session = client
        .bridge
        .connect(&target, handler.clone(), None)
        .await
        .expect("建连");
    assert_eq!(
        handler.events_for(session.id()),
        vec![HandlerEvent::Created, HandlerEvent::Opened]
    );
    assert!(session.local_address().is_some());

    session.write_bytes(Bytes::from_static(b"ping")).expect("写入");
    eventually("回显到达", || received(&handler, session.id()) == b"ping").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connect_reports_connection_failed() {
    let vacant = std::net::TcpListener::bind("127.0.0.1:0").expect("占用临时端口");
    let endpoint = vacant.local_addr().expect("端口");
    drop(vacant);

    let client = Server::start();
    let target = client.address(&format!("tcp://{endpoint}"));
    let error = client
        .bridge
        .connect(&target, Arc::new(RecordingHandler::new()), None)
        .await
        .expect_err("端口无人监听");
    assert_eq!(error.code(), codes::CONNECTION_FAILED);
}

#[tokio::test(flavor = "multi_thread")]
async fn unbind_closes_the_listener() {
    let server = Server::start();
    let address = server.address("tcp://127.0.0.1:0");
    server
        .bridge
        .bind(&address, Arc::new(RecordingHandler::new()), None)
        .expect("绑定");
    let endpoint = server.local_addr(&address);

    server.bridge.unbind(&address).await.expect("解绑");
    assert_eq!(server.transport.binder().listener_count(), 0);
    assert!(TcpStream::connect(endpoint).await.is_err(), "监听已关闭");
}
