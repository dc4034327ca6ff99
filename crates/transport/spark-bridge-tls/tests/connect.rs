//! 发起侧 TLS：握手完成才交付会话，失败与提前断开都体现在连接 future 上。

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{Identity, Peer, TlsGateway, server_config};
use futures::FutureExt;
use spark_bridge::address::keys;
use spark_bridge::error::codes;
use spark_bridge::test_stubs::{HandlerEvent, RecordingHandler};
use spark_bridge::{ResourceOptions, Scheme};
use spark_bridge_tls::TlsSessionInfo;

#[test]
fn connect_completes_after_the_handshake() -> anyhow::Result<()> {
    let gateway = TlsGateway::new();
    let server = Identity::self_signed(&["alpha.test"]);
    gateway.store.add_trust_anchor(server.certificate().clone());
    let address = gateway.bridge.new_address("ssl://alpha.test:9443", ResourceOptions::new())?;
    let handler = Arc::new(RecordingHandler::new());

    let mut pending = gateway.bridge.connect(&address, handler.clone(), None);
    assert!((&mut pending).now_or_never().is_none(), "握手完成前连接未就绪");
    let wire = gateway
        .connector
        .connections()
        .pop()
        .ok_or_else(|| anyhow::anyhow!("没有建立物理连接"))?;
    assert!(!wire.written().is_empty(), "ClientHello 已写出");

    let mut peer = Peer::server(server_config(&server), wire);
    peer.pump()?;
    let session = pending
        .now_or_never()
        .ok_or_else(|| anyhow::anyhow!("握手完成后连接应就绪"))??;

    assert_eq!(session.scheme(), Scheme::Ssl);
    assert_eq!(session.remote_address(), Some(address));
    assert_eq!(
        handler.events_for(session.id()),
        vec![HandlerEvent::Created, HandlerEvent::Opened]
    );
    let info = session
        .attribute::<TlsSessionInfo>()
        .ok_or_else(|| anyhow::anyhow!("缺少握手结果"))?;
    assert_eq!(info.server_name.as_deref(), Some("alpha.test"));
    assert_eq!(info.peer_certificates, server.chain);

    session.write_bytes(&b"hello"[..])?;
    peer.pump()?;
    assert_eq!(peer.received(), b"hello");

    peer.send(b"world")?;
    assert_eq!(
        handler.events_for(session.id()).last(),
        Some(&HandlerEvent::Message(Bytes::from_static(b"world")))
    );

    session.close();
    peer.pump()?;
    assert!(peer.peer_closed());
    assert!(peer.wire().is_closed());
    Ok(())
}

#[test]
fn transport_closing_mid_handshake_fails_the_connect() {
    let gateway = TlsGateway::new();
    let server = Identity::self_signed(&["alpha.test"]);
    gateway.store.add_trust_anchor(server.certificate().clone());
    let address = gateway.address("ssl://alpha.test:9443", ResourceOptions::new());
    let handler = Arc::new(RecordingHandler::new());

    let mut pending = gateway.bridge.connect(&address, handler.clone(), None);
    assert!((&mut pending).now_or_never().is_none());
    let wire = gateway.connector.connections().pop().expect("已建立物理连接");
    wire.disconnect();

    let error = pending
        .now_or_never()
        .expect("断开后 future 立即就绪")
        .expect_err("握手未完成");
    assert_eq!(error.code(), codes::CONNECTION_FAILED);
    assert!(handler.sessions().is_empty(), "业务处理器从未见到会话");
    assert_eq!(gateway.timer.pending(), 0);
}

#[test]
fn untrusted_server_certificate_fails_the_handshake() {
    let gateway = TlsGateway::new();
    let trusted = Identity::self_signed(&["alpha.test"]);
    let impostor = Identity::self_signed(&["alpha.test"]);
    gateway.store.add_trust_anchor(trusted.certificate().clone());
    let address = gateway.address("ssl://alpha.test:9443", ResourceOptions::new());

    let mut pending = gateway
        .bridge
        .connect(&address, Arc::new(RecordingHandler::new()), None);
    assert!((&mut pending).now_or_never().is_none());
    let wire = gateway.connector.connections().pop().expect("已建立物理连接");
    let mut peer = Peer::server(server_config(&impostor), wire);
    assert!(peer.pump().is_err(), "对端收到证书告警");

    let error = pending
        .now_or_never()
        .expect("握手失败后 future 立即就绪")
        .expect_err("证书不受信任");
    assert_eq!(error.code(), codes::HANDSHAKE);
    assert!(peer.wire().is_closed());
}

#[test]
fn missing_trust_anchors_fail_before_connecting() {
    let gateway = TlsGateway::new();
    let address = gateway.address("ssl://alpha.test:9443", ResourceOptions::new());

    let error = gateway
        .bridge
        .connect(&address, Arc::new(RecordingHandler::new()), None)
        .now_or_never()
        .expect("配置错误同步返回")
        .expect_err("没有信任锚");
    assert_eq!(error.code(), codes::CONFIG);
    assert_eq!(gateway.connector.attempts(), 0, "没有发起物理连接");
}

#[test]
fn disabled_encryption_connects_in_plaintext() {
    let gateway = TlsGateway::new();
    let options = ResourceOptions::new().with(keys::SSL_ENCRYPTION_ENABLED, false);
    let address = gateway.address("ssl://alpha.test:9443", options);
    let handler = Arc::new(RecordingHandler::new());

    let session = gateway
        .bridge
        .connect(&address, handler.clone(), None)
        .now_or_never()
        .expect("无需握手，同步完成")
        .expect("连接成功");
    assert_eq!(session.scheme(), Scheme::Ssl);
    assert!(session.attribute::<TlsSessionInfo>().is_none());

    session.write_bytes(&b"plain"[..]).expect("写入");
    let wire = gateway.connector.connections().pop().expect("已建立物理连接");
    assert_eq!(wire.written(), b"plain");
    wire.send(b"reply");
    assert_eq!(
        handler.events_for(session.id()).last(),
        Some(&HandlerEvent::Message(Bytes::from_static(b"reply")))
    );
}
