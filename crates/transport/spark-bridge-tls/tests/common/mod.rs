//! TLS 集成测试共用的网关与对端。
//!
//! 对端是一个直接驱动 `rustls` 连接的内存端点：它把自己产生的记录经
//! [`MemoryConnection::send`] 交给网关，再从 [`MemoryConnection::written`] 读取网关写出的字节。
#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use rustls::{SupportedProtocolVersion, version};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use spark_bridge::address::keys;
use spark_bridge::test_stubs::{ManualTimer, MemoryConnection, MockPhysicalBinder, MockPhysicalConnector};
use spark_bridge::{Bridge, BridgeConfig, ResourceAddress, ResourceOptions, Scheme};
use spark_bridge_tls::{KeyStore, TlsBridge};

pub const BOTH_VERSIONS: &[&SupportedProtocolVersion] = &[&version::TLS13, &version::TLS12];
pub const TLS12_ONLY: &[&SupportedProtocolVersion] = &[&version::TLS12];

pub struct TlsGateway {
    pub bridge: Bridge,
    pub binder: Arc<MockPhysicalBinder>,
    pub connector: Arc<MockPhysicalConnector>,
    pub timer: ManualTimer,
    pub store: Arc<KeyStore>,
}

impl TlsGateway {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let binder = Arc::new(MockPhysicalBinder::new());
        let connector = Arc::new(MockPhysicalConnector::new());
        let timer = ManualTimer::new();
        let store = Arc::new(KeyStore::new());
        let builder = Bridge::builder(config, Arc::new(timer.clone()))
            .physical(Scheme::Tcp, binder.clone())
            .physical_connector(Scheme::Tcp, connector.clone());
        let bridge = TlsBridge::new(Arc::clone(&store))
            .install(builder)
            .build()
            .expect("TLS 网关应能构造");
        Self {
            bridge,
            binder,
            connector,
            timer,
            store,
        }
    }

    pub fn address(&self, uri: &str, options: ResourceOptions) -> ResourceAddress {
        self.bridge.new_address(uri, options).expect("测试地址必须合法")
    }

    /// 以 `bind` 选项把虚拟主机折叠到同一物理端口的地址。
    pub fn virtual_host(&self, uri: &str, port: &str) -> ResourceAddress {
        self.address(uri, bound_to(port))
    }

    /// 在 `address` 最底层的监听上接入一个新连接。
    pub fn accept(&self, address: &ResourceAddress) -> MemoryConnection {
        self.binder
            .accept(address.lowest_transport())
            .expect("物理监听已打开")
    }
}

pub fn bound_to(port: &str) -> ResourceOptions {
    ResourceOptions::new().with(keys::BIND, Some(Arc::from(port)))
}

/// 自签名身份。
pub struct Identity {
    pub chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Identity {
    pub fn self_signed(hosts: &[&str]) -> Self {
        let names = hosts.iter().map(|host| (*host).to_owned()).collect::<Vec<_>>();
        let certified = rcgen::generate_simple_self_signed(names).expect("生成自签名证书");
        let key = PrivateKeyDer::try_from(certified.key_pair.serialize_der()).expect("私钥格式合法");
        Self {
            chain: vec![certified.cert.der().clone()],
            key,
        }
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    pub fn install(&self, store: &KeyStore, alias: &str) {
        store
            .insert_identity(alias, self.chain.clone(), self.key())
            .expect("登记身份");
    }
}

fn roots(trusted: &[&CertificateDer<'static>]) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for certificate in trusted {
        roots.add((*certificate).clone()).expect("自签名证书可作为信任锚");
    }
    roots
}

pub fn client_config(
    trusted: &[&CertificateDer<'static>],
    versions: &[&'static SupportedProtocolVersion],
    identity: Option<&Identity>,
) -> Arc<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(versions)
        .expect("版本集合合法")
        .with_root_certificates(roots(trusted));
    let config = match identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.chain.clone(), identity.key())
            .expect("客户端证书合法"),
        None => builder.with_no_client_auth(),
    };
    Arc::new(config)
}

pub fn server_config(identity: &Identity) -> Arc<ServerConfig> {
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("默认版本集合合法")
        .with_no_client_auth()
        .with_single_cert(identity.chain.clone(), identity.key())
        .expect("服务端证书合法");
    Arc::new(config)
}

/// 隔着一条内存连接与网关对话的 TLS 端点。
pub struct Peer {
    tls: Connection,
    wire: MemoryConnection,
    consumed: usize,
    peer_closed: bool,
}

impl Peer {
    pub fn client(config: Arc<ClientConfig>, host: &str, wire: MemoryConnection) -> Self {
        let name = ServerName::try_from(host.to_owned()).expect("合法主机名");
        let tls = ClientConnection::new(config, name).expect("构造客户端连接");
        Self {
            tls: tls.into(),
            wire,
            consumed: 0,
            peer_closed: false,
        }
    }

    pub fn server(config: Arc<ServerConfig>, wire: MemoryConnection) -> Self {
        let tls = ServerConnection::new(config).expect("构造服务端连接");
        Self {
            tls: tls.into(),
            wire,
            consumed: 0,
            peer_closed: false,
        }
    }

    pub fn tls(&self) -> &Connection {
        &self.tls
    }

    pub fn wire(&self) -> &MemoryConnection {
        &self.wire
    }

    /// 双向搬运记录，直到两边都没有新字节。
    pub fn pump(&mut self) -> Result<(), rustls::Error> {
        loop {
            let mut outgoing = Vec::new();
            while self.tls.wants_write() {
                self.tls.write_tls(&mut outgoing).expect("写入内存缓冲不会失败");
            }
            let sent = !outgoing.is_empty();
            if sent {
                self.wire.send(&outgoing);
            }

            let written = self.wire.written();
            let fresh = written.len() > self.consumed;
            if fresh {
                let mut input = &written[self.consumed..];
                self.consumed = written.len();
                while !input.is_empty() {
                    self.tls.read_tls(&mut input).expect("读取内存缓冲不会失败");
                    let state = self.tls.process_new_packets()?;
                    self.peer_closed |= state.peer_has_closed();
                }
            }

            if !sent && !fresh {
                return Ok(());
            }
        }
    }

    /// 网关是否已发来 `close_notify`。
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// 发出 `close_notify`；网关随后的关闭记录被读入但不视为错误。
    pub fn close(&mut self) {
        self.tls.send_close_notify();
        let _ = self.pump();
    }

    /// 加密一段明文并完成搬运。
    pub fn send(&mut self, plaintext: &[u8]) -> Result<(), rustls::Error> {
        self.tls.writer().write_all(plaintext).expect("写入明文");
        self.pump()
    }

    /// 取出已解密、尚未读取的全部明文。
    pub fn received(&mut self) -> Vec<u8> {
        let mut plaintext = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match self.tls.reader().read(&mut chunk) {
                Ok(0) => return plaintext,
                Ok(read) => plaintext.extend_from_slice(&chunk[..read]),
                Err(error) if error.kind() == ErrorKind::WouldBlock => return plaintext,
                Err(error) => panic!("读取明文失败: {error}"),
            }
        }
    }
}
