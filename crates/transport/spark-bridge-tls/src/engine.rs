//! 以 sans-IO 方式驱动 `rustls` 连接。
//!
//! 密文既不来自也不去往 socket，而是来自父会话的 `message_received`、经父会话的 `write`
//! 送出；引擎因此与物理传输、执行器都无关，同一份代码服务接入侧与发起侧。

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rustls::{CipherSuite, ClientConfig, ClientConnection, Connection, ProtocolVersion, ServerConfig, ServerConnection};
use rustls_pki_types::{CertificateDer, ServerName};
use spark_bridge::{BridgeSession, Result};
use tracing::trace;

use crate::TARGET_LAYER;
use crate::error::{HANDSHAKE, RECORD, map_io_error, map_tls_error, misconfigured};

/// 一批密文处理后的结果。
#[derive(Debug, Default)]
pub(crate) struct Inbound {
    pub plaintext: Option<Bytes>,
    /// 对端发送了 `close_notify`。
    pub peer_closed: bool,
}

/// 会话属性：握手协商结果，挂在 TLS 层会话上。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsSessionInfo {
    /// 接入侧为客户端 SNI，发起侧为目标主机名。
    pub server_name: Option<String>,
    pub protocol_version: Option<ProtocolVersion>,
    pub cipher_suite: Option<CipherSuite>,
    /// 对端证书链，叶子在前；对端未出示时为空。
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

pub(crate) struct TlsEngine {
    connection: Connection,
}

impl TlsEngine {
    pub fn server(config: Arc<ServerConfig>) -> Result<Self> {
        let connection = ServerConnection::new(config).map_err(|error| map_tls_error(HANDSHAKE, &error))?;
        Ok(Self {
            connection: connection.into(),
        })
    }

    pub fn client(config: Arc<ClientConfig>, host: &str) -> Result<Self> {
        let name = ServerName::try_from(host.to_owned())
            .map_err(|error| misconfigured(format!("`{host}` is not a valid server name: {error}")))?;
        let connection =
            ClientConnection::new(config, name).map_err(|error| map_tls_error(HANDSHAKE, &error))?;
        Ok(Self {
            connection: connection.into(),
        })
    }

    pub fn is_handshaking(&self) -> bool {
        self.connection.is_handshaking()
    }

    /// 消费一批密文：解密得到的明文合并返回，引擎产生的记录（握手消息、告警）立即写给 `lower`。
    ///
    /// 引擎报错时，已排队的告警同样先写出再返回错误。
    pub fn exchange(&mut self, lower: &BridgeSession, ciphertext: &[u8]) -> Result<Inbound> {
        let mut input = ciphertext;
        let mut plaintext = BytesMut::new();
        let mut peer_closed = false;
        while !input.is_empty() {
            let kind = if self.is_handshaking() { HANDSHAKE } else { RECORD };
            self.connection
                .read_tls(&mut input)
                .map_err(|error| map_io_error(kind, error))?;
            let state = match self.connection.process_new_packets() {
                Ok(state) => state,
                Err(error) => {
                    trace!(target: TARGET_LAYER, session = %lower.id(), stage = kind.code, %error, "tls engine rejected records");
                    let _ = self.flush(lower);
                    return Err(map_tls_error(kind, &error));
                }
            };
            let available = state.plaintext_bytes_to_read();
            if available > 0 {
                let start = plaintext.len();
                plaintext.resize(start + available, 0);
                self.connection
                    .reader()
                    .read_exact(&mut plaintext[start..])
                    .map_err(|error| map_io_error(RECORD, error))?;
            }
            peer_closed |= state.peer_has_closed();
        }
        self.flush(lower)?;
        Ok(Inbound {
            plaintext: (!plaintext.is_empty()).then(|| plaintext.freeze()),
            peer_closed,
        })
    }

    /// 加密一段明文并写给 `lower`。
    pub fn encrypt(&mut self, lower: &BridgeSession, plaintext: &[u8]) -> Result<()> {
        self.connection
            .writer()
            .write_all(plaintext)
            .map_err(|error| map_io_error(RECORD, error))?;
        self.flush(lower)
    }

    /// 把引擎排队的记录写给 `lower`。
    pub fn flush(&mut self, lower: &BridgeSession) -> Result<()> {
        match self.drain()? {
            Some(records) => lower.write_bytes(records),
            None => Ok(()),
        }
    }

    /// 生成 `close_notify` 记录，由调用方决定何时写出。
    pub fn close_notify(&mut self) -> Result<Option<Bytes>> {
        self.connection.send_close_notify();
        self.drain()
    }

    pub fn info(&self) -> TlsSessionInfo {
        let server_name = match &self.connection {
            Connection::Server(server) => server.server_name().map(str::to_owned),
            Connection::Client(_) => None,
        };
        TlsSessionInfo {
            server_name,
            protocol_version: self.connection.protocol_version(),
            cipher_suite: self
                .connection
                .negotiated_cipher_suite()
                .map(|suite| suite.suite()),
            peer_certificates: self
                .connection
                .peer_certificates()
                .map(<[CertificateDer<'static>]>::to_vec)
                .unwrap_or_default(),
        }
    }

    fn drain(&mut self) -> Result<Option<Bytes>> {
        let mut records = Vec::new();
        while self.connection.wants_write() {
            self.connection
                .write_tls(&mut records)
                .map_err(|error| map_io_error(RECORD, error))?;
        }
        Ok((!records.is_empty()).then(|| Bytes::from(records)))
    }
}
