//! 套接字地址解析与套接字选项。

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use spark_bridge::address::keys;
use spark_bridge::{ResourceAddress, Result};
use tokio::net::TcpStream;

use crate::error::{self, bind_failed, map_io_error};

const LISTEN_BACKLOG: i32 = 1024;

/// 物理地址的 `host:port`，IPv6 主机带方括号。
pub(crate) fn authority_of(address: &ResourceAddress) -> Result<String> {
    if address.host().is_none() {
        return Err(error::unresolvable(address, "tcp address requires a host"));
    }
    if address.port().is_none() {
        return Err(error::unresolvable(address, "tcp address requires a port"));
    }
    Ok(address.resource_uri().authority())
}

/// 同步解析监听地址，取第一个结果。
pub(crate) fn resolve_bind(address: &ResourceAddress) -> Result<SocketAddr> {
    let authority = authority_of(address)?;
    authority
        .to_socket_addrs()
        .map_err(|error| bind_failed(address, error))?
        .next()
        .ok_or_else(|| error::unresolvable(address, "host resolved to no socket address"))
}

/// 以 `SO_REUSEADDR` 打开非阻塞监听套接字。
pub(crate) fn listen(address: &ResourceAddress, socket_addr: SocketAddr) -> Result<StdTcpListener> {
    let open = || -> io::Result<StdTcpListener> {
        let socket = Socket::new(Domain::for_address(socket_addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&socket_addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    };
    open().map_err(|error| bind_failed(address, error))
}

/// 新连接的套接字选项：始终关闭 Nagle，`tcp.keepAlive` 为真时开启保活。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpSocketConfig {
    keep_alive: bool,
}

impl TcpSocketConfig {
    pub fn for_address(address: &ResourceAddress) -> Self {
        Self {
            keep_alive: address.option(keys::KEEP_ALIVE),
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> Result<()> {
        let socket = SockRef::from(stream);
        socket
            .set_tcp_nodelay(true)
            .map_err(|error| map_io_error(error::CONFIGURE, error))?;
        if self.keep_alive {
            socket
                .set_tcp_keepalive(&TcpKeepalive::new())
                .map_err(|error| map_io_error(error::CONFIGURE, error))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_bridge::{ResourceAddressFactory, ResourceOptions};

    fn address(uri: &str, options: ResourceOptions) -> ResourceAddress {
        ResourceAddressFactory::new()
            .new_resource_address(uri, options)
            .expect("地址合法")
    }

    #[test]
    fn bind_resolution_uses_the_physical_authority() {
        let plain = address("tcp://127.0.0.1:7000", ResourceOptions::new());
        assert_eq!(resolve_bind(&plain).expect("可解析"), "127.0.0.1:7000".parse().expect("合法"));

        let v6 = address("tcp://[::1]:7001", ResourceOptions::new());
        assert_eq!(authority_of(&v6).expect("有 authority"), "[::1]:7001");
    }

    #[test]
    fn keep_alive_follows_the_address_option() {
        let plain = address("tcp://127.0.0.1:7002", ResourceOptions::new());
        assert!(!TcpSocketConfig::for_address(&plain).keep_alive());

        let kept = address(
            "tcp://127.0.0.1:7003",
            ResourceOptions::new().with(keys::KEEP_ALIVE, true),
        );
        assert!(TcpSocketConfig::for_address(&kept).keep_alive());
    }
}
