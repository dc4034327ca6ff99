//! TCP 主动连接：[`PhysicalConnector`] 的 Tokio 实现。

use std::sync::Arc;

use futures::FutureExt;
use futures::channel::oneshot;
use spark_bridge::runtime::ConnectFuture;
use spark_bridge::session::{BridgeHandler, SessionInitializer};
use spark_bridge::{
    BridgeError, BridgeSession, PhysicalConnector, ResourceAddress, ResourceAddressFactory, Scheme,
};
use tokio::net::TcpStream;
use tracing::debug;

use crate::TARGET_CONNECTOR;
use crate::connection::Adopted;
use crate::error::connect_failed;
use crate::socket::{self, TcpSocketConfig};
use crate::worker::IoWorkerPool;

/// 主动连接器。
///
/// - 建连、会话构造与读循环都在轮询选中的 worker 上进行，连接从一开始就具备亲和性；
/// - 返回的会话已经按“初始化器 → created → opened”完成启动，本地地址为内核分配的端点。
pub struct TcpConnector {
    pool: IoWorkerPool,
    factory: ResourceAddressFactory,
}

impl TcpConnector {
    pub fn new(pool: IoWorkerPool) -> Self {
        Self {
            pool,
            factory: ResourceAddressFactory::new(),
        }
    }
}

impl PhysicalConnector for TcpConnector {
    fn connect(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> ConnectFuture {
        let authority = match socket::authority_of(address) {
            Ok(authority) => authority,
            Err(error) => return futures::future::ready(Err(error)).boxed(),
        };
        let worker = self.pool.next_worker().clone();
        let read_buffer_size = self.pool.read_buffer_size();
        let factory = self.factory;
        let target = address.clone();
        let (completion, outcome) = oneshot::channel();

        worker.handle().clone().spawn(async move {
            let stream = match TcpStream::connect(authority.as_str()).await {
                Ok(stream) => stream,
                Err(io_error) => {
                    let _ = completion.send(Err(connect_failed(&target, io_error)));
                    return;
                }
            };
            if let Err(error) = TcpSocketConfig::for_address(&target).apply(&stream) {
                let _ = completion.send(Err(error));
                return;
            }
            let local = stream
                .local_addr()
                .ok()
                .and_then(|local| factory.peer_address(Scheme::Tcp, &local.to_string(), None).ok());
            let adopted = Adopted::register(&worker, stream);
            let mut builder = BridgeSession::builder(Scheme::Tcp, adopted.processor.clone())
                .service("tcp-connector")
                .remote_address(Some(target.clone()))
                .handler(handler);
            if let Some(local) = local {
                builder = builder.local_address(local);
            }
            let session = builder.build();
            debug!(target: TARGET_CONNECTOR, session = %session.id(), address = %target, worker = worker.index(), "connected");
            match session.open(initializer.as_ref()) {
                Ok(()) => {
                    let _ = completion.send(Ok(session.clone()));
                    adopted.serve(session, read_buffer_size).await;
                }
                Err(error) => {
                    let _ = completion.send(Err(error));
                }
            }
        });

        let address = address.to_string();
        async move {
            outcome.await.unwrap_or_else(|_| {
                Err(BridgeError::ConnectionFailed {
                    detail: format!("io worker stopped while connecting to {address}"),
                })
            })
        }
        .boxed()
    }
}
