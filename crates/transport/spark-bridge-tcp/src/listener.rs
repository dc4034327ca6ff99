//! TCP 监听：[`PhysicalBinder`] 的 Tokio 实现。

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::channel::oneshot;
use spark_bridge::runtime::UnbindFuture;
use spark_bridge::{BindKey, ConnectionSink, PhysicalBinder, ResourceAddress, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::TARGET_LISTENER;
use crate::connection::Adopted;
use crate::error::{self, bind_failed, map_io_error};
use crate::socket::{self, TcpSocketConfig};
use crate::worker::IoWorkerPool;

struct ListenerEntry {
    local: SocketAddr,
    stop: oneshot::Sender<()>,
    stopped: oneshot::Receiver<()>,
}

/// 物理监听器集合。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `bind` 在调用线程上同步完成 `socket → bind → listen`，端口占用等错误立即返回给绑定流程；
/// - 接入循环运行在池的第一个 worker 上，每个新连接以轮询方式交给某个 worker，此后不再迁移。
///
/// ## 契约（What）
/// - 同一绑定键只会被绑定一次（注册表保证），重复绑定视为调用方错误并返回 `BindFailed`；
/// - `unbind` 立即通知接入循环退出，返回的 future 在监听套接字真正关闭后就绪；
///   已接入的连接不受解绑影响。
pub struct TcpBinder {
    pool: IoWorkerPool,
    listeners: DashMap<BindKey, ListenerEntry>,
}

impl TcpBinder {
    pub fn new(pool: IoWorkerPool) -> Self {
        Self {
            pool,
            listeners: DashMap::new(),
        }
    }

    /// 已绑定地址的实际监听端点（端口 0 绑定后据此得知内核分配的端口）。
    pub fn local_addr(&self, address: &ResourceAddress) -> Option<SocketAddr> {
        self.listeners
            .get(address.bind_key())
            .map(|entry| entry.local)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl PhysicalBinder for TcpBinder {
    fn bind(&self, address: &ResourceAddress, sink: Arc<dyn ConnectionSink>) -> Result<()> {
        if self.listeners.contains_key(address.bind_key()) {
            return Err(bind_failed(
                address,
                std::io::Error::from(std::io::ErrorKind::AddrInUse),
            ));
        }
        let socket_addr = socket::resolve_bind(address)?;
        let std_listener = socket::listen(address, socket_addr)?;
        let local = std_listener
            .local_addr()
            .map_err(|error| bind_failed(address, error))?;
        let primary = self.pool.primary();
        let listener = {
            let _entered = primary.handle().enter();
            TcpListener::from_std(std_listener).map_err(|error| bind_failed(address, error))?
        };

        let (stop, stop_signal) = oneshot::channel();
        let (stopped_signal, stopped) = oneshot::channel();
        primary.handle().spawn(accept_loop(
            listener,
            address.clone(),
            sink,
            self.pool.clone(),
            stop_signal,
            stopped_signal,
        ));
        self.listeners.insert(
            address.bind_key().clone(),
            ListenerEntry {
                local,
                stop,
                stopped,
            },
        );
        debug!(target: TARGET_LISTENER, %address, %local, "listening");
        Ok(())
    }

    fn unbind(&self, address: &ResourceAddress) -> UnbindFuture {
        let Some((_, entry)) = self.listeners.remove(address.bind_key()) else {
            return futures::future::ready(Ok(())).boxed();
        };
        let _ = entry.stop.send(());
        let local = entry.local;
        async move {
            let _ = entry.stopped.await;
            debug!(target: TARGET_LISTENER, %local, "listener closed");
            Ok(())
        }
        .boxed()
    }
}

async fn accept_loop(
    listener: TcpListener,
    address: ResourceAddress,
    sink: Arc<dyn ConnectionSink>,
    pool: IoWorkerPool,
    mut stop: oneshot::Receiver<()>,
    stopped: oneshot::Sender<()>,
) {
    let config = TcpSocketConfig::for_address(&address);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => hand_off(&pool, stream, peer, &sink, config),
                Err(io_error) => {
                    let error = map_io_error(error::ACCEPT, io_error);
                    warn!(target: TARGET_LISTENER, %address, code = error::ACCEPT.code, %error, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            }
        }
    }
    drop(listener);
    let _ = stopped.send(());
}

/// 把新连接迁移到选中的 worker 上并在那里构造会话。
fn hand_off(
    pool: &IoWorkerPool,
    stream: TcpStream,
    peer: SocketAddr,
    sink: &Arc<dyn ConnectionSink>,
    config: TcpSocketConfig,
) {
    let stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(io_error) => {
            warn!(target: TARGET_LISTENER, %peer, error = %io_error, "failed to detach accepted stream");
            return;
        }
    };
    let worker = pool.next_worker().clone();
    let sink = Arc::clone(sink);
    let read_buffer_size = pool.read_buffer_size();
    worker.handle().clone().spawn(async move {
        let stream = match TcpStream::from_std(stream) {
            Ok(stream) => stream,
            Err(io_error) => {
                warn!(target: TARGET_LISTENER, %peer, error = %io_error, "failed to register accepted stream");
                return;
            }
        };
        if let Err(error) = config.apply(&stream) {
            warn!(target: TARGET_LISTENER, %peer, %error, "socket options not applied");
        }
        let adopted = Adopted::register(&worker, stream);
        let session = sink.accept(adopted.processor.clone(), &peer.to_string());
        debug!(target: TARGET_LISTENER, session = %session.id(), %peer, worker = worker.index(), "connection accepted");
        adopted.serve(session, read_buffer_size).await;
    });
}
