//! I/O worker 池。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 每条连接在其生命周期内固定属于一个 worker：读循环、写队列、事件回调都在该 worker 的线程上执行；
//! - 每个 worker 独占一个 [`WriteArena`]，同一 worker 上的会话广播同一负载时共享一份主缓冲。
//!
//! ## 逻辑（How）
//! - worker = 一个专属线程 + 一个 current-thread Tokio 运行时；
//! - 写路径是一个 actor：[`WorkerCommand`] 经无界通道进入 worker 的写循环，写循环持有全部连接的
//!   写半部与 [`SessionWriteState`]，按到达顺序执行；
//! - 刷写未完成时为该连接派生一个等待可写的任务，可写后回送 [`WorkerCommand::Writable`]；
//! - 命令队列排空时清空 arena，主缓冲的生命周期不超过一轮广播。
//!
//! ## 契约（What）
//! - 关闭分两种：有序关闭先写完队列再释放；对端断开或 I/O 失败直接丢弃待写数据；
//! - 释放时先唤醒读循环退出，再触发 `fire_session_closed`。
//!
//! ## 注意事项（Trade-offs）
//! - 丢弃池只会通知 worker 退出，不会等待线程结束：池可能在某个 worker 线程的回调里被丢弃，
//!   在那里 join 自己会死锁。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use spark_bridge::buffer::{NonBlockingWrite, PendingWrite, SessionWriteState, WriteArena};
use spark_bridge::config::IoConfig;
use spark_bridge::session::WeakSession;
use spark_bridge::{BridgeError, BridgeSession, Result};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::runtime::{Builder, Handle};
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::TARGET_WORKER;
use crate::error::{self, map_io_error};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// worker 内的连接编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// 写循环接受的命令。
pub(crate) enum WorkerCommand {
    /// 连接加入 worker；必须先于该连接的任何其它命令发送。
    Register {
        id: ConnectionId,
        writer: Arc<OwnedWriteHalf>,
        stop: Arc<Notify>,
    },
    /// 会话构造完成后补登记，供写失败时上报异常。
    Attach { id: ConnectionId, session: WeakSession },
    Write { id: ConnectionId, payload: PendingWrite },
    Writable { id: ConnectionId },
    Close {
        id: ConnectionId,
        session: BridgeSession,
        graceful: bool,
    },
}

/// worker 池。克隆成本为一次引用计数。
#[derive(Clone)]
pub struct IoWorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    workers: Vec<IoWorker>,
    next: AtomicUsize,
    read_buffer_size: usize,
}

/// 单个 worker 的句柄。
#[derive(Clone)]
pub(crate) struct IoWorker {
    index: usize,
    handle: Handle,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    shutdown: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl IoWorkerPool {
    /// 按 `config` 启动 worker 线程。
    pub fn new(config: &IoConfig) -> Result<Self> {
        let count = config.worker_count();
        let workers = (0..count)
            .map(|index| IoWorker::spawn(index, config.max_write_length))
            .collect::<Result<Vec<_>>>()?;
        debug!(target: TARGET_WORKER, workers = count, "io worker pool started");
        Ok(Self {
            inner: Arc::new(PoolInner {
                workers,
                next: AtomicUsize::new(0),
                read_buffer_size: config.read_buffer_size,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.workers.is_empty()
    }

    pub(crate) fn read_buffer_size(&self) -> usize {
        self.inner.read_buffer_size
    }

    /// 轮询挑选下一个 worker，新连接据此获得亲和性。
    pub(crate) fn next_worker(&self) -> &IoWorker {
        let index = self.inner.next.fetch_add(1, Ordering::Relaxed) % self.inner.workers.len();
        &self.inner.workers[index]
    }

    /// 监听循环与定时器固定使用第一个 worker。
    pub(crate) fn primary(&self) -> &IoWorker {
        &self.inner.workers[0]
    }

    /// 第一个 worker 的运行时句柄。
    pub fn handle(&self) -> Handle {
        self.primary().handle.clone()
    }

    /// 通知全部 worker 退出；不等待线程结束。
    pub fn shutdown(&self) {
        self.inner.signal_shutdown();
    }
}

impl PoolInner {
    fn signal_shutdown(&self) {
        for worker in &self.workers {
            if let Some(signal) = worker.shutdown.lock().take() {
                let _ = signal.send(());
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

impl IoWorker {
    fn spawn(index: usize, max_write_length: usize) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| map_io_error(error::CONFIGURE, error))?;
        let handle = runtime.handle().clone();
        let (commands, receiver) = mpsc::unbounded_channel();
        let (shutdown, stopped) = oneshot::channel::<()>();

        handle.spawn(
            WriteLoop {
                index,
                receiver,
                sender: commands.clone(),
                connections: HashMap::new(),
                arena: WriteArena::new(),
                max_write_length,
            }
            .run(),
        );
        thread::Builder::new()
            .name(format!("spark-bridge-io-{index}"))
            .spawn(move || {
                runtime.block_on(async move {
                    let _ = stopped.await;
                });
                trace!(target: TARGET_WORKER, worker = index, "io worker stopped");
            })
            .map_err(|error| map_io_error(error::CONFIGURE, error))?;

        Ok(Self {
            index,
            handle,
            commands,
            shutdown: Arc::new(Mutex::new(Some(shutdown))),
        })
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn commands(&self) -> mpsc::UnboundedSender<WorkerCommand> {
        self.commands.clone()
    }
}

struct Connection {
    writer: Arc<OwnedWriteHalf>,
    stop: Arc<Notify>,
    session: Option<WeakSession>,
    state: SessionWriteState,
    awaiting_writable: bool,
    closing: Option<BridgeSession>,
}

/// `OwnedWriteHalf` 的非阻塞写适配。
struct SocketWriter<'a>(&'a OwnedWriteHalf);

impl NonBlockingWrite for SocketWriter<'_> {
    fn try_write(&mut self, chunk: &[u8]) -> std::io::Result<usize> {
        self.0.try_write(chunk)
    }
}

struct WriteLoop {
    index: usize,
    receiver: mpsc::UnboundedReceiver<WorkerCommand>,
    sender: mpsc::UnboundedSender<WorkerCommand>,
    connections: HashMap<ConnectionId, Connection>,
    arena: WriteArena,
    max_write_length: usize,
}

impl WriteLoop {
    async fn run(mut self) {
        while let Some(command) = self.receiver.recv().await {
            self.handle(command);
            if self.receiver.is_empty() {
                let diverged = self.arena.clear();
                if diverged > 0 {
                    trace!(target: TARGET_WORKER, worker = self.index, diverged, "released diverged shared masters");
                }
            }
        }
    }

    fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Register { id, writer, stop } => {
                self.connections.insert(
                    id,
                    Connection {
                        writer,
                        stop,
                        session: None,
                        state: SessionWriteState::new(),
                        awaiting_writable: false,
                        closing: None,
                    },
                );
            }
            WorkerCommand::Attach { id, session } => {
                if let Some(connection) = self.connections.get_mut(&id) {
                    connection.session = Some(session);
                }
            }
            WorkerCommand::Write { id, payload } => match self.connections.get_mut(&id) {
                Some(connection) if connection.closing.is_none() => {
                    connection.state.enqueue(payload);
                    self.flush(id);
                }
                _ => trace!(target: TARGET_WORKER, worker = self.index, bytes = payload.len(), "write after close dropped"),
            },
            WorkerCommand::Writable { id } => {
                if let Some(connection) = self.connections.get_mut(&id) {
                    connection.awaiting_writable = false;
                    self.flush(id);
                }
            }
            WorkerCommand::Close { id, session, graceful } => {
                let drained = self
                    .connections
                    .get(&id)
                    .is_none_or(|connection| !connection.state.has_pending());
                if graceful && !drained {
                    if let Some(connection) = self.connections.get_mut(&id) {
                        connection.closing = Some(session);
                    }
                    self.flush(id);
                } else {
                    self.release(id, session);
                }
            }
        }
    }

    fn flush(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        if connection.awaiting_writable {
            return;
        }
        let mut writer = SocketWriter(&connection.writer);
        match connection
            .state
            .flush(&mut self.arena, &mut writer, self.max_write_length)
        {
            Ok(_) if connection.state.has_pending() => {
                connection.awaiting_writable = true;
                let writer = Arc::clone(&connection.writer);
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let _ = writer.writable().await;
                    let _ = sender.send(WorkerCommand::Writable { id });
                });
            }
            Ok(_) => {
                if let Some(session) = connection.closing.take() {
                    self.release(id, session);
                }
            }
            Err(io_error) => {
                let error = map_io_error(error::WRITE, io_error);
                warn!(target: TARGET_WORKER, worker = self.index, %error, "write failed, dropping connection");
                let session = connection
                    .closing
                    .take()
                    .or_else(|| connection.session.as_ref().and_then(WeakSession::upgrade));
                match session {
                    Some(session) => {
                        session.fire_exception_caught(error);
                        self.release(id, session);
                    }
                    None => {
                        if let Some(connection) = self.connections.remove(&id) {
                            connection.stop.notify_one();
                        }
                    }
                }
            }
        }
    }

    fn release(&mut self, id: ConnectionId, session: BridgeSession) {
        if let Some(mut connection) = self.connections.remove(&id) {
            let discarded = connection.state.clear();
            connection.stop.notify_one();
            trace!(
                target: TARGET_WORKER,
                worker = self.index,
                session = %session.id(),
                discarded,
                "connection released"
            );
        }
        session.fire_session_closed();
    }
}

/// 写循环已经退出（池被关闭）时的统一错误。
pub(crate) fn worker_gone(session: &BridgeSession) -> BridgeError {
    BridgeError::SessionClosed {
        session: session.id().get(),
    }
}
