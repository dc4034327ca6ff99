//! 物理 TCP 连接：会话处理器与读循环。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use spark_bridge::buffer::PendingWrite;
use spark_bridge::session::SessionProcessor;
use spark_bridge::{BridgeSession, Result};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{Notify, mpsc};
use tracing::trace;

use crate::TARGET_WORKER;
use crate::error::{self, map_io_error};
use crate::worker::{ConnectionId, IoWorker, WorkerCommand, worker_gone};

/// 物理会话的 [`SessionProcessor`]：把写与关闭请求投递给连接所属 worker 的写循环。
///
/// # 教案式说明
/// - **契约 (What)**：`write` 从不阻塞；`close` 幂等，队列写完后才真正释放连接；
///   worker 已经退出时 `close` 就地触发 `closed`，保证会话不会悬挂。
pub struct TcpProcessor {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    closed: AtomicBool,
}

impl TcpProcessor {
    pub(crate) fn new(id: ConnectionId, commands: mpsc::UnboundedSender<WorkerCommand>) -> Self {
        Self {
            id,
            commands,
            closed: AtomicBool::new(false),
        }
    }

    fn shutdown(&self, session: &BridgeSession, graceful: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let command = WorkerCommand::Close {
            id: self.id,
            session: session.clone(),
            graceful,
        };
        if self.commands.send(command).is_err() {
            session.fire_session_closed();
        }
    }

    /// 对端断开或读失败：丢弃待写数据后释放。
    pub(crate) fn abort(&self, session: &BridgeSession) {
        self.shutdown(session, false);
    }
}

impl SessionProcessor for TcpProcessor {
    fn write(&self, session: &BridgeSession, payload: PendingWrite) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(worker_gone(session));
        }
        self.commands
            .send(WorkerCommand::Write { id: self.id, payload })
            .map_err(|_| worker_gone(session))
    }

    fn close(&self, session: &BridgeSession) {
        self.shutdown(session, true);
    }
}

/// 已在 worker 运行时注册的连接，尚未挂上会话。
pub(crate) struct Adopted {
    pub processor: Arc<TcpProcessor>,
    reader: OwnedReadHalf,
    stop: Arc<Notify>,
    id: ConnectionId,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl Adopted {
    /// 拆分流并把写半部登记到 `worker` 的写循环。必须在 `worker` 的运行时内调用。
    pub(crate) fn register(worker: &IoWorker, stream: TcpStream) -> Self {
        let id = ConnectionId::next();
        let commands = worker.commands();
        let (reader, writer) = stream.into_split();
        let stop = Arc::new(Notify::new());
        let _ = commands.send(WorkerCommand::Register {
            id,
            writer: Arc::new(writer),
            stop: Arc::clone(&stop),
        });
        Self {
            processor: Arc::new(TcpProcessor::new(id, commands.clone())),
            reader,
            stop,
            id,
            commands,
        }
    }

    /// 会话构造完成后登记弱引用并运行读循环，直到连接释放。
    pub(crate) async fn serve(self, session: BridgeSession, read_buffer_size: usize) {
        let _ = self.commands.send(WorkerCommand::Attach {
            id: self.id,
            session: session.downgrade(),
        });
        if session.is_closed() {
            return;
        }
        read_loop(self.reader, &session, &self.processor, &self.stop, read_buffer_size).await;
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    session: &BridgeSession,
    processor: &TcpProcessor,
    stop: &Notify,
    read_buffer_size: usize,
) {
    let mut buffer = BytesMut::with_capacity(read_buffer_size);
    loop {
        buffer.reserve(read_buffer_size);
        tokio::select! {
            _ = stop.notified() => break,
            result = reader.read_buf(&mut buffer) => match result {
                Ok(0) => {
                    trace!(target: TARGET_WORKER, session = %session.id(), "peer closed");
                    processor.abort(session);
                    break;
                }
                Ok(count) => {
                    trace!(target: TARGET_WORKER, session = %session.id(), bytes = count, "read");
                    session.fire_message_received(buffer.split().freeze());
                }
                Err(io_error) => {
                    session.fire_exception_caught(map_io_error(error::READ, io_error));
                    processor.abort(session);
                    break;
                }
            }
        }
    }
}
