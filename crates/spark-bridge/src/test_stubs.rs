//! 测试桩：内存物理传输、记录型处理器与过滤器、手动推进的定时器。
//!
//! # 设计背景（Why）
//! - 会话链、分发与绑定的绝大多数行为与真实 socket 无关，用内存实现即可在单线程内确定性地复现；
//! - 集中维护这些桩，契约演进时只需在一处适配。
//!
//! # 使用方式（How）
//! - 以 [`MockPhysicalBinder`] / [`MockPhysicalConnector`] 注册到 [`BridgeBuilder`](crate::BridgeBuilder)；
//! - 以 [`MockPhysicalBinder::accept`] 模拟一个新连接，得到可 `send` / `written` 的 [`MemoryConnection`]；
//! - 以 [`ManualTimer::advance`] 推进时间触发嗅探超时。
//!
//! # 风险提示（Trade-offs）
//! - 所有桩都在调用线程上同步执行回调，不模拟 worker 间的并发交错。

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::address::{BindKey, ResourceAddress, ResourceAddressFactory};
use crate::bridge::{ConnectionSink, PhysicalBinder, PhysicalConnector};
use crate::buffer::{NonBlockingWrite, PendingWrite};
use crate::dispatch::{ProtocolSniffer, SniffVerdict};
use crate::error::{BridgeError, Result};
use crate::runtime::{ConnectFuture, TimerHandle, TimerService, TimerTask, UnbindFuture};
use crate::session::{
    BridgeHandler, BridgeSession, IdleStatus, NextFilter, SessionFilter, SessionId, SessionInitializer,
    SessionProcessor,
};

/// 记录下来的会话事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerEvent {
    Created,
    Opened,
    Message(Bytes),
    Idle(IdleStatus),
    /// 异常的稳定错误码。
    Exception(&'static str),
    Closed,
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<(SessionId, HandlerEvent)>>,
}

impl EventLog {
    fn push(&self, session: &BridgeSession, event: HandlerEvent) {
        self.events.lock().push((session.id(), event));
    }

    fn for_session(&self, id: SessionId) -> Vec<HandlerEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(owner, _)| *owner == id)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

/// 记录全部事件的处理器；`echo()` 构造的实例会把收到的消息原样写回。
#[derive(Default)]
pub struct RecordingHandler {
    log: EventLog,
    sessions: Mutex<Vec<BridgeSession>>,
    echo: bool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    pub fn events_for(&self, id: SessionId) -> Vec<HandlerEvent> {
        self.log.for_session(id)
    }

    pub fn events(&self) -> Vec<(SessionId, HandlerEvent)> {
        self.log.events.lock().clone()
    }

    /// 收到过 `created` 的会话，按到达顺序。
    pub fn sessions(&self) -> Vec<BridgeSession> {
        self.sessions.lock().clone()
    }

    pub fn last_session(&self) -> Option<BridgeSession> {
        self.sessions.lock().last().cloned()
    }
}

impl BridgeHandler for RecordingHandler {
    fn session_created(&self, session: &BridgeSession) -> Result<()> {
        self.sessions.lock().push(session.clone());
        self.log.push(session, HandlerEvent::Created);
        Ok(())
    }

    fn session_opened(&self, session: &BridgeSession) {
        self.log.push(session, HandlerEvent::Opened);
    }

    fn message_received(&self, session: &BridgeSession, message: Bytes) {
        self.log.push(session, HandlerEvent::Message(message.clone()));
        if self.echo {
            let _ = session.write_bytes(message);
        }
    }

    fn session_idle(&self, session: &BridgeSession, status: IdleStatus) {
        self.log.push(session, HandlerEvent::Idle(status));
    }

    fn exception_caught(&self, session: &BridgeSession, error: &BridgeError) {
        self.log.push(session, HandlerEvent::Exception(error.code()));
    }

    fn session_closed(&self, session: &BridgeSession) {
        self.log.push(session, HandlerEvent::Closed);
    }
}

/// 记录流经自身的入站事件并原样传递的过滤器。
#[derive(Default)]
pub struct RecordingFilter {
    log: EventLog,
}

impl RecordingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_for(&self, id: SessionId) -> Vec<HandlerEvent> {
        self.log.for_session(id)
    }
}

impl SessionFilter for RecordingFilter {
    fn session_created(&self, next: NextFilter<'_>, session: &BridgeSession) {
        self.log.push(session, HandlerEvent::Created);
        next.session_created(session);
    }

    fn session_opened(&self, next: NextFilter<'_>, session: &BridgeSession) {
        self.log.push(session, HandlerEvent::Opened);
        next.session_opened(session);
    }

    fn message_received(&self, next: NextFilter<'_>, session: &BridgeSession, message: Bytes) {
        self.log.push(session, HandlerEvent::Message(message.clone()));
        next.message_received(session, message);
    }

    fn session_idle(&self, next: NextFilter<'_>, session: &BridgeSession, status: IdleStatus) {
        self.log.push(session, HandlerEvent::Idle(status));
        next.session_idle(session, status);
    }

    fn exception_caught(&self, next: NextFilter<'_>, session: &BridgeSession, error: BridgeError) {
        self.log.push(session, HandlerEvent::Exception(error.code()));
        next.exception_caught(session, error);
    }

    fn session_closed(&self, next: NextFilter<'_>, session: &BridgeSession) {
        self.log.push(session, HandlerEvent::Closed);
        next.session_closed(session);
    }
}

/// 把写入收集进内存的物理 processor；`close` 同步触发 `closed`。
#[derive(Default)]
pub struct MemoryProcessor {
    written: Mutex<BytesMut>,
    shared_writes: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryProcessor {
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().to_vec()
    }

    /// 以共享负载形式到达的写入次数。
    pub fn shared_writes(&self) -> usize {
        self.shared_writes.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl SessionProcessor for MemoryProcessor {
    fn write(&self, session: &BridgeSession, payload: PendingWrite) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::SessionClosed {
                session: session.id().get(),
            });
        }
        match payload {
            PendingWrite::Private(bytes) => self.written.lock().extend_from_slice(&bytes),
            PendingWrite::Shared { payload, .. } => {
                self.shared_writes.fetch_add(1, Ordering::AcqRel);
                self.written.lock().extend_from_slice(&payload);
            }
        }
        Ok(())
    }

    fn close(&self, session: &BridgeSession) {
        self.closed.store(true, Ordering::Release);
        session.fire_session_closed();
    }
}

/// 一条内存物理连接。
#[derive(Clone)]
pub struct MemoryConnection {
    session: BridgeSession,
    processor: Arc<MemoryProcessor>,
}

impl MemoryConnection {
    pub fn session(&self) -> &BridgeSession {
        &self.session
    }

    /// 模拟对端发来一段字节。
    pub fn send(&self, bytes: &[u8]) {
        self.session
            .fire_message_received(Bytes::copy_from_slice(bytes));
    }

    /// 本端写往对端的全部字节。
    pub fn written(&self) -> Vec<u8> {
        self.processor.written()
    }

    pub fn shared_writes(&self) -> usize {
        self.processor.shared_writes()
    }

    /// 模拟对端断开。
    pub fn disconnect(&self) {
        self.processor.closed.store(true, Ordering::Release);
        self.session.fire_session_closed();
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}

/// 内存监听：记录绑定与解绑，按绑定键保存接入回调。
#[derive(Default)]
pub struct MockPhysicalBinder {
    sinks: Mutex<HashMap<BindKey, Arc<dyn ConnectionSink>>>,
    fail_on: Mutex<HashSet<BindKey>>,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
    next_port: AtomicUsize,
}

impl MockPhysicalBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让该地址上的下一次 `bind` 失败，模拟端口被占用。
    pub fn fail_on(&self, address: &ResourceAddress) {
        self.fail_on.lock().insert(address.bind_key().clone());
    }

    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::Acquire)
    }

    pub fn unbind_count(&self) -> usize {
        self.unbinds.load(Ordering::Acquire)
    }

    pub fn is_bound(&self, address: &ResourceAddress) -> bool {
        self.sinks.lock().contains_key(address.bind_key())
    }

    /// 当前处于监听状态的绑定键。
    pub fn active(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sinks.lock().keys().map(ToString::to_string).collect();
        keys.sort();
        keys
    }

    /// 在 `address` 的监听上模拟一个新连接；未监听时返回 `None`。
    pub fn accept(&self, address: &ResourceAddress) -> Option<MemoryConnection> {
        let sink = self.sinks.lock().get(address.bind_key()).cloned()?;
        let port = 40_000 + self.next_port.fetch_add(1, Ordering::AcqRel);
        let processor = Arc::new(MemoryProcessor::default());
        let session = sink.accept(processor.clone(), &format!("127.0.0.1:{port}"));
        Some(MemoryConnection { session, processor })
    }
}

impl PhysicalBinder for MockPhysicalBinder {
    fn bind(&self, address: &ResourceAddress, sink: Arc<dyn ConnectionSink>) -> Result<()> {
        if self.fail_on.lock().remove(address.bind_key()) {
            return Err(BridgeError::BindFailed {
                address: address.to_string(),
                detail: "address already in use".into(),
            });
        }
        self.binds.fetch_add(1, Ordering::AcqRel);
        self.sinks.lock().insert(address.bind_key().clone(), sink);
        Ok(())
    }

    fn unbind(&self, address: &ResourceAddress) -> UnbindFuture {
        self.unbinds.fetch_add(1, Ordering::AcqRel);
        self.sinks.lock().remove(address.bind_key());
        futures::future::ready(Ok(())).boxed()
    }
}

/// 内存连接器：每次连接创建一个 [`MemoryProcessor`] 支撑的物理会话。
#[derive(Default)]
pub struct MockPhysicalConnector {
    connections: Mutex<Vec<MemoryConnection>>,
    refuse: Mutex<HashSet<BindKey>>,
    attempts: AtomicUsize,
}

impl MockPhysicalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 拒绝发往 `address` 的连接。
    pub fn refuse(&self, address: &ResourceAddress) {
        self.refuse.lock().insert(address.bind_key().clone());
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn connections(&self) -> Vec<MemoryConnection> {
        self.connections.lock().clone()
    }
}

impl PhysicalConnector for MockPhysicalConnector {
    fn connect(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> ConnectFuture {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if self.refuse.lock().contains(address.bind_key()) {
            let error = BridgeError::ConnectionFailed {
                detail: format!("connection to {address} refused"),
            };
            return futures::future::ready(Err(error)).boxed();
        }
        let local = ResourceAddressFactory::new()
            .peer_address(address.scheme(), "127.0.0.1:50000", None)
            .ok();
        let processor = Arc::new(MemoryProcessor::default());
        let mut builder = BridgeSession::builder(address.scheme(), processor.clone())
            .service(format!("{}-connector", address.scheme()))
            .remote_address(Some(address.clone()))
            .handler(handler);
        if let Some(local) = local {
            builder = builder.local_address(local);
        }
        let session = builder.build();
        self.connections.lock().push(MemoryConnection {
            session: session.clone(),
            processor,
        });
        let result = session.open(initializer.as_ref()).map(|()| session);
        futures::future::ready(result).boxed()
    }
}

#[derive(Default)]
struct TimerState {
    now: Duration,
    next_id: u64,
    tasks: Vec<(u64, Duration, TimerTask)>,
}

/// 手动推进的定时器。
#[derive(Clone, Default)]
pub struct ManualTimer {
    state: Arc<Mutex<TimerState>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尚未触发且未取消的任务数。
    pub fn pending(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// 推进时间并按到期顺序运行到期任务；任务运行时不持有内部锁。
    pub fn advance(&self, delta: Duration) {
        let deadline = {
            let mut state = self.state.lock();
            state.now += delta;
            state.now
        };
        loop {
            let task = {
                let mut state = self.state.lock();
                let due = state
                    .tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, at, _))| *at <= deadline)
                    .min_by_key(|(_, (id, at, _))| (*at, *id))
                    .map(|(index, _)| index);
                match due {
                    Some(index) => state.tasks.remove(index).2,
                    None => return,
                }
            };
            task();
        }
    }
}

impl TimerService for ManualTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let due = state.now + delay;
            state.tasks.push((id, due, task));
            id
        };
        let state = Arc::clone(&self.state);
        TimerHandle::new(move || {
            state.lock().tasks.retain(|(task_id, _, _)| *task_id != id);
        })
    }
}

/// 返回固定结论并统计调用次数的嗅探器。
pub struct ScriptedSniffer {
    verdict: SniffVerdict,
    calls: AtomicUsize,
}

impl ScriptedSniffer {
    pub fn new(verdict: SniffVerdict) -> Self {
        Self {
            verdict,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

impl ProtocolSniffer for ScriptedSniffer {
    fn sniff(&self, _prefix: &[u8]) -> SniffVerdict {
        self.calls.fetch_add(1, Ordering::AcqRel);
        self.verdict
    }
}

/// 带字节额度的写端：额度随写出递减，耗尽后报告 `WouldBlock`，直到 `set_budget` 补充。
#[derive(Debug, Default)]
pub struct LimitedWriter {
    budget: usize,
    out: Vec<u8>,
}

impl LimitedWriter {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            out: Vec::new(),
        }
    }

    pub fn set_budget(&mut self, budget: usize) {
        self.budget = budget;
    }

    pub fn output(&self) -> &[u8] {
        &self.out
    }
}

impl NonBlockingWrite for LimitedWriter {
    fn try_write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        if self.budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let accepted = chunk.len().min(self.budget);
        self.budget -= accepted;
        self.out.extend_from_slice(&chunk[..accepted]);
        Ok(accepted)
    }
}
