//! # buffer 模块说明：共享写缓冲协议
//!
//! ## 核心意图（Why）
//! - 广播场景下，同一份编码后的负载会交给同一 I/O worker 上的许多会话；
//!   若每个会话各自复制一份，分配与拷贝成本随会话数线性增长；
//! - 因此 worker 持有一个按“逻辑层 id”索引的 [`WriteArena`]，同一负载在一个刷写周期内
//!   只安装一次主缓冲（master），各会话依次从它写出。
//!
//! ## 行为契约（What）
//! - [`write_buffer`]：非共享缓冲直接写并推进游标；共享缓冲先记录 `(position, remaining)`，
//!   写完后无论成败都把主缓冲游标恢复原位；若没有写完，把未写出的尾部复制进会话私有的
//!   “未完成写”续体，该会话此后只从续体续写；
//! - [`SessionWriteState::flush`]：每次刷写先尝试续写私有续体，续体清空前不会再读取主缓冲；
//! - 主缓冲对其它会话可见的状态永远是“未被任何会话部分消费”的原貌。
//!
//! ## 所有权模型（How）
//! - arena 由 worker 循环独占，调用方以 `&mut` 显式传入，不存在线程局部的隐式状态；
//! - 负载本身是 `Bytes`，分叉时只复制尚未写出的尾部。
//!
//! ## 风险提示（Trade-offs）
//! - 主缓冲在完整写出后同样会被复位，这让后续共享者始终从原始偏移开始，
//!   代价是无法用主缓冲游标表达“某会话已写完”，完成状态改由会话自己的队列记录。

use std::collections::VecDeque;
use std::fmt;
use std::io;

use bytes::Bytes;

/// 逻辑层标识，作为 [`WriteArena`] 的槽位索引。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u32);

impl LayerId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

/// 非阻塞写出能力。
///
/// 实现者必须在内核缓冲已满时返回 `Ok(0)` 或 `ErrorKind::WouldBlock`，不得阻塞调用线程。
pub trait NonBlockingWrite {
    fn try_write(&mut self, chunk: &[u8]) -> io::Result<usize>;
}

impl<W: NonBlockingWrite + ?Sized> NonBlockingWrite for &mut W {
    fn try_write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        (**self).try_write(chunk)
    }
}

/// 带游标的写缓冲。
///
/// - `shared == true` 时它是 arena 中的主缓冲，任何会话都不得让游标停留在非原始位置；
/// - 有会话从它分叉时 `diverged` 置位；分叉出去的尾部永远是私有缓冲，主缓冲本身保持原貌。
///   分叉的会话此后只续写自己的私有尾部，对它而言负载永久转为非共享；主缓冲仍保持
///   `shared`，其余会话继续从原始偏移写出。
#[derive(Clone)]
pub struct SharedWriteBuffer {
    data: Bytes,
    position: usize,
    limit: usize,
    shared: bool,
    diverged: bool,
}

impl SharedWriteBuffer {
    /// 构造共享主缓冲。
    pub fn shared(data: Bytes) -> Self {
        let limit = data.len();
        Self {
            data,
            position: 0,
            limit,
            shared: true,
            diverged: false,
        }
    }

    /// 构造会话私有缓冲。
    pub fn unshared(data: Bytes) -> Self {
        Self {
            shared: false,
            ..Self::shared(data)
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// 是否曾有会话从该缓冲分叉。
    pub fn has_diverged(&self) -> bool {
        self.diverged
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// 游标到上限之间的字节。
    pub fn chunk(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    fn advance(&mut self, count: usize) {
        self.position = (self.position + count).min(self.limit);
    }

    fn rewind_to(&mut self, position: usize) {
        self.position = position.min(self.limit);
    }

    /// 复制 `[from, limit)` 为新的私有缓冲。
    fn split_private_tail(&self, from: usize) -> SharedWriteBuffer {
        let tail = Bytes::copy_from_slice(&self.data[from.min(self.limit)..self.limit]);
        SharedWriteBuffer::unshared(tail)
    }

    /// 是否承载同一份负载（同一分配、同一长度）。
    fn carries(&self, payload: &Bytes) -> bool {
        self.data.as_ptr() == payload.as_ptr() && self.data.len() == payload.len()
    }
}

impl fmt::Debug for SharedWriteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWriteBuffer")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("shared", &self.shared)
            .field("diverged", &self.diverged)
            .finish()
    }
}

/// worker 独占的主缓冲 arena。
///
/// # 教案式说明
/// - **意图 (Why)**：为每个逻辑层保留一个主缓冲槽位，同一负载只安装一次；
/// - **契约 (What)**：`share` 在槽位已承载同一负载时直接复用，否则原地替换；
///   替换不会影响已经分叉出去的私有续体；
/// - **风险 (Trade-offs)**：槽位按层 id 线性扩容，层 id 应取自小整数空间（例如 scheme 序号）。
#[derive(Debug, Default)]
pub struct WriteArena {
    slots: Vec<Option<SharedWriteBuffer>>,
    installs: u64,
}

impl WriteArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取 `layer` 对应的主缓冲，必要时安装 `payload`。
    pub fn share(&mut self, layer: LayerId, payload: &Bytes) -> &mut SharedWriteBuffer {
        let index = layer.get() as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        let reusable = matches!(&self.slots[index], Some(master) if master.carries(payload));
        if !reusable {
            self.installs += 1;
        }
        let slot = &mut self.slots[index];
        if !reusable {
            *slot = Some(SharedWriteBuffer::shared(payload.clone()));
        }
        slot.get_or_insert_with(|| SharedWriteBuffer::shared(payload.clone()))
    }

    pub fn master(&self, layer: LayerId) -> Option<&SharedWriteBuffer> {
        self.slots.get(layer.get() as usize).and_then(Option::as_ref)
    }

    /// 释放槽位，负载的最后一个引用随之回收。
    pub fn release(&mut self, layer: LayerId) {
        if let Some(slot) = self.slots.get_mut(layer.get() as usize) {
            *slot = None;
        }
    }

    /// 释放全部槽位；worker 在一轮命令处理完毕、队列为空时调用。
    ///
    /// 返回被释放的主缓冲中曾发生分叉的个数。
    pub fn clear(&mut self) -> usize {
        self.slots
            .iter_mut()
            .filter_map(Option::take)
            .filter(SharedWriteBuffer::has_diverged)
            .count()
    }

    /// 累计安装主缓冲的次数。
    pub fn installs(&self) -> u64 {
        self.installs
    }
}

/// 待写请求。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingWrite {
    /// 会话私有负载。
    Private(Bytes),
    /// 可在同一 worker 的会话间共享的负载。
    Shared { layer: LayerId, payload: Bytes },
}

impl PendingWrite {
    pub fn len(&self) -> usize {
        match self {
            PendingWrite::Private(bytes) => bytes.len(),
            PendingWrite::Shared { payload, .. } => payload.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 一次刷写的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub written: usize,
    /// 仍有未写出的数据，需要等待下一次可写通知。
    pub pending: bool,
}

/// 对单个缓冲执行一次受 `max_length` 限制的非阻塞写。
///
/// # 教案式说明
/// - **意图 (Why)**：这是共享写缓冲协议的核心步骤，保证共享主缓冲不会暴露某个会话的部分进度；
/// - **契约 (What)**：
///   - 返回本次写出的字节数；`WouldBlock` 视为写出 0 字节；
///   - 非共享缓冲：游标前进 `written`；
///   - 共享缓冲：游标恢复到调用前位置；若 `written < remaining`，尾部复制进 `incomplete`
///     成为私有续体，主缓冲记录一次分叉；
/// - **前置条件**：`incomplete` 必须为空，调用方应先续写私有续体。
pub fn write_buffer<W: NonBlockingWrite + ?Sized>(
    transport: &mut W,
    buffer: &mut SharedWriteBuffer,
    incomplete: &mut Option<SharedWriteBuffer>,
    max_length: usize,
) -> io::Result<usize> {
    let length = buffer.remaining().min(max_length);
    if !buffer.is_shared() {
        let written = try_write_chunk(transport, &buffer.chunk()[..length])?;
        buffer.advance(written);
        return Ok(written);
    }

    let position = buffer.position();
    let remaining = buffer.remaining();
    let written = try_write_chunk(transport, &buffer.chunk()[..length])?;
    buffer.advance(written);
    if written < remaining {
        *incomplete = Some(buffer.split_private_tail(position + written));
        buffer.diverged = true;
        tracing::trace!(
            target: "spark_bridge::buffer",
            written,
            remaining,
            "partial write diverged from shared master"
        );
    }
    buffer.rewind_to(position);
    Ok(written)
}

fn try_write_chunk<W: NonBlockingWrite + ?Sized>(transport: &mut W, chunk: &[u8]) -> io::Result<usize> {
    if chunk.is_empty() {
        return Ok(0);
    }
    loop {
        match transport.try_write(chunk) {
            Ok(written) => return Ok(written.min(chunk.len())),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
}

/// 单个会话的写路径状态：待写队列 + 未完成写续体。
#[derive(Debug, Default)]
pub struct SessionWriteState {
    queue: VecDeque<PendingWrite>,
    incomplete: Option<SharedWriteBuffer>,
    written_total: u64,
    divergences: u64,
}

impl SessionWriteState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, write: PendingWrite) {
        if !write.is_empty() {
            self.queue.push_back(write);
        }
    }

    /// 是否还有任何待写字节。
    pub fn has_pending(&self) -> bool {
        self.incomplete.is_some() || !self.queue.is_empty()
    }

    pub fn incomplete(&self) -> Option<&SharedWriteBuffer> {
        self.incomplete.as_ref()
    }

    pub fn written_total(&self) -> u64 {
        self.written_total
    }

    /// 该会话从共享主缓冲分叉的次数。
    pub fn divergences(&self) -> u64 {
        self.divergences
    }

    /// 尽可能多地写出，直到队列清空或传输层不再接受数据。
    ///
    /// - 先续写私有续体；续体未清空前不触碰队列中的任何共享负载；
    /// - 共享负载通过 `arena` 取得主缓冲，同一刷写周期内同一负载只安装一次。
    pub fn flush<W: NonBlockingWrite + ?Sized>(
        &mut self,
        arena: &mut WriteArena,
        transport: &mut W,
        max_length: usize,
    ) -> io::Result<FlushOutcome> {
        let mut outcome = FlushOutcome::default();
        loop {
            if let Some(mut private) = self.incomplete.take() {
                let mut unused = None;
                let written = write_buffer(transport, &mut private, &mut unused, max_length)?;
                outcome.written += written;
                self.written_total += written as u64;
                if private.has_remaining() {
                    self.incomplete = Some(private);
                    if written == 0 {
                        outcome.pending = true;
                        return Ok(outcome);
                    }
                    continue;
                }
            }

            let Some(next) = self.queue.pop_front() else {
                return Ok(outcome);
            };
            let written = match next {
                PendingWrite::Private(bytes) => {
                    let mut private = SharedWriteBuffer::unshared(bytes);
                    let written = write_buffer(transport, &mut private, &mut self.incomplete, max_length)?;
                    if private.has_remaining() {
                        self.incomplete = Some(private);
                    }
                    written
                }
                PendingWrite::Shared { layer, payload } => {
                    let master = arena.share(layer, &payload);
                    let written = write_buffer(transport, master, &mut self.incomplete, max_length)?;
                    if self.incomplete.is_some() {
                        self.divergences += 1;
                    }
                    written
                }
            };
            outcome.written += written;
            self.written_total += written as u64;
            if self.incomplete.is_some() && written == 0 {
                outcome.pending = true;
                return Ok(outcome);
            }
        }
    }

    /// 丢弃全部待写数据，返回被丢弃的字节数。
    pub fn clear(&mut self) -> usize {
        let queued: usize = self.queue.drain(..).map(|w| w.len()).sum();
        let incomplete = self.incomplete.take().map_or(0, |b| b.remaining());
        queued + incomplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 每次最多接受 `budget` 字节的写端，记录写出的全部字节。
    struct Throttled {
        budget: usize,
        out: Vec<u8>,
    }

    impl NonBlockingWrite for Throttled {
        fn try_write(&mut self, chunk: &[u8]) -> io::Result<usize> {
            let n = chunk.len().min(self.budget);
            self.budget -= n;
            self.out.extend_from_slice(&chunk[..n]);
            Ok(n)
        }
    }

    #[test]
    fn partial_shared_write_leaves_master_pristine() {
        let payload = Bytes::from_static(b"0123456789");
        let mut arena = WriteArena::new();
        let layer = LayerId::new(3);

        let mut first = Throttled { budget: 4, out: Vec::new() };
        let mut first_state = SessionWriteState::new();
        first_state.enqueue(PendingWrite::Shared { layer, payload: payload.clone() });
        let outcome = first_state.flush(&mut arena, &mut first, 64).expect("写入不应失败");
        assert_eq!(outcome, FlushOutcome { written: 4, pending: true });
        assert_eq!(first_state.incomplete().map(|b| b.remaining()), Some(6));

        let master = arena.master(layer).expect("主缓冲应存在");
        assert_eq!(master.remaining(), payload.len(), "分叉后主缓冲剩余量必须不变");
        assert_eq!(master.position(), 0);

        let mut second = Throttled { budget: usize::MAX, out: Vec::new() };
        let mut second_state = SessionWriteState::new();
        second_state.enqueue(PendingWrite::Shared { layer, payload: payload.clone() });
        second_state.flush(&mut arena, &mut second, 64).expect("写入不应失败");
        assert_eq!(second.out, b"0123456789", "第二个会话必须从原始偏移开始写");

        first.budget = usize::MAX;
        let outcome = first_state.flush(&mut arena, &mut first, 64).expect("续写不应失败");
        assert!(!outcome.pending);
        assert_eq!(first.out, b"0123456789");
        assert_eq!(first_state.divergences(), 1);

        let master = arena.master(layer).expect("主缓冲应存在");
        assert!(master.is_shared(), "分叉不影响主缓冲的共享属性");
        assert!(master.has_diverged());
        assert_eq!(arena.clear(), 1, "释放时报告分叉过的主缓冲");
        assert!(arena.master(layer).is_none());
    }

    #[test]
    fn unshared_buffer_advances_cursor() {
        let mut buffer = SharedWriteBuffer::unshared(Bytes::from_static(b"abcdef"));
        let mut sink = Throttled { budget: 2, out: Vec::new() };
        let mut incomplete = None;
        let written = write_buffer(&mut sink, &mut buffer, &mut incomplete, 16).expect("写入");
        assert_eq!(written, 2);
        assert_eq!(buffer.position(), 2);
        assert!(incomplete.is_none(), "私有缓冲不产生续体");
    }

    #[test]
    fn max_length_bounds_a_single_write() {
        let payload = Bytes::from_static(b"abcdef");
        let mut arena = WriteArena::new();
        let mut sink = Throttled { budget: usize::MAX, out: Vec::new() };
        let mut state = SessionWriteState::new();
        state.enqueue(PendingWrite::Shared { layer: LayerId::new(0), payload });
        let outcome = state.flush(&mut arena, &mut sink, 4).expect("写入");
        assert_eq!(outcome.written, 6, "续体会在同一次刷写中继续写出");
        assert_eq!(sink.out, b"abcdef");
    }

    #[test]
    fn arena_reuses_master_for_identical_payload() {
        let payload = Bytes::from_static(b"broadcast");
        let mut arena = WriteArena::new();
        arena.share(LayerId::new(1), &payload);
        arena.share(LayerId::new(1), &payload);
        assert_eq!(arena.installs(), 1);
        arena.share(LayerId::new(1), &Bytes::from_static(b"other"));
        assert_eq!(arena.installs(), 2);
        arena.release(LayerId::new(1));
        assert!(arena.master(LayerId::new(1)).is_none());
    }
}
