//! 会话的出站终点。

use crate::buffer::PendingWrite;
use crate::error::{BridgeError, Result};

use super::BridgeSession;

/// 出站写与关闭请求的最终执行者。
///
/// # 教案式说明
/// - **意图 (Why)**：物理会话的 processor 把数据交给 I/O worker，逻辑会话的 processor
///   把数据交给父会话（必要时先加密），过滤器链因此无需区分层次；
/// - **契约 (What)**：
///   - `write` 不得阻塞，超出内核缓冲的数据由实现自行排队；
///   - `close` 必须幂等，并最终触发一次 `session.fire_session_closed()`；
///   - `reset` 用于“非正常终止”，默认先上报异常再关闭。
pub trait SessionProcessor: Send + Sync + 'static {
    fn write(&self, session: &BridgeSession, payload: PendingWrite) -> Result<()>;

    fn close(&self, session: &BridgeSession);

    fn reset(&self, session: &BridgeSession, error: BridgeError) {
        session.fire_exception_caught(error);
        self.close(session);
    }
}

/// 透传逻辑层的 processor：写入原样交给父会话。
///
/// 关闭子会话后，若父会话上已没有其它存活的子会话，则一并关闭父会话。
#[derive(Debug, Default, Clone, Copy)]
pub struct ParentProcessor;

impl SessionProcessor for ParentProcessor {
    fn write(&self, session: &BridgeSession, payload: PendingWrite) -> Result<()> {
        match session.parent() {
            Some(parent) => parent.write(payload),
            None => Err(BridgeError::SessionClosed {
                session: session.id().get(),
            }),
        }
    }

    fn close(&self, session: &BridgeSession) {
        session.fire_session_closed();
        if let Some(parent) = session.parent()
            && parent.children().is_empty()
        {
            parent.close();
        }
    }
}
