//! 会话处理器与会话初始化器。

use bytes::Bytes;

use super::BridgeSession;
use crate::error::{BridgeError, Result};

/// 空闲类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdleStatus {
    Read,
    Write,
    Both,
}

/// 某一协议层会话的事件回调。
///
/// # 教案式说明
/// - **意图 (Why)**：服务与协议层都以同一套回调观察会话，协议层（TLS、透传层）本身就是
///   下层会话的处理器，从而把“层叠”表达为处理器的组合；
/// - **契约 (What)**：
///   - 同一会话的事件按 `created → opened → (idle | exception | message)* → closed` 顺序到达；
///   - `session_created` 返回错误时，会话触发 `exception_caught` 后关闭；
///   - 回调在连接所属 worker 上同步执行，不得阻塞。
/// - **风险 (Trade-offs)**：默认实现全部为空操作，实现者只需覆盖关心的事件。
pub trait BridgeHandler: Send + Sync + 'static {
    fn session_created(&self, session: &BridgeSession) -> Result<()> {
        let _ = session;
        Ok(())
    }

    fn session_opened(&self, session: &BridgeSession) {
        let _ = session;
    }

    fn message_received(&self, session: &BridgeSession, message: Bytes) {
        let _ = (session, message);
    }

    fn session_idle(&self, session: &BridgeSession, status: IdleStatus) {
        let _ = (session, status);
    }

    fn exception_caught(&self, session: &BridgeSession, error: &BridgeError) {
        let _ = (session, error);
    }

    fn session_closed(&self, session: &BridgeSession) {
        let _ = session;
    }
}

/// 解析出绑定后、首个事件交付前执行的每会话初始化（通常用于安装过滤器）。
pub trait SessionInitializer: Send + Sync + 'static {
    fn initialize(&self, session: &BridgeSession) -> Result<()>;
}

impl<F> SessionInitializer for F
where
    F: Fn(&BridgeSession) -> Result<()> + Send + Sync + 'static,
{
    fn initialize(&self, session: &BridgeSession) -> Result<()> {
        self(session)
    }
}

/// 协议尚未解析时会话挂载的占位处理器。
#[derive(Debug, Default)]
pub(crate) struct PendingHandler;

impl BridgeHandler for PendingHandler {}
