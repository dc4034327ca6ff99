//! 透传协议层：`http`、`ws`、`wse`、`wsx`。
//!
//! 这些层在本 crate 中不解析帧，只负责在父会话之上建立一个逻辑会话、原样转发字节，
//! 从而让上层的下一协议分发与共享写缓冲在完整的层次结构上工作。

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::channel::oneshot;
use parking_lot::Mutex;
use tracing::debug;

use super::connector::{BridgeConnector, ConnectorTable};
use super::layer::{ConnectorContext, LayerContext};
use crate::address::{ResourceAddress, Scheme};
use crate::error::{BridgeError, Result};
use crate::observability::{TARGET_CONNECT, TARGET_SESSION};
use crate::runtime::ConnectFuture;
use crate::session::{
    BridgeHandler, BridgeSession, IdleStatus, ParentProcessor, SessionInitializer,
};

/// 父会话属性：本层在其上建立的子会话。
#[derive(Clone)]
pub struct ChildSession(pub BridgeSession);

fn child_of(parent: &BridgeSession) -> Option<BridgeSession> {
    parent.attribute::<ChildSession>().map(|ChildSession(child)| child)
}

fn forward_message(parent: &BridgeSession, message: Bytes) {
    if let Some(child) = child_of(parent) {
        child.fire_message_received(message);
    }
}

fn forward_idle(parent: &BridgeSession, status: IdleStatus) {
    if let Some(child) = child_of(parent) {
        child.fire_session_idle(status);
    }
}

fn forward_exception(parent: &BridgeSession, error: &BridgeError) {
    if let Some(child) = child_of(parent) {
        child.fire_exception_caught(error.clone());
    }
}

/// 接入侧透传层：作为下层会话的处理器。
pub struct PassthroughLayer {
    context: LayerContext,
}

impl PassthroughLayer {
    pub fn new(context: LayerContext) -> Self {
        Self { context }
    }
}

impl BridgeHandler for PassthroughLayer {
    fn session_created(&self, parent: &BridgeSession) -> Result<()> {
        let groups = self.context.candidates(parent);
        let Some(group) = groups.first() else {
            debug!(
                target: TARGET_SESSION,
                session = %parent.id(),
                layer = %self.context.scheme(),
                "no layer binding above transport, closing"
            );
            parent.close();
            return Ok(());
        };
        let child = self
            .context
            .new_child(parent, group, Arc::new(ParentProcessor));
        parent.insert_attribute(ChildSession(child.clone()));
        child.fire_session_created();
        Ok(())
    }

    fn session_opened(&self, parent: &BridgeSession) {
        if let Some(child) = child_of(parent) {
            child.fire_session_opened();
        }
    }

    fn message_received(&self, parent: &BridgeSession, message: Bytes) {
        forward_message(parent, message);
    }

    fn session_idle(&self, parent: &BridgeSession, status: IdleStatus) {
        forward_idle(parent, status);
    }

    fn exception_caught(&self, parent: &BridgeSession, error: &BridgeError) {
        forward_exception(parent, error);
    }
}

/// 发起侧透传层。
pub struct PassthroughConnector {
    context: ConnectorContext,
}

impl PassthroughConnector {
    pub fn new(context: ConnectorContext) -> Self {
        Self { context }
    }
}

impl BridgeConnector for PassthroughConnector {
    fn scheme(&self) -> Scheme {
        self.context.scheme()
    }

    fn connect(
        &self,
        connectors: &ConnectorTable,
        address: &ResourceAddress,
        handler: Arc<dyn BridgeHandler>,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> ConnectFuture {
        let scheme = self.context.scheme();
        let (lower, transport) = match connectors.lower_of(address) {
            Ok(found) => found,
            Err(error) => return futures::future::ready(Err(error)).boxed(),
        };
        let (sender, receiver) = oneshot::channel();
        let bridge = Arc::new(PassthroughConnectHandler {
            context: self.context.clone(),
            target: address.clone(),
            handler,
            initializer,
            completion: Mutex::new(Some(sender)),
        });
        let pending = lower.connect(connectors, &transport, bridge, None);
        async move {
            let parent = pending.await?;
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::ConnectionFailed {
                    detail: format!(
                        "{} session {} ended before {scheme} was established",
                        parent.scheme(),
                        parent.id()
                    ),
                }),
            }
        }
        .boxed()
    }
}

type Completion = oneshot::Sender<Result<BridgeSession>>;

/// 发起侧父会话的处理器：父会话建立后在其上建立本层会话。
struct PassthroughConnectHandler {
    context: ConnectorContext,
    target: ResourceAddress,
    handler: Arc<dyn BridgeHandler>,
    initializer: Option<Arc<dyn SessionInitializer>>,
    completion: Mutex<Option<Completion>>,
}

impl PassthroughConnectHandler {
    fn complete(&self, result: Result<BridgeSession>) {
        if let Some(sender) = self.completion.lock().take() {
            let _ = sender.send(result);
        }
    }
}

impl BridgeHandler for PassthroughConnectHandler {
    fn session_created(&self, parent: &BridgeSession) -> Result<()> {
        let mut builder = BridgeSession::builder(self.context.scheme(), Arc::new(ParentProcessor))
            .service(format!("{}-connector", self.context.scheme()))
            .parent(parent)
            .remote_address(Some(self.target.clone()))
            .handler(Arc::clone(&self.handler));
        if let Some(local) = self.context.local_of(parent) {
            builder = builder.local_address(local);
        }
        let child = builder.build();
        parent.insert_attribute(ChildSession(child.clone()));
        // 子会话启动失败会连带关闭父会话，先取走完成通知以保留原始错误
        let completion = self.completion.lock().take();
        let result = child.open(self.initializer.as_ref()).map(|()| child);
        if let Some(sender) = completion {
            let _ = sender.send(result);
        }
        Ok(())
    }

    fn message_received(&self, parent: &BridgeSession, message: Bytes) {
        forward_message(parent, message);
    }

    fn session_idle(&self, parent: &BridgeSession, status: IdleStatus) {
        forward_idle(parent, status);
    }

    fn exception_caught(&self, parent: &BridgeSession, error: &BridgeError) {
        forward_exception(parent, error);
    }

    fn session_closed(&self, parent: &BridgeSession) {
        debug!(target: TARGET_CONNECT, session = %parent.id(), "transport closed");
        self.complete(Err(BridgeError::ConnectionFailed {
            detail: format!(
                "{} session {} closed before {} was established",
                parent.scheme(),
                parent.id(),
                self.context.scheme()
            ),
        }));
    }
}
