use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    client::ClientHandler,
    context::RequestContext,
    error::{Error, Result},
    schema::{JSONRPCNotification, PING},
};

/// Routes server-initiated upstream traffic to whichever downstream handler
/// is currently bound. At most one handler is bound at a time.
#[derive(Clone, Default)]
pub struct HandlerSlot {
    inner: Arc<RwLock<Option<Arc<dyn ClientHandler>>>>,
}

impl HandlerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler`, returning the one it replaced.
    pub async fn set(&self, handler: Arc<dyn ClientHandler>) -> Option<Arc<dyn ClientHandler>> {
        self.inner.write().await.replace(handler)
    }

    /// Unbind `handler` if it is still the bound one.
    pub async fn release(&self, handler: &Arc<dyn ClientHandler>) -> bool {
        let mut slot = self.inner.write().await;
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, handler) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub async fn current(&self) -> Option<Arc<dyn ClientHandler>> {
        self.inner.read().await.clone()
    }
}

#[async_trait]
impl ClientHandler for HandlerSlot {
    async fn on_notification(&self, notification: JSONRPCNotification) {
        match self.current().await {
            Some(handler) => handler.on_notification(notification).await,
            None => debug!("Dropping {} with no downstream bound", notification.method),
        }
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        match self.current().await {
            Some(handler) => handler.handle(ctx, method, params).await,
            None if method == PING => Ok(Value::Object(Default::default())),
            None => Err(Error::MethodNotFound(format!(
                "{method}: no downstream client connected"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::NoopClientHandler;

    #[tokio::test]
    async fn test_release_only_unbinds_current() {
        let slot = HandlerSlot::new();
        let first: Arc<dyn ClientHandler> = Arc::new(NoopClientHandler);
        let second: Arc<dyn ClientHandler> = Arc::new(NoopClientHandler);

        assert!(slot.set(first.clone()).await.is_none());
        assert!(slot.set(second.clone()).await.is_some());
        assert!(!slot.release(&first).await);
        assert!(slot.current().await.is_some());
        assert!(slot.release(&second).await);
        assert!(slot.current().await.is_none());
    }
}
