//! Subscriber callbacks.

use crate::core::Message;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// A subscriber callback.
///
/// Errors and panics are caught by the router's delivery loop, logged, and
/// never reach the publisher or other subscribers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one delivered message.
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self.f)(message.clone()).await
    }
}

/// Wraps an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
