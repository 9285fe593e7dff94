//! Message handler abstraction and handler decoration.
//!
//! The consumption loop only knows [`MessageHandler`]. Before a handler reaches a subscription
//! the facade passes it through a [`DecoratedMessageHandlerFactory`], which owns the retry
//! policy. Whatever the decorated handler still reports as failure is left unacknowledged and
//! re-delivered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use streamgroup_core::Fields;
use streamgroup_core::Offset;
use streamgroup_core::PartitionId;
use tracing::warn;

/// One stream entry delivered to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subscriber_id: String,
    pub partition: PartitionId,
    pub offset: Offset,
    pub fields: Fields,
}

impl Message {
    pub fn channel(&self) -> &str {
        &self.partition.channel
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Processes messages of one subscription.
///
/// Called sequentially per partition, in stream order. A message may be delivered more than once
/// around rebalances, so processing should be idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Handler backed by an async closure.
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

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Applies the delivery policy to user handlers.
pub trait DecoratedMessageHandlerFactory: Send + Sync {
    fn decorate(&self, handler: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler>;
}

/// Hands the handler through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDecorator;

impl DecoratedMessageHandlerFactory for PassthroughDecorator {
    fn decorate(&self, handler: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        handler
    }
}

/// Retries a failing handler in place a bounded number of times.
#[derive(Debug, Clone, Copy)]
pub struct RetryingHandlerDecorator {
    /// Total attempts per delivery, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts; up to half of it again is added as jitter.
    pub backoff: Duration,
}

impl Default for RetryingHandlerDecorator {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl DecoratedMessageHandlerFactory for RetryingHandlerDecorator {
    fn decorate(&self, handler: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        Arc::new(RetryingHandler {
            inner: handler,
            max_attempts: self.max_attempts.max(1),
            backoff: self.backoff,
        })
    }
}

struct RetryingHandler {
    inner: Arc<dyn MessageHandler>,
    max_attempts: u32,
    backoff: Duration,
}

impl RetryingHandler {
    fn delay(&self) -> Duration {
        let base = self.backoff.as_millis() as u64;
        let jitter = if base >= 2 { rand::rng().random_range(0..=base / 2) } else { 0 };
        Duration::from_millis(base + jitter)
    }
}

#[async_trait]
impl MessageHandler for RetryingHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            match self.inner.handle(message).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    warn!(
                        subscriber_id = %message.subscriber_id,
                        partition = %message.partition,
                        offset = %message.offset,
                        attempt,
                        error = %e,
                        "handler failed, retrying"
                    );
                    tokio::time::sleep(self.delay()).await;
                    attempt += 1;
                }
            }
        }
    }
}
