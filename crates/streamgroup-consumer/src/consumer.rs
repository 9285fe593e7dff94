//! The `MessageConsumer` facade.
//!
//! One consumer per process: it owns the consumer id, creates subscriptions, decorates their
//! handlers, fans hook registration out to every subscription, and closes them all on shutdown.

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use streamgroup_core::ChannelSet;
use streamgroup_core::KeyValueStore;
use streamgroup_core::StreamClient;
use streamgroup_coordination::LeaderHook;
use streamgroup_coordination::SubscriptionLifecycleHook;
use tracing::info;

use crate::config::ConsumerConfig;
use crate::config::SubscriptionIdGenerator;
use crate::error::ConsumerError;
use crate::handler::DecoratedMessageHandlerFactory;
use crate::handler::MessageHandler;
use crate::handler::RetryingHandlerDecorator;
use crate::subscription::Subscription;
use crate::subscription::SubscriptionRequest;

struct State<C: StreamClient + ?Sized + 'static> {
    subscriptions: Vec<Arc<Subscription<C>>>,
    leader_hooks: Vec<Arc<dyn LeaderHook>>,
    lifecycle_hooks: Vec<Arc<dyn SubscriptionLifecycleHook>>,
    closed: bool,
}

/// Entry point for consuming channels as part of consumer groups.
///
/// # Example
///
/// ```ignore
/// let consumer = MessageConsumer::new(store, streams, ConsumerConfig::default().apply_env())?;
/// let subscription = consumer
///     .subscribe("billing", ["orders"], handler_fn(|m| async move { process(m).await }))
///     .await?;
///
/// // ...
/// consumer.close().await;
/// ```
pub struct MessageConsumer<K: KeyValueStore + ?Sized + 'static, C: StreamClient + ?Sized + 'static> {
    id: String,
    store: Arc<K>,
    streams: Arc<C>,
    config: ConsumerConfig,
    subscription_ids: SubscriptionIdGenerator,
    decorator: Arc<dyn DecoratedMessageHandlerFactory>,
    state: Mutex<State<C>>,
}

impl<K, C> MessageConsumer<K, C>
where
    K: KeyValueStore + ?Sized + 'static,
    C: StreamClient + ?Sized + 'static,
{
    /// Create a consumer. Its id is `config.consumer_id`, or a random UUID when unset.
    pub fn new(store: Arc<K>, streams: Arc<C>, config: ConsumerConfig) -> Result<Self, ConsumerError> {
        config.validate()?;
        let id = config.consumer_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        info!(consumer_id = %id, "consumer created");

        Ok(Self {
            id,
            store,
            streams,
            config,
            subscription_ids: SubscriptionIdGenerator::default(),
            decorator: Arc::new(RetryingHandlerDecorator::default()),
            state: Mutex::new(State {
                subscriptions: Vec::new(),
                leader_hooks: Vec::new(),
                lifecycle_hooks: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn with_subscription_ids(mut self, generator: SubscriptionIdGenerator) -> Self {
        self.subscription_ids = generator;
        self
    }

    pub fn with_decorator(mut self, decorator: Arc<dyn DecoratedMessageHandlerFactory>) -> Self {
        self.decorator = decorator;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Join the `subscriber_id` group for `channels` and start consuming with `handler`.
    ///
    /// Returns as soon as the group is joined; partitions arrive once the leader publishes an
    /// assignment that includes this consumer.
    pub async fn subscribe<I, S>(
        &self,
        subscriber_id: &str,
        channels: I,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<Subscription<C>>, ConsumerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (leader_hooks, lifecycle_hooks) = {
            let state = self.state.lock();
            if state.closed {
                return Err(ConsumerError::Closed {
                    consumer_id: self.id.clone(),
                });
            }
            (state.leader_hooks.clone(), state.lifecycle_hooks.clone())
        };

        let request = SubscriptionRequest {
            id: self.subscription_ids.generate(),
            consumer_id: self.id.clone(),
            subscriber_id: subscriber_id.to_string(),
            channels: ChannelSet::new(channels),
            handler: self.decorator.decorate(handler),
        };
        info!(
            consumer_id = %self.id,
            subscription_id = %request.id,
            subscriber_id,
            channels = %request.channels,
            "consumer subscribes to channels"
        );

        let subscription = Subscription::start(
            self.store.clone(),
            self.streams.clone(),
            request,
            &self.config,
            &leader_hooks,
            &lifecycle_hooks,
        )
        .await?;

        let closed_meanwhile = {
            let mut state = self.state.lock();
            if !state.closed {
                // Hooks registered while the subscription was starting.
                for hook in &state.leader_hooks[leader_hooks.len()..] {
                    subscription.add_leader_hook(hook.clone());
                }
                for hook in &state.lifecycle_hooks[lifecycle_hooks.len()..] {
                    subscription.add_lifecycle_hook(hook.clone());
                }
                state.subscriptions.push(subscription.clone());
            }
            state.closed
        };

        if closed_meanwhile {
            subscription.close().await;
            return Err(ConsumerError::Closed {
                consumer_id: self.id.clone(),
            });
        }
        Ok(subscription)
    }

    /// Register `hook` on every open subscription and on every subscription created later.
    pub fn set_leader_hook(&self, hook: Arc<dyn LeaderHook>) {
        let mut state = self.state.lock();
        for subscription in &state.subscriptions {
            subscription.add_leader_hook(hook.clone());
        }
        state.leader_hooks.push(hook);
    }

    /// Register `hook` on every open subscription and on every subscription created later.
    pub fn set_subscription_lifecycle_hook(&self, hook: Arc<dyn SubscriptionLifecycleHook>) {
        let mut state = self.state.lock();
        for subscription in &state.subscriptions {
            subscription.add_lifecycle_hook(hook.clone());
        }
        state.lifecycle_hooks.push(hook);
    }

    /// Open subscriptions.
    pub fn subscriptions(&self) -> Vec<Arc<Subscription<C>>> {
        let mut state = self.state.lock();
        state.subscriptions.retain(|s| !s.is_closed());
        state.subscriptions.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions().len()
    }

    /// Close every subscription and refuse new ones. Returns once all of them are closed.
    pub async fn close(&self) {
        let subscriptions = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.subscriptions)
        };
        let count = subscriptions.len();
        join_all(subscriptions.iter().map(|s| s.close())).await;
        info!(consumer_id = %self.id, subscriptions = count, "consumer closed");
    }
}
