//! One (subscriber id, channel set) membership of a consumer.
//!
//! A subscription owns a [`CoordinatorHandle`] and a reconciler task. The reconciler watches the
//! partitions the published assignment gives to this consumer and starts or stops one
//! [`PartitionLoop`] per partition to match. The map of running loops is the only in-process
//! mutable state; it is guarded by a single mutex, mutated by reconciliation, and drained by
//! [`Subscription::close`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use futures::future::join_all;
use streamgroup_core::ChannelSet;
use streamgroup_core::KeyValueStore;
use streamgroup_core::PartitionId;
use streamgroup_core::ReadPosition;
use streamgroup_core::StreamClient;
use streamgroup_coordination::Coordinator;
use streamgroup_coordination::CoordinatorHandle;
use streamgroup_coordination::HookRegistry;
use streamgroup_coordination::LeaderHook;
use streamgroup_coordination::LeadershipState;
use streamgroup_coordination::SubscriptionLifecycleHook;
use tokio::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::handler::MessageHandler;
use crate::partition_loop::LoopTiming;
use crate::partition_loop::PartitionLoop;
use crate::partition_loop::resolve_start;

/// What to subscribe, as handed over by the facade.
pub(crate) struct SubscriptionRequest {
    pub id: String,
    pub consumer_id: String,
    pub subscriber_id: String,
    pub channels: ChannelSet,
    /// Already decorated.
    pub handler: Arc<dyn MessageHandler>,
}

struct RunningLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A live subscription. Obtained from [`crate::MessageConsumer::subscribe`].
pub struct Subscription<C: StreamClient + ?Sized + 'static> {
    id: String,
    consumer_id: String,
    subscriber_id: String,
    channels: ChannelSet,
    streams: Arc<C>,
    handler: Arc<dyn MessageHandler>,
    timing: LoopTiming,
    leader_hooks: Arc<HookRegistry<dyn LeaderHook>>,
    lifecycle_hooks: HookRegistry<dyn SubscriptionLifecycleHook>,
    loops: Mutex<BTreeMap<PartitionId, RunningLoop>>,
    coordinator: Mutex<Option<CoordinatorHandle>>,
    leadership: watch::Receiver<LeadershipState>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
    reconciler_cancel: CancellationToken,
    closed: AtomicBool,
}

impl<C: StreamClient + ?Sized + 'static> Subscription<C> {
    /// Join the group and start reconciling. Hooks given here see the very first transitions.
    pub(crate) async fn start<K: KeyValueStore + ?Sized + 'static>(
        store: Arc<K>,
        streams: Arc<C>,
        request: SubscriptionRequest,
        config: &ConsumerConfig,
        leader_hooks: &[Arc<dyn LeaderHook>],
        lifecycle_hooks: &[Arc<dyn SubscriptionLifecycleHook>],
    ) -> Result<Arc<Self>, ConsumerError> {
        validate(&request)?;

        let leader_registry: Arc<HookRegistry<dyn LeaderHook>> = Arc::new(HookRegistry::new());
        for hook in leader_hooks {
            leader_registry.register(hook.clone());
        }
        let lifecycle_registry: HookRegistry<dyn SubscriptionLifecycleHook> = HookRegistry::new();
        for hook in lifecycle_hooks {
            lifecycle_registry.register(hook.clone());
        }

        let coordinator_config =
            config.coordinator_config(&request.subscriber_id, request.channels.clone(), &request.consumer_id);
        let coordinator = Coordinator::new(store, streams.clone(), coordinator_config, leader_registry.clone())?;
        let handle = coordinator.start().await;
        let assignment = handle.subscribe_assignment();

        let subscription = Arc::new(Self {
            id: request.id,
            consumer_id: request.consumer_id,
            subscriber_id: request.subscriber_id,
            channels: request.channels,
            streams,
            handler: request.handler,
            timing: LoopTiming {
                block_duration: config.block_duration(),
                missing_key_backoff: config.missing_key_backoff(),
                handler_failure_backoff: config.handler_failure_backoff(),
            },
            leader_hooks: leader_registry,
            lifecycle_hooks: lifecycle_registry,
            loops: Mutex::new(BTreeMap::new()),
            leadership: handle.subscribe_leadership(),
            coordinator: Mutex::new(Some(handle)),
            reconciler: Mutex::new(None),
            reconciler_cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let task = tokio::spawn(subscription.clone().reconcile_loop(assignment));
        *subscription.reconciler.lock().await = Some(task);

        info!(
            subscription_id = %subscription.id,
            consumer_id = %subscription.consumer_id,
            subscriber_id = %subscription.subscriber_id,
            channels = %subscription.channels,
            "subscription started"
        );
        Ok(subscription)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Whether this consumer currently leads the group.
    pub fn is_leader(&self) -> bool {
        self.leadership.borrow().is_leader()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Partitions with a running consumption loop.
    pub async fn assigned_partitions(&self) -> BTreeSet<PartitionId> {
        self.loops.lock().await.keys().cloned().collect()
    }

    pub fn add_leader_hook(&self, hook: Arc<dyn LeaderHook>) {
        self.leader_hooks.register(hook);
    }

    pub fn add_lifecycle_hook(&self, hook: Arc<dyn SubscriptionLifecycleHook>) {
        self.lifecycle_hooks.register(hook);
    }

    async fn reconcile_loop(self: Arc<Self>, mut assignment: watch::Receiver<BTreeSet<PartitionId>>) {
        loop {
            let target = assignment.borrow_and_update().clone();
            self.reconcile(&target).await;

            tokio::select! {
                _ = self.reconciler_cancel.cancelled() => break,
                changed = assignment.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(subscription_id = %self.id, "reconciler stopped");
    }

    /// Make the running loops match `target`: stop revoked partitions first, then start new ones.
    async fn reconcile(&self, target: &BTreeSet<PartitionId>) {
        let mut loops = self.loops.lock().await;

        let revoked: Vec<PartitionId> = loops.keys().filter(|p| !target.contains(*p)).cloned().collect();
        let added: Vec<PartitionId> = target.iter().filter(|p| !loops.contains_key(*p)).cloned().collect();
        if revoked.is_empty() && added.is_empty() {
            return;
        }

        let stopping: Vec<RunningLoop> = revoked.iter().filter_map(|p| loops.remove(p)).collect();
        self.stop_loops(stopping).await;
        self.lifecycle_hooks.revoked(&self.id, &revoked);

        for partition in &added {
            // Resolved before the loop starts, so anything appended after on_assigned is seen.
            let start = match resolve_start(self.streams.as_ref(), &partition.stream_key(), &self.subscriber_id).await {
                Ok(position) => Some(position),
                Err(e) => {
                    warn!(partition = %partition, error = %e, "start position unresolved, loop will retry");
                    None
                }
            };
            let running = self.spawn_loop(partition.clone(), start);
            loops.insert(partition.clone(), running);
        }
        self.lifecycle_hooks.assigned(&self.id, &added);

        info!(
            subscription_id = %self.id,
            subscriber_id = %self.subscriber_id,
            revoked = revoked.len(),
            assigned = added.len(),
            owned = loops.len(),
            "partitions reconciled"
        );
    }

    fn spawn_loop(&self, partition: PartitionId, start: Option<ReadPosition>) -> RunningLoop {
        let cancel = CancellationToken::new();
        let partition_loop = PartitionLoop {
            streams: self.streams.clone(),
            handler: self.handler.clone(),
            subscriber_id: self.subscriber_id.clone(),
            subscription_id: self.id.clone(),
            partition,
            timing: self.timing,
        };
        let task = tokio::spawn(partition_loop.run(start, cancel.clone()));
        RunningLoop { cancel, task }
    }

    /// Signal every loop, then wait for all of them. In-flight messages finish first.
    async fn stop_loops(&self, stopping: Vec<RunningLoop>) {
        for running in &stopping {
            running.cancel.cancel();
        }
        for result in join_all(stopping.into_iter().map(|r| r.task)).await {
            if let Err(e) = result {
                warn!(subscription_id = %self.id, error = %e, "partition loop ended abnormally");
            }
        }
    }

    /// Stop consuming and leave the group.
    ///
    /// Returns once every partition loop has stopped, leadership has been released if held, and
    /// the membership record has been removed. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.reconciler_cancel.cancel();
        if let Some(task) = self.reconciler.lock().await.take() {
            if let Err(e) = task.await {
                warn!(subscription_id = %self.id, error = %e, "reconciler ended abnormally");
            }
        }

        let (owned, stopping): (Vec<PartitionId>, Vec<RunningLoop>) = {
            let mut loops = self.loops.lock().await;
            std::mem::take(&mut *loops).into_iter().unzip()
        };
        self.stop_loops(stopping).await;
        self.lifecycle_hooks.revoked(&self.id, &owned);

        if let Some(mut handle) = self.coordinator.lock().await.take() {
            handle.stop().await;
        }

        info!(
            subscription_id = %self.id,
            consumer_id = %self.consumer_id,
            subscriber_id = %self.subscriber_id,
            "subscription closed"
        );
    }

    /// Stop every task at once without releasing leadership, deregistering, or firing hooks, as
    /// if the process had died. The rest of the group recovers through lease and membership
    /// expiry.
    pub async fn abort(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.reconciler_cancel.cancel();
        if let Some(task) = self.reconciler.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(mut handle) = self.coordinator.lock().await.take() {
            handle.abort().await;
        }
        let stopping = std::mem::take(&mut *self.loops.lock().await);
        for running in stopping.into_values() {
            running.task.abort();
            let _ = running.task.await;
        }

        warn!(subscription_id = %self.id, consumer_id = %self.consumer_id, "subscription aborted");
    }
}

fn validate(request: &SubscriptionRequest) -> Result<(), ConsumerError> {
    let reason = if request.subscriber_id.is_empty() {
        "subscriber id is empty"
    } else if request.subscriber_id.contains('/') {
        "subscriber id must not contain '/'"
    } else if request.channels.is_empty() {
        "at least one channel is required"
    } else if request.channels.iter().any(|c| c.is_empty() || c.contains(',') || c.contains(':')) {
        "channel names must be non-empty and must not contain ',' or ':'"
    } else {
        return Ok(());
    };
    Err(ConsumerError::InvalidSubscription {
        reason: reason.to_string(),
    })
}
