//! Per-group coordination: leader election, rebalancing, assignment watching, and heartbeats.
//!
//! One [`Coordinator`] runs per (subscriber id, channel set) inside each consumer. It spawns
//! three tasks that share nothing but the backend:
//!
//! - **election**: as follower, tries to take the leadership lease every poll interval; as leader,
//!   renews it, discovers partitions, lists alive members, and publishes the assignment when it
//!   changed. The publish is one `ConditionalBatch` conditioned on the exact lease record just
//!   renewed, so a leader that has already been replaced cannot overwrite its successor.
//! - **assignment watch**: reads the published document every poll interval and exposes this
//!   consumer's share through a `watch` channel.
//! - **heartbeat**: refreshes this consumer's membership record.
//!
//! ```text
//! Follower --acquire--> Leader --renew ok--> Leader
//!    ^                    |
//!    +---renew failed-----+
//!    +---lease deadline passed during backend outage
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use streamgroup_core::BatchCondition;
use streamgroup_core::BatchOperation;
use streamgroup_core::ChannelSet;
use streamgroup_core::KeyValueStore;
use streamgroup_core::PartitionId;
use streamgroup_core::ReadRequest;
use streamgroup_core::StreamClient;
use streamgroup_core::WriteRequest;
use streamgroup_core::keys;
use tokio::sync::Notify;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::assignment::AssignmentDocument;
use crate::assignment::compute_assignment;
use crate::error::CoordinationError;
use crate::hooks::HookRegistry;
use crate::hooks::LeaderHook;
use crate::lock::DistributedLock;
use crate::lock::Lease;
use crate::membership::MembershipTracker;
use crate::types::FencingToken;
use crate::types::now_unix_ms;

/// Timing and identity of one coordinated group member.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub subscriber_id: String,
    pub channels: ChannelSet,
    pub consumer_id: String,
    /// TTL of the leadership lease.
    pub lease_ttl: Duration,
    /// Cadence of the election and assignment-watch loops.
    pub poll_interval: Duration,
    /// TTL of this consumer's membership record.
    pub membership_ttl: Duration,
    /// Must be shorter than `membership_ttl`.
    pub heartbeat_interval: Duration,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), CoordinationError> {
        let reason = if self.subscriber_id.is_empty() {
            "subscriber id is empty"
        } else if self.subscriber_id.contains('/') {
            "subscriber id must not contain '/'"
        } else if self.consumer_id.is_empty() {
            "consumer id is empty"
        } else if self.consumer_id.contains('/') {
            "consumer id must not contain '/'"
        } else if self.channels.is_empty() {
            "no channels"
        } else if self.poll_interval.is_zero() || self.heartbeat_interval.is_zero() {
            "intervals must be non-zero"
        } else if self.heartbeat_interval >= self.membership_ttl {
            "heartbeat interval must be shorter than the membership TTL"
        } else if self.poll_interval * 2 > self.lease_ttl {
            "the lease must outlive at least two poll intervals"
        } else {
            return Ok(());
        };
        Err(CoordinationError::InvalidGroup {
            reason: reason.to_string(),
        })
    }
}

/// Leadership as seen by this consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    Follower,
    Leader { fencing_token: FencingToken },
}

impl LeadershipState {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipState::Leader { .. })
    }

    pub fn fencing_token(&self) -> Option<FencingToken> {
        match self {
            LeadershipState::Leader { fencing_token } => Some(*fencing_token),
            LeadershipState::Follower => None,
        }
    }
}

/// Coordination for one group member. Consumed by [`Coordinator::start`].
pub struct Coordinator<K: KeyValueStore + ?Sized + 'static, C: StreamClient + ?Sized + 'static> {
    store: Arc<K>,
    streams: Arc<C>,
    lock: DistributedLock<K>,
    membership: MembershipTracker<K>,
    config: CoordinatorConfig,
    leader_key: String,
    assignment_key: String,
    leader_hooks: Arc<HookRegistry<dyn LeaderHook>>,
    /// Wakes the assignment watcher right after this consumer published a new document.
    published: Notify,
}

impl<K, C> Coordinator<K, C>
where
    K: KeyValueStore + ?Sized + 'static,
    C: StreamClient + ?Sized + 'static,
{
    pub fn new(
        store: Arc<K>,
        streams: Arc<C>,
        config: CoordinatorConfig,
        leader_hooks: Arc<HookRegistry<dyn LeaderHook>>,
    ) -> Result<Self, CoordinationError> {
        config.validate()?;
        Ok(Self {
            lock: DistributedLock::new(store.clone()),
            membership: MembershipTracker::new(store.clone()),
            leader_key: keys::leader_key(&config.subscriber_id, &config.channels),
            assignment_key: keys::assignment_key(&config.subscriber_id, &config.channels),
            store,
            streams,
            config,
            leader_hooks,
            published: Notify::new(),
        })
    }

    /// Announce membership once, then spawn the election, assignment-watch, and heartbeat tasks.
    ///
    /// A failed first heartbeat is logged, not returned: the heartbeat task keeps retrying.
    pub async fn start(self) -> CoordinatorHandle {
        if let Err(e) = self.heartbeat().await {
            warn!(
                subscriber_id = %self.config.subscriber_id,
                consumer_id = %self.config.consumer_id,
                error = %e,
                "initial heartbeat failed"
            );
        }

        let this = Arc::new(self);
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(LeadershipState::Follower);
        let (assignment_tx, assignment_rx) = watch::channel(BTreeSet::new());

        info!(
            subscriber_id = %this.config.subscriber_id,
            consumer_id = %this.config.consumer_id,
            channels = %this.config.channels,
            "coordinator started"
        );

        let tasks = vec![
            tokio::spawn(this.clone().election_loop(cancel.clone(), state_tx)),
            tokio::spawn(this.clone().assignment_loop(cancel.clone(), assignment_tx)),
            tokio::spawn(this.clone().heartbeat_loop(cancel.clone())),
        ];

        CoordinatorHandle {
            subscriber_id: this.config.subscriber_id.clone(),
            consumer_id: this.config.consumer_id.clone(),
            cancel,
            tasks,
            state_rx,
            assignment_rx,
        }
    }

    async fn election_loop(self: Arc<Self>, cancel: CancellationToken, state_tx: watch::Sender<LeadershipState>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lease: Option<Lease> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            lease = match lease.take() {
                None => self.try_lead(&state_tx).await,
                Some(held) => self.keep_leading(held, &state_tx).await,
            };

            if let Some(held) = &lease {
                if let Err(e) = self.rebalance(held).await {
                    warn!(subscriber_id = %self.config.subscriber_id, error = %e, "rebalance failed");
                }
            }
        }

        if let Some(held) = lease {
            self.step_down(held, &state_tx).await;
        }
    }

    async fn try_lead(&self, state_tx: &watch::Sender<LeadershipState>) -> Option<Lease> {
        let ttl = self.config.lease_ttl;
        match self.lock.try_acquire_lease(&self.leader_key, &self.config.consumer_id, ttl).await {
            Ok(Some(lease)) => {
                info!(
                    subscriber_id = %self.config.subscriber_id,
                    consumer_id = %self.config.consumer_id,
                    fencing_token = lease.entry.fencing_token,
                    "acquired leadership"
                );
                let _ = state_tx.send(LeadershipState::Leader {
                    fencing_token: lease.fencing_token(),
                });
                self.leader_hooks.acquired(&self.config.subscriber_id);
                Some(lease)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(subscriber_id = %self.config.subscriber_id, error = %e, "election attempt failed");
                None
            }
        }
    }

    async fn keep_leading(&self, held: Lease, state_tx: &watch::Sender<LeadershipState>) -> Option<Lease> {
        let ttl = self.config.lease_ttl;
        match self.lock.renew_lease(&self.leader_key, &self.config.consumer_id, ttl).await {
            Ok(Some(renewed)) => {
                debug!(
                    subscriber_id = %self.config.subscriber_id,
                    fencing_token = renewed.entry.fencing_token,
                    deadline_ms = renewed.deadline_ms(),
                    "leadership lease renewed"
                );
                Some(renewed)
            }
            Ok(None) => {
                self.lose_leadership(state_tx, "lease expired or taken over");
                None
            }
            // The lease is still ours until its deadline even if the backend cannot confirm it.
            Err(e) if e.is_transient() && now_unix_ms() <= held.deadline_ms() => {
                warn!(subscriber_id = %self.config.subscriber_id, error = %e, "failed to renew leadership lease");
                Some(held)
            }
            Err(e) if e.is_transient() => {
                warn!(subscriber_id = %self.config.subscriber_id, error = %e, "failed to renew leadership lease");
                self.lose_leadership(state_tx, "lease deadline passed without renewal");
                None
            }
            Err(e) => {
                error!(subscriber_id = %self.config.subscriber_id, error = %e, "leadership lease unusable");
                self.lose_leadership(state_tx, "lease record unusable");
                None
            }
        }
    }

    fn lose_leadership(&self, state_tx: &watch::Sender<LeadershipState>, reason: &str) {
        info!(
            subscriber_id = %self.config.subscriber_id,
            consumer_id = %self.config.consumer_id,
            reason,
            "lost leadership"
        );
        let _ = state_tx.send(LeadershipState::Follower);
        self.leader_hooks.lost(&self.config.subscriber_id);
    }

    async fn step_down(&self, held: Lease, state_tx: &watch::Sender<LeadershipState>) {
        if let Err(e) = self.lock.release(&self.leader_key, &self.config.consumer_id).await {
            warn!(subscriber_id = %self.config.subscriber_id, error = %e, "failed to release leadership");
        }
        debug!(
            subscriber_id = %self.config.subscriber_id,
            fencing_token = held.entry.fencing_token,
            "stepped down"
        );
        self.lose_leadership(state_tx, "coordinator stopped");
    }

    /// Current partitions of every subscribed channel.
    async fn discover_partitions(&self) -> Result<BTreeSet<PartitionId>, CoordinationError> {
        let mut partitions = BTreeSet::new();
        for channel in self.config.channels.iter() {
            for index in self.streams.list_partitions(channel).await? {
                partitions.insert(PartitionId::new(channel, index));
            }
        }
        Ok(partitions)
    }

    /// Publish a fresh assignment if it differs from the current one.
    ///
    /// Returns whether a new document was written.
    async fn rebalance(&self, lease: &Lease) -> Result<bool, CoordinationError> {
        let partitions = self.discover_partitions().await?;
        let members = self.membership.list_alive(&self.config.subscriber_id, &self.config.channels).await?;
        let owners = compute_assignment(&partitions, &members);

        let current = self.read_assignment().await.unwrap_or_else(|e| {
            warn!(subscriber_id = %self.config.subscriber_id, error = %e, "replacing unreadable assignment");
            None
        });
        if current.as_ref().is_some_and(|(doc, _)| doc.owners == owners) {
            return Ok(false);
        }

        let generation = current.as_ref().map_or(0, |(doc, _)| doc.generation) + 1;
        let doc = AssignmentDocument {
            leader_id: self.config.consumer_id.clone(),
            fencing_token: lease.entry.fencing_token,
            generation,
            updated_at_ms: now_unix_ms(),
            members: members.iter().cloned().collect(),
            owners,
        };

        let assignment_condition = match current {
            Some((_, raw)) => BatchCondition::ValueEquals {
                key: self.assignment_key.clone(),
                expected: raw,
            },
            None => BatchCondition::KeyNotExists {
                key: self.assignment_key.clone(),
            },
        };
        let request = WriteRequest::conditional_batch(
            vec![
                BatchCondition::ValueEquals {
                    key: self.leader_key.clone(),
                    expected: lease.record.clone(),
                },
                assignment_condition,
            ],
            vec![BatchOperation::Set {
                key: self.assignment_key.clone(),
                value: serde_json::to_string(&doc)?,
            }],
        );

        let result = self.store.write(request).await?;
        if result.conditions_met != Some(true) {
            debug!(subscriber_id = %self.config.subscriber_id, generation, "assignment write discarded");
            return Ok(false);
        }

        info!(
            subscriber_id = %self.config.subscriber_id,
            channels = %self.config.channels,
            generation,
            fencing_token = doc.fencing_token,
            members = doc.members.len(),
            partitions = doc.owners.len(),
            "assignment published"
        );
        self.published.notify_one();
        Ok(true)
    }

    async fn read_assignment(&self) -> Result<Option<(AssignmentDocument, String)>, CoordinationError> {
        let result = self.store.read(ReadRequest::new(&self.assignment_key)).await?;
        let Some(kv) = result.kv else {
            return Ok(None);
        };
        let doc = serde_json::from_str(&kv.value).map_err(|e| CoordinationError::CorruptedData {
            key: self.assignment_key.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some((doc, kv.value)))
    }

    async fn assignment_loop(self: Arc<Self>, cancel: CancellationToken, tx: watch::Sender<BTreeSet<PartitionId>>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.published.notified() => {}
            }

            let doc = match self.read_assignment().await {
                Ok(Some((doc, _))) => doc,
                Ok(None) => continue,
                Err(e) => {
                    warn!(subscriber_id = %self.config.subscriber_id, error = %e, "failed to read assignment");
                    continue;
                }
            };

            // Only the live lease holder can publish, so the stored document wins even if its term
            // is lower than one seen before. Terms restart at 1 when the backend loses the keys.
            let mine = doc.partitions_for(&self.config.consumer_id);
            tx.send_if_modified(|current| {
                if *current == mine {
                    return false;
                }
                info!(
                    subscriber_id = %self.config.subscriber_id,
                    consumer_id = %self.config.consumer_id,
                    generation = doc.generation,
                    owned = mine.len(),
                    "assignment changed"
                );
                *current = mine;
                true
            });
        }
    }

    async fn heartbeat(&self) -> Result<(), CoordinationError> {
        self.membership
            .heartbeat(
                &self.config.subscriber_id,
                &self.config.channels,
                &self.config.consumer_id,
                self.config.membership_ttl,
            )
            .await
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.heartbeat_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.heartbeat().await {
                warn!(
                    subscriber_id = %self.config.subscriber_id,
                    consumer_id = %self.config.consumer_id,
                    error = %e,
                    "heartbeat failed"
                );
            }
        }

        let deregistered =
            self.membership.deregister(&self.config.subscriber_id, &self.config.channels, &self.config.consumer_id).await;
        if let Err(e) = deregistered {
            warn!(subscriber_id = %self.config.subscriber_id, error = %e, "failed to deregister");
        }
    }
}

/// Running coordination tasks of one group member.
///
/// Dropping the handle cancels the tasks; they release leadership and deregister on their own.
pub struct CoordinatorHandle {
    subscriber_id: String,
    consumer_id: String,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    state_rx: watch::Receiver<LeadershipState>,
    assignment_rx: watch::Receiver<BTreeSet<PartitionId>>,
}

impl CoordinatorHandle {
    pub fn state(&self) -> LeadershipState {
        *self.state_rx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state().is_leader()
    }

    pub fn subscribe_leadership(&self) -> watch::Receiver<LeadershipState> {
        self.state_rx.clone()
    }

    /// Partitions the latest published assignment gives to this consumer.
    pub fn subscribe_assignment(&self) -> watch::Receiver<BTreeSet<PartitionId>> {
        self.assignment_rx.clone()
    }

    pub fn assignment(&self) -> BTreeSet<PartitionId> {
        self.assignment_rx.borrow().clone()
    }

    /// Stop every task, release leadership if held, and deregister. Returns once all tasks exited.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(subscriber_id = %self.subscriber_id, error = %e, "coordinator task failed");
            }
        }
        info!(subscriber_id = %self.subscriber_id, consumer_id = %self.consumer_id, "coordinator stopped");
    }

    /// Kill every task without releasing leadership or deregistering, as a crashed process would.
    ///
    /// The group notices through lease and membership expiry.
    pub async fn abort(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.cancel.cancel();
        info!(subscriber_id = %self.subscriber_id, consumer_id = %self.consumer_id, "coordinator aborted");
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
