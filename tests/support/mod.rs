//! Test support for the cross-crate scenario tests.
//!
//! - Fast consumer timings so a rebalance completes in tens of milliseconds
//! - A handler that records every message it sees
//! - Hooks that record every transition
//! - Polling helpers bounded by a timeout

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use streamgroup::ConsumerConfig;
use streamgroup::LeaderHook;
use streamgroup::Message;
use streamgroup::MessageHandler;
use streamgroup::Offset;
use streamgroup::PartitionId;
use streamgroup::StreamClient;
use streamgroup::Subscription;
use streamgroup::SubscriptionLifecycleHook;

// ============================================================================
// Constants
// ============================================================================

pub const MEMBERSHIP_TTL: Duration = Duration::from_millis(300);
pub const LEASE_TTL: Duration = Duration::from_millis(300);
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Upper bound for anything the tests wait on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn fast_config(consumer_id: &str) -> ConsumerConfig {
    ConsumerConfig {
        consumer_id: Some(consumer_id.to_string()),
        block_duration_ms: 20,
        missing_key_backoff_ms: 10,
        handler_failure_backoff_ms: 10,
        membership_ttl_ms: MEMBERSHIP_TTL.as_millis() as u64,
        heartbeat_interval_ms: 50,
        leadership_lease_ttl_ms: LEASE_TTL.as_millis() as u64,
        coordinator_poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
    }
}

// ============================================================================
// Recording handler
// ============================================================================

#[derive(Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<Message>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Offsets delivered for `partition`, in delivery order.
    pub fn offsets(&self, partition: &PartitionId) -> Vec<Offset> {
        self.messages.lock().iter().filter(|m| &m.partition == partition).map(|m| m.offset).collect()
    }

    /// Values of field `name`, in delivery order.
    pub fn values(&self, name: &str) -> Vec<String> {
        self.messages.lock().iter().filter_map(|m| m.field(name).map(str::to_string)).collect()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

// ============================================================================
// Recording hooks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    Acquired(String),
    Lost(String),
    Assigned(String, Vec<PartitionId>),
    Revoked(String, Vec<PartitionId>),
}

#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<HookEvent>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().clone()
    }

    pub fn acquired(&self) -> usize {
        self.events.lock().iter().filter(|e| matches!(e, HookEvent::Acquired(_))).count()
    }

    pub fn lost(&self) -> usize {
        self.events.lock().iter().filter(|e| matches!(e, HookEvent::Lost(_))).count()
    }

    /// Union of every partition reported through `on_assigned`.
    pub fn ever_assigned(&self) -> BTreeSet<PartitionId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HookEvent::Assigned(_, partitions) => Some(partitions.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl LeaderHook for RecordingHooks {
    fn on_acquired(&self, subscriber_id: &str) -> anyhow::Result<()> {
        self.events.lock().push(HookEvent::Acquired(subscriber_id.to_string()));
        Ok(())
    }

    fn on_lost(&self, subscriber_id: &str) -> anyhow::Result<()> {
        self.events.lock().push(HookEvent::Lost(subscriber_id.to_string()));
        Ok(())
    }
}

impl SubscriptionLifecycleHook for RecordingHooks {
    fn on_assigned(&self, subscription_id: &str, partitions: &[PartitionId]) -> anyhow::Result<()> {
        self.events.lock().push(HookEvent::Assigned(subscription_id.to_string(), partitions.to_vec()));
        Ok(())
    }

    fn on_revoked(&self, subscription_id: &str, partitions: &[PartitionId]) -> anyhow::Result<()> {
        self.events.lock().push(HookEvent::Revoked(subscription_id.to_string(), partitions.to_vec()));
        Ok(())
    }
}

// ============================================================================
// Waiting helpers
// ============================================================================

/// Poll `condition` until it holds. Panics with `what` after [`WAIT_TIMEOUT`].
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let result = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Wait until `subscription` runs loops for exactly `count` partitions.
pub async fn wait_for_partitions<C: StreamClient + ?Sized>(subscription: &Subscription<C>, count: usize) -> BTreeSet<PartitionId> {
    let result = tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            let owned = subscription.assigned_partitions().await;
            if owned.len() == count {
                return owned;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    match result {
        Ok(owned) => owned,
        Err(_) => panic!(
            "subscription {} never owned {count} partitions (owns {:?})",
            subscription.id(),
            subscription.assigned_partitions().await
        ),
    }
}
