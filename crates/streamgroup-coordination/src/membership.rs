//! Consumer liveness per group.
//!
//! Each consumer writes a TTL'd presence record under
//! `members/{subscriber_id}/{channel_set}/{consumer_id}`.
//! A consumer is alive iff its record exists and its recorded deadline has not passed; the
//! deadline is checked on read as well, so a backend with coarse TTL reaping cannot report a
//! stale member.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use streamgroup_core::ChannelSet;
use streamgroup_core::DeleteRequest;
use streamgroup_core::KeyValueStore;
use streamgroup_core::ScanRequest;
use streamgroup_core::WriteRequest;
use streamgroup_core::keys;
use tracing::debug;
use tracing::warn;

use crate::error::CoordinationError;
use crate::types::now_unix_ms;

/// Upper bound on members returned by one scan.
pub const MAX_MEMBERS: u32 = 1_000;

/// Presence record written by [`MembershipTracker::heartbeat`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberRecord {
    pub consumer_id: String,
    pub last_heartbeat_ms: u64,
    pub ttl_ms: u64,
    pub deadline_ms: u64,
}

impl MemberRecord {
    fn new(consumer_id: &str, ttl_ms: u64) -> Self {
        let now = now_unix_ms();
        Self {
            consumer_id: consumer_id.to_string(),
            last_heartbeat_ms: now,
            ttl_ms,
            deadline_ms: now + ttl_ms,
        }
    }

    pub fn is_alive(&self, now_ms: u64) -> bool {
        now_ms <= self.deadline_ms
    }
}

/// Reads and writes membership records for any number of groups.
pub struct MembershipTracker<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
}

impl<S: KeyValueStore + ?Sized + 'static> MembershipTracker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Announce `consumer_id` as alive for `ttl`. Call at an interval strictly shorter than `ttl`.
    pub async fn heartbeat(
        &self,
        subscriber_id: &str,
        channels: &ChannelSet,
        consumer_id: &str,
        ttl: Duration,
    ) -> Result<(), CoordinationError> {
        let ttl_ms = ttl.as_millis() as u64;
        let record = MemberRecord::new(consumer_id, ttl_ms);
        let value = serde_json::to_string(&record)?;
        let key = keys::member_key(subscriber_id, channels, consumer_id);

        self.store.write(WriteRequest::set_with_ttl(key, value, ttl_ms)).await?;
        debug!(subscriber_id, consumer_id, deadline_ms = record.deadline_ms, "heartbeat sent");
        Ok(())
    }

    /// Every consumer id with an unexpired record in the `(subscriber_id, channels)` group.
    pub async fn list_alive(&self, subscriber_id: &str, channels: &ChannelSet) -> Result<BTreeSet<String>, CoordinationError> {
        let prefix = keys::members_prefix(subscriber_id, channels);
        let result = self.store.scan(ScanRequest::prefix(prefix).with_limit(MAX_MEMBERS)).await?;
        if result.is_truncated {
            warn!(subscriber_id, limit = MAX_MEMBERS, "membership scan truncated");
        }

        let now = now_unix_ms();
        let mut alive = BTreeSet::new();
        for kv in result.entries {
            let Some(consumer_id) = keys::consumer_id_from_member_key(subscriber_id, channels, &kv.key) else {
                continue;
            };
            match serde_json::from_str::<MemberRecord>(&kv.value) {
                Ok(record) if record.is_alive(now) => {
                    alive.insert(consumer_id.to_string());
                }
                Ok(_) => {}
                Err(e) => warn!(subscriber_id, key = %kv.key, error = %e, "skipping unreadable member record"),
            }
        }
        Ok(alive)
    }

    /// Remove the record for `consumer_id` so the group notices the departure before the TTL runs out.
    pub async fn deregister(
        &self,
        subscriber_id: &str,
        channels: &ChannelSet,
        consumer_id: &str,
    ) -> Result<(), CoordinationError> {
        let key = keys::member_key(subscriber_id, channels, consumer_id);
        let result = self.store.delete(DeleteRequest::new(key)).await?;
        // `false` when the record had already expired.
        debug!(subscriber_id, consumer_id, removed = result.deleted, "member deregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use streamgroup_testing::DeterministicKeyValueStore;

    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    fn orders() -> ChannelSet {
        ChannelSet::new(["orders"])
    }

    #[tokio::test]
    async fn test_heartbeat_makes_consumer_alive() {
        let tracker = MembershipTracker::new(DeterministicKeyValueStore::new());

        tracker.heartbeat("billing", &orders(), "c1", TTL).await.unwrap();
        tracker.heartbeat("billing", &orders(), "c2", TTL).await.unwrap();
        tracker.heartbeat("audit", &orders(), "c3", TTL).await.unwrap();

        let alive = tracker.list_alive("billing", &orders()).await.unwrap();
        assert_eq!(alive, BTreeSet::from(["c1".to_string(), "c2".to_string()]));
    }

    #[tokio::test]
    async fn test_member_expires_without_heartbeat() {
        let tracker = MembershipTracker::new(DeterministicKeyValueStore::new());

        tracker.heartbeat("billing", &orders(), "c1", Duration::from_millis(50)).await.unwrap();
        tracker.heartbeat("billing", &orders(), "c2", TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let alive = tracker.list_alive("billing", &orders()).await.unwrap();
        assert_eq!(alive, BTreeSet::from(["c2".to_string()]));
    }

    #[tokio::test]
    async fn test_repeated_heartbeat_keeps_member_alive() {
        let tracker = MembershipTracker::new(DeterministicKeyValueStore::new());
        let ttl = Duration::from_millis(80);

        for _ in 0..4 {
            tracker.heartbeat("billing", &orders(), "c1", ttl).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        assert!(tracker.list_alive("billing", &orders()).await.unwrap().contains("c1"));
    }

    #[tokio::test]
    async fn test_deregister_removes_member() {
        let tracker = MembershipTracker::new(DeterministicKeyValueStore::new());

        tracker.heartbeat("billing", &orders(), "c1", TTL).await.unwrap();
        tracker.deregister("billing", &orders(), "c1").await.unwrap();
        // Idempotent.
        tracker.deregister("billing", &orders(), "c1").await.unwrap();

        assert!(tracker.list_alive("billing", &orders()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_prefix_does_not_leak() {
        let tracker = MembershipTracker::new(DeterministicKeyValueStore::new());

        tracker.heartbeat("bill", &orders(), "c1", TTL).await.unwrap();
        tracker.heartbeat("billing", &orders(), "c2", TTL).await.unwrap();

        assert_eq!(tracker.list_alive("bill", &orders()).await.unwrap(), BTreeSet::from(["c1".to_string()]));
    }

    #[tokio::test]
    async fn test_unreadable_record_is_skipped() {
        let store = DeterministicKeyValueStore::new();
        store.write(WriteRequest::set(keys::member_key("billing", &orders(), "junk"), "{")).await.unwrap();
        let tracker = MembershipTracker::new(store);
        tracker.heartbeat("billing", &orders(), "c1", TTL).await.unwrap();

        assert_eq!(tracker.list_alive("billing", &orders()).await.unwrap(), BTreeSet::from(["c1".to_string()]));
    }

    #[tokio::test]
    async fn test_channel_sets_form_separate_groups() {
        let tracker = MembershipTracker::new(DeterministicKeyValueStore::new());
        let refunds = ChannelSet::new(["refunds"]);

        tracker.heartbeat("billing", &orders(), "c1", TTL).await.unwrap();
        tracker.heartbeat("billing", &refunds, "c2", TTL).await.unwrap();

        assert_eq!(tracker.list_alive("billing", &orders()).await.unwrap(), BTreeSet::from(["c1".to_string()]));
        assert_eq!(tracker.list_alive("billing", &refunds).await.unwrap(), BTreeSet::from(["c2".to_string()]));
    }
}
