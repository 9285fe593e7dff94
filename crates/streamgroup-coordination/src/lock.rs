//! Leased mutual exclusion over the coordination store.
//!
//! Provides at most one unexpired holder per key with:
//! - TTL-based expiration, so a crashed holder's lease frees itself
//! - Idempotent re-acquire: acquiring a lease you already hold renews it
//! - Monotonically increasing fencing tokens, bumped whenever the lease changes hands
//!
//! Every mutation is a single `CompareAndSwap` against the record that was just read, so two
//! contenders can never both believe they won.

use std::sync::Arc;
use std::time::Duration;

use streamgroup_core::KeyValueStore;
use streamgroup_core::KeyValueStoreError;
use streamgroup_core::ReadRequest;
use streamgroup_core::WriteRequest;
use tracing::debug;

use crate::error::CoordinationError;
use crate::types::FencingToken;
use crate::types::LockEntry;

/// A lease held by this process, together with the exact record stored for it.
///
/// `record` is what a conditional write must match to prove the lease is still current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub entry: LockEntry,
    pub record: String,
}

impl Lease {
    pub fn fencing_token(&self) -> FencingToken {
        FencingToken(self.entry.fencing_token)
    }

    pub fn deadline_ms(&self) -> u64 {
        self.entry.deadline_ms
    }
}

/// Distributed lock handle bound to one store.
///
/// Stateless apart from the store: any number of keys and holders can share one handle.
pub struct DistributedLock<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
}

impl<S: KeyValueStore + ?Sized + 'static> DistributedLock<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Acquire `key` for `holder_id` if it is free, expired, or already held by `holder_id`.
    pub async fn try_acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        Ok(self.try_acquire_lease(key, holder_id, ttl).await?.is_some())
    }

    /// Extend the lease. `Ok(false)` means it expired or belongs to someone else; the caller
    /// must stop acting as holder immediately.
    pub async fn renew(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        Ok(self.renew_lease(key, holder_id, ttl).await?.is_some())
    }

    /// Like [`Self::try_acquire`], returning the stored lease on success.
    pub async fn try_acquire_lease(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, CoordinationError> {
        let current = self.read_entry(key).await?;

        let (expected, token) = match current {
            Some((ref entry, _)) if entry.is_live() && entry.holder_id != holder_id => {
                debug!(key, holder = %entry.holder_id, deadline_ms = entry.deadline_ms, "lock held");
                return Ok(None);
            }
            // Re-acquire by the current holder refreshes the lease within the same term.
            Some((ref entry, ref raw)) if entry.is_live() => (Some(raw.clone()), entry.fencing_token),
            Some((ref entry, ref raw)) => {
                debug!(key, previous_holder = %entry.holder_id, "taking expired lock");
                (Some(raw.clone()), entry.fencing_token + 1)
            }
            None => (None, 1),
        };

        let entry = LockEntry::granted(holder_id, token, ttl.as_millis() as u64);
        self.swap(key, expected, entry).await
    }

    /// Like [`Self::renew`], returning the refreshed lease on success.
    pub async fn renew_lease(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, CoordinationError> {
        match self.read_entry(key).await? {
            Some((entry, raw)) if entry.is_held_by(holder_id) => {
                let renewed = entry.extended(ttl.as_millis() as u64);
                self.swap(key, Some(raw), renewed).await
            }
            Some((entry, _)) => {
                debug!(key, holder_id, current_holder = %entry.holder_id, live = entry.is_live(), "lease not renewable");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Release the lease if `holder_id` holds it. A no-op otherwise.
    pub async fn release(&self, key: &str, holder_id: &str) -> Result<(), CoordinationError> {
        let Some((entry, raw)) = self.read_entry(key).await? else {
            return Ok(());
        };
        if entry.holder_id != holder_id || entry.deadline_ms == 0 {
            return Ok(());
        }

        let released = serde_json::to_string(&entry.released())?;
        match self.store.write(WriteRequest::compare_and_swap(key, Some(raw), released)).await {
            Ok(_) => {
                debug!(key, holder_id, fencing_token = entry.fencing_token, "lock released");
                Ok(())
            }
            // Renewed or taken over in between; either way it is no longer ours to release.
            Err(KeyValueStoreError::CompareAndSwapFailed { .. }) => Ok(()),
            Err(e) => Err(CoordinationError::Storage { source: e }),
        }
    }

    /// Read the current lease record, if any.
    pub async fn current(&self, key: &str) -> Result<Option<LockEntry>, CoordinationError> {
        Ok(self.read_entry(key).await?.map(|(entry, _)| entry))
    }

    async fn swap(
        &self,
        key: &str,
        expected: Option<String>,
        entry: LockEntry,
    ) -> Result<Option<Lease>, CoordinationError> {
        let record = serde_json::to_string(&entry)?;
        match self.store.write(WriteRequest::compare_and_swap(key, expected, record.clone())).await {
            Ok(_) => {
                debug!(
                    key,
                    holder = %entry.holder_id,
                    fencing_token = entry.fencing_token,
                    ttl_ms = entry.ttl_ms,
                    "lease written"
                );
                Ok(Some(Lease {
                    key: key.to_string(),
                    entry,
                    record,
                }))
            }
            Err(KeyValueStoreError::CompareAndSwapFailed { .. }) => {
                debug!(key, holder = %entry.holder_id, "lost lease race");
                Ok(None)
            }
            Err(e) => Err(CoordinationError::Storage { source: e }),
        }
    }

    async fn read_entry(&self, key: &str) -> Result<Option<(LockEntry, String)>, CoordinationError> {
        let result = self.store.read(ReadRequest::new(key)).await?;
        let Some(kv) = result.kv else {
            return Ok(None);
        };
        let entry: LockEntry = serde_json::from_str(&kv.value).map_err(|_| CoordinationError::CorruptedData {
            key: key.to_string(),
            reason: "invalid JSON".to_string(),
        })?;
        Ok(Some((entry, kv.value)))
    }
}
