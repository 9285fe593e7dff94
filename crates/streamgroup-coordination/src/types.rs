//! Lease record and term numbering shared by the lock and the coordinator.

use serde::Deserialize;
use serde::Serialize;
pub use streamgroup_core::now_unix_ms;

/// Contents of a leadership key, stored as JSON.
///
/// `deadline_ms == 0` marks a lease given up voluntarily; the term number survives the release so
/// the next holder continues the sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockEntry {
    pub holder_id: String,
    pub fencing_token: u64,
    /// Start of the current term (unix ms). Kept across renewals.
    pub acquired_at_ms: u64,
    pub ttl_ms: u64,
    pub deadline_ms: u64,
}

impl LockEntry {
    /// A fresh term for `holder_id` lasting `ttl_ms` from now.
    pub fn granted(holder_id: &str, fencing_token: u64, ttl_ms: u64) -> Self {
        let now = now_unix_ms();
        Self {
            holder_id: holder_id.to_string(),
            fencing_token,
            acquired_at_ms: now,
            ttl_ms,
            deadline_ms: now + ttl_ms,
        }
    }

    /// The same term with its deadline moved to now + `ttl_ms`.
    pub fn extended(&self, ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            deadline_ms: now_unix_ms() + ttl_ms,
            ..self.clone()
        }
    }

    /// The record left behind by a holder stepping down.
    pub fn released(&self) -> Self {
        Self {
            holder_id: String::new(),
            ttl_ms: 0,
            deadline_ms: 0,
            ..self.clone()
        }
    }

    pub fn is_live_at(&self, now_ms: u64) -> bool {
        self.deadline_ms != 0 && now_ms <= self.deadline_ms
    }

    pub fn is_live(&self) -> bool {
        self.is_live_at(now_unix_ms())
    }

    pub fn is_held_by(&self, holder_id: &str) -> bool {
        self.is_live() && self.holder_id == holder_id
    }
}

/// Term number of a leadership lease, copied into every assignment that term publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FencingToken(pub u64);
