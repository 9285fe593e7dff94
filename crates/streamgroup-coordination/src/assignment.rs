//! Deterministic partition assignment and the published assignment document.
//!
//! The computation is a pure function of the partition set and the alive member set. Two leaders
//! that compute from the same snapshot therefore publish the same mapping, which is what lets a
//! leadership flap converge instead of oscillating.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use streamgroup_core::PartitionId;

/// One entry of the published mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwner {
    pub partition: PartitionId,
    pub consumer_id: String,
}

/// The assignment document stored under the group's assignment key.
///
/// Written only by the leader, in the same atomic batch that proves it still holds the lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentDocument {
    /// Consumer that computed this mapping.
    pub leader_id: String,
    /// Fencing token of the leadership term that wrote it.
    pub fencing_token: u64,
    /// Incremented on every published change, across terms.
    pub generation: u64,
    pub updated_at_ms: u64,
    /// Alive members the mapping was computed from, sorted.
    pub members: Vec<String>,
    /// Sorted by partition.
    pub owners: Vec<PartitionOwner>,
}

impl AssignmentDocument {
    /// Partitions this document gives to `consumer_id`.
    pub fn partitions_for(&self, consumer_id: &str) -> BTreeSet<PartitionId> {
        self.owners
            .iter()
            .filter(|o| o.consumer_id == consumer_id)
            .map(|o| o.partition.clone())
            .collect()
    }

    /// Owner of `partition`, if it is assigned.
    pub fn owner_of(&self, partition: &PartitionId) -> Option<&str> {
        self.owners.iter().find(|o| &o.partition == partition).map(|o| o.consumer_id.as_str())
    }
}

/// Map every partition to exactly one member.
///
/// Partitions are sorted by (channel, index) and members by id. Each member receives a
/// contiguous slice of the sorted partitions; when the split is uneven, the first
/// `partitions % members` members get one extra. No members means no owners.
pub fn compute_assignment(partitions: &BTreeSet<PartitionId>, members: &BTreeSet<String>) -> Vec<PartitionOwner> {
    if members.is_empty() {
        return Vec::new();
    }

    let base = partitions.len() / members.len();
    let extra = partitions.len() % members.len();

    let mut owners = Vec::with_capacity(partitions.len());
    let mut sorted = partitions.iter();
    for (i, member) in members.iter().enumerate() {
        let share = base + usize::from(i < extra);
        for partition in sorted.by_ref().take(share) {
            owners.push(PartitionOwner {
                partition: partition.clone(),
                consumer_id: member.clone(),
            });
        }
    }
    owners
}
