//! Consumer-group coordination built on CAS operations.
//!
//! - `DistributedLock` - leased mutual exclusion with fencing tokens
//! - `MembershipTracker` - TTL'd liveness records per group
//! - `compute_assignment` - deterministic partition to consumer mapping
//! - `Coordinator` - leader election, rebalancing, and assignment watching for one group member
//! - `HookRegistry` - ordered, failure-isolated leader and lifecycle observers
//!
//! All shared state lives in a [`streamgroup_core::KeyValueStore`]; every mutation is a
//! conditional write, so any number of processes can run the same group.
//!
//! ## Coordinator Example
//!
//! ```ignore
//! use streamgroup_coordination::{Coordinator, CoordinatorConfig, HookRegistry};
//!
//! let handle = Coordinator::new(store, streams, config, Arc::new(HookRegistry::new()))?
//!     .start()
//!     .await;
//!
//! let mut owned = handle.subscribe_assignment();
//! while owned.changed().await.is_ok() {
//!     println!("now own {:?}", *owned.borrow());
//! }
//! ```

mod assignment;
mod coordinator;
mod error;
mod hooks;
mod lock;
mod membership;
mod types;

pub use assignment::AssignmentDocument;
pub use assignment::PartitionOwner;
pub use assignment::compute_assignment;
pub use coordinator::Coordinator;
pub use coordinator::CoordinatorConfig;
pub use coordinator::CoordinatorHandle;
pub use coordinator::LeadershipState;
pub use error::CoordinationError;
pub use hooks::HookRegistry;
pub use hooks::LeaderHook;
pub use hooks::SubscriptionLifecycleHook;
pub use lock::DistributedLock;
pub use lock::Lease;
pub use membership::MAX_MEMBERS;
pub use membership::MemberRecord;
pub use membership::MembershipTracker;
pub use types::FencingToken;
pub use types::LockEntry;
pub use types::now_unix_ms;
