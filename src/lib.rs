//! Kafka-style consumer groups over a keyed stream backend.
//!
//! This crate bundles the workspace crates behind one dependency:
//!
//! - [`streamgroup_core`]: backend traits (`KeyValueStore`, `StreamClient`) and shared types
//! - [`streamgroup_coordination`]: leases, membership, assignment, and the coordinator
//! - [`streamgroup_consumer`]: subscriptions, consumption loops, and the `MessageConsumer` facade
//! - [`testing`]: deterministic in-memory backends
//!
//! ```ignore
//! use streamgroup::{ConsumerConfig, MessageConsumer, handler_fn};
//! use streamgroup::testing::{DeterministicKeyValueStore, InMemoryStreamClient};
//!
//! let consumer = MessageConsumer::new(
//!     DeterministicKeyValueStore::new(),
//!     InMemoryStreamClient::new(),
//!     ConsumerConfig::default(),
//! )?;
//! let subscription = consumer
//!     .subscribe("billing", ["orders"], handler_fn(|m| async move {
//!         println!("{} {}", m.partition, m.offset);
//!         Ok(())
//!     }))
//!     .await?;
//! ```

pub use streamgroup_consumer::ConsumerConfig;
pub use streamgroup_consumer::ConsumerError;
pub use streamgroup_consumer::DecoratedMessageHandlerFactory;
pub use streamgroup_consumer::Message;
pub use streamgroup_consumer::MessageConsumer;
pub use streamgroup_consumer::MessageHandler;
pub use streamgroup_consumer::PassthroughDecorator;
pub use streamgroup_consumer::RetryingHandlerDecorator;
pub use streamgroup_consumer::Subscription;
pub use streamgroup_consumer::SubscriptionIdGenerator;
pub use streamgroup_consumer::handler_fn;
pub use streamgroup_coordination::CoordinationError;
pub use streamgroup_coordination::DistributedLock;
pub use streamgroup_coordination::LeaderHook;
pub use streamgroup_coordination::MembershipTracker;
pub use streamgroup_coordination::SubscriptionLifecycleHook;
pub use streamgroup_coordination::compute_assignment;
pub use streamgroup_core::ChannelSet;
pub use streamgroup_core::Fields;
pub use streamgroup_core::KeyValueStore;
pub use streamgroup_core::Offset;
pub use streamgroup_core::PartitionId;
pub use streamgroup_core::StreamClient;
pub use streamgroup_core::keys;

/// Deterministic in-memory backends for tests and simulations.
pub mod testing {
    pub use streamgroup_testing::DeterministicKeyValueStore;
    pub use streamgroup_testing::InMemoryStreamClient;
}
