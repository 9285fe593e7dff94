//! Core traits and types shared by the streamgroup crates.
//!
//! The consumer-group protocol is built on two narrow backend interfaces:
//!
//! - [`KeyValueStore`] holds the coordination records (leadership lease, published assignment,
//!   membership records). Every mutation of a shared record goes through a conditional write
//!   (`CompareAndSwap`, `ConditionalBatch`).
//! - [`StreamClient`] exposes the partition streams themselves: append, bounded blocking reads,
//!   per-subscriber acknowledgment cursors and partition discovery.
//!
//! Neither interface is implemented here. Production deployments adapt their stream backend to
//! these traits; tests use the deterministic implementations in `streamgroup-testing`.

pub mod error;
pub mod keys;
pub mod kv;
pub mod stream;
pub mod traits;

pub use error::KeyValueStoreError;
pub use error::StreamError;
pub use kv::BatchCondition;
pub use kv::BatchOperation;
pub use kv::DeleteRequest;
pub use kv::DeleteResult;
pub use kv::KeyValueEntry;
pub use kv::ReadRequest;
pub use kv::ReadResult;
pub use kv::ScanRequest;
pub use kv::ScanResult;
pub use kv::WriteCommand;
pub use kv::WriteRequest;
pub use kv::WriteResult;
pub use stream::ChannelSet;
pub use stream::Fields;
pub use stream::Offset;
pub use stream::PartitionId;
pub use stream::ReadPosition;
pub use stream::StreamEntry;
pub use traits::KeyValueStore;
pub use traits::StreamClient;

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if system time is before UNIX epoch rather than panicking.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
