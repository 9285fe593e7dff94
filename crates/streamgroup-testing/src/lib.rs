//! Deterministic in-memory backends for streamgroup tests.
//!
//! - [`DeterministicKeyValueStore`]: coordination store with CAS, conditional batches and TTL expiry
//! - [`InMemoryStreamClient`]: partition streams with real blocking reads and per-subscriber cursors
//!
//! Both backends can be switched into an "unavailable" mode to simulate a backend restart or
//! network failure; every operation then fails with a transient error until switched back.

mod kv;
mod stream;

pub use kv::DeterministicKeyValueStore;
pub use stream::InMemoryStreamClient;
