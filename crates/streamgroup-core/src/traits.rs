//! Backend traits consumed by the coordination and consumption layers.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::KeyValueStoreError;
use crate::error::StreamError;
use crate::kv::DeleteRequest;
use crate::kv::DeleteResult;
use crate::kv::ReadRequest;
use crate::kv::ReadResult;
use crate::kv::ScanRequest;
use crate::kv::ScanResult;
use crate::kv::WriteRequest;
use crate::kv::WriteResult;
use crate::stream::Fields;
use crate::stream::Offset;
use crate::stream::ReadPosition;
use crate::stream::StreamEntry;

/// Key-value store holding leadership leases, assignments and membership records.
///
/// Must provide linearizable conditional writes; the protocol never mutates a shared record with
/// an unconditional read-then-write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Apply a write command.
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError>;

    /// Read a value by key. Expired keys read as absent.
    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError>;

    /// Delete a key. Idempotent: deleting a missing key succeeds with `deleted = false`.
    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError>;

    /// Scan live keys matching a prefix, in key order.
    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        (**self).write(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        (**self).read(request).await
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        (**self).delete(request).await
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        (**self).scan(request).await
    }
}

/// Keyed stream backend holding the partition streams and acknowledgment cursors.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Append an entry, creating the stream if needed. Returns the new entry's offset.
    async fn append(&self, key: &str, fields: Fields) -> Result<Offset, StreamError>;

    /// Wait up to `block` for entries after `position`.
    ///
    /// Returns an empty vector when the wait elapses with nothing new, and
    /// [`StreamError::KeyNotFound`] when the stream does not exist.
    async fn blocking_read(
        &self,
        key: &str,
        position: ReadPosition,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Record that `subscriber_id` has processed everything up to and including `offset`.
    ///
    /// Cursors never move backwards: acknowledging an older offset is a no-op.
    async fn ack(&self, key: &str, subscriber_id: &str, offset: Offset) -> Result<(), StreamError>;

    /// The last offset acknowledged by `subscriber_id`, if any.
    async fn acked_offset(&self, key: &str, subscriber_id: &str) -> Result<Option<Offset>, StreamError>;

    /// Offset of the newest entry in the stream, or `None` if the stream is empty or absent.
    async fn last_offset(&self, key: &str) -> Result<Option<Offset>, StreamError>;

    /// Indexes of the partitions that currently exist for `channel`, ascending.
    async fn list_partitions(&self, channel: &str) -> Result<Vec<u32>, StreamError>;
}

#[async_trait]
impl<T: StreamClient + ?Sized> StreamClient for std::sync::Arc<T> {
    async fn append(&self, key: &str, fields: Fields) -> Result<Offset, StreamError> {
        (**self).append(key, fields).await
    }

    async fn blocking_read(
        &self,
        key: &str,
        position: ReadPosition,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        (**self).blocking_read(key, position, block).await
    }

    async fn ack(&self, key: &str, subscriber_id: &str, offset: Offset) -> Result<(), StreamError> {
        (**self).ack(key, subscriber_id, offset).await
    }

    async fn acked_offset(&self, key: &str, subscriber_id: &str) -> Result<Option<Offset>, StreamError> {
        (**self).acked_offset(key, subscriber_id).await
    }

    async fn last_offset(&self, key: &str) -> Result<Option<Offset>, StreamError> {
        (**self).last_offset(key).await
    }

    async fn list_partitions(&self, channel: &str) -> Result<Vec<u32>, StreamError> {
        (**self).list_partitions(channel).await
    }
}
