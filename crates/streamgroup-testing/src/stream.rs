use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use streamgroup_core::Fields;
use streamgroup_core::Offset;
use streamgroup_core::ReadPosition;
use streamgroup_core::StreamClient;
use streamgroup_core::StreamEntry;
use streamgroup_core::StreamError;
use streamgroup_core::keys;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Upper bound on entries returned by one blocking read.
const MAX_READ_BATCH: usize = 100;

#[derive(Default)]
struct State {
    streams: BTreeMap<String, Vec<StreamEntry>>,
    /// (stream key, subscriber id) -> last acknowledged offset.
    cursors: HashMap<(String, String), Offset>,
    next_offset: u64,
}

/// In-memory partition streams with blocking reads.
///
/// Offsets are allocated from one counter shared by all streams, so they are unique and strictly
/// increasing within each stream. Readers blocked in [`StreamClient::blocking_read`] are woken by
/// every append.
#[derive(Default)]
pub struct InMemoryStreamClient {
    state: Mutex<State>,
    appended: Notify,
    unavailable: AtomicBool,
}

impl InMemoryStreamClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create empty partition streams `0..count` for `channel` so they can be discovered before
    /// anything is appended.
    pub fn create_partitions(&self, channel: &str, count: u32) {
        let mut state = self.state.lock();
        for index in 0..count {
            state.streams.entry(keys::partition_stream_key(channel, index)).or_default();
        }
    }

    /// Make every subsequent operation fail with [`StreamError::Unavailable`] (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
        // Wake blocked readers so they observe the switch.
        self.appended.notify_waiters();
    }

    /// Snapshot of every entry in `key`, bypassing the availability switch.
    pub fn entries(&self, key: &str) -> Vec<StreamEntry> {
        self.state.lock().streams.get(key).cloned().unwrap_or_default()
    }

    /// Cursor for `(key, subscriber_id)`, bypassing the availability switch.
    pub fn cursor(&self, key: &str, subscriber_id: &str) -> Option<Offset> {
        self.state.lock().cursors.get(&(key.to_string(), subscriber_id.to_string())).copied()
    }

    fn check_available(&self) -> Result<(), StreamError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StreamError::Unavailable {
                reason: "in-memory stream backend switched off".to_string(),
            });
        }
        Ok(())
    }

    fn read_now(&self, key: &str, position: ReadPosition) -> Result<Vec<StreamEntry>, StreamError> {
        let state = self.state.lock();
        let entries = state.streams.get(key).ok_or_else(|| StreamError::KeyNotFound { key: key.to_string() })?;
        Ok(entries.iter().filter(|e| position.admits(e.offset)).take(MAX_READ_BATCH).cloned().collect())
    }
}

#[async_trait]
impl StreamClient for InMemoryStreamClient {
    async fn append(&self, key: &str, fields: Fields) -> Result<Offset, StreamError> {
        self.check_available()?;
        if keys::parse_partition_stream_key(key).is_none() {
            return Err(StreamError::InvalidKey {
                key: key.to_string(),
                reason: "expected '{channel}:partition:{index}'".to_string(),
            });
        }
        let offset = {
            let mut state = self.state.lock();
            state.next_offset += 1;
            let offset = Offset(state.next_offset);
            state.streams.entry(key.to_string()).or_default().push(StreamEntry { offset, fields });
            offset
        };
        trace!(key, offset = offset.value(), "appended");
        self.appended.notify_waiters();
        Ok(offset)
    }

    async fn blocking_read(
        &self,
        key: &str,
        position: ReadPosition,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = Instant::now() + block;
        loop {
            // Register for wakeups before looking, so an append between the check and the wait
            // is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            let batch = self.read_now(key, position)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, key: &str, subscriber_id: &str, offset: Offset) -> Result<(), StreamError> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.streams.contains_key(key) {
            return Err(StreamError::KeyNotFound { key: key.to_string() });
        }
        let cursor = state.cursors.entry((key.to_string(), subscriber_id.to_string())).or_insert(offset);
        if offset > *cursor {
            *cursor = offset;
        }
        Ok(())
    }

    async fn acked_offset(&self, key: &str, subscriber_id: &str) -> Result<Option<Offset>, StreamError> {
        self.check_available()?;
        Ok(self.cursor(key, subscriber_id))
    }

    async fn last_offset(&self, key: &str) -> Result<Option<Offset>, StreamError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state.streams.get(key).and_then(|entries| entries.last()).map(|e| e.offset))
    }

    async fn list_partitions(&self, channel: &str) -> Result<Vec<u32>, StreamError> {
        self.check_available()?;
        let prefix = keys::partition_stream_prefix(channel);
        let state = self.state.lock();
        let mut indexes: Vec<u32> = state
            .streams
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| keys::parse_partition_stream_key(k))
            .filter(|(c, _)| *c == channel)
            .map(|(_, index)| index)
            .collect();
        indexes.sort_unstable();
        Ok(indexes)
    }
}
