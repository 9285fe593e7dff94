//! The consumption loop for one owned partition.
//!
//! Reads with a bounded block, hands entries to the decorated handler in stream order, and acks
//! each one after it succeeds. Cancellation is cooperative: it is observed between reads and
//! between messages, never in the middle of a handler call or a blocking read.

use std::sync::Arc;
use std::time::Duration;

use streamgroup_core::PartitionId;
use streamgroup_core::ReadPosition;
use streamgroup_core::StreamClient;
use streamgroup_core::StreamError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::handler::Message;
use crate::handler::MessageHandler;

#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopTiming {
    pub block_duration: Duration,
    pub missing_key_backoff: Duration,
    pub handler_failure_backoff: Duration,
}

pub(crate) struct PartitionLoop<C: StreamClient + ?Sized> {
    pub streams: Arc<C>,
    pub handler: Arc<dyn MessageHandler>,
    pub subscriber_id: String,
    pub subscription_id: String,
    pub partition: PartitionId,
    pub timing: LoopTiming,
}

/// Where a newly owned partition starts: after the group's cursor, or at the current tail when
/// the group never acked anything there. A partition stream that does not exist yet starts at
/// the beginning, so its first entries are not skipped.
pub(crate) async fn resolve_start<C: StreamClient + ?Sized>(
    streams: &C,
    stream_key: &str,
    subscriber_id: &str,
) -> Result<ReadPosition, StreamError> {
    match streams.acked_offset(stream_key, subscriber_id).await {
        Ok(Some(cursor)) => return Ok(ReadPosition::After(cursor)),
        Ok(None) | Err(StreamError::KeyNotFound { .. }) => {}
        Err(e) => return Err(e),
    }
    match streams.last_offset(stream_key).await {
        Ok(tail) => Ok(ReadPosition::from(tail)),
        Err(StreamError::KeyNotFound { .. }) => Ok(ReadPosition::Beginning),
        Err(e) => Err(e),
    }
}

/// Sleep for `duration` unless cancelled first. Returns true when cancelled.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

impl<C: StreamClient + ?Sized + 'static> PartitionLoop<C> {
    /// Run until cancelled. `start` is the resolved start position, or `None` to resolve it here.
    pub async fn run(self, start: Option<ReadPosition>, cancel: CancellationToken) {
        let stream_key = self.partition.stream_key();

        let mut position = match start {
            Some(position) => position,
            None => match self.resolve_with_retry(&stream_key, &cancel).await {
                Some(position) => position,
                None => return,
            },
        };

        info!(
            subscription_id = %self.subscription_id,
            partition = %self.partition,
            start = ?position,
            "partition loop started"
        );

        'read: while !cancel.is_cancelled() {
            let entries = match self.streams.blocking_read(&stream_key, position, self.timing.block_duration).await {
                Ok(entries) => entries,
                Err(StreamError::KeyNotFound { .. }) => {
                    debug!(partition = %self.partition, "partition stream does not exist yet");
                    if pause(self.timing.missing_key_backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
                Err(e) if e.is_transient() => {
                    warn!(partition = %self.partition, error = %e, "blocking read failed");
                    if pause(self.timing.missing_key_backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(partition = %self.partition, error = %e, "blocking read rejected");
                    if pause(self.timing.handler_failure_backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            for entry in entries {
                if cancel.is_cancelled() {
                    break 'read;
                }

                let message = Message {
                    subscriber_id: self.subscriber_id.clone(),
                    partition: self.partition.clone(),
                    offset: entry.offset,
                    fields: entry.fields,
                };

                if let Err(e) = self.handler.handle(&message).await {
                    error!(
                        subscription_id = %self.subscription_id,
                        partition = %self.partition,
                        offset = %entry.offset,
                        error = %e,
                        "handler failed, message will be redelivered"
                    );
                    if pause(self.timing.handler_failure_backoff, &cancel).await {
                        break 'read;
                    }
                    // Re-read from the unchanged position so order is preserved.
                    continue 'read;
                }

                // Cursors only move forward, so a lost ack at most causes a redelivery after the
                // next ownership change.
                if let Err(e) = self.streams.ack(&stream_key, &self.subscriber_id, entry.offset).await {
                    warn!(partition = %self.partition, offset = %entry.offset, error = %e, "ack failed");
                }
                position = ReadPosition::After(entry.offset);
            }
        }

        info!(
            subscription_id = %self.subscription_id,
            partition = %self.partition,
            position = ?position,
            "partition loop stopped"
        );
    }

    async fn resolve_with_retry(&self, stream_key: &str, cancel: &CancellationToken) -> Option<ReadPosition> {
        loop {
            match resolve_start(self.streams.as_ref(), stream_key, &self.subscriber_id).await {
                Ok(position) => return Some(position),
                Err(e) => {
                    warn!(partition = %self.partition, error = %e, "failed to resolve start position");
                    if pause(self.timing.missing_key_backoff, cancel).await {
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use parking_lot::Mutex;
    use streamgroup_core::Fields;
    use streamgroup_core::Offset;
    use streamgroup_testing::InMemoryStreamClient;

    use super::*;
    use crate::handler::handler_fn;

    const TIMING: LoopTiming = LoopTiming {
        block_duration: Duration::from_millis(20),
        missing_key_backoff: Duration::from_millis(10),
        handler_failure_backoff: Duration::from_millis(10),
    };

    fn fields(n: u32) -> Fields {
        Fields::from([("n".to_string(), n.to_string())])
    }

    fn recording(seen: Arc<Mutex<Vec<String>>>) -> Arc<dyn MessageHandler> {
        handler_fn(move |m: Message| {
            let seen = seen.clone();
            async move {
                seen.lock().push(m.field("n").unwrap_or_default().to_string());
                anyhow::Ok(())
            }
        })
    }

    fn partition_loop(streams: Arc<InMemoryStreamClient>, handler: Arc<dyn MessageHandler>) -> PartitionLoop<InMemoryStreamClient> {
        PartitionLoop {
            streams,
            handler,
            subscriber_id: "billing".to_string(),
            subscription_id: "sub-1".to_string(),
            partition: PartitionId::new("orders", 0),
            timing: TIMING,
        }
    }

    async fn wait_for<F: Fn() -> bool>(f: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_position_resolution() {
        let streams = InMemoryStreamClient::new();
        let key = PartitionId::new("orders", 0).stream_key();

        assert_eq!(resolve_start(streams.as_ref(), &key, "billing").await.unwrap(), ReadPosition::Beginning);

        let first = streams.append(&key, fields(1)).await.unwrap();
        let second = streams.append(&key, fields(2)).await.unwrap();
        assert_eq!(resolve_start(streams.as_ref(), &key, "billing").await.unwrap(), ReadPosition::After(second));

        streams.ack(&key, "billing", first).await.unwrap();
        assert_eq!(resolve_start(streams.as_ref(), &key, "billing").await.unwrap(), ReadPosition::After(first));
    }

    #[tokio::test]
    async fn test_delivers_in_order_and_acks() {
        let streams = InMemoryStreamClient::new();
        let key = PartitionId::new("orders", 0).stream_key();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            partition_loop(streams.clone(), recording(seen.clone())).run(Some(ReadPosition::Beginning), cancel.clone()),
        );

        let mut last = Offset::new(0);
        for n in 1..=3 {
            last = streams.append(&key, fields(n)).await.unwrap();
        }
        wait_for(|| seen.lock().len() == 3).await;

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(*seen.lock(), vec!["1", "2", "3"]);
        assert_eq!(streams.cursor(&key, "billing"), Some(last));
    }

    #[tokio::test]
    async fn test_waits_for_missing_stream() {
        let streams = InMemoryStreamClient::new();
        let key = PartitionId::new("orders", 0).stream_key();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(partition_loop(streams.clone(), recording(seen.clone())).run(None, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        streams.append(&key, fields(1)).await.unwrap();

        wait_for(|| seen.lock().len() == 1).await;
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_message_is_redelivered_before_later_ones() {
        let streams = InMemoryStreamClient::new();
        let key = PartitionId::new("orders", 0).stream_key();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(AtomicU32::new(0));

        let handler = {
            let seen = seen.clone();
            let failures = failures.clone();
            handler_fn(move |m: Message| {
                let seen = seen.clone();
                let failures = failures.clone();
                async move {
                    let n = m.field("n").unwrap_or_default().to_string();
                    if n == "2" && failures.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("not yet");
                    }
                    seen.lock().push(n);
                    Ok(())
                }
            })
        };

        for n in 1..=3 {
            streams.append(&key, fields(n)).await.unwrap();
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(partition_loop(streams.clone(), handler).run(Some(ReadPosition::Beginning), cancel.clone()));

        wait_for(|| seen.lock().len() == 3).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(*seen.lock(), vec!["1", "2", "3"]);
        assert_eq!(failures.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let streams = InMemoryStreamClient::new();
        let key = PartitionId::new("orders", 0).stream_key();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            partition_loop(streams.clone(), recording(seen.clone())).run(Some(ReadPosition::Beginning), cancel.clone()),
        );
        cancel.cancel();
        task.await.unwrap();

        streams.append(&key, fields(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_backend_outage_self_heals() {
        let streams = InMemoryStreamClient::new();
        let key = PartitionId::new("orders", 0).stream_key();
        streams.create_partitions("orders", 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        streams.set_unavailable(true);
        let task = tokio::spawn(
            partition_loop(streams.clone(), recording(seen.clone())).run(Some(ReadPosition::Beginning), cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        streams.set_unavailable(false);
        streams.append(&key, fields(1)).await.unwrap();

        wait_for(|| seen.lock().len() == 1).await;
        cancel.cancel();
        task.await.unwrap();
    }
}
