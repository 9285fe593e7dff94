use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use streamgroup_core::BatchCondition;
use streamgroup_core::BatchOperation;
use streamgroup_core::DeleteRequest;
use streamgroup_core::DeleteResult;
use streamgroup_core::KeyValueStore;
use streamgroup_core::KeyValueEntry;
use streamgroup_core::KeyValueStoreError;
use streamgroup_core::ReadRequest;
use streamgroup_core::ReadResult;
use streamgroup_core::ScanRequest;
use streamgroup_core::ScanResult;
use streamgroup_core::WriteCommand;
use streamgroup_core::WriteRequest;
use streamgroup_core::WriteResult;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, StoredValue>,
}

impl Inner {
    fn live_value(&self, key: &str, now: Instant) -> Option<&StoredValue> {
        self.data.get(key).filter(|v| v.is_live(now))
    }

    fn put(&mut self, key: &str, value: &str, expires_at: Option<Instant>) {
        self.data.insert(key.to_string(), StoredValue {
            value: value.to_string(),
            expires_at,
        });
    }

    fn apply(&mut self, operations: &[BatchOperation]) {
        for op in operations {
            match op {
                BatchOperation::Set { key, value } => self.put(key, value, None),
            }
        }
    }

    fn condition_holds(&self, condition: &BatchCondition, now: Instant) -> bool {
        match condition {
            BatchCondition::KeyNotExists { key } => self.live_value(key, now).is_none(),
            BatchCondition::ValueEquals { key, expected } => {
                self.live_value(key, now).is_some_and(|v| v.value == *expected)
            }
        }
    }
}

/// A deterministic in-memory key-value store for testing.
///
/// Thread-safe, supports every `KeyValueStore` operation, and expires `SetWithTTL` keys lazily:
/// an expired key reads as absent and is treated as absent by conditional writes.
#[derive(Default)]
pub struct DeterministicKeyValueStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
}

impl DeterministicKeyValueStore {
    /// Create a new deterministic store wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent operation fail with [`KeyValueStoreError::Unavailable`] (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current live value for `key`, bypassing the availability switch.
    pub async fn peek(&self, key: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.live_value(key, Instant::now()).map(|v| v.value.clone())
    }

    /// Live keys under `prefix`, bypassing the availability switch.
    pub async fn live_keys(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| v.is_live(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn check_available(&self) -> Result<(), KeyValueStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KeyValueStoreError::Unavailable {
                reason: "deterministic store switched off".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for DeterministicKeyValueStore {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let mut result = WriteResult::default();

        match &request.command {
            WriteCommand::Set { key, value } => inner.put(key, value, None),
            WriteCommand::SetWithTTL { key, value, ttl_ms } => {
                inner.put(key, value, Some(now + Duration::from_millis(*ttl_ms)));
            }
            WriteCommand::CompareAndSwap {
                key,
                expected,
                new_value,
            } => {
                let current = inner.live_value(key, now).map(|v| v.value.clone());
                if current.as_ref() != expected.as_ref() {
                    return Err(KeyValueStoreError::CompareAndSwapFailed {
                        key: key.clone(),
                        expected: expected.clone(),
                        actual: current,
                    });
                }
                inner.put(key, new_value, None);
            }
            WriteCommand::ConditionalBatch { conditions, operations } => {
                let conditions_met = conditions.iter().all(|c| inner.condition_holds(c, now));
                if conditions_met {
                    inner.apply(operations);
                }
                result.conditions_met = Some(conditions_met);
            }
        }

        Ok(result)
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let kv = inner.live_value(&request.key, Instant::now()).map(|v| KeyValueEntry {
            key: request.key.clone(),
            value: v.value.clone(),
        });
        Ok(ReadResult { kv })
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let deleted = inner.data.remove(&request.key).is_some_and(|v| v.is_live(now));
        Ok(DeleteResult {
            key: request.key,
            deleted,
        })
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        self.check_available()?;
        let now = Instant::now();
        let inner = self.inner.read().await;
        let limit = request.limit.map(|l| l as usize).unwrap_or(usize::MAX);

        let mut live = inner
            .data
            .range(request.prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&request.prefix))
            .filter(|(_, v)| v.is_live(now));

        let entries: Vec<KeyValueEntry> = live
            .by_ref()
            .take(limit)
            .map(|(k, v)| KeyValueEntry {
                key: k.clone(),
                value: v.value.clone(),
            })
            .collect();
        let is_truncated = live.next().is_some();

        Ok(ScanResult {
            count: entries.len() as u32,
            entries,
            is_truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_requires_matching_value() {
        let store = DeterministicKeyValueStore::new();
        store.write(WriteRequest::compare_and_swap("k", None, "v1")).await.unwrap();

        let err = store.write(WriteRequest::compare_and_swap("k", None, "v2")).await.unwrap_err();
        assert!(matches!(err, KeyValueStoreError::CompareAndSwapFailed { actual: Some(ref a), .. } if a == "v1"));

        store.write(WriteRequest::compare_and_swap("k", Some("v1".into()), "v2")).await.unwrap();
        assert_eq!(store.peek("k").await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn ttl_keys_expire() {
        let store = DeterministicKeyValueStore::new();
        store.write(WriteRequest::set_with_ttl("member", "x", 30)).await.unwrap();
        assert!(store.read(ReadRequest::new("member")).await.unwrap().kv.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.read(ReadRequest::new("member")).await.unwrap().kv.is_none());

        // Expired keys count as absent for CAS.
        store.write(WriteRequest::compare_and_swap("member", None, "y")).await.unwrap();
    }

    #[tokio::test]
    async fn conditional_batch_is_all_or_nothing() {
        let store = DeterministicKeyValueStore::new();
        store.write(WriteRequest::set("lease", "a")).await.unwrap();

        let ops = vec![BatchOperation::Set {
            key: "doc".into(),
            value: "1".into(),
        }];
        let miss = store
            .write(WriteRequest::conditional_batch(
                vec![BatchCondition::ValueEquals {
                    key: "lease".into(),
                    expected: "b".into(),
                }],
                ops.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(miss.conditions_met, Some(false));
        assert!(store.peek("doc").await.is_none());

        let hit = store
            .write(WriteRequest::conditional_batch(
                vec![BatchCondition::ValueEquals {
                    key: "lease".into(),
                    expected: "a".into(),
                }],
                ops,
            ))
            .await
            .unwrap();
        assert_eq!(hit.conditions_met, Some(true));
        assert_eq!(store.peek("doc").await.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn scan_skips_expired_and_respects_limit() {
        let store = DeterministicKeyValueStore::new();
        store.write(WriteRequest::set("p/a", "1")).await.unwrap();
        store.write(WriteRequest::set("p/b", "2")).await.unwrap();
        store.write(WriteRequest::set_with_ttl("p/c", "3", 10)).await.unwrap();
        store.write(WriteRequest::set("q/a", "4")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let all = store.scan(ScanRequest::prefix("p/")).await.unwrap();
        assert_eq!(all.count, 2);
        assert!(!all.is_truncated);

        let limited = store
            .scan(ScanRequest {
                prefix: "p/".into(),
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(limited.entries[0].key, "p/a");
        assert!(limited.is_truncated);
    }

    #[tokio::test]
    async fn delete_reports_only_live_keys() {
        let store = DeterministicKeyValueStore::new();
        store.write(WriteRequest::set("a", "1")).await.unwrap();
        store.write(WriteRequest::set_with_ttl("b", "2", 10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.delete(DeleteRequest::new("a")).await.unwrap().deleted);
        assert!(!store.delete(DeleteRequest::new("a")).await.unwrap().deleted);
        // Expired before the delete arrived.
        assert!(!store.delete(DeleteRequest::new("b")).await.unwrap().deleted);
        assert!(store.live_keys("").await.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_transiently() {
        let store = DeterministicKeyValueStore::new();
        store.set_unavailable(true);
        let err = store.read(ReadRequest::new("k")).await.unwrap_err();
        assert!(err.is_transient());
        store.set_unavailable(false);
        assert!(store.read(ReadRequest::new("k")).await.is_ok());
    }
}
