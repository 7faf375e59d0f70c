//! Durable queue of progress writes that could not reach the store.
//!
//! Entries are kept in enqueue order and collapsed by an identity key taken
//! from the payload (`record_id` by default), so at most one pending write
//! exists per learner and question.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::error::{EngineError, EngineResult};
use crate::metrics::{OFFLINE_QUEUE_DEPTH, OFFLINE_QUEUE_SYNC_TOTAL};
use crate::models::progress::{QueuedWrite, SyncResult};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

/// Backing store for the serialized queue.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    async fn load(&self) -> EngineResult<Vec<QueuedWrite>>;

    async fn save(&self, entries: &[QueuedWrite]) -> EngineResult<()>;

    async fn clear(&self) -> EngineResult<()>;
}

/// Keeps the queue in process memory only.
#[derive(Default)]
pub struct MemoryQueueStorage {
    entries: StdMutex<Vec<QueuedWrite>>,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<QueuedWrite>) -> Self {
        Self {
            entries: StdMutex::new(entries),
        }
    }

    pub fn snapshot(&self) -> Vec<QueuedWrite> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn load(&self) -> EngineResult<Vec<QueuedWrite>> {
        Ok(self.snapshot())
    }

    async fn save(&self, entries: &[QueuedWrite]) -> EngineResult<()> {
        let mut stored = self
            .entries
            .lock()
            .map_err(|_| EngineError::QueueStorage("memory storage poisoned".to_string()))?;
        *stored = entries.to_vec();
        Ok(())
    }

    async fn clear(&self) -> EngineResult<()> {
        self.save(&[]).await
    }
}

/// Stores the whole queue as one JSON array under a single key with a TTL.
pub struct RedisQueueStorage {
    redis: ConnectionManager,
    key: String,
    ttl_secs: u64,
    retry: RetryConfig,
}

impl RedisQueueStorage {
    pub fn new(redis: ConnectionManager, settings: &QueueSettings) -> Self {
        Self {
            redis,
            key: settings.storage_key.clone(),
            ttl_secs: settings.ttl_secs,
            retry: RetryConfig::default(),
        }
    }
}

#[async_trait]
impl QueueStorage for RedisQueueStorage {
    async fn load(&self) -> EngineResult<Vec<QueuedWrite>> {
        let raw: Option<String> = retry_async_with_config(&self.retry, "queue_load", || {
            let mut conn = self.redis.clone();
            let key = self.key.clone();
            async move { redis::cmd("GET").arg(&key).query_async(&mut conn).await }
        })
        .await?;

        let Some(raw) = raw else {
            return Ok(Vec::new());
        };

        match serde_json::from_str::<Vec<QueuedWrite>>(&raw) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                warn!(key = %self.key, error = %err, "Discarding unreadable offline queue");
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, entries: &[QueuedWrite]) -> EngineResult<()> {
        let body = serde_json::to_string(entries)?;
        retry_async_with_config(&self.retry, "queue_save", || {
            let mut conn = self.redis.clone();
            let key = self.key.clone();
            let body = body.clone();
            let ttl = self.ttl_secs;
            async move {
                redis::cmd("SETEX")
                    .arg(&key)
                    .arg(ttl)
                    .arg(body)
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    async fn clear(&self) -> EngineResult<()> {
        retry_async_with_config(&self.retry, "queue_clear", || {
            let mut conn = self.redis.clone();
            let key = self.key.clone();
            async move { redis::cmd("DEL").arg(&key).query_async::<()>(&mut conn).await }
        })
        .await?;
        Ok(())
    }
}

#[derive(Default, Clone)]
struct QueueState {
    next_seq: u64,
    entries: BTreeMap<u64, QueuedWrite>,
    by_id: HashMap<String, u64>,
    by_identity: HashMap<String, u64>,
}

impl QueueState {
    /// Indexes persisted entries, re-applying de-duplication and the size cap.
    fn rebuild(persisted: Vec<QueuedWrite>, settings: &QueueSettings) -> Self {
        let mut state = Self::default();
        for entry in persisted {
            let identity = identity_of(&entry.payload, &settings.identity_field);
            match identity.as_ref().and_then(|i| state.by_identity.get(i).copied()) {
                Some(seq) => state.replace(seq, entry),
                None => state.push(entry, identity),
            }
            while state.entries.len() > settings.max_size {
                state.pop_oldest(&settings.identity_field);
            }
        }
        state
    }

    fn push(&mut self, entry: QueuedWrite, identity: Option<String>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(entry.id.clone(), seq);
        if let Some(identity) = identity {
            self.by_identity.insert(identity, seq);
        }
        self.entries.insert(seq, entry);
    }

    /// Swaps the entry at `seq` for `entry`, keeping its queue position.
    fn replace(&mut self, seq: u64, entry: QueuedWrite) {
        if let Some(old) = self.entries.insert(seq, entry.clone()) {
            self.by_id.remove(&old.id);
        }
        self.by_id.insert(entry.id, seq);
    }

    fn remove_seq(&mut self, seq: u64, identity_field: &str) -> Option<QueuedWrite> {
        let entry = self.entries.remove(&seq)?;
        self.by_id.remove(&entry.id);
        if let Some(identity) = identity_of(&entry.payload, identity_field) {
            if self.by_identity.get(&identity) == Some(&seq) {
                self.by_identity.remove(&identity);
            }
        }
        Some(entry)
    }

    fn pop_oldest(&mut self, identity_field: &str) -> Option<QueuedWrite> {
        let seq = *self.entries.keys().next()?;
        self.remove_seq(seq, identity_field)
    }

    fn snapshot(&self) -> Vec<QueuedWrite> {
        self.entries.values().cloned().collect()
    }
}

fn identity_of(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The backing storage is the source of truth: several processes (API and
/// sync worker) may share it, so every read and mutation starts by reloading
/// it under the lock. The in-memory state only changes after a successful save.
pub struct OfflineQueue {
    state: Mutex<QueueState>,
    storage: Arc<dyn QueueStorage>,
    settings: QueueSettings,
}

impl OfflineQueue {
    /// Restores whatever the storage still holds, re-applying de-duplication
    /// and the size cap.
    pub async fn load(storage: Arc<dyn QueueStorage>, settings: QueueSettings) -> EngineResult<Self> {
        let state = QueueState::rebuild(storage.load().await?, &settings);

        OFFLINE_QUEUE_DEPTH.set(state.entries.len() as i64);
        info!(pending = state.entries.len(), "Offline queue loaded");

        Ok(Self {
            state: Mutex::new(state),
            storage,
            settings,
        })
    }

    /// Queues `payload` and returns the new entry id. A pending write with the
    /// same identity key is replaced where it stands. On a storage error the
    /// write is not queued.
    pub async fn enqueue(&self, payload: Value) -> EngineResult<String> {
        let identity = identity_of(&payload, &self.settings.identity_field);
        let entry = QueuedWrite {
            id: Uuid::new_v4().to_string(),
            payload,
            enqueued_at: now_ms(),
            retry_count: 0,
        };
        let id = entry.id.clone();

        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;

        let mut next = state.clone();
        match identity.as_ref().and_then(|i| next.by_identity.get(i).copied()) {
            Some(seq) => {
                debug!(id = %id, "Replacing pending write with the same identity");
                next.replace(seq, entry);
            }
            None => {
                next.push(entry, identity);
                while next.entries.len() > self.settings.max_size {
                    if let Some(evicted) = next.pop_oldest(&self.settings.identity_field) {
                        warn!(id = %evicted.id, "Offline queue full, evicted oldest entry");
                    }
                }
            }
        }

        self.commit(&mut state, next).await?;
        Ok(id)
    }

    /// All pending entries in enqueue order. Nothing is removed.
    pub async fn dequeue_all(&self) -> EngineResult<Vec<QueuedWrite>> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        Ok(state.snapshot())
    }

    /// Returns whether an entry with `id` was present.
    pub async fn remove(&self, id: &str) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        let Some(seq) = state.by_id.get(id).copied() else {
            return Ok(false);
        };

        let mut next = state.clone();
        next.remove_seq(seq, &self.settings.identity_field);
        self.commit(&mut state, next).await?;
        Ok(true)
    }

    /// Bumps the retry count and returns the new value, if the entry exists.
    pub async fn increment_retry(&self, id: &str) -> EngineResult<Option<u32>> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        let Some(seq) = state.by_id.get(id).copied() else {
            return Ok(None);
        };

        let mut next = state.clone();
        let Some(entry) = next.entries.get_mut(&seq) else {
            return Ok(None);
        };
        entry.retry_count += 1;
        let count = entry.retry_count;

        self.commit(&mut state, next).await?;
        Ok(Some(count))
    }

    /// Replays every pending entry through `sync_fn` in enqueue order.
    ///
    /// Successful entries are removed. Failed ones get their retry count
    /// bumped and are dropped once it reaches the retry ceiling. Individual
    /// failures never fail the flush; only storage errors do. The lock is
    /// released while `sync_fn` runs, and an entry replaced meanwhile keeps
    /// its newer payload.
    pub async fn sync<F, Fut>(&self, mut sync_fn: F) -> EngineResult<Vec<SyncResult>>
    where
        F: FnMut(Value) -> Fut,
        Fut: Future<Output = EngineResult<()>>,
    {
        let pending = self.dequeue_all().await?;
        let mut results = Vec::with_capacity(pending.len());

        for entry in pending {
            match sync_fn(entry.payload.clone()).await {
                Ok(()) => {
                    self.remove(&entry.id).await?;
                    OFFLINE_QUEUE_SYNC_TOTAL.with_label_values(&["success"]).inc();
                    results.push(SyncResult {
                        id: entry.id,
                        success: true,
                        error: None,
                        dropped: false,
                    });
                }
                Err(err) => {
                    let retries = self.increment_retry(&entry.id).await?;
                    let dropped = match retries {
                        Some(count) if count >= self.settings.max_retries => {
                            warn!(id = %entry.id, retries = count, "Dropping queued write after repeated failures");
                            self.remove(&entry.id).await?;
                            true
                        }
                        _ => false,
                    };
                    let label = if dropped { "dropped" } else { "failure" };
                    OFFLINE_QUEUE_SYNC_TOTAL.with_label_values(&[label]).inc();
                    results.push(SyncResult {
                        id: entry.id,
                        success: false,
                        error: Some(err.to_string()),
                        dropped,
                    });
                }
            }
        }

        let synced = results.iter().filter(|r| r.success).count();
        info!(processed = results.len(), synced, "Offline queue sync finished");
        Ok(results)
    }

    pub async fn len(&self) -> EngineResult<usize> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        Ok(state.entries.len())
    }

    pub async fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn clear(&self) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        self.storage.clear().await?;
        *state = QueueState::default();
        OFFLINE_QUEUE_DEPTH.set(0);
        Ok(())
    }

    async fn refresh(&self, state: &mut QueueState) -> EngineResult<()> {
        *state = QueueState::rebuild(self.storage.load().await?, &self.settings);
        OFFLINE_QUEUE_DEPTH.set(state.entries.len() as i64);
        Ok(())
    }

    async fn commit(&self, state: &mut QueueState, next: QueueState) -> EngineResult<()> {
        self.storage.save(&next.snapshot()).await?;
        OFFLINE_QUEUE_DEPTH.set(next.entries.len() as i64);
        *state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory storage whose saves can be switched off.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryQueueStorage,
        fail_saves: AtomicBool,
    }

    #[async_trait]
    impl QueueStorage for FlakyStorage {
        async fn load(&self) -> EngineResult<Vec<QueuedWrite>> {
            self.inner.load().await
        }

        async fn save(&self, entries: &[QueuedWrite]) -> EngineResult<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(EngineError::QueueStorage("redis unavailable".into()));
            }
            self.inner.save(entries).await
        }

        async fn clear(&self) -> EngineResult<()> {
            self.inner.clear().await
        }
    }

    fn settings(max_size: usize) -> QueueSettings {
        QueueSettings {
            max_size,
            ..QueueSettings::default()
        }
    }

    async fn queue(max_size: usize) -> (OfflineQueue, Arc<MemoryQueueStorage>) {
        let storage = Arc::new(MemoryQueueStorage::new());
        let queue = OfflineQueue::load(storage.clone(), settings(max_size))
            .await
            .unwrap();
        (queue, storage)
    }

    #[tokio::test]
    async fn same_identity_replaces_in_place() {
        let (queue, storage) = queue(10).await;
        queue.enqueue(json!({"record_id": "q1", "v": 1})).await.unwrap();
        queue.enqueue(json!({"record_id": "q2", "v": 1})).await.unwrap();
        let first = queue.dequeue_all().await.unwrap()[0].id.clone();

        queue.increment_retry(&first).await.unwrap();
        let new_id = queue
            .enqueue(json!({"record_id": "q1", "v": 2}))
            .await
            .unwrap();

        let entries = queue.dequeue_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, new_id);
        assert_eq!(entries[0].payload["v"], json!(2));
        assert_eq!(entries[0].retry_count, 0);
        assert_eq!(entries[1].payload["record_id"], json!("q2"));
        assert_eq!(storage.snapshot(), entries);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest() {
        let (queue, _) = queue(2).await;
        for q in ["a", "b", "c"] {
            queue.enqueue(json!({"record_id": q})).await.unwrap();
        }

        let ids: Vec<_> = queue
            .dequeue_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.payload["record_id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("b"), json!("c")]);

        // evicted identity can be queued again as a fresh entry
        queue.enqueue(json!({"record_id": "a"})).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn payload_without_identity_is_never_collapsed() {
        let (queue, _) = queue(10).await;
        queue.enqueue(json!({"note": 1})).await.unwrap();
        queue.enqueue(json!({"note": 1})).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn remove_and_increment_unknown_ids() {
        let (queue, _) = queue(10).await;
        assert!(!queue.remove("missing").await.unwrap());
        assert_eq!(queue.increment_retry("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn load_restores_persisted_entries() {
        let persisted = vec![
            QueuedWrite {
                id: "1".into(),
                payload: json!({"record_id": "q1"}),
                enqueued_at: 1,
                retry_count: 3,
            },
            QueuedWrite {
                id: "2".into(),
                payload: json!({"record_id": "q2"}),
                enqueued_at: 2,
                retry_count: 0,
            },
        ];
        let storage = Arc::new(MemoryQueueStorage::with_entries(persisted.clone()));
        let queue = OfflineQueue::load(storage, settings(10)).await.unwrap();

        assert_eq!(queue.dequeue_all().await.unwrap(), persisted);
        assert!(queue.remove("1").await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_empties_storage() {
        let (queue, storage) = queue(10).await;
        queue.enqueue(json!({"record_id": "q1"})).await.unwrap();
        queue.clear().await.unwrap();

        assert!(queue.is_empty().await.unwrap());
        assert!(storage.snapshot().is_empty());
    }

    #[tokio::test]
    async fn failed_save_leaves_queue_unchanged() {
        let storage = Arc::new(FlakyStorage::default());
        let queue = OfflineQueue::load(storage.clone(), settings(10)).await.unwrap();
        queue.enqueue(json!({"record_id": "u1:q1", "v": 1})).await.unwrap();

        storage.fail_saves.store(true, Ordering::SeqCst);
        let err = queue
            .enqueue(json!({"record_id": "u1:q2"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::QueueStorage(_)));
        assert!(queue
            .enqueue(json!({"record_id": "u1:q1", "v": 2}))
            .await
            .is_err());

        let entries = queue.dequeue_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["v"], json!(1));

        storage.fail_saves.store(false, Ordering::SeqCst);
        let results = queue.sync(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(storage.inner.snapshot().is_empty());
    }
}
