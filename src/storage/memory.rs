//! In-process storage for tests and single-node runs.
//!
//! Backed by plain maps under one mutex, so every contract operation is
//! trivially atomic, including [`Storage::exec_notify_batch`].

use super::{keys, CmpOp, Fetched, Group, NotifyBatch, Storage, StorageError};
use crate::meta::WorkerState;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    /// Append-only logs; offset of an item is its index + 1.
    queues: HashMap<(u64, Group, u32), Vec<Vec<u8>>>,
    kv: HashMap<Group, HashMap<Vec<u8>, Vec<u8>>>,
    /// Value plus absolute expiry timestamp.
    ttl: HashMap<Vec<u8>, (Vec<u8>, i64)>,
    offsets: HashMap<(u64, Group, u32, Vec<u8>), u64>,
    locks: HashMap<Vec<u8>, Vec<u8>>,
    input_partitions: HashMap<u64, u32>,
}

impl Inner {
    fn kv_mut(&mut self, group: Group) -> &mut HashMap<Vec<u8>, Vec<u8>> {
        self.kv.entry(group).or_default()
    }
}

pub struct MemStorage {
    inner: Mutex<Inner>,
    id_seq: AtomicU64,
}

impl MemStorage {
    pub fn new() -> Self {
        MemStorage {
            inner: Mutex::new(Inner::default()),
            id_seq: AtomicU64::new(1),
        }
    }

    /// Number of items ever appended to a queue partition. Test helper.
    pub fn queue_len(&self, tenant_id: u64, partition: u32, group: Group) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .queues
            .get(&(tenant_id, group, partition))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Overwrite a lock cell unconditionally. Test helper to simulate a
    /// competing runner taking the lock.
    pub fn usurp_lock(&self, key: &[u8], value: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.locks.insert(key.to_vec(), value);
    }

    /// Drop a TTL key before its time. Test helper.
    pub fn expire_ttl_key(&self, key: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.ttl.remove(key);
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        MemStorage::new()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn alloc_id(&self) -> Result<u64, StorageError> {
        Ok(self.id_seq.fetch_add(1, Ordering::Relaxed))
    }

    async fn create_tenant_queues(
        &self,
        tenant_id: u64,
        input_partitions: u32,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.input_partitions.insert(tenant_id, input_partitions);
        for p in 0..input_partitions {
            inner
                .queues
                .entry((tenant_id, Group::TenantInput, p))
                .or_default();
        }
        inner
            .queues
            .entry((tenant_id, Group::TenantOutput, 0))
            .or_default();
        Ok(())
    }

    async fn put_to_queue(
        &self,
        tenant_id: u64,
        partition: u32,
        group: Group,
        items: Vec<Vec<u8>>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner
            .queues
            .get_mut(&(tenant_id, group, partition))
            .ok_or(StorageError::NoSuchQueue {
                tenant_id,
                partition,
            })?;
        queue.extend(items);
        Ok(())
    }

    async fn fetch_from_queue(
        &self,
        tenant_id: u64,
        partition: u32,
        group: Group,
        _consumer: &[u8],
        completed: u64,
        count: u64,
    ) -> Result<Fetched, StorageError> {
        let inner = self.inner.lock().unwrap();
        let queue = inner
            .queues
            .get(&(tenant_id, group, partition))
            .ok_or(StorageError::NoSuchQueue {
                tenant_id,
                partition,
            })?;
        let start = completed as usize;
        let end = queue.len().min(start + count as usize);
        let items = (start..end)
            .map(|i| (i as u64 + 1, queue[i].clone()))
            .collect();
        Ok(Fetched { items })
    }

    async fn commit_consumer_offset(
        &self,
        tenant_id: u64,
        partition: u32,
        group: Group,
        consumer: &[u8],
        offset: u64,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .offsets
            .entry((tenant_id, group, partition, consumer.to_vec()))
            .or_insert(0);
        if offset > *slot {
            *slot = offset;
        }
        Ok(())
    }

    async fn get_committed_offset(
        &self,
        tenant_id: u64,
        partition: u32,
        group: Group,
        consumer: &[u8],
    ) -> Result<u64, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .offsets
            .get(&(tenant_id, group, partition, consumer.to_vec()))
            .copied()
            .unwrap_or(0))
    }

    async fn get_with_group(
        &self,
        key: &[u8],
        group: Group,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .kv
            .get(&group)
            .and_then(|m| m.get(key))
            .cloned())
    }

    async fn set_with_group(
        &self,
        key: &[u8],
        value: Vec<u8>,
        group: Group,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.kv_mut(group).insert(key.to_vec(), value);
        Ok(())
    }

    async fn delete_with_group(&self, key: &[u8], group: Group) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.kv_mut(group).remove(key);
        Ok(())
    }

    async fn scan_prefix(
        &self,
        prefix: &[u8],
        group: Group,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = inner
            .kv
            .get(&group)
            .map(|m| {
                m.iter()
                    .filter(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn set_with_ttl(
        &self,
        key: &[u8],
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let expire_at = Utc::now().timestamp() + ttl_secs as i64;
        inner.ttl.insert(key.to_vec(), (value, expire_at));
        Ok(())
    }

    async fn get_ttl_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.ttl.get(key) {
            Some((_, expire_at)) if *expire_at <= Utc::now().timestamp() => {
                inner.ttl.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn exec_notify_batch(
        &self,
        tenant_id: u64,
        group: Group,
        batch: NotifyBatch,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap();

        let stored = inner.kv.get(&group).and_then(|m| m.get(&batch.condition.key));
        let holds = match batch.condition.cmp {
            CmpOp::Lt => match stored {
                None => true,
                Some(current) => current.as_slice() < batch.condition.value.as_slice(),
            },
        };
        if !holds {
            return Ok(false);
        }

        for (key, value) in batch.kv_writes {
            inner.kv_mut(group).insert(key, value);
        }
        let queue = inner
            .queues
            .get_mut(&(tenant_id, group, batch.queue_partition))
            .ok_or(StorageError::NoSuchQueue {
                tenant_id,
                partition: batch.queue_partition,
            })?;
        queue.extend(batch.queue_items);
        Ok(true)
    }

    async fn update_instance_state_shard(
        &self,
        state: WorkerState,
        lock_key: &[u8],
        lock_expect: &[u8],
        _ts: i64,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.locks.get(lock_key) {
            Some(held) if held.as_slice() == lock_expect => {}
            _ => return Ok(false),
        }
        let key = keys::instance_state_key(state.instance_id, state.index);
        let value = serde_json::to_vec(&state)
            .map_err(|e| StorageError::Corrupt(format!("encode worker state: {}", e)))?;
        inner.kv_mut(Group::TenantRunner).insert(key, value);
        Ok(true)
    }

    async fn grab_lock(&self, key: &[u8], value: &[u8]) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.locks.get(key) {
            None => {
                inner.locks.insert(key.to_vec(), value.to_vec());
                Ok(true)
            }
            Some(held) => Ok(held.as_slice() == value),
        }
    }

    async fn check_lock(&self, key: &[u8], value: &[u8]) -> Result<bool, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .locks
            .get(key)
            .map(|held| held.as_slice() == value)
            .unwrap_or(false))
    }

    async fn release_lock(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locks.get(key).map(|held| held.as_slice() == value) == Some(true) {
            inner.locks.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::encode_version;

    #[tokio::test]
    async fn test_queue_append_and_fetch() {
        let store = MemStorage::new();
        store.create_tenant_queues(1, 2).await.unwrap();
        store
            .put_to_queue(1, 0, Group::TenantInput, vec![b"a".to_vec(), b"b".to_vec()])
            .await
            .unwrap();

        let fetched = store
            .fetch_from_queue(1, 0, Group::TenantInput, b"c", 0, 10)
            .await
            .unwrap();
        assert_eq!(fetched.items.len(), 2);
        assert_eq!(fetched.items[0], (1, b"a".to_vec()));
        assert_eq!(fetched.items[1], (2, b"b".to_vec()));

        let fetched = store
            .fetch_from_queue(1, 0, Group::TenantInput, b"c", 1, 10)
            .await
            .unwrap();
        assert_eq!(fetched.items.len(), 1);
        assert_eq!(fetched.items[0].0, 2);
    }

    #[tokio::test]
    async fn test_fetch_unknown_partition_fails() {
        let store = MemStorage::new();
        assert!(matches!(
            store
                .fetch_from_queue(9, 0, Group::TenantInput, b"c", 0, 1)
                .await,
            Err(StorageError::NoSuchQueue { .. })
        ));
    }

    #[tokio::test]
    async fn test_notify_batch_cas_rejects_duplicate() {
        use super::super::Condition;

        let store = MemStorage::new();
        store.create_tenant_queues(1, 1).await.unwrap();

        let cond_key = b"cond".to_vec();
        let batch = |version: u64| NotifyBatch {
            condition: Condition {
                key: cond_key.clone(),
                cmp: CmpOp::Lt,
                value: encode_version(version),
            },
            kv_writes: vec![(cond_key.clone(), encode_version(version))],
            queue_partition: 0,
            queue_items: vec![b"notify".to_vec()],
        };

        assert!(store
            .exec_notify_batch(1, Group::TenantOutput, batch(1))
            .await
            .unwrap());
        // Same version again: condition LT fails, nothing is appended.
        assert!(!store
            .exec_notify_batch(1, Group::TenantOutput, batch(1))
            .await
            .unwrap());
        assert_eq!(store.queue_len(1, 0, Group::TenantOutput), 1);

        // Next version applies.
        assert!(store
            .exec_notify_batch(1, Group::TenantOutput, batch(2))
            .await
            .unwrap());
        assert_eq!(store.queue_len(1, 0, Group::TenantOutput), 2);
    }

    #[tokio::test]
    async fn test_state_shard_write_requires_lock() {
        let store = MemStorage::new();
        let state = WorkerState {
            instance_id: 5,
            index: 0,
            version: 1,
            ..Default::default()
        };

        assert!(!store
            .update_instance_state_shard(state.clone(), b"lock", b"me", 0)
            .await
            .unwrap());

        assert!(store.grab_lock(b"lock", b"me").await.unwrap());
        assert!(store
            .update_instance_state_shard(state.clone(), b"lock", b"me", 0)
            .await
            .unwrap());

        store.usurp_lock(b"lock", b"other".to_vec());
        assert!(!store
            .update_instance_state_shard(state, b"lock", b"me", 0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_ttl_value_expires() {
        let store = MemStorage::new();
        store.set_with_ttl(b"k", b"v".to_vec(), 60).await.unwrap();
        assert_eq!(
            store.get_ttl_value(b"k").await.unwrap(),
            Some(b"v".to_vec())
        );
        store.expire_ttl_key(b"k");
        assert_eq!(store.get_ttl_value(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_cycle() {
        let store = MemStorage::new();
        assert!(store.grab_lock(b"l", b"a").await.unwrap());
        // Re-entrant for the same holder, refused for another.
        assert!(store.grab_lock(b"l", b"a").await.unwrap());
        assert!(!store.grab_lock(b"l", b"b").await.unwrap());
        assert!(store.check_lock(b"l", b"a").await.unwrap());
        store.release_lock(b"l", b"b").await.unwrap();
        assert!(store.check_lock(b"l", b"a").await.unwrap());
        store.release_lock(b"l", b"a").await.unwrap();
        assert!(store.grab_lock(b"l", b"b").await.unwrap());
    }
}
