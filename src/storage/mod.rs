//! The storage contract the engine consumes.
//!
//! In production this is backed by a raft-partitioned store; the engine only
//! depends on the operations below. [`memory::MemStorage`] implements the
//! same contract in-process for tests and single-node runs.

pub mod memory;

use crate::meta::WorkerState;
use async_trait::async_trait;

/// Raft group families a tenant's data is spread over.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Group {
    /// Tenant event input queues.
    TenantInput,
    /// Notify output queue plus the transaction-authoritative KV cells.
    TenantOutput,
    /// Runner metadata and the queryable worker-state shards.
    TenantRunner,
}

/// Comparison operator of a [`Condition`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CmpOp {
    /// Condition holds when the stored value is absent or byte-wise less
    /// than the condition value.
    Lt,
}

/// Guard of an atomic multi-write.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub key: Vec<u8>,
    pub cmp: CmpOp,
    pub value: Vec<u8>,
}

/// One atomic unit applied by [`Storage::exec_notify_batch`]: a guarded set
/// of KV writes plus queue appends. Either everything applies or nothing.
#[derive(Clone, Debug)]
pub struct NotifyBatch {
    pub condition: Condition,
    pub kv_writes: Vec<(Vec<u8>, Vec<u8>)>,
    pub queue_partition: u32,
    pub queue_items: Vec<Vec<u8>>,
}

/// Items pulled from a queue partition with their absolute offsets.
#[derive(Clone, Debug, Default)]
pub struct Fetched {
    pub items: Vec<(u64, Vec<u8>)>,
}

#[derive(Clone, Debug)]
pub enum StorageError {
    /// Transient failure; callers retry with backoff.
    Unavailable(String),
    /// The tenant's queues were never provisioned.
    NoSuchQueue { tenant_id: u64, partition: u32 },
    /// Value bytes did not decode.
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Unavailable(msg) => write!(f, "storage unavailable: {}", msg),
            StorageError::NoSuchQueue {
                tenant_id,
                partition,
            } => write!(
                f,
                "no queue for tenant {} partition {}",
                tenant_id, partition
            ),
            StorageError::Corrupt(msg) => write!(f, "corrupt value: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// Shard-aware storage operations. All calls are synchronous RPCs in
/// production; transient failures surface as [`StorageError::Unavailable`].
#[async_trait]
pub trait Storage: Send + Sync {
    /// Allocate a unique id (instance ids).
    async fn alloc_id(&self) -> Result<u64, StorageError>;

    /// Provision a tenant's input partitions, output queue and runner group.
    async fn create_tenant_queues(
        &self,
        tenant_id: u64,
        input_partitions: u32,
    ) -> Result<(), StorageError>;

    /// Append items to a queue partition.
    async fn put_to_queue(
        &self,
        tenant_id: u64,
        partition: u32,
        group: Group,
        items: Vec<Vec<u8>>,
    ) -> Result<(), StorageError>;

    /// Pull up to `count` items after `completed` from a queue partition.
    async fn fetch_from_queue(
        &self,
        tenant_id: u64,
        partition: u32,
        group: Group,
        consumer: &[u8],
        completed: u64,
        count: u64,
    ) -> Result<Fetched, StorageError>;

    /// Durably record a consumer's progress on a partition.
    async fn commit_consumer_offset(
        &self,
        tenant_id: u64,
        partition: u32,
        group: Group,
        consumer: &[u8],
        offset: u64,
    ) -> Result<(), StorageError>;

    /// Last offset committed by [`Storage::commit_consumer_offset`], 0 if none.
    async fn get_committed_offset(
        &self,
        tenant_id: u64,
        partition: u32,
        group: Group,
        consumer: &[u8],
    ) -> Result<u64, StorageError>;

    async fn get_with_group(
        &self,
        key: &[u8],
        group: Group,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    async fn set_with_group(
        &self,
        key: &[u8],
        value: Vec<u8>,
        group: Group,
    ) -> Result<(), StorageError>;

    async fn delete_with_group(&self, key: &[u8], group: Group) -> Result<(), StorageError>;

    /// Keys and values under a prefix, byte-ordered. Engine recovery only.
    async fn scan_prefix(
        &self,
        prefix: &[u8],
        group: Group,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Write a key that expires `ttl_secs` from now.
    async fn set_with_ttl(
        &self,
        key: &[u8],
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<(), StorageError>;

    /// Read a TTL key; `None` once expired.
    async fn get_ttl_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Apply a [`NotifyBatch`] atomically against the group. Returns whether
    /// the condition held; a `false` return means every effect was skipped
    /// (the duplicate-commit signal, not an error).
    async fn exec_notify_batch(
        &self,
        tenant_id: u64,
        group: Group,
        batch: NotifyBatch,
    ) -> Result<bool, StorageError>;

    /// Write a worker-state shard, fenced by the runner lock. Returns
    /// whether the lock was still held by `lock_expect`.
    async fn update_instance_state_shard(
        &self,
        state: WorkerState,
        lock_key: &[u8],
        lock_expect: &[u8],
        ts: i64,
    ) -> Result<bool, StorageError>;

    /// Take a lock cell. Succeeds when free or already held with `value`.
    async fn grab_lock(&self, key: &[u8], value: &[u8]) -> Result<bool, StorageError>;

    /// Whether the lock cell currently holds `value`.
    async fn check_lock(&self, key: &[u8], value: &[u8]) -> Result<bool, StorageError>;

    /// Release a lock cell if held with `value`.
    async fn release_lock(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
}

/// Big-endian version encoding used in condition cells; fixed width so the
/// byte order matches the numeric order.
pub fn encode_version(version: u64) -> Vec<u8> {
    version.to_be_bytes().to_vec()
}

/// Key layout. All keys are raw bytes; numeric components are big-endian.
pub mod keys {
    const QUEUE_KV_PREFIX: u8 = b'k';
    const STEP_TTL_PREFIX: u8 = b't';
    const RUNNER_LOCK_PREFIX: u8 = b'l';
    const INSTANCE_RECORD_PREFIX: u8 = b'i';
    const TENANT_RECORD_PREFIX: u8 = b'T';

    /// 12 bytes: `u64(instance_id) || u32(index)`.
    pub fn instance_state_key(instance_id: u64, index: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(12);
        key.extend_from_slice(&instance_id.to_be_bytes());
        key.extend_from_slice(&index.to_be_bytes());
        key
    }

    /// 13 bytes: the state key plus a zero suffix.
    pub fn condition_key(state_key: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(state_key.len() + 1);
        key.extend_from_slice(state_key);
        key.push(0);
        key
    }

    /// Tenant-scoped KV cell within a queue group.
    pub fn queue_kv_key(tenant_id: u64, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + key.len());
        out.push(QUEUE_KV_PREFIX);
        out.extend_from_slice(&tenant_id.to_be_bytes());
        out.extend_from_slice(key);
        out
    }

    /// Per-user step TTL cell, written when a user enters a TTL step.
    pub fn step_ttl_key(workflow_id: u64, user_id: u32, step: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(13 + step.len());
        key.push(STEP_TTL_PREFIX);
        key.extend_from_slice(&workflow_id.to_be_bytes());
        key.extend_from_slice(&user_id.to_be_bytes());
        key.extend_from_slice(step.as_bytes());
        key
    }

    /// The tenant runner's distributed lock cell.
    pub fn runner_lock_key(tenant_id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(9);
        key.push(RUNNER_LOCK_PREFIX);
        key.extend_from_slice(&tenant_id.to_be_bytes());
        key
    }

    /// Admission record of a running instance.
    pub fn instance_record_key(workflow_id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(9);
        key.push(INSTANCE_RECORD_PREFIX);
        key.extend_from_slice(&workflow_id.to_be_bytes());
        key
    }

    pub fn instance_record_prefix() -> Vec<u8> {
        vec![INSTANCE_RECORD_PREFIX]
    }

    /// Provisioning record of a tenant.
    pub fn tenant_record_key(tenant_id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(9);
        key.push(TENANT_RECORD_PREFIX);
        key.extend_from_slice(&tenant_id.to_be_bytes());
        key
    }

    pub fn tenant_record_prefix() -> Vec<u8> {
        vec![TENANT_RECORD_PREFIX]
    }
}
