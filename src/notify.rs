//! Downstream move notifications.

use crate::meta::Notify;
use crate::storage::{CmpOp, Condition, Group, NotifyBatch, Storage, StorageError};
use async_trait::async_trait;
use slog::{debug, info, Logger};
use std::sync::Arc;

/// Delivers notifies together with the worker's versioned state under one
/// atomic guard. An implementation must apply all effects or none.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Append `notifies` to the tenant's output queue, bump the condition
    /// cell from any value `< cond_value` to `cond_value` and write the
    /// serialized worker state, atomically. A commit whose condition no
    /// longer holds is a duplicate replay and must succeed without effects.
    async fn notify(
        &self,
        tenant_id: u64,
        notifies: &[Notify],
        condition_key: &[u8],
        cond_value: Vec<u8>,
        state_key: &[u8],
        state_value: Vec<u8>,
    ) -> Result<(), StorageError>;
}

/// Notifier backed by the tenant's output queue group.
pub struct QueueNotifier {
    store: Arc<dyn Storage>,
    log: Logger,
}

impl QueueNotifier {
    pub fn new(store: Arc<dyn Storage>, log: Logger) -> Self {
        QueueNotifier { store, log }
    }
}

#[async_trait]
impl Notifier for QueueNotifier {
    async fn notify(
        &self,
        tenant_id: u64,
        notifies: &[Notify],
        condition_key: &[u8],
        cond_value: Vec<u8>,
        state_key: &[u8],
        state_value: Vec<u8>,
    ) -> Result<(), StorageError> {
        let mut items = Vec::with_capacity(notifies.len());
        for nt in notifies {
            let bytes = serde_json::to_vec(nt)
                .map_err(|e| StorageError::Corrupt(format!("encode notify: {}", e)))?;
            items.push(bytes);
        }

        let batch = NotifyBatch {
            condition: Condition {
                key: condition_key.to_vec(),
                cmp: CmpOp::Lt,
                value: cond_value.clone(),
            },
            kv_writes: vec![
                (condition_key.to_vec(), cond_value),
                (state_key.to_vec(), state_value),
            ],
            queue_partition: 0,
            queue_items: items,
        };

        let applied = self
            .store
            .exec_notify_batch(tenant_id, Group::TenantOutput, batch)
            .await?;
        if applied {
            info!(self.log, "notifies appended";
                "tenant_id" => tenant_id,
                "count" => notifies.len());
        } else {
            // A previous attempt of the same commit already landed.
            debug!(self.log, "notify batch skipped by condition";
                "tenant_id" => tenant_id);
        }
        Ok(())
    }
}
