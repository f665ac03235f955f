//! The workflow state engine core: execution rules, transactions, the
//! single-writer state worker, the per-tenant runner and the admin façade.

pub(crate) mod execution;
pub(crate) mod queue;
pub(crate) mod runner;
pub(crate) mod transaction;
pub(crate) mod worker;

mod engine;

pub use engine::Engine;

use crate::expr::ExprError;
use crate::storage::StorageError;
use std::time::Duration;

/// Worker mailbox capacity; ingress beyond it is backpressure.
pub(crate) const EVENTS_CACHE_SIZE: usize = 4096;
/// User events buffered into one transaction before it commits.
pub(crate) const HANDLE_EVENT_BATCH: usize = 1024;
/// Offset-only items drained into one cycle before it commits.
pub(crate) const MAX_OFFSET_ONLY_ITEMS: usize = 1024;
/// Items pulled from a queue partition per fetch.
pub(crate) const FETCH_EVENT_BATCH: u64 = 2048;
/// Users injected per step per TTL sweep.
pub(crate) const MAX_TRIGGER_COUNT: usize = 256;
/// Delay between TTL sweeps of a step.
pub(crate) const TTL_TRIGGER_INTERVAL: Duration = Duration::from_secs(5);
/// Idle wait between fetches of an empty partition.
pub(crate) const EMPTY_FETCH_INTERVAL: Duration = Duration::from_millis(50);

/// Engine-level errors.
#[derive(Clone, Debug)]
pub enum CoreError {
    /// A workflow condition failed to parse or evaluate.
    Expr(ExprError),
    /// Storage failed in a context that is not retried.
    Storage(StorageError),
    /// Structurally invalid workflow (duplicate steps, bad cron, ...).
    InvalidWorkflow(String),
    /// Tenant queues were never provisioned.
    NoSuchTenant(u64),
    /// No running instance for this workflow.
    NoSuchInstance(u64),
    /// Another host already runs this tenant.
    LockHeld(u64),
    /// The runner's lock was taken by another host.
    LockLost,
    /// The worker queue was disposed during stop.
    Disposed,
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::Expr(e) => write!(f, "expression error: {}", e),
            CoreError::Storage(e) => write!(f, "storage error: {}", e),
            CoreError::InvalidWorkflow(msg) => write!(f, "invalid workflow: {}", msg),
            CoreError::NoSuchTenant(id) => write!(f, "tenant {} has no queues", id),
            CoreError::NoSuchInstance(id) => {
                write!(f, "workflow {} has no running instance", id)
            }
            CoreError::LockHeld(id) => {
                write!(f, "tenant {} runner lock held by another host", id)
            }
            CoreError::LockLost => write!(f, "runner lock lost"),
            CoreError::Disposed => write!(f, "worker queue disposed"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<ExprError> for CoreError {
    fn from(e: ExprError) -> Self {
        CoreError::Expr(e)
    }
}

impl From<StorageError> for CoreError {
    fn from(e: StorageError) -> Self {
        CoreError::Storage(e)
    }
}
