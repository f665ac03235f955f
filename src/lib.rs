//! crowdflow: a tenant-partitioned workflow state engine.
//!
//! For each running workflow instance, the engine maintains, per audience
//! partition, the distribution of users across the workflow's steps as
//! compressed bitmaps, and advances them as tenant events, cron ticks and
//! TTL sweeps match the steps' execution rules. Every partition is owned by
//! a single-writer state worker committing under an optimistic-version
//! guard; see [`core::Engine`] for the admin surface.

pub mod bitmap;
pub mod core;
pub mod expr;
pub mod meta;
pub mod notify;
pub mod sched;
pub mod storage;

pub use crate::core::{CoreError, Engine};
pub use crate::notify::{Notifier, QueueNotifier};
pub use crate::storage::{memory::MemStorage, Storage};
