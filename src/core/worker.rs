//! The per-`(instance, partition)` state worker.
//!
//! A worker is a single-writer actor: exactly one drive task owns the live
//! step crowds and issues storage commits. Everything else talks to it
//! through its [`WorkerHandle`]: the runner's queue consumer appends items,
//! cron jobs append timer ticks, the TTL re-arm appends sweep requests.
//!
//! Commit protocol per transaction: install the working crowds, bump the
//! version, append notifies + condition-cell CAS + state snapshot in one
//! atomic multi-write, write the per-user step-TTL keys, then write the
//! queryable state shard fenced by the runner lock. The CAS guarantees a
//! crashed-and-replayed commit lands at most once; the fenced shard write
//! detects a stolen runner lock.

use crate::bitmap::{acquire_bm, marshal_bm, must_parse_bm, parse_bm, release_bm};
use crate::core::execution::{RuleCtx, StepRule};
use crate::core::queue::ItemQueue;
use crate::core::transaction::Transaction;
use crate::core::{
    CoreError, EVENTS_CACHE_SIZE, HANDLE_EVENT_BATCH, MAX_OFFSET_ONLY_ITEMS, MAX_TRIGGER_COUNT,
    TTL_TRIGGER_INTERVAL,
};
use crate::meta::{Event, Notify, UserEvent, Workflow, WorkerState};
use crate::notify::Notifier;
use crate::sched::{JobId, Scheduler};
use crate::storage::{encode_version, keys, Group, Storage};
use chrono::Utc;
use roaring::RoaringBitmap;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Mailbox items. User and structural events carry the queue position they
/// came from so progress can be committed once they are handled.
pub(crate) enum Item {
    Timer {
        step: usize,
    },
    User {
        event: UserEvent,
        partition: u32,
        offset: u64,
    },
    UpdateCrowd {
        crowd: Vec<u8>,
        partition: u32,
        offset: u64,
    },
    UpdateWorkflow {
        workflow: Workflow,
        partition: u32,
        offset: u64,
    },
    CheckTtl {
        step: usize,
    },
    ChangeOffset {
        partition: u32,
        offset: u64,
    },
    Stop,
}

/// Reports from workers to the runner.
pub(crate) enum WorkerReport {
    /// A queue position was durably handled.
    Completed {
        worker: String,
        partition: u32,
        offset: u64,
    },
    /// The worker was removed; forget its offsets.
    Gone { worker: String },
    /// The worker observed the runner lock stolen and stopped itself.
    LockLost { worker: String },
}

/// Shared environment handed to every worker of a runner.
#[derive(Clone)]
pub(crate) struct WorkerEnv {
    pub storage: Arc<dyn Storage>,
    pub notifier: Arc<dyn Notifier>,
    pub sched: Arc<dyn Scheduler>,
    pub log: Logger,
    /// The runner's distributed lock; every state-shard write is fenced on it.
    pub lock_key: Vec<u8>,
    pub lock_value: Vec<u8>,
}

/// Ingress-side view of a worker.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    pub key: String,
    pub workflow_id: u64,
    pub instance_id: u64,
    pub index: u32,
    queue: Arc<ItemQueue<Item>>,
    membership: Arc<RwLock<RoaringBitmap>>,
    stopped: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Whether an event for this user concerns the worker at all.
    pub fn matches(&self, user_id: u32) -> bool {
        self.membership.read().unwrap().contains(user_id)
    }

    /// Offer one queue item to the worker. Returns `false` when the mailbox
    /// is full; the caller must not advance the partition past this event.
    pub fn on_event(&self, partition: u32, offset: u64, event: &Event) -> bool {
        let item = match event {
            Event::User(user) => {
                if self.matches(user.user_id) {
                    let mut event = user.clone();
                    event.workflow_id = self.workflow_id;
                    event.instance_id = self.instance_id;
                    Item::User {
                        event,
                        partition,
                        offset,
                    }
                } else {
                    Item::ChangeOffset { partition, offset }
                }
            }
            Event::UpdateCrowd {
                workflow_id,
                index,
                crowd,
            } => {
                if *workflow_id == self.workflow_id && *index == self.index {
                    Item::UpdateCrowd {
                        crowd: crowd.clone(),
                        partition,
                        offset,
                    }
                } else {
                    Item::ChangeOffset { partition, offset }
                }
            }
            Event::UpdateWorkflow { workflow } => {
                if workflow.id == self.workflow_id {
                    Item::UpdateWorkflow {
                        workflow: workflow.clone(),
                        partition,
                        offset,
                    }
                } else {
                    Item::ChangeOffset { partition, offset }
                }
            }
        };

        match self.queue.try_put(item) {
            Ok(accepted) => accepted,
            // Disposed while stopping; let the consumer move on.
            Err(_) => true,
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.queue.put(Item::Stop);
    }
}

struct TriggerInfo {
    first_ts: i64,
    already: RoaringBitmap,
}

impl TriggerInfo {
    /// Roll the TTL window over once it elapsed, forgetting who was
    /// already triggered.
    fn maybe_reset(&mut self, ttl: u32) {
        let now = Utc::now().timestamp();
        if self.first_ts == 0 {
            self.first_ts = now;
        }
        if now - self.first_ts > i64::from(ttl) {
            self.first_ts = now;
            self.already.clear();
        }
    }
}

pub(crate) enum Outcome {
    /// Mailbox empty; nothing happened.
    Idle,
    Worked { success: bool },
    Stopped,
}

/// Retry a storage effect until it lands or the worker stops. Backoff
/// doubles from 2s up to 30s.
macro_rules! retry_do {
    ($self:ident, $what:expr, $call:expr) => {{
        let mut times = 1u32;
        let mut after = 2u64;
        loop {
            if $self.stopped.load(Ordering::Acquire) {
                break;
            }
            match $call.await {
                Ok(_) => break,
                Err(e) => {
                    error!($self.log, "storage effect failed, will retry";
                        "op" => $what,
                        "times" => times,
                        "retry_after_secs" => after,
                        "error" => %e);
                    times += 1;
                    tokio::time::sleep(std::time::Duration::from_secs(after)).await;
                    if after < 30 {
                        after = (after * 2).min(30);
                    }
                }
            }
        }
    }};
}

pub(crate) struct StateWorker {
    key: String,
    env: WorkerEnv,
    log: Logger,
    state: WorkerState,
    total_crowds: RoaringBitmap,
    step_crowds: Vec<RoaringBitmap>,
    rules: Vec<StepRule>,
    step_index: HashMap<String, usize>,
    ttl_triggers: HashMap<String, TriggerInfo>,
    cron_jobs: Vec<JobId>,
    queue: Arc<ItemQueue<Item>>,
    membership: Arc<RwLock<RoaringBitmap>>,
    stopped: Arc<AtomicBool>,
    update_success: bool,
    /// Authoritative state copy, written atomically with notifies.
    state_kv_key: Vec<u8>,
    /// Version cell guarding duplicate commits.
    cond_kv_key: Vec<u8>,
    tran: Transaction,
    report_tx: mpsc::UnboundedSender<WorkerReport>,
}

impl StateWorker {
    pub fn new(
        state: WorkerState,
        env: WorkerEnv,
        report_tx: mpsc::UnboundedSender<WorkerReport>,
    ) -> Result<(StateWorker, WorkerHandle), CoreError> {
        let key = format!(
            "w-{}-{}-{}",
            state.tenant_id, state.instance_id, state.index
        );
        let state_key = keys::instance_state_key(state.instance_id, state.index);
        let cond_key = keys::condition_key(&state_key);
        let log = env.log.new(o!("worker" => key.clone()));

        let mut worker = StateWorker {
            state_kv_key: keys::queue_kv_key(state.tenant_id, &state_key),
            cond_kv_key: keys::queue_kv_key(state.tenant_id, &cond_key),
            key: key.clone(),
            log,
            state,
            total_crowds: RoaringBitmap::new(),
            step_crowds: Vec::new(),
            rules: Vec::new(),
            step_index: HashMap::new(),
            ttl_triggers: HashMap::new(),
            cron_jobs: Vec::new(),
            queue: Arc::new(ItemQueue::new(EVENTS_CACHE_SIZE)),
            membership: Arc::new(RwLock::new(RoaringBitmap::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            update_success: true,
            tran: Transaction::new(),
            report_tx,
            env,
        };
        worker.reset_by_state()?;

        let handle = WorkerHandle {
            key,
            workflow_id: worker.state.workflow_id,
            instance_id: worker.state.instance_id,
            index: worker.state.index,
            queue: worker.queue.clone(),
            membership: worker.membership.clone(),
            stopped: worker.stopped.clone(),
        };
        Ok((worker, handle))
    }

    /// Rebuild every derived view from `self.state`.
    fn reset_by_state(&mut self) -> Result<(), CoreError> {
        for id in self.cron_jobs.drain(..) {
            self.env.sched.remove_job(id);
        }
        for bm in self.step_crowds.drain(..) {
            release_bm(bm);
        }
        for (_, info) in self.ttl_triggers.drain() {
            release_bm(info.already);
        }
        self.total_crowds.clear();
        self.rules.clear();
        self.step_index.clear();

        for idx in 0..self.state.states.len() {
            let step = self.state.states[idx].step.clone();

            let mut crowd = acquire_bm();
            crowd |= must_parse_bm(&self.state.states[idx].crowd);
            self.total_crowds |= &crowd;

            let rule = StepRule::compile(&step).map_err(CoreError::Expr)?;
            if let Some(cron) = rule.cron() {
                let queue = self.queue.clone();
                let id = self
                    .env
                    .sched
                    .add_job(
                        cron,
                        Box::new(move || {
                            let _ = queue.put(Item::Timer { step: idx });
                        }),
                    )
                    .map_err(|e| CoreError::InvalidWorkflow(e.to_string()))?;
                self.cron_jobs.push(id);
            }

            if step.ttl > 0 {
                self.ttl_triggers.insert(
                    step.name.clone(),
                    TriggerInfo {
                        first_ts: 0,
                        already: acquire_bm(),
                    },
                );
                self.check_ttl_later(idx);
            }

            self.step_index.insert(step.name.clone(), idx);
            self.rules.push(rule);
            self.step_crowds.push(crowd);
        }

        *self.membership.write().unwrap() = self.total_crowds.clone();
        Ok(())
    }

    fn check_ttl_later(&self, step: usize) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TTL_TRIGGER_INTERVAL).await;
            let _ = queue.put(Item::CheckTtl { step });
        });
    }

    /// The single-writer loop. Owns the worker until stop or lock loss.
    pub async fn drive(mut self) {
        self.check_last_transaction().await;
        info!(self.log, "worker started";
            "crowd" => self.total_crowds.len(),
            "version" => self.state.version);

        loop {
            match self.handle_event().await {
                Outcome::Stopped => return,
                Outcome::Idle => self.queue.wait_items().await,
                Outcome::Worked { success: true } => {}
                Outcome::Worked { success: false } => {
                    if !self.recover_update().await {
                        let _ = self.report_tx.send(WorkerReport::LockLost {
                            worker: self.key.clone(),
                        });
                        self.shutdown();
                        return;
                    }
                }
            }
        }
    }

    /// A rejected shard write usually means the lock is gone; if it is in
    /// fact still ours, re-issue the write and resume.
    async fn recover_update(&mut self) -> bool {
        match self
            .env
            .storage
            .check_lock(&self.env.lock_key, &self.env.lock_value)
            .await
        {
            Ok(true) => {
                warn!(self.log, "state shard write rejected but lock still held, retrying");
                self.update_success = true;
                retry_do!(self, "exec update state", self.exec_update());
                if !self.update_success {
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                self.update_success
            }
            Ok(false) => {
                error!(self.log, "runner lock lost");
                false
            }
            Err(e) => {
                error!(self.log, "lock check failed"; "error" => %e);
                false
            }
        }
    }

    /// One handle cycle: drain a batch from the mailbox into a transaction
    /// and commit it.
    pub async fn handle_event(&mut self) -> Outcome {
        if self.queue.is_empty() && !self.queue.is_disposed() {
            return Outcome::Idle;
        }

        self.tran.start(&self.step_crowds);
        let mut offset_only = 0usize;

        loop {
            let item = match self.queue.pop() {
                Some(item) => item,
                None => break,
            };
            match item {
                Item::Stop => {
                    self.tran.reset();
                    self.shutdown();
                    return Outcome::Stopped;
                }
                Item::User {
                    event,
                    partition,
                    offset,
                } => {
                    self.tran.record_offset(partition, offset);
                    self.tran.buffer_user_event(event);
                    if self.tran.buffered_len() >= HANDLE_EVENT_BATCH {
                        break;
                    }
                }
                Item::Timer { step } => {
                    // Timer moves commit eagerly so cron-observed state
                    // reflects them.
                    self.flush_user_events().await;
                    self.do_step_timer_event(step);
                    self.complete_transaction().await;
                    self.tran.start(&self.step_crowds);
                }
                Item::CheckTtl { step } => {
                    self.do_check_step_ttl(step).await;
                }
                Item::ChangeOffset { partition, offset } => {
                    self.tran.record_offset(partition, offset);
                    offset_only += 1;
                    if offset_only >= MAX_OFFSET_ONLY_ITEMS {
                        break;
                    }
                }
                Item::UpdateCrowd {
                    crowd,
                    partition,
                    offset,
                } => {
                    // Structural changes are barriers: settle everything
                    // buffered, apply, then start a fresh transaction.
                    self.flush_user_events().await;
                    self.complete_transaction().await;
                    self.do_update_crowd(&crowd).await;
                    self.tran.start(&self.step_crowds);
                    self.tran.record_offset(partition, offset);
                }
                Item::UpdateWorkflow {
                    workflow,
                    partition,
                    offset,
                } => {
                    self.flush_user_events().await;
                    self.complete_transaction().await;
                    if let Err(e) = self.do_update_workflow(workflow).await {
                        error!(self.log, "update workflow rejected"; "error" => %e);
                    }
                    self.tran.start(&self.step_crowds);
                    self.tran.record_offset(partition, offset);
                }
            }
            if !self.update_success {
                break;
            }
        }

        self.flush_user_events().await;
        self.complete_transaction().await;
        Outcome::Worked {
            success: self.update_success,
        }
    }

    /// Index of the step currently holding a user, from the start-of-cycle
    /// view.
    fn step_of(&self, user_id: u32) -> Option<usize> {
        self.step_crowds.iter().position(|bm| bm.contains(user_id))
    }

    fn resolve_target(&self, next: &str) -> Option<(Option<usize>, u32)> {
        if next.is_empty() {
            return Some((None, 0));
        }
        self.step_index
            .get(next)
            .map(|&idx| (Some(idx), self.state.states[idx].step.ttl))
    }

    /// Run buffered user events through their steps' rules. Each user moves
    /// at most once per cycle; evaluation failures skip the single event.
    async fn flush_user_events(&mut self) {
        let events = self.tran.take_buffered();
        for event in events {
            if self.tran.moved_contains(event.user_id) {
                continue;
            }
            let from = match self.step_of(event.user_id) {
                Some(idx) => idx,
                None => continue,
            };

            let step_ttl = if self.rules[from].uses_step_ttl() {
                self.load_step_ttl(&event, from).await
            } else {
                0
            };
            let ctx = RuleCtx {
                event: Some(&event),
                step_crowd: self.step_crowds[from].len(),
                step_ttl,
            };

            match self.rules[from].eval_user(&ctx) {
                Ok(Some(next)) => {
                    let (to, ttl) = match self.resolve_target(next) {
                        Some(target) => target,
                        None => {
                            error!(self.log, "branch target step missing"; "step" => next);
                            continue;
                        }
                    };
                    let mut who = acquire_bm();
                    who.insert(event.user_id);
                    self.tran.record_change(from, to, who, ttl);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(self.log, "user event skipped by expression failure";
                        "user_id" => event.user_id,
                        "error" => %e);
                }
            }
        }
    }

    /// Positive once the user's step window expired, non-positive inside it.
    async fn load_step_ttl(&self, event: &UserEvent, step: usize) -> i64 {
        let key = keys::step_ttl_key(
            self.state.workflow_id,
            event.user_id,
            &self.state.states[step].step.name,
        );
        match self.env.storage.get_ttl_value(&key).await {
            Ok(Some(value)) if value.len() == 8 => {
                let expire_at = i64::from_be_bytes(value[..8].try_into().unwrap());
                Utc::now().timestamp() - expire_at
            }
            Ok(Some(_)) | Ok(None) => 1,
            Err(e) => {
                warn!(self.log, "step ttl probe failed"; "error" => %e);
                0
            }
        }
    }

    /// Evaluate a whole step crowd against its rule on a cron tick.
    fn do_step_timer_event(&mut self, step: usize) {
        if step >= self.rules.len() {
            return;
        }
        let crowd_len = self.tran.step_crowds[step].len();
        if crowd_len == 0 {
            return;
        }
        match self.rules[step].eval_crowd(crowd_len) {
            Ok(Some(next)) => {
                let (to, ttl) = match self.resolve_target(next) {
                    Some(target) => target,
                    None => {
                        error!(self.log, "timer target step missing"; "step" => next);
                        return;
                    }
                };
                let mut who = acquire_bm();
                who.clone_from(&self.tran.step_crowds[step]);
                self.tran.record_change(step, to, who, ttl);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(self.log, "timer evaluation failed"; "step" => step, "error" => %e);
            }
        }
    }

    /// TTL sweep: inject a synthetic event for each user on the step that
    /// was not yet triggered within the current window, then re-arm.
    async fn do_check_step_ttl(&mut self, step: usize) {
        if step >= self.state.states.len() {
            return;
        }
        let ttl = self.state.states[step].step.ttl;
        if ttl == 0 {
            return;
        }
        self.check_ttl_later(step);

        if self.step_crowds[step].is_empty() {
            return;
        }
        let name = self.state.states[step].step.name.clone();

        let mut candidates = acquire_bm();
        candidates.clone_from(&self.step_crowds[step]);
        let info = self
            .ttl_triggers
            .get_mut(&name)
            .expect("BUG: missing ttl trigger info");
        info.maybe_reset(ttl);
        candidates -= &info.already;

        let mut count = 0usize;
        for user_id in candidates.iter() {
            info.already.insert(user_id);
            self.tran.buffer_user_event(UserEvent {
                tenant_id: self.state.tenant_id,
                user_id,
                workflow_id: self.state.workflow_id,
                instance_id: self.state.instance_id,
                data: Vec::new(),
            });
            count += 1;
            if count >= MAX_TRIGGER_COUNT {
                break;
            }
        }
        release_bm(candidates);
    }

    /// Commit the current transaction, then surrender its resources.
    async fn complete_transaction(&mut self) {
        if !self.update_success {
            self.tran.reset();
            return;
        }

        if self.tran.has_changes() {
            for (idx, crowd) in self.tran.step_crowds.iter().enumerate() {
                self.step_crowds[idx].clone_from(crowd);
            }
            self.total_crowds.clear();
            for crowd in &self.step_crowds {
                self.total_crowds |= crowd;
            }
            *self.membership.write().unwrap() = self.total_crowds.clone();

            self.state.version += 1;
            self.refresh_state_crowds();

            retry_do!(self, "exec notify", self.exec_notify());
            retry_do!(self, "exec step ttl keys", self.exec_step_ttl_keys());
            retry_do!(self, "exec update state", self.exec_update());

            debug!(self.log, "state committed"; "version" => self.state.version);
        }

        if self.update_success {
            self.commit_offsets();
        }
        self.tran.reset();
    }

    fn refresh_state_crowds(&mut self) {
        for (idx, state) in self.state.states.iter_mut().enumerate() {
            state.crowd = marshal_bm(&self.step_crowds[idx]);
            state.total = self.step_crowds[idx].len();
        }
    }

    /// Append notifies + condition bump + state snapshot atomically. A
    /// replayed commit is skipped by the CAS inside the notifier.
    async fn exec_notify(&self) -> Result<(), crate::storage::StorageError> {
        let mut notifies = Vec::with_capacity(self.tran.changes.len());
        let mut total_moved = 0u64;
        for change in &self.tran.changes {
            let from_step = &self.state.states[change.from].step;
            let (to_step, to_action) = match change.to {
                Some(to) => {
                    let step = &self.state.states[to].step;
                    (step.name.clone(), step.enter_action.clone())
                }
                None => (String::new(), String::new()),
            };
            let (user_id, crowd) = if change.who.len() == 1 {
                (change.who.iter().next().unwrap(), Vec::new())
            } else {
                (0, marshal_bm(&change.who))
            };
            notifies.push(Notify {
                tenant_id: self.state.tenant_id,
                workflow_id: self.state.workflow_id,
                instance_id: self.state.instance_id,
                user_id,
                crowd,
                from_step: from_step.name.clone(),
                to_step,
                to_step_cycle_ttl: change.ttl,
                from_action: from_step.leave_action.clone(),
                to_action,
            });
            total_moved += change.who.len();
        }

        let state_value =
            serde_json::to_vec(&self.state).expect("BUG: encode worker state failed");
        self.env
            .notifier
            .notify(
                self.state.tenant_id,
                &notifies,
                &self.cond_kv_key,
                encode_version(self.state.version),
                &self.state_kv_key,
                state_value,
            )
            .await?;

        info!(self.log, "users moved"; "count" => total_moved);
        Ok(())
    }

    /// Mark the window start for every user that entered a TTL step.
    async fn exec_step_ttl_keys(&self) -> Result<(), crate::storage::StorageError> {
        for change in &self.tran.changes {
            if change.ttl == 0 {
                continue;
            }
            let to = match change.to {
                Some(to) => to,
                None => continue,
            };
            let step_name = &self.state.states[to].step.name;
            let expire_at = Utc::now().timestamp() + i64::from(change.ttl);
            for user_id in change.who.iter() {
                let key = keys::step_ttl_key(self.state.workflow_id, user_id, step_name);
                self.env
                    .storage
                    .set_with_ttl(&key, expire_at.to_be_bytes().to_vec(), u64::from(change.ttl))
                    .await?;
            }
        }
        Ok(())
    }

    /// Write the queryable state shard, fenced by the runner lock.
    async fn exec_update(&mut self) -> Result<(), crate::storage::StorageError> {
        let ok = self
            .env
            .storage
            .update_instance_state_shard(
                self.state.clone(),
                &self.env.lock_key,
                &self.env.lock_value,
                Utc::now().timestamp(),
            )
            .await?;
        if !ok {
            error!(self.log, "state shard write rejected");
            self.update_success = false;
        }
        Ok(())
    }

    fn commit_offsets(&mut self) {
        for (partition, offset) in self.tran.offsets.drain() {
            let _ = self.report_tx.send(WorkerReport::Completed {
                worker: self.key.clone(),
                partition,
                offset,
            });
        }
    }

    /// Replace the crowd of this partition. Users gone from the new crowd
    /// are dropped wherever they stand; new users start at the first step.
    async fn do_update_crowd(&mut self, crowd: &[u8]) {
        let new_total = match parse_bm(crowd) {
            Ok(bm) => bm,
            Err(e) => {
                error!(self.log, "update crowd carries corrupt bitmap"; "error" => %e);
                return;
            }
        };

        let mut new_added = new_total.clone();
        new_added -= &self.total_crowds;

        self.total_crowds.clone_from(&new_total);
        for (idx, crowd) in self.step_crowds.iter_mut().enumerate() {
            if idx == 0 {
                *crowd |= &new_added;
            }
            *crowd &= &new_total;
        }
        *self.membership.write().unwrap() = self.total_crowds.clone();

        self.state.version += 1;
        self.refresh_state_crowds();
        retry_do!(self, "exec update crowd", self.exec_update());
        info!(self.log, "crowd updated"; "total" => self.total_crowds.len());
    }

    /// Swap in a new step graph. Crowds of same-named steps carry over;
    /// crowds of removed steps are dropped. No retroactive replay.
    async fn do_update_workflow(&mut self, workflow: Workflow) -> Result<(), CoreError> {
        // Compile everything up front so a bad workflow leaves the worker
        // untouched.
        let mut new_rules = Vec::with_capacity(workflow.steps.len());
        for step in &workflow.steps {
            new_rules.push(StepRule::compile(step).map_err(CoreError::Expr)?);
        }
        for rule in &new_rules {
            if let Some(cron) = rule.cron() {
                crate::sched::parse_cron(cron)
                    .map_err(|e| CoreError::InvalidWorkflow(e.to_string()))?;
            }
        }

        for id in self.cron_jobs.drain(..) {
            self.env.sched.remove_job(id);
        }
        for (_, info) in self.ttl_triggers.drain() {
            release_bm(info.already);
        }

        let mut old_crowds: HashMap<String, RoaringBitmap> = self
            .state
            .states
            .iter()
            .map(|s| s.step.name.clone())
            .zip(self.step_crowds.drain(..))
            .collect();

        self.step_index.clear();
        let mut new_states = Vec::with_capacity(workflow.steps.len());
        let mut new_crowds = Vec::with_capacity(workflow.steps.len());

        for (idx, step) in workflow.steps.iter().enumerate() {
            let mut crowd = acquire_bm();
            if let Some(old) = old_crowds.remove(&step.name) {
                crowd |= &old;
                release_bm(old);
            }

            if let Some(cron) = new_rules[idx].cron() {
                let queue = self.queue.clone();
                let id = self
                    .env
                    .sched
                    .add_job(
                        cron,
                        Box::new(move || {
                            let _ = queue.put(Item::Timer { step: idx });
                        }),
                    )
                    .map_err(|e| CoreError::InvalidWorkflow(e.to_string()))?;
                self.cron_jobs.push(id);
            }

            if step.ttl > 0 {
                self.ttl_triggers.insert(
                    step.name.clone(),
                    TriggerInfo {
                        first_ts: 0,
                        already: acquire_bm(),
                    },
                );
                self.check_ttl_later(idx);
            }

            self.step_index.insert(step.name.clone(), idx);
            new_states.push(crate::meta::StepState {
                step: step.clone(),
                crowd: Vec::new(),
                total: 0,
            });
            new_crowds.push(crowd);
        }

        // Crowds of steps absent from the new graph are dropped.
        for (_, old) in old_crowds.drain() {
            release_bm(old);
        }

        self.rules = new_rules;
        self.step_crowds = new_crowds;
        self.state.states = new_states;

        self.total_crowds.clear();
        for crowd in &self.step_crowds {
            self.total_crowds |= crowd;
        }
        *self.membership.write().unwrap() = self.total_crowds.clone();

        self.state.version += 1;
        self.refresh_state_crowds();
        retry_do!(self, "exec update workflow", self.exec_update());
        info!(self.log, "workflow updated"; "steps" => self.state.states.len());
        Ok(())
    }

    /// Reconcile with the authoritative state copy written by `exec_notify`.
    /// A copy newer than ours means a previous worker crashed between notify
    /// and the shard write; adopt it and re-issue the shard write.
    pub async fn check_last_transaction(&mut self) {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            let value = match self
                .env
                .storage
                .get_with_group(&self.state_kv_key, Group::TenantOutput)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    error!(self.log, "load last transaction failed, retrying"; "error" => %e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let value = match value {
                Some(value) => value,
                None => {
                    debug!(self.log, "no last transaction");
                    return;
                }
            };

            let last: WorkerState =
                serde_json::from_slice(&value).expect("BUG: corrupt persisted worker state");
            if last.version <= self.state.version {
                return;
            }

            info!(self.log, "adopting newer persisted state";
                "persisted_version" => last.version,
                "version" => self.state.version);
            self.state = last;
            if let Err(e) = self.reset_by_state() {
                panic!("BUG: reset from persisted state failed: {}", e);
            }
            retry_do!(self, "exec update state", self.exec_update());
            return;
        }
    }

    fn shutdown(&mut self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.queue.dispose();
        for id in self.cron_jobs.drain(..) {
            self.env.sched.remove_job(id);
        }
        for bm in self.step_crowds.drain(..) {
            release_bm(bm);
        }
        for (_, info) in self.ttl_triggers.drain() {
            release_bm(info.already);
        }
        self.tran.reset();
        info!(self.log, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::marshal_bm;
    use crate::meta::{ConditionExecution, Execution, KV, Step, StepState};
    use crate::notify::QueueNotifier;
    use crate::sched::CronScheduler;
    use crate::storage::memory::MemStorage;
    use slog::Drain;

    fn create_logger() -> Logger {
        let decorator = slog_term::PlainDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, o!())
    }

    fn branch_workflow_steps() -> Vec<Step> {
        vec![
            Step {
                name: "step_start".to_string(),
                execution: Execution::Branch {
                    branches: vec![
                        ConditionExecution {
                            condition: "{num: event.uid} == 1".to_string(),
                            next_step: "step_end_1".to_string(),
                        },
                        ConditionExecution {
                            condition: "1 == 1".to_string(),
                            next_step: "step_end_else".to_string(),
                        },
                    ],
                },
                ..Default::default()
            },
            Step {
                name: "step_end_1".to_string(),
                execution: Execution::Direct {
                    next_step: String::new(),
                },
                ..Default::default()
            },
            Step {
                name: "step_end_else".to_string(),
                execution: Execution::Direct {
                    next_step: String::new(),
                },
                ..Default::default()
            },
        ]
    }

    fn worker_state(steps: Vec<Step>, crowd: &[u32]) -> WorkerState {
        let crowd_bm: RoaringBitmap = crowd.iter().copied().collect();
        let states = steps
            .into_iter()
            .enumerate()
            .map(|(idx, step)| StepState {
                step,
                crowd: if idx == 0 {
                    marshal_bm(&crowd_bm)
                } else {
                    marshal_bm(&RoaringBitmap::new())
                },
                total: if idx == 0 { crowd_bm.len() } else { 0 },
            })
            .collect();
        WorkerState {
            tenant_id: 10001,
            workflow_id: 10000,
            instance_id: 1,
            index: 0,
            runner: 1,
            version: 0,
            states,
        }
    }

    struct Setup {
        storage: Arc<MemStorage>,
        env: WorkerEnv,
        report_rx: mpsc::UnboundedReceiver<WorkerReport>,
        report_tx: mpsc::UnboundedSender<WorkerReport>,
    }

    async fn setup() -> Setup {
        let log = create_logger();
        let storage = Arc::new(MemStorage::new());
        storage.create_tenant_queues(10001, 1).await.unwrap();

        let lock_key = keys::runner_lock_key(10001);
        let lock_value = b"test-runner".to_vec();
        assert!(storage.grab_lock(&lock_key, &lock_value).await.unwrap());

        let storage_dyn: Arc<dyn Storage> = storage.clone();
        let env = WorkerEnv {
            storage: storage_dyn.clone(),
            notifier: Arc::new(QueueNotifier::new(storage_dyn, log.clone())),
            sched: Arc::new(CronScheduler::new(log.clone())),
            log,
            lock_key,
            lock_value,
        };
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        Setup {
            storage,
            env,
            report_rx,
            report_tx,
        }
    }

    fn user_event(uid: u32) -> Event {
        Event::User(UserEvent {
            tenant_id: 10001,
            user_id: uid,
            workflow_id: 0,
            instance_id: 0,
            data: vec![KV {
                key: "uid".to_string(),
                value: uid.to_string(),
            }],
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_branch_event_moves_user_and_notifies() {
        let mut setup = setup().await;
        let state = worker_state(branch_workflow_steps(), &[1, 2, 3, 4]);
        let (mut worker, handle) =
            StateWorker::new(state, setup.env.clone(), setup.report_tx.clone()).unwrap();

        assert!(handle.on_event(0, 1, &user_event(1)));
        match worker.handle_event().await {
            Outcome::Worked { success } => assert!(success),
            _ => panic!("expected work"),
        }

        assert_eq!(worker.state.version, 1);
        assert_eq!(worker.step_crowds[0].len(), 3);
        assert_eq!(worker.step_crowds[1].len(), 1);
        assert!(worker.step_crowds[1].contains(1));
        assert_eq!(worker.step_crowds[2].len(), 0);

        // Exactly one notify landed on the output queue.
        assert_eq!(setup.storage.queue_len(10001, 0, Group::TenantOutput), 1);

        // The offset was reported as completed.
        match setup.report_rx.try_recv().unwrap() {
            WorkerReport::Completed {
                partition, offset, ..
            } => {
                assert_eq!(partition, 0);
                assert_eq!(offset, 1);
            }
            _ => panic!("expected completed report"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_foreign_event_is_pure_offset_advance() {
        let mut setup = setup().await;
        let state = worker_state(branch_workflow_steps(), &[1, 2]);
        let (mut worker, handle) =
            StateWorker::new(state, setup.env.clone(), setup.report_tx.clone()).unwrap();

        // uid 99 is not in the crowd.
        assert!(handle.on_event(0, 7, &user_event(99)));
        match worker.handle_event().await {
            Outcome::Worked { success } => assert!(success),
            _ => panic!("expected work"),
        }

        assert_eq!(worker.state.version, 0);
        assert_eq!(worker.step_crowds[0].len(), 2);
        assert_eq!(setup.storage.queue_len(10001, 0, Group::TenantOutput), 0);

        match setup.report_rx.try_recv().unwrap() {
            WorkerReport::Completed { offset, .. } => assert_eq!(offset, 7),
            _ => panic!("expected completed report"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_commit_is_skipped_by_cas() {
        let setup = setup().await;
        let state = worker_state(branch_workflow_steps(), &[1, 2, 3, 4]);
        let (mut worker, handle) =
            StateWorker::new(state, setup.env.clone(), setup.report_tx.clone()).unwrap();

        assert!(handle.on_event(0, 1, &user_event(1)));
        worker.handle_event().await;
        assert_eq!(setup.storage.queue_len(10001, 0, Group::TenantOutput), 1);

        // Replaying the same version is swallowed by the condition cell.
        worker.tran.start(&worker.step_crowds);
        let mut who = acquire_bm();
        who.insert(2);
        worker.tran.record_change(0, Some(2), who, 0);
        worker.refresh_state_crowds();
        worker.exec_notify().await.unwrap();
        worker.tran.reset();
        // Version was not bumped, so the CAS rejected the append.
        assert_eq!(setup.storage.queue_len(10001, 0, Group::TenantOutput), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_update_crowd_reshapes_steps() {
        let mut setup = setup().await;
        let state = worker_state(branch_workflow_steps(), &[2, 3, 4]);
        let (mut worker, handle) =
            StateWorker::new(state, setup.env.clone(), setup.report_tx.clone()).unwrap();

        // All three fall through to step_end_else.
        for (i, uid) in [2u32, 3, 4].iter().enumerate() {
            assert!(handle.on_event(0, i as u64 + 1, &user_event(*uid)));
        }
        worker.handle_event().await;
        assert_eq!(worker.step_crowds[0].len(), 0);
        assert_eq!(worker.step_crowds[2].len(), 3);

        // New crowd: 4 removed, 1 and 5 added to the first step.
        let new_crowd: RoaringBitmap = [1u32, 2, 3, 5].iter().copied().collect();
        let update = Event::UpdateCrowd {
            workflow_id: 10000,
            index: 0,
            crowd: marshal_bm(&new_crowd),
        };
        assert!(handle.on_event(0, 4, &update));
        worker.handle_event().await;

        assert_eq!(worker.step_crowds[0].len(), 2); // 1, 5
        assert!(worker.step_crowds[0].contains(1));
        assert!(worker.step_crowds[0].contains(5));
        assert_eq!(worker.step_crowds[2].len(), 2); // 2, 3 stay; 4 dropped
        assert!(!worker.total_crowds.contains(4));

        // uid 1 now matches the membership filter and moves to step_end_1.
        assert!(handle.matches(1));
        assert!(handle.on_event(0, 5, &user_event(1)));
        worker.handle_event().await;
        assert_eq!(worker.step_crowds[0].len(), 1);
        assert_eq!(worker.step_crowds[1].len(), 1);

        while let Ok(report) = setup.report_rx.try_recv() {
            drop(report);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recovery_adopts_newer_persisted_state() {
        let setup = setup().await;
        let state = worker_state(branch_workflow_steps(), &[1, 2, 3, 4]);

        // A previous worker committed notify (output copy at version 3)
        // but never wrote the runner shard.
        let mut persisted = state.clone();
        persisted.version = 3;
        persisted.states[0].crowd = marshal_bm(&[2u32, 3, 4].iter().copied().collect());
        persisted.states[0].total = 3;
        persisted.states[1].crowd = marshal_bm(&[1u32].iter().copied().collect());
        persisted.states[1].total = 1;

        let state_key = keys::instance_state_key(1, 0);
        let state_kv_key = keys::queue_kv_key(10001, &state_key);
        setup
            .storage
            .set_with_group(
                &state_kv_key,
                serde_json::to_vec(&persisted).unwrap(),
                Group::TenantOutput,
            )
            .await
            .unwrap();

        let (mut worker, _handle) =
            StateWorker::new(state, setup.env.clone(), setup.report_tx.clone()).unwrap();
        assert_eq!(worker.state.version, 0);

        worker.check_last_transaction().await;
        assert_eq!(worker.state.version, 3);
        assert_eq!(worker.step_crowds[0].len(), 3);
        assert_eq!(worker.step_crowds[1].len(), 1);

        // The shard write was re-issued.
        let shard = setup
            .storage
            .get_with_group(&state_key, Group::TenantRunner)
            .await
            .unwrap()
            .unwrap();
        let shard: WorkerState = serde_json::from_slice(&shard).unwrap();
        assert_eq!(shard.version, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lock_loss_stops_commits() {
        let setup = setup().await;
        let state = worker_state(branch_workflow_steps(), &[1, 2]);
        let (mut worker, handle) =
            StateWorker::new(state, setup.env.clone(), setup.report_tx.clone()).unwrap();

        setup
            .storage
            .usurp_lock(&setup.env.lock_key, b"intruder".to_vec());

        assert!(handle.on_event(0, 1, &user_event(1)));
        match worker.handle_event().await {
            Outcome::Worked { success } => assert!(!success),
            _ => panic!("expected work"),
        }
        assert!(!worker.update_success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ttl_sweep_injects_at_most_once_per_window() {
        let setup = setup().await;
        let steps = vec![
            Step {
                name: "ttl_start".to_string(),
                ttl: 60,
                execution: Execution::Branch {
                    branches: vec![ConditionExecution {
                        condition: "{num: func.wf_step_ttl} > 0".to_string(),
                        next_step: "ttl_end".to_string(),
                    }],
                },
                ..Default::default()
            },
            Step {
                name: "ttl_end".to_string(),
                execution: Execution::Direct {
                    next_step: String::new(),
                },
                ..Default::default()
            },
        ];
        let state = worker_state(steps, &[1, 2]);
        let (mut worker, _handle) =
            StateWorker::new(state, setup.env.clone(), setup.report_tx.clone()).unwrap();

        // Window keys exist: users are inside their TTL window, the sweep
        // injects them but the rule does not fire.
        for uid in [1u32, 2] {
            let key = keys::step_ttl_key(10000, uid, "ttl_start");
            let expire_at = Utc::now().timestamp() + 60;
            setup
                .storage
                .set_with_ttl(&key, expire_at.to_be_bytes().to_vec(), 60)
                .await
                .unwrap();
        }

        worker.tran.start(&worker.step_crowds);
        worker.do_check_step_ttl(0).await;
        assert_eq!(worker.tran.buffered_len(), 2);
        worker.flush_user_events().await;
        assert!(!worker.tran.has_changes());
        worker.tran.reset();

        // Second sweep within the same window: nobody is re-injected.
        worker.tran.start(&worker.step_crowds);
        worker.do_check_step_ttl(0).await;
        assert_eq!(worker.tran.buffered_len(), 0);
        worker.tran.reset();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_expired_ttl_window_moves_user()  {
        let setup = setup().await;
        let steps = vec![
            Step {
                name: "ttl_start".to_string(),
                ttl: 60,
                execution: Execution::Branch {
                    branches: vec![ConditionExecution {
                        condition: "{num: func.wf_step_ttl} > 0".to_string(),
                        next_step: "ttl_end".to_string(),
                    }],
                },
                ..Default::default()
            },
            Step {
                name: "ttl_end".to_string(),
                execution: Execution::Direct {
                    next_step: String::new(),
                },
                ..Default::default()
            },
        ];
        let state = worker_state(steps, &[1]);
        let (mut worker, _handle) =
            StateWorker::new(state, setup.env.clone(), setup.report_tx.clone()).unwrap();

        // No TTL key for uid 1: its window has expired.
        worker.tran.start(&worker.step_crowds);
        worker.do_check_step_ttl(0).await;
        worker.flush_user_events().await;
        assert!(worker.tran.has_changes());
        worker.complete_transaction().await;

        assert_eq!(worker.step_crowds[0].len(), 0);
        assert_eq!(worker.step_crowds[1].len(), 1);
        assert!(worker.step_crowds[1].contains(1));
    }
}
