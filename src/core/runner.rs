//! The per-tenant worker host.
//!
//! A runner owns the tenant's distributed lock, consumes the tenant's input
//! queue partitions, and fans every event out to its workers' mailboxes. A
//! worker refusing an event (full mailbox) holds that partition back until
//! it drains. Progress is committed per partition as the minimum completed
//! offset across workers.

use crate::core::worker::{StateWorker, WorkerEnv, WorkerHandle, WorkerReport};
use crate::core::{CoreError, EMPTY_FETCH_INTERVAL, FETCH_EVENT_BATCH};
use crate::meta::{Event, WorkerState};
use crate::notify::Notifier;
use crate::sched::Scheduler;
use crate::storage::{keys, Group, Storage};
use slog::{error, info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct WorkerEntry {
    handle: WorkerHandle,
    drive: JoinHandle<()>,
}

pub(crate) struct WorkerRunner {
    tenant_id: u64,
    runner_id: u64,
    input_partitions: u32,
    env: WorkerEnv,
    log: Logger,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    stopped: Arc<AtomicBool>,
    report_tx: mpsc::UnboundedSender<WorkerReport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerRunner {
    /// Grab the tenant lock and start consuming. Fails if another host
    /// holds the lock.
    pub async fn start(
        tenant_id: u64,
        runner_id: u64,
        input_partitions: u32,
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        sched: Arc<dyn Scheduler>,
        log: Logger,
    ) -> Result<Arc<WorkerRunner>, CoreError> {
        let lock_key = keys::runner_lock_key(tenant_id);
        let lock_value = Uuid::new_v4().as_bytes().to_vec();
        if !storage
            .grab_lock(&lock_key, &lock_value)
            .await
            .map_err(CoreError::Storage)?
        {
            return Err(CoreError::LockHeld(tenant_id));
        }

        let log = log.new(o!("runner" => runner_id, "tenant_id" => tenant_id));
        let env = WorkerEnv {
            storage,
            notifier,
            sched,
            log: log.clone(),
            lock_key,
            lock_value,
        };

        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let runner = Arc::new(WorkerRunner {
            tenant_id,
            runner_id,
            input_partitions,
            env,
            log,
            workers: Mutex::new(HashMap::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            report_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(runner.clone().run_offset_committer(report_rx)));
        for partition in 0..input_partitions {
            tasks.push(tokio::spawn(runner.clone().consume_partition(partition)));
        }
        *runner.tasks.lock().unwrap() = tasks;

        info!(runner.log, "runner started"; "input_partitions" => input_partitions);
        Ok(runner)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn input_partitions(&self) -> u32 {
        self.input_partitions
    }

    /// Create a worker for a state shard and start driving it.
    pub fn add_worker(&self, state: WorkerState) -> Result<(), CoreError> {
        let (worker, handle) =
            StateWorker::new(state, self.env.clone(), self.report_tx.clone())?;
        let drive = tokio::spawn(worker.drive());
        let mut workers = self.workers.lock().unwrap();
        if let Some(previous) = workers.insert(
            handle.key.clone(),
            WorkerEntry {
                handle: handle.clone(),
                drive,
            },
        ) {
            warn!(self.log, "replaced existing worker"; "worker" => &handle.key);
            previous.handle.stop();
        }
        Ok(())
    }

    /// Stop and forget every worker of an instance.
    pub fn remove_instance(&self, instance_id: u64) {
        let mut workers = self.workers.lock().unwrap();
        let victims: Vec<String> = workers
            .iter()
            .filter(|(_, entry)| entry.handle.instance_id == instance_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in victims {
            if let Some(entry) = workers.remove(&key) {
                entry.handle.stop();
                let _ = self.report_tx.send(WorkerReport::Gone { worker: key });
            }
        }
    }

    /// Stop every worker and consumer, then release the tenant lock.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_workers();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Err(e) = self
            .env
            .storage
            .release_lock(&self.env.lock_key, &self.env.lock_value)
            .await
        {
            warn!(self.log, "release lock failed"; "error" => %e);
        }
        info!(self.log, "runner stopped");
    }

    fn stop_workers(&self) {
        let mut workers = self.workers.lock().unwrap();
        for (_, entry) in workers.drain() {
            entry.handle.stop();
        }
    }

    /// Stable per tenant so a succeeding runner resumes where the previous
    /// one committed.
    fn consumer_name(&self) -> Vec<u8> {
        format!("runner-{}", self.tenant_id).into_bytes()
    }

    /// Pull one input partition and fan out to every worker, honoring
    /// per-worker backpressure.
    async fn consume_partition(self: Arc<Self>, partition: u32) {
        let consumer = self.consumer_name();
        let mut next = match self
            .env
            .storage
            .get_committed_offset(self.tenant_id, partition, Group::TenantInput, &consumer)
            .await
        {
            Ok(offset) => offset,
            Err(e) => {
                error!(self.log, "load committed offset failed, starting at 0";
                    "partition" => partition, "error" => %e);
                0
            }
        };

        loop {
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            let fetched = match self
                .env
                .storage
                .fetch_from_queue(
                    self.tenant_id,
                    partition,
                    Group::TenantInput,
                    &consumer,
                    next,
                    FETCH_EVENT_BATCH,
                )
                .await
            {
                Ok(fetched) => fetched,
                Err(e) => {
                    error!(self.log, "queue fetch failed"; "partition" => partition, "error" => %e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            if fetched.items.is_empty() {
                tokio::time::sleep(EMPTY_FETCH_INTERVAL).await;
                continue;
            }

            for (offset, bytes) in fetched.items {
                let event: Event = match serde_json::from_slice(&bytes) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(self.log, "skipping undecodable event";
                            "partition" => partition, "offset" => offset, "error" => %e);
                        next = offset;
                        continue;
                    }
                };

                let handles: Vec<WorkerHandle> = {
                    let workers = self.workers.lock().unwrap();
                    workers.values().map(|entry| entry.handle.clone()).collect()
                };
                if handles.is_empty() {
                    // Nobody to deliver to; hold the partition here.
                    tokio::time::sleep(EMPTY_FETCH_INTERVAL).await;
                    break;
                }
                for handle in handles {
                    // Do not advance past a worker that refused the event.
                    while !handle.on_event(partition, offset, &event) {
                        if self.stopped.load(Ordering::Acquire) {
                            return;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
                next = offset;
            }
        }
    }

    /// Collect per-worker completion reports and commit the minimum per
    /// partition.
    async fn run_offset_committer(
        self: Arc<Self>,
        mut report_rx: mpsc::UnboundedReceiver<WorkerReport>,
    ) {
        let consumer = self.consumer_name();
        let mut completed: HashMap<u32, HashMap<String, u64>> = HashMap::new();
        let mut committed: HashMap<u32, u64> = HashMap::new();

        while let Some(report) = report_rx.recv().await {
            match report {
                WorkerReport::Completed {
                    worker,
                    partition,
                    offset,
                } => {
                    let per_worker = completed.entry(partition).or_default();
                    let slot = per_worker.entry(worker).or_insert(0);
                    if offset > *slot {
                        *slot = offset;
                    }

                    let min = per_worker.values().min().copied().unwrap_or(0);
                    let already = committed.entry(partition).or_insert(0);
                    if min > *already {
                        match self
                            .env
                            .storage
                            .commit_consumer_offset(
                                self.tenant_id,
                                partition,
                                Group::TenantInput,
                                &consumer,
                                min,
                            )
                            .await
                        {
                            Ok(()) => *already = min,
                            Err(e) => {
                                error!(self.log, "offset commit failed";
                                    "partition" => partition, "error" => %e);
                            }
                        }
                    }
                }
                WorkerReport::Gone { worker } => {
                    for per_worker in completed.values_mut() {
                        per_worker.remove(&worker);
                    }
                }
                WorkerReport::LockLost { worker } => {
                    error!(self.log, "worker reported lock loss, stopping all workers";
                        "worker" => worker);
                    self.stopped.store(true, Ordering::Release);
                    self.stop_workers();
                    return;
                }
            }
        }
    }
}
