//! The admin façade: translates tenant/instance operations into storage
//! effects and runner signals.

use crate::bitmap::{marshal_bm, parse_bm};
use crate::core::execution::StepRule;
use crate::core::runner::WorkerRunner;
use crate::core::CoreError;
use crate::meta::{
    CountState, Event, Execution, InstanceCountState, InstanceRecord, StepCrowdState, StepState,
    TenantRecord, Workflow, WorkerState,
};
use crate::notify::Notifier;
use crate::sched::{parse_cron, CronScheduler, Scheduler};
use crate::storage::{keys, Group, Storage};
use roaring::RoaringBitmap;
use slog::{info, warn, Logger};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The engine hosts one runner per provisioned tenant and owns the admin
/// surface. Queries read the persisted worker-state shards, never the
/// workers themselves.
pub struct Engine {
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    sched: Arc<CronScheduler>,
    runners: Mutex<HashMap<u64, Arc<WorkerRunner>>>,
    runner_id: AtomicU64,
    log: Logger,
}

impl Engine {
    pub fn new(
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        log: Logger,
    ) -> Arc<Engine> {
        Arc::new(Engine {
            sched: Arc::new(CronScheduler::new(log.clone())),
            storage,
            notifier,
            runners: Mutex::new(HashMap::new()),
            runner_id: AtomicU64::new(0),
            log,
        })
    }

    /// Start the engine: allocate a host id and rebuild runners and workers
    /// from persisted tenant and instance records.
    pub async fn start(self: &Arc<Self>) -> Result<(), CoreError> {
        let runner_id = self.storage.alloc_id().await?;
        self.runner_id.store(runner_id, Ordering::Release);

        for (_, value) in self
            .storage
            .scan_prefix(&keys::tenant_record_prefix(), Group::TenantRunner)
            .await?
        {
            let record: TenantRecord = serde_json::from_slice(&value)
                .map_err(|e| CoreError::Storage(crate::storage::StorageError::Corrupt(
                    format!("tenant record: {}", e),
                )))?;
            self.ensure_runner(record.tenant_id, record.input_partitions)
                .await?;
        }

        for (_, value) in self
            .storage
            .scan_prefix(&keys::instance_record_prefix(), Group::TenantRunner)
            .await?
        {
            let record: InstanceRecord = serde_json::from_slice(&value)
                .map_err(|e| CoreError::Storage(crate::storage::StorageError::Corrupt(
                    format!("instance record: {}", e),
                )))?;
            let runner = self.runner_of(record.workflow.tenant_id)?;
            for index in 0..record.partitions {
                let key = keys::instance_state_key(record.instance_id, index);
                match self.storage.get_with_group(&key, Group::TenantRunner).await? {
                    Some(bytes) => {
                        let state: WorkerState = serde_json::from_slice(&bytes).map_err(|e| {
                            CoreError::Storage(crate::storage::StorageError::Corrupt(format!(
                                "worker state: {}",
                                e
                            )))
                        })?;
                        runner.add_worker(state)?;
                    }
                    None => {
                        warn!(self.log, "missing worker state shard";
                            "instance_id" => record.instance_id, "index" => index);
                    }
                }
            }
            if record.workflow.duration > 0 {
                self.auto_stop_later(record.workflow.id, record.workflow.duration);
            }
        }

        info!(self.log, "engine started"; "runner_id" => runner_id);
        Ok(())
    }

    pub async fn stop(&self) {
        let runners: Vec<Arc<WorkerRunner>> = {
            let mut runners = self.runners.lock().unwrap();
            runners.drain().map(|(_, r)| r).collect()
        };
        for runner in runners {
            runner.stop().await;
        }
        self.sched.stop_all();
        info!(self.log, "engine stopped");
    }

    /// Provision a tenant's three queue groups and start its runner.
    pub async fn create_tenant_queue(
        &self,
        tenant_id: u64,
        input_partitions: u32,
    ) -> Result<(), CoreError> {
        if input_partitions == 0 {
            return Err(CoreError::InvalidWorkflow(
                "input partitions must be > 0".to_string(),
            ));
        }
        self.storage
            .create_tenant_queues(tenant_id, input_partitions)
            .await?;

        let record = TenantRecord {
            tenant_id,
            input_partitions,
        };
        self.storage
            .set_with_group(
                &keys::tenant_record_key(tenant_id),
                serde_json::to_vec(&record).expect("BUG: encode tenant record failed"),
                Group::TenantRunner,
            )
            .await?;

        self.ensure_runner(tenant_id, input_partitions).await?;
        info!(self.log, "tenant queue created";
            "tenant_id" => tenant_id, "input_partitions" => input_partitions);
        Ok(())
    }

    /// Admit a workflow: validate, split the crowd by `uid % partitions`,
    /// persist one worker state per slice and hand them to the runner.
    pub async fn start_instance(
        self: &Arc<Self>,
        workflow: Workflow,
        crowd: Vec<u8>,
        partitions: u32,
    ) -> Result<u64, CoreError> {
        validate_workflow(&workflow)?;
        if partitions == 0 {
            return Err(CoreError::InvalidWorkflow(
                "partitions must be > 0".to_string(),
            ));
        }
        let crowd_bm =
            parse_bm(&crowd).map_err(|e| CoreError::InvalidWorkflow(format!("crowd: {}", e)))?;
        let runner = self.runner_of(workflow.tenant_id)?;

        let instance_id = self.storage.alloc_id().await?;
        let record = InstanceRecord {
            instance_id,
            workflow: workflow.clone(),
            partitions,
        };
        self.storage
            .set_with_group(
                &keys::instance_record_key(workflow.id),
                serde_json::to_vec(&record).expect("BUG: encode instance record failed"),
                Group::TenantRunner,
            )
            .await?;

        for index in 0..partitions {
            let slice = crowd_slice(&crowd_bm, partitions, index);
            let states = workflow
                .steps
                .iter()
                .enumerate()
                .map(|(i, step)| StepState {
                    step: step.clone(),
                    crowd: if i == 0 {
                        marshal_bm(&slice)
                    } else {
                        marshal_bm(&RoaringBitmap::new())
                    },
                    total: if i == 0 { slice.len() } else { 0 },
                })
                .collect();
            let state = WorkerState {
                tenant_id: workflow.tenant_id,
                workflow_id: workflow.id,
                instance_id,
                index,
                runner: self.runner_id.load(Ordering::Acquire),
                version: 0,
                states,
            };
            self.storage
                .set_with_group(
                    &keys::instance_state_key(instance_id, index),
                    serde_json::to_vec(&state).expect("BUG: encode worker state failed"),
                    Group::TenantRunner,
                )
                .await?;
            runner.add_worker(state)?;
        }

        if workflow.duration > 0 {
            self.auto_stop_later(workflow.id, workflow.duration);
        }

        info!(self.log, "instance started";
            "workflow_id" => workflow.id,
            "instance_id" => instance_id,
            "partitions" => partitions,
            "crowd" => crowd_bm.len());
        Ok(instance_id)
    }

    /// Stop an instance: stop its workers, drop its shards and records.
    pub async fn stop_instance(&self, workflow_id: u64) -> Result<(), CoreError> {
        let record = self.load_record(workflow_id).await?;
        let runner = self.runner_of(record.workflow.tenant_id)?;
        runner.remove_instance(record.instance_id);

        for index in 0..record.partitions {
            let state_key = keys::instance_state_key(record.instance_id, index);
            self.storage
                .delete_with_group(&state_key, Group::TenantRunner)
                .await?;
            let tenant_id = record.workflow.tenant_id;
            self.storage
                .delete_with_group(
                    &keys::queue_kv_key(tenant_id, &state_key),
                    Group::TenantOutput,
                )
                .await?;
            self.storage
                .delete_with_group(
                    &keys::queue_kv_key(tenant_id, &keys::condition_key(&state_key)),
                    Group::TenantOutput,
                )
                .await?;
        }
        self.storage
            .delete_with_group(&keys::instance_record_key(workflow_id), Group::TenantRunner)
            .await?;

        info!(self.log, "instance stopped"; "workflow_id" => workflow_id);
        Ok(())
    }

    /// Publish a per-partition crowd replacement to the instance's workers.
    pub async fn update_crowd(&self, workflow_id: u64, crowd: Vec<u8>) -> Result<(), CoreError> {
        let record = self.load_record(workflow_id).await?;
        let crowd_bm =
            parse_bm(&crowd).map_err(|e| CoreError::InvalidWorkflow(format!("crowd: {}", e)))?;
        let tenant_id = record.workflow.tenant_id;
        let runner = self.runner_of(tenant_id)?;

        for index in 0..record.partitions {
            let slice = crowd_slice(&crowd_bm, record.partitions, index);
            let event = Event::UpdateCrowd {
                workflow_id,
                index,
                crowd: marshal_bm(&slice),
            };
            self.publish(tenant_id, index % runner.input_partitions(), &event)
                .await?;
        }
        Ok(())
    }

    /// Publish a workflow replacement to every partition of the instance.
    pub async fn update_workflow(&self, workflow: Workflow) -> Result<(), CoreError> {
        validate_workflow(&workflow)?;
        let mut record = self.load_record(workflow.id).await?;
        let tenant_id = record.workflow.tenant_id;
        let runner = self.runner_of(tenant_id)?;

        // Keep the admission record current for recovery.
        record.workflow = workflow.clone();
        self.storage
            .set_with_group(
                &keys::instance_record_key(workflow.id),
                serde_json::to_vec(&record).expect("BUG: encode instance record failed"),
                Group::TenantRunner,
            )
            .await?;

        let event = Event::UpdateWorkflow { workflow };
        for partition in 0..runner.input_partitions() {
            self.publish(tenant_id, partition, &event).await?;
        }
        Ok(())
    }

    /// Per-step user counts, aggregated over the persisted shards.
    pub async fn instance_count_state(
        &self,
        workflow_id: u64,
    ) -> Result<InstanceCountState, CoreError> {
        let record = self.load_record(workflow_id).await?;

        let mut order: Vec<String> = Vec::new();
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut version = 0u64;

        for index in 0..record.partitions {
            let state = match self.load_shard(record.instance_id, index).await? {
                Some(state) => state,
                None => continue,
            };
            version = version.max(state.version);
            for step_state in &state.states {
                if !counts.contains_key(&step_state.step.name) {
                    order.push(step_state.step.name.clone());
                }
                *counts.entry(step_state.step.name.clone()).or_insert(0) += step_state.total;
            }
        }

        Ok(InstanceCountState {
            workflow_id,
            version,
            states: order
                .into_iter()
                .map(|step| {
                    let count = counts[&step];
                    CountState { step, count }
                })
                .collect(),
        })
    }

    /// Union of one step's crowd across the persisted shards.
    pub async fn instance_step_state(
        &self,
        workflow_id: u64,
        step: &str,
    ) -> Result<StepCrowdState, CoreError> {
        let record = self.load_record(workflow_id).await?;

        let mut crowd = RoaringBitmap::new();
        for index in 0..record.partitions {
            let state = match self.load_shard(record.instance_id, index).await? {
                Some(state) => state,
                None => continue,
            };
            for step_state in &state.states {
                if step_state.step.name == step {
                    crowd |= parse_bm(&step_state.crowd).map_err(|e| {
                        CoreError::Storage(crate::storage::StorageError::Corrupt(format!(
                            "step crowd: {}",
                            e
                        )))
                    })?;
                }
            }
        }

        Ok(StepCrowdState {
            workflow_id,
            step: step.to_string(),
            crowd: marshal_bm(&crowd),
        })
    }

    fn auto_stop_later(self: &Arc<Self>, workflow_id: u64, duration: u32) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(u64::from(duration))).await;
            match engine.stop_instance(workflow_id).await {
                Ok(()) => {}
                Err(CoreError::NoSuchInstance(_)) => {}
                Err(e) => {
                    warn!(engine.log, "auto stop failed";
                        "workflow_id" => workflow_id, "error" => %e);
                }
            }
        });
    }

    async fn ensure_runner(
        &self,
        tenant_id: u64,
        input_partitions: u32,
    ) -> Result<Arc<WorkerRunner>, CoreError> {
        if let Some(runner) = self.runners.lock().unwrap().get(&tenant_id) {
            return Ok(runner.clone());
        }
        let sched: Arc<dyn Scheduler> = self.sched.clone();
        let runner = WorkerRunner::start(
            tenant_id,
            self.runner_id.load(Ordering::Acquire),
            input_partitions,
            self.storage.clone(),
            self.notifier.clone(),
            sched,
            self.log.clone(),
        )
        .await?;
        self.runners
            .lock()
            .unwrap()
            .insert(tenant_id, runner.clone());
        Ok(runner)
    }

    fn runner_of(&self, tenant_id: u64) -> Result<Arc<WorkerRunner>, CoreError> {
        self.runners
            .lock()
            .unwrap()
            .get(&tenant_id)
            .cloned()
            .ok_or(CoreError::NoSuchTenant(tenant_id))
    }

    async fn load_record(&self, workflow_id: u64) -> Result<InstanceRecord, CoreError> {
        let bytes = self
            .storage
            .get_with_group(&keys::instance_record_key(workflow_id), Group::TenantRunner)
            .await?
            .ok_or(CoreError::NoSuchInstance(workflow_id))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            CoreError::Storage(crate::storage::StorageError::Corrupt(format!(
                "instance record: {}",
                e
            )))
        })
    }

    async fn load_shard(
        &self,
        instance_id: u64,
        index: u32,
    ) -> Result<Option<WorkerState>, CoreError> {
        let bytes = self
            .storage
            .get_with_group(
                &keys::instance_state_key(instance_id, index),
                Group::TenantRunner,
            )
            .await?;
        match bytes {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                CoreError::Storage(crate::storage::StorageError::Corrupt(format!(
                    "worker state: {}",
                    e
                )))
            }),
            None => Ok(None),
        }
    }

    async fn publish(
        &self,
        tenant_id: u64,
        partition: u32,
        event: &Event,
    ) -> Result<(), CoreError> {
        self.storage
            .put_to_queue(
                tenant_id,
                partition,
                Group::TenantInput,
                vec![serde_json::to_vec(event).expect("BUG: encode event failed")],
            )
            .await?;
        Ok(())
    }
}

/// Users of one partition slice: `uid % partitions == index`.
fn crowd_slice(crowd: &RoaringBitmap, partitions: u32, index: u32) -> RoaringBitmap {
    crowd.iter().filter(|uid| uid % partitions == index).collect()
}

/// Admission validation: structure, step references, conditions, cron specs.
fn validate_workflow(workflow: &Workflow) -> Result<(), CoreError> {
    if workflow.steps.is_empty() {
        return Err(CoreError::InvalidWorkflow("workflow has no steps".to_string()));
    }

    let mut names: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if step.name.is_empty() {
            return Err(CoreError::InvalidWorkflow("step with empty name".to_string()));
        }
        if !names.insert(&step.name) {
            return Err(CoreError::InvalidWorkflow(format!(
                "duplicate step {}",
                step.name
            )));
        }
    }

    let check_target = |next: &str| -> Result<(), CoreError> {
        if !next.is_empty() && !names.contains(next) {
            return Err(CoreError::InvalidWorkflow(format!(
                "unknown target step {}",
                next
            )));
        }
        Ok(())
    };

    for step in &workflow.steps {
        let rule = StepRule::compile(step).map_err(CoreError::Expr)?;
        match &step.execution {
            Execution::Direct { next_step } => check_target(next_step)?,
            Execution::Branch { branches } | Execution::Timer { branches, .. } => {
                for arm in branches {
                    check_target(&arm.next_step)?;
                }
            }
        }
        if let Some(cron) = rule.cron() {
            parse_cron(cron).map_err(|e| CoreError::InvalidWorkflow(e.to_string()))?;
            // No user event is in scope when a cron tick fires.
            if rule.uses_event_fields() {
                return Err(CoreError::InvalidWorkflow(format!(
                    "timer step {} references event fields",
                    step.name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ConditionExecution, Step};

    fn step(name: &str, execution: Execution) -> Step {
        Step {
            name: name.to_string(),
            execution,
            ..Default::default()
        }
    }

    #[test]
    fn test_crowd_slice_partitions_by_modulo() {
        let crowd: RoaringBitmap = (0..10u32).collect();
        let a = crowd_slice(&crowd, 3, 0);
        let b = crowd_slice(&crowd, 3, 1);
        let c = crowd_slice(&crowd, 3, 2);
        assert_eq!(a.len() + b.len() + c.len(), 10);
        assert!(a.contains(0) && a.contains(3) && a.contains(9));
        assert!(b.contains(1) && b.contains(4));
        assert!(c.contains(2) && c.contains(5));
    }

    #[test]
    fn test_validate_accepts_branch_workflow() {
        let workflow = Workflow {
            id: 1,
            tenant_id: 1,
            name: "wf".to_string(),
            duration: 0,
            steps: vec![
                step(
                    "start",
                    Execution::Branch {
                        branches: vec![
                            ConditionExecution {
                                condition: "{num: event.uid} == 1".to_string(),
                                next_step: "end".to_string(),
                            },
                            ConditionExecution {
                                condition: "1 == 1".to_string(),
                                next_step: "end".to_string(),
                            },
                        ],
                    },
                ),
                step(
                    "end",
                    Execution::Direct {
                        next_step: String::new(),
                    },
                ),
            ],
        };
        assert!(validate_workflow(&workflow).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_target() {
        let workflow = Workflow {
            id: 1,
            tenant_id: 1,
            name: "wf".to_string(),
            duration: 0,
            steps: vec![step(
                "start",
                Execution::Direct {
                    next_step: "nowhere".to_string(),
                },
            )],
        };
        assert!(matches!(
            validate_workflow(&workflow),
            Err(CoreError::InvalidWorkflow(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_steps() {
        let workflow = Workflow {
            id: 1,
            tenant_id: 1,
            name: "wf".to_string(),
            duration: 0,
            steps: vec![
                step("a", Execution::Direct { next_step: String::new() }),
                step("a", Execution::Direct { next_step: String::new() }),
            ],
        };
        assert!(matches!(
            validate_workflow(&workflow),
            Err(CoreError::InvalidWorkflow(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_condition() {
        let workflow = Workflow {
            id: 1,
            tenant_id: 1,
            name: "wf".to_string(),
            duration: 0,
            steps: vec![step(
                "start",
                Execution::Branch {
                    branches: vec![ConditionExecution {
                        condition: "{num: func.bogus} == 1".to_string(),
                        next_step: String::new(),
                    }],
                },
            )],
        };
        assert!(matches!(
            validate_workflow(&workflow),
            Err(CoreError::Expr(_))
        ));
    }

    #[test]
    fn test_validate_rejects_event_fields_in_timer() {
        let workflow = Workflow {
            id: 1,
            tenant_id: 1,
            name: "wf".to_string(),
            duration: 0,
            steps: vec![
                step(
                    "tick",
                    Execution::Timer {
                        cron: "0 * * * * *".to_string(),
                        branches: vec![ConditionExecution {
                            condition: "{num: event.uid} == 1".to_string(),
                            next_step: "end".to_string(),
                        }],
                    },
                ),
                step("end", Execution::Direct { next_step: String::new() }),
            ],
        };
        assert!(matches!(
            validate_workflow(&workflow),
            Err(CoreError::InvalidWorkflow(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_cron() {
        let workflow = Workflow {
            id: 1,
            tenant_id: 1,
            name: "wf".to_string(),
            duration: 0,
            steps: vec![step(
                "tick",
                Execution::Timer {
                    cron: "whenever".to_string(),
                    branches: vec![ConditionExecution {
                        condition: "1 == 1".to_string(),
                        next_step: String::new(),
                    }],
                },
            )],
        };
        assert!(matches!(
            validate_workflow(&workflow),
            Err(CoreError::InvalidWorkflow(_))
        ));
    }
}
