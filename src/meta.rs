//! Wire and state model for the workflow engine.
//!
//! Everything that crosses a queue or lands in storage is defined here and
//! encoded with `serde_json`. Struct field order is declaration order, so a
//! decoded value re-encodes to the same bytes.

use serde::{Deserialize, Serialize};

/// A workflow definition: a static graph of named steps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: u64,
    pub tenant_id: u64,
    pub name: String,
    /// Seconds the instance stays alive after start. 0 means unbounded.
    pub duration: u32,
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// One step of a workflow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Step cycle TTL in seconds. 0 means no TTL behavior.
    pub ttl: u32,
    pub enter_action: String,
    pub leave_action: String,
    pub execution: Execution,
}

/// How a step advances its crowd.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Execution {
    /// Unconditional move. An empty `next_step` terminates the users.
    Direct { next_step: String },
    /// Ordered conditions; the first that holds wins.
    Branch { branches: Vec<ConditionExecution> },
    /// Cron-fired branch body. Evaluated against a synthetic tick, never
    /// against tenant events.
    Timer {
        cron: String,
        branches: Vec<ConditionExecution>,
    },
}

impl Default for Execution {
    fn default() -> Self {
        Execution::Direct {
            next_step: String::new(),
        }
    }
}

/// A single `(condition, next_step)` arm of a branch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionExecution {
    pub condition: String,
    pub next_step: String,
}

/// Key-value attribute attached to a user event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KV {
    pub key: String,
    pub value: String,
}

/// A tenant event concerning one user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub tenant_id: u64,
    pub user_id: u32,
    pub workflow_id: u64,
    pub instance_id: u64,
    pub data: Vec<KV>,
}

impl UserEvent {
    /// Look up an attribute value by key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }
}

/// Envelope for everything flowing through a tenant input queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    User(UserEvent),
    /// Replace the crowd of one instance partition.
    UpdateCrowd {
        workflow_id: u64,
        index: u32,
        crowd: Vec<u8>,
    },
    /// Replace the step graph of an instance.
    UpdateWorkflow { workflow: Workflow },
}

/// Downstream record emitted when users move between steps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Notify {
    pub tenant_id: u64,
    pub workflow_id: u64,
    pub instance_id: u64,
    /// Set when exactly one user moved, 0 otherwise.
    pub user_id: u32,
    /// Serialized bitmap of the moved users when more than one moved.
    pub crowd: Vec<u8>,
    pub from_step: String,
    pub to_step: String,
    pub to_step_cycle_ttl: u32,
    pub from_action: String,
    pub to_action: String,
}

/// Persisted state of one step within a worker shard.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub step: Step,
    /// Serialized bitmap of the users currently on this step.
    pub crowd: Vec<u8>,
    pub total: u64,
}

/// Persisted state of one `(instance, partition)` worker shard.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub tenant_id: u64,
    pub workflow_id: u64,
    pub instance_id: u64,
    /// Partition index within the instance.
    pub index: u32,
    /// Id of the runner host owning this shard.
    pub runner: u64,
    /// Monotonic commit counter; bumped on every committed mutation.
    pub version: u64,
    /// Aligned with `workflow.steps`.
    pub states: Vec<StepState>,
}

/// Admission record of a running instance, persisted so a restarted engine
/// can rebuild its runners.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: u64,
    pub workflow: Workflow,
    pub partitions: u32,
}

/// Per-tenant queue provisioning record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: u64,
    pub input_partitions: u32,
}

/// Per-step user count, aggregated across partitions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CountState {
    pub step: String,
    pub count: u64,
}

/// Result of `Engine::instance_count_state`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceCountState {
    pub workflow_id: u64,
    pub version: u64,
    pub states: Vec<CountState>,
}

/// Result of `Engine::instance_step_state`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepCrowdState {
    pub workflow_id: u64,
    pub step: String,
    /// Serialized bitmap union of the step's crowd across partitions.
    pub crowd: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_state_round_trip() {
        let state = WorkerState {
            tenant_id: 10001,
            workflow_id: 10000,
            instance_id: 7,
            index: 2,
            runner: 1,
            version: 42,
            states: vec![StepState {
                step: Step {
                    name: "start".to_string(),
                    ttl: 0,
                    enter_action: "enter".to_string(),
                    leave_action: String::new(),
                    execution: Execution::Direct {
                        next_step: "end".to_string(),
                    },
                },
                crowd: vec![1, 2, 3],
                total: 3,
            }],
        };

        let encoded = serde_json::to_vec(&state).unwrap();
        let decoded: WorkerState = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(state, decoded);

        // Re-encoding must be byte-identical.
        let reencoded = serde_json::to_vec(&decoded).unwrap();
        assert_eq!(encoded, reencoded);
    }

    #[test]
    fn test_event_envelope_round_trip() {
        let event = Event::User(UserEvent {
            tenant_id: 1,
            user_id: 99,
            workflow_id: 2,
            instance_id: 3,
            data: vec![KV {
                key: "uid".to_string(),
                value: "99".to_string(),
            }],
        });

        let encoded = serde_json::to_vec(&event).unwrap();
        let decoded: Event = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_user_event_field_lookup() {
        let event = UserEvent {
            user_id: 5,
            data: vec![
                KV {
                    key: "city".to_string(),
                    value: "berlin".to_string(),
                },
                KV {
                    key: "uid".to_string(),
                    value: "5".to_string(),
                },
            ],
            ..Default::default()
        };

        assert_eq!(event.field("city"), Some("berlin"));
        assert_eq!(event.field("uid"), Some("5"));
        assert_eq!(event.field("missing"), None);
    }
}
