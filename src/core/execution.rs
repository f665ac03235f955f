//! Compiled execution rules.
//!
//! A step's execution is compiled once when a worker (re)initializes, so
//! event handling never re-parses conditions.

use crate::expr::{EventContext, Expr, ExprError};
use crate::meta::{Execution, Step, UserEvent};

/// Evaluation context for one rule application: a user event for branch
/// evaluation, or a crowd-only view for timer ticks.
pub(crate) struct RuleCtx<'a> {
    pub event: Option<&'a UserEvent>,
    pub step_crowd: u64,
    pub step_ttl: i64,
}

impl EventContext for RuleCtx<'_> {
    fn field(&self, name: &str) -> Option<&str> {
        self.event.and_then(|e| e.field(name))
    }

    fn user_id(&self) -> u32 {
        self.event.map(|e| e.user_id).unwrap_or(0)
    }

    fn step_crowd(&self) -> u64 {
        self.step_crowd
    }

    fn step_ttl(&self) -> i64 {
        self.step_ttl
    }
}

pub(crate) struct CompiledBranch {
    pub expr: Expr,
    pub next_step: String,
}

/// One step's compiled rule.
pub(crate) enum StepRule {
    Direct {
        next_step: String,
    },
    Branch {
        branches: Vec<CompiledBranch>,
    },
    Timer {
        cron: String,
        branches: Vec<CompiledBranch>,
    },
}

fn compile_branches(
    arms: &[crate::meta::ConditionExecution],
) -> Result<Vec<CompiledBranch>, ExprError> {
    arms.iter()
        .map(|arm| {
            Ok(CompiledBranch {
                expr: Expr::parse(&arm.condition)?,
                next_step: arm.next_step.clone(),
            })
        })
        .collect()
}

impl StepRule {
    pub fn compile(step: &Step) -> Result<StepRule, ExprError> {
        match &step.execution {
            Execution::Direct { next_step } => Ok(StepRule::Direct {
                next_step: next_step.clone(),
            }),
            Execution::Branch { branches } => Ok(StepRule::Branch {
                branches: compile_branches(branches)?,
            }),
            Execution::Timer { cron, branches } => Ok(StepRule::Timer {
                cron: cron.clone(),
                branches: compile_branches(branches)?,
            }),
        }
    }

    /// Cron spec for timer rules.
    pub fn cron(&self) -> Option<&str> {
        match self {
            StepRule::Timer { cron, .. } => Some(cron),
            _ => None,
        }
    }

    pub fn direct_next(&self) -> Option<&str> {
        match self {
            StepRule::Direct { next_step } if !next_step.is_empty() => Some(next_step),
            _ => None,
        }
    }

    /// Whether any condition reads the per-user step-TTL probe.
    pub fn uses_step_ttl(&self) -> bool {
        match self {
            StepRule::Direct { .. } => false,
            StepRule::Branch { branches } | StepRule::Timer { branches, .. } => {
                branches.iter().any(|b| b.expr.uses_step_ttl())
            }
        }
    }

    /// Whether any condition reads `event.*` fields.
    pub fn uses_event_fields(&self) -> bool {
        match self {
            StepRule::Direct { .. } => false,
            StepRule::Branch { branches } | StepRule::Timer { branches, .. } => {
                branches.iter().any(|b| b.expr.uses_event_fields())
            }
        }
    }

    /// Evaluate for one user. Returns the target step name; an empty name
    /// terminates the user, `None` leaves it in place.
    pub fn eval_user(&self, ctx: &RuleCtx<'_>) -> Result<Option<&str>, ExprError> {
        match self {
            StepRule::Direct { next_step } => Ok(Some(next_step)),
            StepRule::Branch { branches } | StepRule::Timer { branches, .. } => {
                for branch in branches {
                    if branch.expr.eval_bool(ctx)? {
                        return Ok(Some(&branch.next_step));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Evaluate against a whole crowd (cron tick). The first holding
    /// condition takes every user still on the step.
    pub fn eval_crowd(&self, step_crowd: u64) -> Result<Option<&str>, ExprError> {
        let ctx = RuleCtx {
            event: None,
            step_crowd,
            step_ttl: 0,
        };
        self.eval_user(&ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ConditionExecution;

    fn branch_step(arms: &[(&str, &str)]) -> Step {
        Step {
            name: "s".to_string(),
            execution: Execution::Branch {
                branches: arms
                    .iter()
                    .map(|(cond, next)| ConditionExecution {
                        condition: cond.to_string(),
                        next_step: next.to_string(),
                    })
                    .collect(),
            },
            ..Default::default()
        }
    }

    fn user_ctx(event: &UserEvent) -> RuleCtx<'_> {
        RuleCtx {
            event: Some(event),
            step_crowd: 0,
            step_ttl: 0,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let step = branch_step(&[
            ("{num: event.uid} == 1", "end_1"),
            ("1 == 1", "end_else"),
        ]);
        let rule = StepRule::compile(&step).unwrap();

        let event = UserEvent {
            user_id: 1,
            ..Default::default()
        };
        assert_eq!(rule.eval_user(&user_ctx(&event)).unwrap(), Some("end_1"));

        let event = UserEvent {
            user_id: 9,
            ..Default::default()
        };
        assert_eq!(
            rule.eval_user(&user_ctx(&event)).unwrap(),
            Some("end_else")
        );
    }

    #[test]
    fn test_no_match_without_else() {
        let step = branch_step(&[("{num: event.uid} == 1", "end_1")]);
        let rule = StepRule::compile(&step).unwrap();
        let event = UserEvent {
            user_id: 2,
            ..Default::default()
        };
        assert_eq!(rule.eval_user(&user_ctx(&event)).unwrap(), None);
    }

    #[test]
    fn test_direct_always_moves() {
        let step = Step {
            name: "s".to_string(),
            execution: Execution::Direct {
                next_step: "next".to_string(),
            },
            ..Default::default()
        };
        let rule = StepRule::compile(&step).unwrap();
        let event = UserEvent::default();
        assert_eq!(rule.eval_user(&user_ctx(&event)).unwrap(), Some("next"));
        assert_eq!(rule.direct_next(), Some("next"));
    }

    #[test]
    fn test_terminal_direct() {
        let step = Step {
            name: "s".to_string(),
            execution: Execution::Direct {
                next_step: String::new(),
            },
            ..Default::default()
        };
        let rule = StepRule::compile(&step).unwrap();
        let event = UserEvent::default();
        // Empty target: the user exits the workflow.
        assert_eq!(rule.eval_user(&user_ctx(&event)).unwrap(), Some(""));
        assert_eq!(rule.direct_next(), None);
    }

    #[test]
    fn test_compile_rejects_bad_condition() {
        let step = branch_step(&[("{num: func.nope} == 1", "end")]);
        assert!(StepRule::compile(&step).is_err());
    }

    #[test]
    fn test_uses_step_ttl_detection() {
        let step = branch_step(&[
            ("{num: func.wf_step_ttl} > 0", "ttl_end"),
            ("1 == 1", "end"),
        ]);
        let rule = StepRule::compile(&step).unwrap();
        assert!(rule.uses_step_ttl());
        assert!(!rule.uses_event_fields());
    }

    #[test]
    fn test_crowd_eval_takes_all() {
        let step = Step {
            name: "s".to_string(),
            execution: Execution::Timer {
                cron: "0 * * * * *".to_string(),
                branches: vec![ConditionExecution {
                    condition: "{num: func.wf_step_crowd} >= 10".to_string(),
                    next_step: "drain".to_string(),
                }],
            },
            ..Default::default()
        };
        let rule = StepRule::compile(&step).unwrap();
        assert_eq!(rule.eval_crowd(10).unwrap(), Some("drain"));
        assert_eq!(rule.eval_crowd(9).unwrap(), None);
        assert_eq!(rule.cron(), Some("0 * * * * *"));
    }
}
