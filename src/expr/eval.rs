//! Evaluation of parsed conditions.

use super::{parse, EventContext, ExprError, Func, Node, Op, Value, ValueType, Var, VarPath};
use chrono::{Datelike, Local};

/// A compiled condition. Parse once per step, evaluate per event.
#[derive(Clone, Debug)]
pub struct Expr {
    root: Node,
    src: String,
}

impl Expr {
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        Ok(Expr {
            root: parse::parse(input)?,
            src: input.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.src
    }

    pub fn eval(&self, ctx: &dyn EventContext) -> Result<Value, ExprError> {
        eval_node(&self.root, ctx)
    }

    /// Evaluate and reduce to the condition's truth value.
    pub fn eval_bool(&self, ctx: &dyn EventContext) -> Result<bool, ExprError> {
        self.eval(ctx)?.truthy()
    }

    /// Whether evaluation reads the per-user step-TTL probe. Used by the
    /// worker to decide what to prefetch before evaluating a crowd.
    pub fn uses_step_ttl(&self) -> bool {
        uses_func(&self.root, Func::StepTtl)
    }

    /// Whether evaluation reads `event.*` fields. Timer bodies reject these
    /// at admission since no user event is in scope for a cron tick.
    pub fn uses_event_fields(&self) -> bool {
        uses_event(&self.root)
    }
}

fn uses_func(node: &Node, func: Func) -> bool {
    match node {
        Node::Const(_) => false,
        Node::Var(var) => var.path == VarPath::Func(func),
        Node::Chain { first, rest } => {
            uses_func(first, func) || rest.iter().any(|(_, n)| uses_func(n, func))
        }
    }
}

fn uses_event(node: &Node) -> bool {
    match node {
        Node::Const(_) => false,
        Node::Var(var) => matches!(var.path, VarPath::EventField(_)),
        Node::Chain { first, rest } => {
            uses_event(first) || rest.iter().any(|(_, n)| uses_event(n))
        }
    }
}

fn eval_node(node: &Node, ctx: &dyn EventContext) -> Result<Value, ExprError> {
    match node {
        Node::Const(value) => Ok(value.clone()),
        Node::Var(var) => eval_var(var, ctx),
        Node::Chain { first, rest } => {
            let mut acc = eval_node(first, ctx)?;
            for (op, node) in rest {
                let rhs = eval_node(node, ctx)?;
                acc = apply(*op, acc, rhs)?;
            }
            Ok(acc)
        }
    }
}

fn eval_var(var: &Var, ctx: &dyn EventContext) -> Result<Value, ExprError> {
    match &var.path {
        VarPath::EventField(name) => match ctx.field(name) {
            Some(raw) => convert(raw, var.ty, name),
            // The user id is always known even when the event carries no
            // explicit uid attribute.
            None if name == "uid" => Ok(match var.ty {
                ValueType::Num => Value::Num(i64::from(ctx.user_id())),
                ValueType::Str => Value::Str(ctx.user_id().to_string()),
            }),
            None => Err(ExprError::MissingField(name.clone())),
        },
        VarPath::Func(func) => {
            let n = match func {
                Func::Year => i64::from(Local::now().year()),
                Func::Month => i64::from(Local::now().month()),
                Func::Day => i64::from(Local::now().day()),
                Func::StepCrowd => ctx.step_crowd() as i64,
                Func::StepTtl => ctx.step_ttl(),
            };
            Ok(match var.ty {
                ValueType::Num => Value::Num(n),
                ValueType::Str => Value::Str(n.to_string()),
            })
        }
    }
}

fn convert(raw: &str, ty: ValueType, name: &str) -> Result<Value, ExprError> {
    match ty {
        ValueType::Str => Ok(Value::Str(raw.to_string())),
        ValueType::Num => raw.parse::<i64>().map(Value::Num).map_err(|_| {
            ExprError::Type(format!("field {} value {:?} is not a number", name, raw))
        }),
    }
}

fn apply(op: Op, left: Value, right: Value) -> Result<Value, ExprError> {
    use Value::{Bool, Num, Str};

    let mismatch = |l: &Value, r: &Value| {
        Err(ExprError::Type(format!(
            "cannot apply {} to {} and {}",
            op.symbol(),
            l.type_name(),
            r.type_name()
        )))
    };

    match op {
        Op::Add => match (left, right) {
            (Num(l), Num(r)) => Ok(Num(l.wrapping_add(r))),
            (l, r) => mismatch(&l, &r),
        },
        Op::Sub => match (left, right) {
            (Num(l), Num(r)) => Ok(Num(l.wrapping_sub(r))),
            (l, r) => mismatch(&l, &r),
        },
        Op::Eq => match (left, right) {
            (Num(l), Num(r)) => Ok(Bool(l == r)),
            (Str(l), Str(r)) => Ok(Bool(l == r)),
            (Bool(l), Bool(r)) => Ok(Bool(l == r)),
            (l, r) => mismatch(&l, &r),
        },
        Op::Ne => match (left, right) {
            (Num(l), Num(r)) => Ok(Bool(l != r)),
            (Str(l), Str(r)) => Ok(Bool(l != r)),
            (Bool(l), Bool(r)) => Ok(Bool(l != r)),
            (l, r) => mismatch(&l, &r),
        },
        Op::Gt => compare(left, right, |o| o.is_gt(), op),
        Op::Ge => compare(left, right, |o| o.is_ge(), op),
        Op::Lt => compare(left, right, |o| o.is_lt(), op),
        Op::Le => compare(left, right, |o| o.is_le(), op),
        Op::And => match (left, right) {
            (Bool(l), Bool(r)) => Ok(Bool(l && r)),
            (l, r) => mismatch(&l, &r),
        },
        Op::Or => match (left, right) {
            (Bool(l), Bool(r)) => Ok(Bool(l || r)),
            (l, r) => mismatch(&l, &r),
        },
    }
}

fn compare(
    left: Value,
    right: Value,
    check: fn(std::cmp::Ordering) -> bool,
    op: Op,
) -> Result<Value, ExprError> {
    match (&left, &right) {
        (Value::Num(l), Value::Num(r)) => Ok(Value::Bool(check(l.cmp(r)))),
        (Value::Str(l), Value::Str(r)) => Ok(Value::Bool(check(l.cmp(r)))),
        _ => Err(ExprError::Type(format!(
            "cannot apply {} to {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}
