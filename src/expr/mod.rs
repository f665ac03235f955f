//! The branch condition language.
//!
//! Conditions are short infix expressions evaluated against one event, e.g.
//! `{num: event.uid} == 1` or `{num: func.wf_step_ttl} > 0`. Variables are
//! written `{type: path}` where the type is `num` (64-bit signed integer,
//! the default) or `str`, and the path is either `event.<field>` (an
//! attribute of the user event) or `func.<name>` (a built-in). Operators
//! apply left to right without precedence; parenthesize to group.
//!
//! Conditions are parsed once per step when a worker initializes; evaluation
//! is stateless given an [`EventContext`].

mod eval;
mod parse;

pub use eval::Expr;

/// Declared type of a variable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValueType {
    Num,
    Str,
}

/// Runtime value of a (sub-)expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Num(i64),
    Str(String),
    Bool(bool),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Num(_) => "num",
            Value::Str(_) => "str",
            Value::Bool(_) => "bool",
        }
    }

    /// A condition holds when it yields `true` or a non-zero number.
    pub fn truthy(&self) -> Result<bool, ExprError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Num(n) => Ok(*n != 0),
            Value::Str(_) => Err(ExprError::Type(
                "condition result is a string, expected bool or num".to_string(),
            )),
        }
    }
}

/// Built-in functions reachable through `func.<name>`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Func {
    Year,
    Month,
    Day,
    StepCrowd,
    StepTtl,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum VarPath {
    EventField(String),
    Func(Func),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Var {
    pub ty: ValueType,
    pub path: VarPath,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Add,
    Sub,
    And,
    Or,
}

impl Op {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Add => "+",
            Op::Sub => "-",
            Op::And => "&&",
            Op::Or => "||",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Node {
    Const(Value),
    Var(Var),
    Chain { first: Box<Node>, rest: Vec<(Op, Node)> },
}

/// What an expression can see while evaluating.
pub trait EventContext {
    /// Attribute of the evaluated user event, if present.
    fn field(&self, name: &str) -> Option<&str>;
    /// Id of the evaluated user. Backs `event.uid` when the attribute is
    /// absent from the event data.
    fn user_id(&self) -> u32;
    /// Cardinality of the step crowd under evaluation.
    fn step_crowd(&self) -> u64;
    /// Step TTL probe for the evaluated user; positive once the user's
    /// step window has expired.
    fn step_ttl(&self) -> i64;
}

/// Errors from parsing or evaluating a condition.
#[derive(Clone, Debug, PartialEq)]
pub enum ExprError {
    /// Syntax error at a byte position of the source.
    Parse { pos: usize, message: String },
    /// `func.<name>` is not a known built-in.
    UnknownFunc(String),
    /// `event.<field>` is not present on the evaluated event.
    MissingField(String),
    /// Operand or conversion type mismatch.
    Type(String),
}

impl std::fmt::Display for ExprError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExprError::Parse { pos, message } => {
                write!(f, "parse error at {}: {}", pos, message)
            }
            ExprError::UnknownFunc(name) => write!(f, "func {} not supported", name),
            ExprError::MissingField(name) => write!(f, "event field {} not found", name),
            ExprError::Type(msg) => write!(f, "type error: {}", msg),
        }
    }
}

impl std::error::Error for ExprError {}
