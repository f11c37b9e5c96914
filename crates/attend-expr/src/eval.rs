//! Host evaluation of expression graphs.
//!
//! Evaluation covers one query row at a time: an `Array` binding is the
//! innermost axis of the row as `Value::Row`, per-row state is a
//! `Value::Scalar`, and scalars broadcast against rows.

use std::collections::HashMap;

use crate::error::{ExprError, Result};
use crate::graph::ExprGraph;
use crate::node::{ExprId, Node};

/// A concrete value flowing through evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A single number.
    Scalar(f64),
    /// The innermost axis of an array.
    Row(Vec<f64>),
}

impl Value {
    /// The scalar, or `None` for a row.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Row(_) => None,
        }
    }

    /// Materialize as a row of `len` elements, broadcasting scalars.
    pub fn to_row(&self, len: usize) -> Result<Vec<f64>> {
        match self {
            Value::Scalar(v) => Ok(vec![*v; len]),
            Value::Row(r) if r.len() == len => Ok(r.clone()),
            Value::Row(r) => Err(ExprError::TypeMismatch(format!(
                "row of length {} where {len} was expected",
                r.len()
            ))),
        }
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Value {
        match self {
            Value::Scalar(v) => Value::Scalar(f(*v)),
            Value::Row(r) => Value::Row(r.iter().map(|&v| f(v)).collect()),
        }
    }

    fn zip(&self, other: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value> {
        Ok(match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(f(*a, *b)),
            (Value::Row(a), Value::Scalar(b)) => Value::Row(a.iter().map(|&x| f(x, *b)).collect()),
            (Value::Scalar(a), Value::Row(b)) => Value::Row(b.iter().map(|&y| f(*a, y)).collect()),
            (Value::Row(a), Value::Row(b)) => {
                if a.len() != b.len() {
                    return Err(ExprError::TypeMismatch(format!(
                        "row lengths differ: {} vs {}",
                        a.len(),
                        b.len()
                    )));
                }
                Value::Row(a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect())
            }
        })
    }

    fn fold(&self, init: f64, f: impl Fn(f64, f64) -> f64) -> Value {
        match self {
            Value::Scalar(v) => Value::Scalar(*v),
            Value::Row(r) => Value::Scalar(r.iter().fold(init, |acc, &v| f(acc, v))),
        }
    }
}

/// Variable bindings by name.
#[derive(Clone, Debug, Default)]
pub struct Env {
    values: HashMap<String, Value>,
}

impl Env {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style binding.
    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.bind(name, value);
        self
    }

    /// Bind or rebind `name`.
    pub fn bind(&mut self, name: &str, value: Value) {
        match self.values.get_mut(name) {
            Some(slot) => *slot = value,
            None => {
                self.values.insert(name.to_string(), value);
            }
        }
    }

    /// Look up a binding.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

impl ExprGraph {
    /// Evaluate an expression with the given bindings.
    pub fn eval(&self, expr: ExprId, env: &Env) -> Result<Value> {
        let mut out = self.eval_many(&[expr], env)?;
        Ok(out.swap_remove(0))
    }

    /// Evaluate multiple output expressions, sharing intermediate values.
    ///
    /// Only nodes reachable from `exprs` are computed, in index order
    /// (children are always created before parents).
    pub fn eval_many(&self, exprs: &[ExprId], env: &Env) -> Result<Vec<Value>> {
        for &e in exprs {
            self.check(e)?;
        }
        let Some(max_id) = exprs.iter().map(|e| e.0 as usize).max() else {
            return Ok(Vec::new());
        };
        let live = self.live_set(exprs);
        let mut vals: Vec<Option<Value>> = vec![None; max_id + 1];

        for i in 0..=max_id {
            if !live.contains(&i) {
                continue;
            }
            let get = |id: ExprId| slot(&vals, id);
            let v = match self.node(ExprId(i as u32)) {
                Node::Var(sym) => {
                    let name = self.symbol_name(sym);
                    env.get(name)
                        .cloned()
                        .ok_or_else(|| ExprError::UnboundVariable(name.to_string()))?
                }
                Node::Const(bits) => Value::Scalar(f64::from_bits(bits)),
                Node::Neg(a) => get(a).map(|x| -x),
                Node::Abs(a) => get(a).map(f64::abs),
                Node::Exp(a) => get(a).map(f64::exp),
                Node::Log(a) => get(a).map(f64::ln),
                Node::Add(a, b) => get(a).zip(get(b), |x, y| x + y)?,
                Node::Sub(a, b) => get(a).zip(get(b), |x, y| x - y)?,
                Node::Mul(a, b) => get(a).zip(get(b), |x, y| x * y)?,
                Node::Div(a, b) => get(a).zip(get(b), |x, y| x / y)?,
                Node::Max(a, b) => get(a).zip(get(b), f64::max)?,
                Node::ReduceSum(a) => get(a).fold(0.0, |acc, v| acc + v),
                Node::ReduceMax(a) => get(a).fold(f64::NEG_INFINITY, f64::max),
            };
            vals[i] = Some(v);
        }

        Ok(exprs
            .iter()
            .map(|&e| slot(&vals, e).clone())
            .collect())
    }
}

static MISSING: Value = Value::Scalar(f64::NAN);

// Operands precede consumers and are live whenever the consumer is, so the
// slot is always filled by the time it is read.
fn slot(vals: &[Option<Value>], id: ExprId) -> &Value {
    vals[id.0 as usize].as_ref().unwrap_or(&MISSING)
}
