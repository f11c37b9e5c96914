//! `Sym`: the symbolic value handle user programs are written against.
//!
//! Every operator inserts nodes into the thread-local graph installed by
//! [`trace`](crate::trace). Fallible `try_*` methods report errors directly;
//! the operator impls record the first error in the trace instead, and the
//! trace returns it once the traced closure finishes.

use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use crate::diff::Gradients;
use crate::error::{ExprError, Result};
use crate::graph::{ExprGraph, TraceId};
use crate::node::{ExprId, ReduceOp, ValueKind};
use crate::{poison, with_graph};

/// A value in the graph being traced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Sym {
    id: ExprId,
    trace: TraceId,
}

/// Right-hand side of a binary operator: a value or a numeric literal.
/// Literals are promoted to constants when the operation is recorded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operand {
    /// A traced value.
    Value(Sym),
    /// A numeric literal.
    Literal(f64),
}

impl From<Sym> for Operand {
    fn from(s: Sym) -> Self {
        Operand::Value(s)
    }
}

impl From<f64> for Operand {
    fn from(v: f64) -> Self {
        Operand::Literal(v)
    }
}

impl From<f32> for Operand {
    fn from(v: f32) -> Self {
        Operand::Literal(f64::from(v))
    }
}

impl From<i32> for Operand {
    fn from(v: i32) -> Self {
        Operand::Literal(f64::from(v))
    }
}

type BinaryFn = fn(&mut ExprGraph, ExprId, ExprId) -> Result<ExprId>;
type UnaryFn = fn(&mut ExprGraph, ExprId) -> Result<ExprId>;

impl Sym {
    /// Wrap an existing node of `graph`.
    pub fn from_id(graph: &ExprGraph, id: ExprId) -> Result<Self> {
        graph.check(id)?;
        Ok(Self {
            id,
            trace: graph.trace_id(),
        })
    }

    fn leaf(make: impl FnOnce(&mut ExprGraph) -> ExprId) -> Self {
        match with_graph(|g| (make(g), g.trace_id())) {
            Ok((id, trace)) => Self { id, trace },
            Err(err) => {
                poison(err);
                Self {
                    id: ExprId(0),
                    trace: TraceId::DETACHED,
                }
            }
        }
    }

    /// Named variable of the given kind and axes.
    pub fn var(name: &str, kind: ValueKind, axes: &[&str]) -> Self {
        Self::leaf(|g| g.var(name, kind, axes))
    }

    /// Per-element scalar variable.
    pub fn scalar(name: &str) -> Self {
        Self::leaf(|g| g.scalar(name))
    }

    /// Per-row scalar state with the given axes.
    pub fn row_scalar(name: &str, axes: &[&str]) -> Self {
        Self::leaf(|g| g.var(name, ValueKind::Scalar, axes))
    }

    /// Row-shaped array variable.
    pub fn array(name: &str, axes: &[&str]) -> Self {
        Self::leaf(|g| g.array(name, axes))
    }

    /// External tensor placeholder.
    pub fn tensor(name: &str) -> Self {
        Self::leaf(|g| g.tensor(name))
    }

    /// Literal constant.
    pub fn constant(v: f64) -> Self {
        Self::leaf(|g| g.constant(v))
    }

    /// Node this value refers to.
    #[inline]
    pub fn id(&self) -> ExprId {
        self.id
    }

    pub(crate) fn with_id(self, id: ExprId) -> Self {
        Self { id, ..self }
    }

    /// Graph this value belongs to.
    #[inline]
    pub fn trace_id(&self) -> TraceId {
        self.trace
    }

    fn inspect<R>(&self, f: impl FnOnce(&ExprGraph, ExprId) -> R) -> Result<R> {
        with_graph(|g| {
            check_trace(g, self)?;
            Ok(f(g, self.id))
        })?
    }

    /// Kind of this value.
    pub fn kind(&self) -> Result<ValueKind> {
        self.inspect(|g, id| g.kind(id))
    }

    /// Symbolic shape axes.
    pub fn axes(&self) -> Result<Vec<String>> {
        self.inspect(|g, id| g.axes(id).to_vec())
    }

    /// Number of distinct nodes consuming this value so far.
    pub fn use_count(&self) -> Result<usize> {
        self.inspect(|g, id| g.use_count(id))
    }

    fn try_unary(self, op: UnaryFn) -> Result<Sym> {
        with_graph(|g| {
            check_trace(g, &self)?;
            let id = op(g, self.id)?;
            Ok(Sym { id, ..self })
        })?
    }

    fn try_binary(self, rhs: Operand, op: BinaryFn) -> Result<Sym> {
        with_graph(|g| {
            check_trace(g, &self)?;
            let rhs = match rhs {
                Operand::Value(s) => {
                    check_trace(g, &s)?;
                    s.id
                }
                Operand::Literal(v) => g.constant(v),
            };
            let id = op(g, self.id, rhs)?;
            Ok(Sym { id, ..self })
        })?
    }

    /// `self + rhs`.
    pub fn try_add(self, rhs: impl Into<Operand>) -> Result<Sym> {
        self.try_binary(rhs.into(), ExprGraph::add)
    }

    /// `self - rhs`.
    pub fn try_sub(self, rhs: impl Into<Operand>) -> Result<Sym> {
        self.try_binary(rhs.into(), ExprGraph::sub)
    }

    /// `self * rhs`.
    pub fn try_mul(self, rhs: impl Into<Operand>) -> Result<Sym> {
        self.try_binary(rhs.into(), ExprGraph::mul)
    }

    /// `self / rhs`.
    pub fn try_div(self, rhs: impl Into<Operand>) -> Result<Sym> {
        self.try_binary(rhs.into(), ExprGraph::div)
    }

    /// Elementwise maximum.
    pub fn try_max(self, rhs: impl Into<Operand>) -> Result<Sym> {
        self.try_binary(rhs.into(), ExprGraph::max)
    }

    /// Reduce an array along its innermost axis.
    pub fn try_reduce(self, op: ReduceOp) -> Result<Sym> {
        with_graph(|g| {
            check_trace(g, &self)?;
            let id = g.reduce(self.id, op)?;
            Ok(Sym { id, ..self })
        })?
    }

    fn or_poison(self, result: Result<Sym>) -> Sym {
        result.unwrap_or_else(|err| {
            poison(err);
            self
        })
    }

    /// Absolute value.
    pub fn abs(self) -> Sym {
        self.or_poison(self.try_unary(ExprGraph::abs))
    }

    /// Natural exponential.
    pub fn exp(self) -> Sym {
        self.or_poison(self.try_unary(ExprGraph::exp))
    }

    /// Natural logarithm.
    pub fn log(self) -> Sym {
        self.or_poison(self.try_unary(ExprGraph::log))
    }

    /// Elementwise maximum.
    pub fn max(self, rhs: impl Into<Operand>) -> Sym {
        self.or_poison(self.try_max(rhs))
    }

    /// Reduce an array along its innermost axis, yielding a scalar.
    pub fn reduce(self, op: ReduceOp) -> Sym {
        self.or_poison(self.try_reduce(op))
    }

    /// Reverse-mode differentiation from this value.
    ///
    /// `seed` defaults to the constant 1.
    pub fn backward(self, seed: Option<Sym>) -> Result<Gradients> {
        with_graph(|g| {
            check_trace(g, &self)?;
            if let Some(s) = &seed {
                check_trace(g, s)?;
            }
            g.backward(self.id, seed.map(|s| s.id))
        })?
    }
}

fn check_trace(g: &ExprGraph, s: &Sym) -> Result<()> {
    if s.trace != g.trace_id() {
        return Err(ExprError::TypeMismatch(format!(
            "value {} belongs to another trace",
            s.id
        )));
    }
    g.check(s.id)
}

// --- Operator impls (all delegate to graph ops) ---

macro_rules! binary_op {
    ($trait:ident, $method:ident, $try:ident, $assign_trait:ident, $assign:ident) => {
        impl<R: Into<Operand>> $trait<R> for Sym {
            type Output = Sym;
            #[inline]
            fn $method(self, rhs: R) -> Sym {
                self.or_poison(self.$try(rhs))
            }
        }

        impl $trait<Sym> for f64 {
            type Output = Sym;
            #[inline]
            fn $method(self, rhs: Sym) -> Sym {
                let lhs = Sym::constant(self);
                lhs.or_poison(lhs.$try(rhs))
            }
        }

        impl<R: Into<Operand>> $assign_trait<R> for Sym {
            #[inline]
            fn $assign(&mut self, rhs: R) {
                *self = self.or_poison(self.$try(rhs));
            }
        }
    };
}

binary_op!(Add, add, try_add, AddAssign, add_assign);
binary_op!(Sub, sub, try_sub, SubAssign, sub_assign);
binary_op!(Mul, mul, try_mul, MulAssign, mul_assign);
binary_op!(Div, div, try_div, DivAssign, div_assign);

impl Neg for Sym {
    type Output = Sym;
    #[inline]
    fn neg(self) -> Sym {
        self.or_poison(self.try_unary(ExprGraph::neg))
    }
}
