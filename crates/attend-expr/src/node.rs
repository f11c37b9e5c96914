//! Expression node types and the `ExprId` handle.

use std::fmt;

/// Handle into the expression graph. Lightweight (4 bytes), Copy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub(crate) u32);

impl ExprId {
    /// Create an ExprId from a raw index.
    #[inline]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// The raw index of this expression in the graph.
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Index into a graph's symbol table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub(crate) u32);

impl SymbolId {
    /// The raw index of this symbol.
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// Row reduction flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum along the innermost axis.
    Sum,
    /// Maximum along the innermost axis.
    Max,
}

/// What a value represents, independent of the node that computes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Per-element or per-row quantity with full algebra.
    Scalar,
    /// Row-shaped quantity flowing through the online reduction.
    Array,
    /// Named external input declared through custom IO.
    Tensor,
    /// Literal wrapped as a value.
    Constant,
}

/// A node in the expression graph.
///
/// Two atoms, four unary ops, five binary ops and two row reductions.
/// Operands always precede the node that uses them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Node {
    // Atoms
    /// Named free symbol.
    Var(SymbolId),
    /// Literal f64 value stored as bits for Hash/Eq.
    Const(u64),

    // Unary
    /// Negation.
    Neg(ExprId),
    /// Absolute value.
    Abs(ExprId),
    /// Natural exponential.
    Exp(ExprId),
    /// Natural logarithm.
    Log(ExprId),

    // Binary
    /// Addition.
    Add(ExprId, ExprId),
    /// Subtraction.
    Sub(ExprId, ExprId),
    /// Multiplication.
    Mul(ExprId, ExprId),
    /// Division.
    Div(ExprId, ExprId),
    /// Elementwise maximum.
    Max(ExprId, ExprId),

    // Row reductions
    /// Sum over the innermost axis.
    ReduceSum(ExprId),
    /// Maximum over the innermost axis.
    ReduceMax(ExprId),
}

impl Node {
    /// Create a `Const` node from an f64 value.
    #[inline]
    pub fn constant(v: f64) -> Self {
        Self::Const(v.to_bits())
    }

    /// Extract f64 value from a `Const` node, or `None`.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Const(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    /// Operator name, as reported in errors and debug output.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Var(_) => "var",
            Self::Const(_) => "const",
            Self::Neg(_) => "neg",
            Self::Abs(_) => "abs",
            Self::Exp(_) => "exp",
            Self::Log(_) => "log",
            Self::Add(..) => "add",
            Self::Sub(..) => "sub",
            Self::Mul(..) => "mul",
            Self::Div(..) => "div",
            Self::Max(..) => "max",
            Self::ReduceSum(_) => "reduce_sum",
            Self::ReduceMax(_) => "reduce_max",
        }
    }

    /// Ordered operand list.
    pub fn operands(&self) -> impl Iterator<Item = ExprId> {
        let slots = match *self {
            Self::Var(_) | Self::Const(_) => [None, None],
            Self::Neg(a)
            | Self::Abs(a)
            | Self::Exp(a)
            | Self::Log(a)
            | Self::ReduceSum(a)
            | Self::ReduceMax(a) => [Some(a), None],
            Self::Add(a, b)
            | Self::Sub(a, b)
            | Self::Mul(a, b)
            | Self::Div(a, b)
            | Self::Max(a, b) => [Some(a), Some(b)],
        };
        slots.into_iter().flatten()
    }

    /// Whether this node reduces along an axis.
    #[inline]
    pub fn is_reduction(&self) -> bool {
        matches!(self, Self::ReduceSum(_) | Self::ReduceMax(_))
    }

    /// Whether this node is a leaf (`Var` or `Const`).
    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Var(_) | Self::Const(_))
    }
}
