//! Serializable form of expression graphs.
//!
//! `WireNode` mirrors `attend_expr::Node` with serde derives, keeping
//! attend-expr dependency-light. Generated kernels embed a `WireGraph` in
//! their manifest so a loader can rebuild the traced program from the
//! source text alone.

use attend_expr::{ExprGraph, ExprId, Node, ValueKind};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Incremented on breaking format changes.
pub const WIRE_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireKind {
    Scalar,
    Array,
    Tensor,
    Constant,
}

impl From<ValueKind> for WireKind {
    fn from(k: ValueKind) -> Self {
        match k {
            ValueKind::Scalar => WireKind::Scalar,
            ValueKind::Array => WireKind::Array,
            ValueKind::Tensor => WireKind::Tensor,
            ValueKind::Constant => WireKind::Constant,
        }
    }
}

impl From<WireKind> for ValueKind {
    fn from(k: WireKind) -> Self {
        match k {
            WireKind::Scalar => ValueKind::Scalar,
            WireKind::Array => ValueKind::Array,
            WireKind::Tensor => ValueKind::Tensor,
            WireKind::Constant => ValueKind::Constant,
        }
    }
}

/// A node in the wire-format expression graph. Operands are node indices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireNode {
    Var {
        name: String,
        kind: WireKind,
        axes: Vec<String>,
    },
    Const(u64),
    Neg(u32),
    Abs(u32),
    Exp(u32),
    Log(u32),
    Add(u32, u32),
    Sub(u32, u32),
    Mul(u32, u32),
    Div(u32, u32),
    Max(u32, u32),
    ReduceSum(u32),
    ReduceMax(u32),
}

/// A serializable expression graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireGraph {
    pub version: u32,
    /// All nodes in topological order (index = ExprId).
    pub nodes: Vec<WireNode>,
}

impl WireGraph {
    pub fn from_expr_graph(graph: &ExprGraph) -> Self {
        let nodes = (0..graph.len() as u32)
            .map(|i| {
                let id = ExprId::from_index(i);
                match graph.node(id) {
                    Node::Var(sym) => WireNode::Var {
                        name: graph.symbol_name(sym).to_string(),
                        kind: graph.kind(id).into(),
                        axes: graph.axes(id).to_vec(),
                    },
                    Node::Const(bits) => WireNode::Const(bits),
                    Node::Neg(a) => WireNode::Neg(a.index()),
                    Node::Abs(a) => WireNode::Abs(a.index()),
                    Node::Exp(a) => WireNode::Exp(a.index()),
                    Node::Log(a) => WireNode::Log(a.index()),
                    Node::Add(a, b) => WireNode::Add(a.index(), b.index()),
                    Node::Sub(a, b) => WireNode::Sub(a.index(), b.index()),
                    Node::Mul(a, b) => WireNode::Mul(a.index(), b.index()),
                    Node::Div(a, b) => WireNode::Div(a.index(), b.index()),
                    Node::Max(a, b) => WireNode::Max(a.index(), b.index()),
                    Node::ReduceSum(a) => WireNode::ReduceSum(a.index()),
                    Node::ReduceMax(a) => WireNode::ReduceMax(a.index()),
                }
            })
            .collect();
        Self {
            version: WIRE_VERSION,
            nodes,
        }
    }

    /// Rebuild the graph through the public construction API.
    ///
    /// Construction never interns, so node `i` of the wire graph becomes
    /// `ExprId` `i` of the result and stored output indices stay valid.
    /// Shape rules are re-checked on the way.
    pub fn to_expr_graph(&self) -> Result<ExprGraph> {
        if self.version != WIRE_VERSION {
            return Err(EngineError::TypeMismatch(format!(
                "wire graph version {} (expected {WIRE_VERSION})",
                self.version
            )));
        }
        let mut g = ExprGraph::new();
        let id = |i: u32| ExprId::from_index(i);
        for node in &self.nodes {
            match node {
                WireNode::Var { name, kind, axes } => {
                    let axes: Vec<&str> = axes.iter().map(String::as_str).collect();
                    g.var(name, (*kind).into(), &axes);
                }
                WireNode::Const(bits) => {
                    g.constant(f64::from_bits(*bits));
                }
                WireNode::Neg(a) => {
                    g.neg(id(*a))?;
                }
                WireNode::Abs(a) => {
                    g.abs(id(*a))?;
                }
                WireNode::Exp(a) => {
                    g.exp(id(*a))?;
                }
                WireNode::Log(a) => {
                    g.log(id(*a))?;
                }
                WireNode::Add(a, b) => {
                    g.add(id(*a), id(*b))?;
                }
                WireNode::Sub(a, b) => {
                    g.sub(id(*a), id(*b))?;
                }
                WireNode::Mul(a, b) => {
                    g.mul(id(*a), id(*b))?;
                }
                WireNode::Div(a, b) => {
                    g.div(id(*a), id(*b))?;
                }
                WireNode::Max(a, b) => {
                    g.max(id(*a), id(*b))?;
                }
                WireNode::ReduceSum(a) => {
                    g.reduce(id(*a), attend_expr::ReduceOp::Sum)?;
                }
                WireNode::ReduceMax(a) => {
                    g.reduce(id(*a), attend_expr::ReduceOp::Max)?;
                }
            }
        }
        Ok(g)
    }
}
