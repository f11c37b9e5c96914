//! Append-only expression graph.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ExprError, Result};
use crate::node::{ExprId, Node, ReduceOp, SymbolId, ValueKind};

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one graph. Handles carry it so values from another trace
/// are rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceId(u64);

impl TraceId {
    /// Never issued; marks handles created outside of a trace.
    pub(crate) const DETACHED: Self = Self(0);

    fn fresh() -> Self {
        Self(NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Bookkeeping kept next to every node.
#[derive(Clone, Debug)]
struct NodeMeta {
    kind: ValueKind,
    axes: Vec<String>,
    consumers: Vec<ExprId>,
}

/// Arena-based expression graph.
///
/// Nodes are immutable once pushed and always reference earlier nodes, so
/// index order is a topological order. Unlike an interning graph, building
/// the same expression twice yields two structurally equal nodes; identical
/// programs are only deduplicated once rendered to text.
#[derive(Clone, Debug)]
pub struct ExprGraph {
    id: TraceId,
    nodes: Vec<Node>,
    meta: Vec<NodeMeta>,
    symbols: Vec<String>,
    symbol_index: HashMap<String, SymbolId>,
}

impl ExprGraph {
    /// Create an empty graph with a fresh trace id.
    pub fn new() -> Self {
        Self {
            id: TraceId::fresh(),
            nodes: Vec::new(),
            meta: Vec::new(),
            symbols: Vec::new(),
            symbol_index: HashMap::new(),
        }
    }

    /// Identity of this graph.
    #[inline]
    pub fn trace_id(&self) -> TraceId {
        self.id
    }

    /// Total number of nodes in the graph.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up the node for an ExprId.
    ///
    /// Panics if `id` does not belong to this graph.
    #[inline]
    pub fn node(&self, id: ExprId) -> Node {
        self.nodes[id.0 as usize]
    }

    /// All nodes in topological order.
    #[inline]
    pub fn nodes_slice(&self) -> &[Node] {
        &self.nodes
    }

    /// Kind of the value computed by `id`.
    pub fn kind(&self, id: ExprId) -> ValueKind {
        self.meta[id.0 as usize].kind
    }

    /// Symbolic shape axes of `id`.
    pub fn axes(&self, id: ExprId) -> &[String] {
        &self.meta[id.0 as usize].axes
    }

    /// Distinct nodes that consume `id`, in creation order.
    pub fn consumers(&self, id: ExprId) -> &[ExprId] {
        &self.meta[id.0 as usize].consumers
    }

    /// Number of distinct nodes consuming `id`.
    pub fn use_count(&self, id: ExprId) -> usize {
        self.meta[id.0 as usize].consumers.len()
    }

    /// Name of a symbol.
    pub fn symbol_name(&self, sym: SymbolId) -> &str {
        &self.symbols[sym.0 as usize]
    }

    /// Name of `id` if it is a `Var`.
    pub fn var_name(&self, id: ExprId) -> Option<&str> {
        match self.node(id) {
            Node::Var(sym) => Some(self.symbol_name(sym)),
            _ => None,
        }
    }

    /// Fail with `TypeMismatch` unless `id` is a node of this graph.
    pub fn check(&self, id: ExprId) -> Result<()> {
        if (id.0 as usize) < self.nodes.len() {
            Ok(())
        } else {
            Err(ExprError::TypeMismatch(format!(
                "operand {id} does not belong to this graph ({} nodes)",
                self.nodes.len()
            )))
        }
    }

    fn intern_symbol(&mut self, name: &str) -> SymbolId {
        if let Some(&sym) = self.symbol_index.get(name) {
            return sym;
        }
        let sym = SymbolId(self.symbols.len() as u32);
        self.symbols.push(name.to_string());
        self.symbol_index.insert(name.to_string(), sym);
        sym
    }

    /// Internal: append a node and register it as a consumer of its operands.
    fn push(&mut self, node: Node, kind: ValueKind, axes: Vec<String>) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        let mut seen: [Option<ExprId>; 2] = [None, None];
        for (slot, operand) in node.operands().enumerate() {
            if seen.contains(&Some(operand)) {
                continue;
            }
            seen[slot] = Some(operand);
            self.meta[operand.0 as usize].consumers.push(id);
        }
        self.nodes.push(node);
        self.meta.push(NodeMeta {
            kind,
            axes,
            consumers: Vec::new(),
        });
        id
    }

    /// Internal: drop every node created at or after `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        for i in (len..self.nodes.len()).rev() {
            let operands: Vec<ExprId> = self.nodes[i].operands().collect();
            for operand in operands {
                self.meta[operand.0 as usize]
                    .consumers
                    .retain(|c| (c.0 as usize) < len);
            }
        }
        self.nodes.truncate(len);
        self.meta.truncate(len);
    }

    // --- Leaves ---

    /// Create a named variable of the given kind and axes.
    pub fn var(&mut self, name: &str, kind: ValueKind, axes: &[&str]) -> ExprId {
        let sym = self.intern_symbol(name);
        let axes = axes.iter().map(|a| a.to_string()).collect();
        self.push(Node::Var(sym), kind, axes)
    }

    /// Per-element scalar variable with no axes.
    #[inline]
    pub fn scalar(&mut self, name: &str) -> ExprId {
        self.var(name, ValueKind::Scalar, &[])
    }

    /// Row-shaped array variable.
    #[inline]
    pub fn array(&mut self, name: &str, axes: &[&str]) -> ExprId {
        self.var(name, ValueKind::Array, axes)
    }

    /// Placeholder for an external tensor, read elementwise.
    #[inline]
    pub fn tensor(&mut self, name: &str) -> ExprId {
        self.var(name, ValueKind::Tensor, &[])
    }

    /// Literal constant.
    #[inline]
    pub fn constant(&mut self, v: f64) -> ExprId {
        self.push(Node::constant(v), ValueKind::Constant, Vec::new())
    }

    // --- Unary ---

    fn unary(&mut self, a: ExprId, make: fn(ExprId) -> Node) -> Result<ExprId> {
        self.check(a)?;
        let kind = elementwise_kind(self.kind(a));
        let axes = self.axes(a).to_vec();
        Ok(self.push(make(a), kind, axes))
    }

    /// Negate an expression.
    pub fn neg(&mut self, a: ExprId) -> Result<ExprId> {
        self.unary(a, Node::Neg)
    }

    /// Absolute value.
    pub fn abs(&mut self, a: ExprId) -> Result<ExprId> {
        self.unary(a, Node::Abs)
    }

    /// Natural exponential.
    pub fn exp(&mut self, a: ExprId) -> Result<ExprId> {
        self.unary(a, Node::Exp)
    }

    /// Natural logarithm.
    pub fn log(&mut self, a: ExprId) -> Result<ExprId> {
        self.unary(a, Node::Log)
    }

    // --- Binary ---

    fn binary(&mut self, a: ExprId, b: ExprId, make: fn(ExprId, ExprId) -> Node) -> Result<ExprId> {
        self.check(a)?;
        self.check(b)?;
        let axes = broadcast_axes(self.axes(a), self.axes(b)).ok_or_else(|| {
            ExprError::TypeMismatch(format!(
                "cannot combine axes {:?} and {:?}",
                self.axes(a),
                self.axes(b)
            ))
        })?;
        let kind = if self.kind(a) == ValueKind::Array || self.kind(b) == ValueKind::Array {
            ValueKind::Array
        } else {
            ValueKind::Scalar
        };
        Ok(self.push(make(a, b), kind, axes))
    }

    /// Add two expressions.
    pub fn add(&mut self, a: ExprId, b: ExprId) -> Result<ExprId> {
        self.binary(a, b, Node::Add)
    }

    /// Subtract `b` from `a`.
    pub fn sub(&mut self, a: ExprId, b: ExprId) -> Result<ExprId> {
        self.binary(a, b, Node::Sub)
    }

    /// Multiply two expressions.
    pub fn mul(&mut self, a: ExprId, b: ExprId) -> Result<ExprId> {
        self.binary(a, b, Node::Mul)
    }

    /// Divide `a` by `b`.
    pub fn div(&mut self, a: ExprId, b: ExprId) -> Result<ExprId> {
        self.binary(a, b, Node::Div)
    }

    /// Elementwise maximum.
    pub fn max(&mut self, a: ExprId, b: ExprId) -> Result<ExprId> {
        self.binary(a, b, Node::Max)
    }

    // --- Reductions ---

    /// Reduce an array along its innermost axis, yielding a scalar.
    pub fn reduce(&mut self, a: ExprId, op: ReduceOp) -> Result<ExprId> {
        self.check(a)?;
        if self.kind(a) != ValueKind::Array {
            return Err(ExprError::TypeMismatch(format!(
                "reduce expects an array, got {:?}",
                self.kind(a)
            )));
        }
        let mut axes = self.axes(a).to_vec();
        if axes.pop().is_none() {
            return Err(ExprError::TypeMismatch(
                "reduce needs at least one axis".to_string(),
            ));
        }
        let node = match op {
            ReduceOp::Sum => Node::ReduceSum(a),
            ReduceOp::Max => Node::ReduceMax(a),
        };
        Ok(self.push(node, ValueKind::Scalar, axes))
    }

    // --- Queries ---

    /// Find all node indices reachable from the given outputs.
    pub fn live_set(&self, outputs: &[ExprId]) -> HashSet<usize> {
        let mut live = HashSet::new();
        let mut stack: Vec<usize> = outputs.iter().map(|e| e.0 as usize).collect();
        while let Some(i) = stack.pop() {
            if !live.insert(i) {
                continue;
            }
            stack.extend(self.nodes[i].operands().map(|e| e.0 as usize));
        }
        live
    }

    /// Whether the sub-graph under `a` contains a row reduction.
    pub fn contains_reduction(&self, a: ExprId) -> bool {
        self.live_set(&[a])
            .into_iter()
            .any(|i| self.nodes[i].is_reduction())
    }

    /// Structural equality of two sub-graphs: same op tags, operand order,
    /// constants and variable names.
    pub fn same_structure(&self, a: ExprId, b: ExprId) -> bool {
        let mut memo = HashMap::new();
        self.same_structure_inner(a, b, &mut memo)
    }

    fn same_structure_inner(
        &self,
        a: ExprId,
        b: ExprId,
        memo: &mut HashMap<(ExprId, ExprId), bool>,
    ) -> bool {
        if a == b {
            return true;
        }
        if let Some(&cached) = memo.get(&(a, b)) {
            return cached;
        }
        let (na, nb) = (self.node(a), self.node(b));
        let equal = match (na, nb) {
            (Node::Var(x), Node::Var(y)) => self.symbol_name(x) == self.symbol_name(y),
            (Node::Const(x), Node::Const(y)) => x == y,
            _ if std::mem::discriminant(&na) == std::mem::discriminant(&nb) => na
                .operands()
                .zip(nb.operands())
                .all(|(x, y)| self.same_structure_inner(x, y, memo)),
            _ => false,
        };
        memo.insert((a, b), equal);
        equal
    }
}

impl Default for ExprGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn elementwise_kind(kind: ValueKind) -> ValueKind {
    match kind {
        ValueKind::Array => ValueKind::Array,
        _ => ValueKind::Scalar,
    }
}

/// The longer of two axis lists when one is a prefix of the other.
fn broadcast_axes(a: &[String], b: &[String]) -> Option<Vec<String>> {
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    if long[..short.len()] == *short {
        Some(long.to_vec())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_only_no_interning() {
        let mut g = ExprGraph::new();
        let x = g.scalar("x");
        let a = g.exp(x).unwrap();
        let b = g.exp(x).unwrap();
        assert_ne!(a, b);
        assert!(g.same_structure(a, b));
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn construction_leaves_operands_untouched() {
        let mut g = ExprGraph::new();
        let x = g.scalar("x");
        let y = g.scalar("y");
        let before = (g.node(x), g.node(y));
        let _ = g.mul(x, y).unwrap();
        let _ = g.mul(x, y).unwrap();
        assert_eq!((g.node(x), g.node(y)), before);
    }

    #[test]
    fn use_count_counts_distinct_consumers() {
        let mut g = ExprGraph::new();
        let x = g.scalar("x");
        let y = g.scalar("y");
        let sq = g.mul(x, x).unwrap();
        let s = g.add(x, y).unwrap();
        let _ = g.div(sq, s).unwrap();
        assert_eq!(g.use_count(x), 2);
        assert_eq!(g.use_count(y), 1);
        assert_eq!(g.use_count(sq), 1);
        assert_eq!(g.consumers(x), &[sq, s]);
    }

    #[test]
    fn reduce_drops_trailing_axis() {
        let mut g = ExprGraph::new();
        let s = g.array("scores", &["block_M", "block_N"]);
        let r = g.reduce(s, ReduceOp::Sum).unwrap();
        assert_eq!(g.kind(r), ValueKind::Scalar);
        assert_eq!(g.axes(r), &["block_M".to_string()]);
    }

    #[test]
    fn reduce_rejects_scalars() {
        let mut g = ExprGraph::new();
        let x = g.scalar("x");
        assert!(matches!(
            g.reduce(x, ReduceOp::Max),
            Err(ExprError::TypeMismatch(_))
        ));
    }

    #[test]
    fn row_scalar_broadcasts_against_array() {
        let mut g = ExprGraph::new();
        let s = g.array("scores", &["block_M", "block_N"]);
        let m = g.var("m", ValueKind::Scalar, &["block_M"]);
        let d = g.sub(s, m).unwrap();
        assert_eq!(g.kind(d), ValueKind::Array);
        assert_eq!(g.axes(d).len(), 2);

        let other = g.array("o", &["block_M", "dim"]);
        assert!(matches!(g.add(s, other), Err(ExprError::TypeMismatch(_))));
    }

    #[test]
    fn foreign_ids_rejected() {
        let mut g = ExprGraph::new();
        let x = g.scalar("x");
        let bogus = ExprId::from_index(42);
        assert!(matches!(g.add(x, bogus), Err(ExprError::TypeMismatch(_))));
    }

    #[test]
    fn structure_distinguishes_names_and_order() {
        let mut g = ExprGraph::new();
        let x = g.scalar("x");
        let y = g.scalar("y");
        let a = g.sub(x, y).unwrap();
        let b = g.sub(y, x).unwrap();
        assert!(!g.same_structure(a, b));
        let x2 = g.scalar("x");
        let c = g.sub(x2, y).unwrap();
        assert!(g.same_structure(a, c));
    }
}
