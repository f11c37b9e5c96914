//! Reverse-mode symbolic differentiation.

use std::collections::HashMap;

use crate::error::{ExprError, Result};
use crate::graph::{ExprGraph, TraceId};
use crate::node::{ExprId, Node};
use crate::sym::Sym;

/// Adjoints produced by [`ExprGraph::backward`].
///
/// Maps every node reached from the root to the expression of its
/// accumulated gradient. Nodes the root does not depend on have no entry.
#[derive(Clone, Debug)]
pub struct Gradients {
    trace: TraceId,
    adjoints: HashMap<ExprId, ExprId>,
}

impl Gradients {
    /// Gradient expression for `id`, if the root depends on it.
    pub fn get(&self, id: ExprId) -> Option<ExprId> {
        self.adjoints.get(&id).copied()
    }

    /// Gradient of a traced value, as a value of the same trace.
    pub fn of(&self, value: Sym) -> Option<Sym> {
        if value.trace_id() != self.trace {
            return None;
        }
        self.get(value.id()).map(|id| value.with_id(id))
    }

    /// Number of nodes holding a gradient.
    pub fn len(&self) -> usize {
        self.adjoints.len()
    }

    /// Whether no gradient was populated.
    pub fn is_empty(&self) -> bool {
        self.adjoints.is_empty()
    }
}

impl ExprGraph {
    /// Propagate `seed` (default: the constant 1) backwards from `root`.
    ///
    /// Nodes are visited in reverse index order, which is a reverse
    /// topological order because operands always precede their consumers.
    /// Each node's adjoint is therefore complete before it propagates to its
    /// producers; contributions from several use sites are summed.
    ///
    /// Gradient nodes are appended to this graph. Reaching an operator with
    /// no adjoint rule aborts with `UnsupportedGradient`; the nodes appended
    /// so far are removed and the graph is left as it was.
    pub fn backward(&mut self, root: ExprId, seed: Option<ExprId>) -> Result<Gradients> {
        let mark = self.len();
        let result = self.propagate(root, seed);
        if result.is_err() {
            self.truncate(mark);
        }
        result
    }

    fn propagate(&mut self, root: ExprId, seed: Option<ExprId>) -> Result<Gradients> {
        self.check(root)?;
        let seed = match seed {
            Some(s) => {
                self.check(s)?;
                s
            }
            None => self.constant(1.0),
        };

        let n = root.0 as usize + 1;
        let mut adjoints: Vec<Option<ExprId>> = vec![None; n];
        adjoints[root.0 as usize] = Some(seed);

        for i in (0..n).rev() {
            let Some(g) = adjoints[i] else {
                continue;
            };
            match self.node(ExprId(i as u32)) {
                Node::Var(_) | Node::Const(_) => {}

                Node::Add(a, b) => {
                    // d(a + b) = da + db
                    self.accumulate(&mut adjoints, a, g)?;
                    self.accumulate(&mut adjoints, b, g)?;
                }

                Node::Sub(a, b) => {
                    // d(a - b) = da - db
                    self.accumulate(&mut adjoints, a, g)?;
                    let ng = self.neg(g)?;
                    self.accumulate(&mut adjoints, b, ng)?;
                }

                Node::Neg(a) => {
                    let ng = self.neg(g)?;
                    self.accumulate(&mut adjoints, a, ng)?;
                }

                Node::Mul(a, b) => {
                    // d(a * b) = g*b da + g*a db
                    let ga = self.mul(g, b)?;
                    self.accumulate(&mut adjoints, a, ga)?;
                    let gb = self.mul(g, a)?;
                    self.accumulate(&mut adjoints, b, gb)?;
                }

                Node::Div(a, b) => {
                    // d(a / b) = g/b da + g*(-a/b)/b db
                    let ga = self.div(g, b)?;
                    self.accumulate(&mut adjoints, a, ga)?;
                    let na = self.neg(a)?;
                    let q = self.div(na, b)?;
                    let t = self.mul(g, q)?;
                    let gb = self.div(t, b)?;
                    self.accumulate(&mut adjoints, b, gb)?;
                }

                node => {
                    return Err(ExprError::UnsupportedGradient {
                        op: node.op_name(),
                    })
                }
            }
        }

        let adjoints = adjoints
            .into_iter()
            .enumerate()
            .filter_map(|(i, g)| g.map(|g| (ExprId(i as u32), g)))
            .collect();
        Ok(Gradients {
            trace: self.trace_id(),
            adjoints,
        })
    }

    fn accumulate(
        &mut self,
        adjoints: &mut [Option<ExprId>],
        target: ExprId,
        contribution: ExprId,
    ) -> Result<()> {
        let slot = &mut adjoints[target.0 as usize];
        *slot = Some(match *slot {
            Some(prev) => self.add(prev, contribution)?,
            None => contribution,
        });
        Ok(())
    }
}
