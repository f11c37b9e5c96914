//! CUDA C expression emission.
//!
//! Kernel templates own the surrounding loops and buffers; this module only
//! renders the traced expressions that get spliced into them. Variables are
//! bound to C expressions by the caller (`scores` → `acc_s[j]`, ...).

use std::collections::HashMap;
use std::fmt::Write;

use crate::error::{ExprError, Result};
use crate::graph::ExprGraph;
use crate::node::{ExprId, Node, ValueKind};

/// Output of one emission pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Emitted {
    /// Declarations of materialized temporaries, in dependency order.
    pub statements: Vec<String>,
    /// One C expression per requested output.
    pub results: Vec<String>,
}

impl Emitted {
    /// Statements joined with newlines, each prefixed by `indent`.
    pub fn body(&self, indent: &str) -> String {
        let mut out = String::new();
        for stmt in &self.statements {
            let _ = writeln!(out, "{indent}{stmt}");
        }
        out
    }
}

/// Per-pass emission state.
///
/// Reference counts are computed over the live sub-graph of the outputs of
/// each [`emit`](Self::emit) call and dropped afterwards. A value referenced
/// more than once is materialized into `float {prefix}{index}`; values used
/// once are inlined into their consumer. Row reductions always get a
/// temporary. Array values are rendered for one element `j` of their
/// innermost axis; a materialized array becomes a local buffer sized by the
/// upper-cased axis name (`block_N` → `BLOCK_N`).
pub struct EmitContext<'g> {
    graph: &'g ExprGraph,
    prefix: String,
    bindings: HashMap<String, String>,
}

impl<'g> EmitContext<'g> {
    pub fn new(graph: &'g ExprGraph, prefix: &str) -> Self {
        Self {
            graph,
            prefix: prefix.to_string(),
            bindings: HashMap::new(),
        }
    }

    /// Render variable `name` as the C expression `code`.
    pub fn bind(&mut self, name: &str, code: impl Into<String>) -> &mut Self {
        self.bindings.insert(name.to_string(), code.into());
        self
    }

    /// Emit the given outputs.
    pub fn emit(&self, outputs: &[ExprId]) -> Result<Emitted> {
        for &o in outputs {
            self.graph.check(o)?;
        }
        let live = self.graph.live_set(outputs);
        let mut order: Vec<usize> = live.iter().copied().collect();
        order.sort_unstable();

        let mut refs: HashMap<usize, usize> = HashMap::new();
        for &i in &order {
            let node = self.graph.node(ExprId(i as u32));
            let mut prev = None;
            for operand in node.operands() {
                if prev != Some(operand) {
                    *refs.entry(operand.0 as usize).or_default() += 1;
                }
                prev = Some(operand);
            }
        }
        for o in outputs {
            *refs.entry(o.0 as usize).or_default() += 1;
        }

        let mut rendered: HashMap<usize, String> = HashMap::new();
        let mut statements = Vec::new();
        for &i in &order {
            let id = ExprId(i as u32);
            let node = self.graph.node(id);
            match node {
                Node::Var(sym) => {
                    let name = self.graph.symbol_name(sym);
                    let bound = self
                        .bindings
                        .get(name)
                        .ok_or_else(|| ExprError::UnboundVariable(name.to_string()))?;
                    rendered.insert(i, bound.clone());
                    continue;
                }
                Node::Const(bits) => {
                    rendered.insert(i, format_literal(f64::from_bits(bits)));
                    continue;
                }
                _ => {}
            }
            let r = |e: ExprId| rendered.get(&(e.0 as usize)).cloned().unwrap_or_default();
            let code = match node {
                Node::Var(_) | Node::Const(_) => continue,
                Node::Neg(a) => format!("(-{})", r(a)),
                Node::Abs(a) => format!("fabsf({})", r(a)),
                Node::Exp(a) => format!("__expf({})", r(a)),
                Node::Log(a) => format!("__logf({})", r(a)),
                Node::Add(a, b) => format!("({} + {})", r(a), r(b)),
                Node::Sub(a, b) => format!("({} - {})", r(a), r(b)),
                Node::Mul(a, b) => format!("({} * {})", r(a), r(b)),
                Node::Div(a, b) => format!("({} / {})", r(a), r(b)),
                Node::Max(a, b) => format!("fmaxf({}, {})", r(a), r(b)),
                Node::ReduceSum(a) => format!("reduce_sum({})", r(a)),
                Node::ReduceMax(a) => format!("reduce_max({})", r(a)),
            };
            let shared = refs.get(&i).copied().unwrap_or(0) > 1;
            if !shared && !node.is_reduction() {
                rendered.insert(i, code);
                continue;
            }
            let tmp = format!("{}{i}", self.prefix);
            if self.graph.kind(id) == ValueKind::Array {
                // Arrays are indexed by `j` along their innermost axis.
                let extent = self
                    .graph
                    .axes(id)
                    .last()
                    .map(|a| a.to_uppercase())
                    .unwrap_or_else(|| "1".to_string());
                statements.push(format!("float {tmp}[{extent}];"));
                statements.push(format!(
                    "for (int j = 0; j < {extent}; ++j) {tmp}[j] = {code};"
                ));
                rendered.insert(i, format!("{tmp}[j]"));
            } else {
                statements.push(format!("float {tmp} = {code};"));
                rendered.insert(i, tmp);
            }
        }

        let results = outputs
            .iter()
            .map(|o| rendered.get(&(o.0 as usize)).cloned().unwrap_or_default())
            .collect();
        Ok(Emitted {
            statements,
            results,
        })
    }
}

/// Format f64 as a CUDA float literal.
pub fn format_literal(v: f64) -> String {
    if v.is_nan() {
        return "NAN".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "INFINITY" } else { "(-INFINITY)" }.to_string();
    }
    let s = format!("{v}");
    let s = if s.contains('.') || s.contains('e') || s.contains('E') {
        s
    } else {
        format!("{s}.0")
    };
    if v < 0.0 {
        format!("({s}f)")
    } else {
        format!("{s}f")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ReduceOp;

    #[test]
    fn single_use_values_inline() {
        let mut g = ExprGraph::new();
        let q = g.scalar("q_idx");
        let k = g.scalar("kv_idx");
        let d = g.sub(q, k).unwrap();
        let mut ctx = EmitContext::new(&g, "t");
        ctx.bind("q_idx", "qi").bind("kv_idx", "ki");
        let out = ctx.emit(&[d]).unwrap();
        assert!(out.statements.is_empty());
        assert_eq!(out.results, vec!["(qi - ki)".to_string()]);
    }

    #[test]
    fn shared_values_materialize() {
        let mut g = ExprGraph::new();
        let x = g.scalar("x");
        let e = g.exp(x).unwrap();
        let sq = g.mul(e, e).unwrap();
        let f = g.add(sq, e).unwrap();
        let mut ctx = EmitContext::new(&g, "t");
        ctx.bind("x", "s");
        let out = ctx.emit(&[f]).unwrap();
        assert_eq!(out.statements, vec![format!("float t{} = __expf(s);", e.index())]);
        let t = format!("t{}", e.index());
        assert_eq!(out.results[0], format!("(({t} * {t}) + {t})"));
    }

    #[test]
    fn reductions_get_temporaries() {
        let mut g = ExprGraph::new();
        let s = g.array("scores", &["block_M", "block_N"]);
        let m = g.reduce(s, ReduceOp::Max).unwrap();
        let mut ctx = EmitContext::new(&g, "r");
        ctx.bind("scores", "acc_s[j]");
        let out = ctx.emit(&[m]).unwrap();
        assert_eq!(
            out.statements,
            vec![format!("float r{} = reduce_max(acc_s[j]);", m.index())]
        );
        assert_eq!(out.results[0], format!("r{}", m.index()));
    }

    #[test]
    fn shared_arrays_become_buffers() {
        let mut g = ExprGraph::new();
        let s = g.array("scores", &["block_M", "block_N"]);
        let m = g.var("m", ValueKind::Scalar, &["block_M"]);
        let d = g.sub(s, m).unwrap();
        let p = g.exp(d).unwrap();
        let sum = g.reduce(p, ReduceOp::Sum).unwrap();
        let mut ctx = EmitContext::new(&g, "t");
        ctx.bind("scores", "acc_s[j]").bind("m", "m");
        let out = ctx.emit(&[p, sum]).unwrap();
        let t = format!("t{}", p.index());
        assert_eq!(
            out.statements,
            vec![
                format!("float {t}[BLOCK_N];"),
                format!("for (int j = 0; j < BLOCK_N; ++j) {t}[j] = __expf((acc_s[j] - m));"),
                format!("float t{} = reduce_sum({t}[j]);", sum.index()),
            ]
        );
        assert_eq!(out.results[0], format!("{t}[j]"));
    }

    #[test]
    fn outputs_count_as_references() {
        let mut g = ExprGraph::new();
        let x = g.scalar("x");
        let e = g.exp(x).unwrap();
        let l = g.log(e).unwrap();
        let mut ctx = EmitContext::new(&g, "t");
        ctx.bind("x", "v");
        let out = ctx.emit(&[e, l]).unwrap();
        assert_eq!(out.statements.len(), 1);
        assert_eq!(out.results[1], format!("__logf(t{})", e.index()));
    }

    #[test]
    fn unbound_variable_rejected() {
        let mut g = ExprGraph::new();
        let x = g.scalar("x");
        let ctx = EmitContext::new(&g, "t");
        assert_eq!(
            ctx.emit(&[x]),
            Err(ExprError::UnboundVariable("x".to_string()))
        );
    }

    #[test]
    fn literal_formatting() {
        assert_eq!(format_literal(1.0), "1.0f");
        assert_eq!(format_literal(0.125), "0.125f");
        assert_eq!(format_literal(-2.0), "(-2.0f)");
        assert_eq!(format_literal(f64::NEG_INFINITY), "(-INFINITY)");
        assert_eq!(format_literal(f64::INFINITY), "INFINITY");
    }
}
