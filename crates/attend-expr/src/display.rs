//! Pretty-printing for expressions.

use std::collections::HashMap;

use crate::graph::ExprGraph;
use crate::node::{ExprId, Node};

impl ExprGraph {
    /// Format an expression as a human-readable string.
    ///
    /// Compound sub-expressions used more than once are printed a single
    /// time as `let tN = ...;` bindings ahead of the body, so the output
    /// stays linear in the size of the graph.
    pub fn fmt_expr(&self, expr: ExprId) -> String {
        let mut live: Vec<usize> = self.live_set(&[expr]).into_iter().collect();
        live.sort_unstable();

        let mut uses: HashMap<ExprId, usize> = HashMap::new();
        for &i in &live {
            for operand in self.nodes_slice()[i].operands() {
                *uses.entry(operand).or_default() += 1;
            }
        }

        let mut names: HashMap<ExprId, String> = HashMap::new();
        let mut out = String::new();
        for &i in &live {
            let id = ExprId::from_index(i as u32);
            let compound = !matches!(self.node(id), Node::Var(_) | Node::Const(_));
            if id != expr && compound && uses.get(&id).copied().unwrap_or(0) > 1 {
                let name = format!("t{i}");
                out.push_str(&format!("let {name} = {}; ", self.fmt_node(id, &names)));
                names.insert(id, name);
            }
        }
        out.push_str(&self.fmt_node(expr, &names));
        out
    }

    fn fmt_node(&self, expr: ExprId, names: &HashMap<ExprId, String>) -> String {
        if let Some(name) = names.get(&expr) {
            return name.clone();
        }
        let f = |id: ExprId| self.fmt_node(id, names);
        match self.node(expr) {
            Node::Var(sym) => self.symbol_name(sym).to_string(),
            Node::Const(bits) => {
                let v = f64::from_bits(bits);
                if v == v.trunc() && v.abs() < 1e15 {
                    format!("{}", v as i64)
                } else {
                    format!("{v}")
                }
            }
            Node::Add(a, b) => format!("({} + {})", f(a), f(b)),
            Node::Sub(a, b) => format!("({} - {})", f(a), f(b)),
            Node::Mul(a, b) => format!("({} * {})", f(a), f(b)),
            Node::Div(a, b) => format!("({} / {})", f(a), f(b)),
            Node::Max(a, b) => format!("max({}, {})", f(a), f(b)),
            Node::Neg(a) => format!("(-{})", f(a)),
            Node::Abs(a) => format!("abs({})", f(a)),
            Node::Exp(a) => format!("exp({})", f(a)),
            Node::Log(a) => format!("log({})", f(a)),
            Node::ReduceSum(a) => format!("reduce_sum({})", f(a)),
            Node::ReduceMax(a) => format!("reduce_max({})", f(a)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::ExprGraph;
    use crate::node::ReduceOp;

    #[test]
    fn display_simple() {
        let mut g = ExprGraph::new();
        let x = g.scalar("q_idx");
        let y = g.scalar("kv_idx");
        let d = g.sub(x, y).unwrap();
        assert_eq!(g.fmt_expr(d), "(q_idx - kv_idx)");

        let e = g.exp(d).unwrap();
        assert_eq!(g.fmt_expr(e), "exp((q_idx - kv_idx))");

        let m = g.max(x, y).unwrap();
        assert_eq!(g.fmt_expr(m), "max(q_idx, kv_idx)");
    }

    #[test]
    fn display_constants_and_reductions() {
        let mut g = ExprGraph::new();
        let two = g.constant(2.0);
        let half = g.constant(0.5);
        assert_eq!(g.fmt_expr(two), "2");
        assert_eq!(g.fmt_expr(half), "0.5");

        let s = g.array("scores", &["block_M", "block_N"]);
        let r = g.reduce(s, ReduceOp::Sum).unwrap();
        assert_eq!(g.fmt_expr(r), "reduce_sum(scores)");
    }

    #[test]
    fn shared_subterms_print_once() {
        let mut g = ExprGraph::new();
        let x = g.scalar("x");
        let d = g.sub(x, x).unwrap();
        let s = g.mul(d, d).unwrap();
        assert_eq!(g.fmt_expr(s), "let t1 = (x - x); (t1 * t1)");

        // squaring 40 times would be 2^40 leaves without sharing
        let mut e = x;
        for _ in 0..40 {
            e = g.mul(e, e).unwrap();
        }
        let text = g.fmt_expr(e);
        assert!(text.len() < 2000, "{}", text.len());
        assert_eq!(text.matches("let ").count(), 39);
    }
}
