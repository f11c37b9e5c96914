//! Block-sparse masks derived from the traced mask function.

use attend_expr::{Env, ExprError, ExprGraph, ExprId, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::meta::ShapeMeta;

/// Which `(query block, key block)` tiles contain at least one kept element.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMask {
    pub q_blocks: usize,
    pub kv_blocks: usize,
    pub block_m: usize,
    pub block_n: usize,
    /// Row-major over `[q_blocks, kv_blocks]`.
    pub active: Vec<bool>,
}

impl BlockMask {
    /// Every block active.
    pub fn dense(meta: &ShapeMeta, block_m: usize, block_n: usize) -> Self {
        let q_blocks = meta.q_len.div_ceil(block_m);
        let kv_blocks = meta.kv_len.div_ceil(block_n);
        Self {
            q_blocks,
            kv_blocks,
            block_m,
            block_n,
            active: vec![true; q_blocks * kv_blocks],
        }
    }

    /// Evaluate `mask` over the whole score matrix.
    ///
    /// A tile is active when any `(b, h)` keeps an element in it. Masks
    /// that never read `b` or `h` are evaluated once at `0`. The query
    /// coordinate is the absolute position `q + kv_len - q_len`. Masks that
    /// read custom tensors cannot be evaluated at compile time and are
    /// rejected.
    pub fn infer(
        graph: &ExprGraph,
        mask: ExprId,
        meta: &ShapeMeta,
        block_m: usize,
        block_n: usize,
    ) -> Result<Self> {
        let mut out = Self::dense(meta, block_m, block_n);
        let offset = meta.kv_len - meta.q_len;
        let live = graph.live_set(&[mask]);
        let reads = |name: &str| {
            live.iter()
                .any(|&i| graph.var_name(ExprId::from_index(i as u32)) == Some(name))
        };
        let batches = if reads("b") { meta.batch } else { 1 };
        let heads = if reads("h") { meta.q_heads } else { 1 };
        let mut env = Env::new();

        for qb in 0..out.q_blocks {
            for kb in 0..out.kv_blocks {
                let kv_lo = kb * block_n;
                let kv_hi = (kv_lo + block_n).min(meta.kv_len);
                env.bind(
                    "kv_idx",
                    Value::Row((kv_lo..kv_hi).map(|k| k as f64).collect()),
                );
                let q_lo = qb * block_m;
                let q_hi = (q_lo + block_m).min(meta.q_len);
                let mut any = false;
                'search: for b in 0..batches {
                    env.bind("b", Value::Scalar(b as f64));
                    for h in 0..heads {
                        env.bind("h", Value::Scalar(h as f64));
                        for q in q_lo..q_hi {
                            env.bind("q_idx", Value::Scalar((q + offset) as f64));
                            if kept(graph, mask, &env)? {
                                any = true;
                                break 'search;
                            }
                        }
                    }
                }
                out.active[qb * out.kv_blocks + kb] = any;
            }
        }
        debug!(
            active = out.active_count(),
            total = out.active.len(),
            "inferred block mask"
        );
        Ok(out)
    }

    /// `false` outside the grid.
    pub fn is_active(&self, q_block: usize, kv_block: usize) -> bool {
        if kv_block >= self.kv_blocks {
            return false;
        }
        self.active
            .get(q_block * self.kv_blocks + kv_block)
            .copied()
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    /// `0`/`1` bytes, the layout kernels receive.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.active.iter().map(|&a| a as u8).collect()
    }
}

fn kept(graph: &ExprGraph, mask: ExprId, env: &Env) -> Result<bool> {
    match graph.eval(mask, env) {
        Ok(Value::Scalar(v)) => Ok(v >= 0.0),
        Ok(Value::Row(r)) => Ok(r.iter().any(|&v| v >= 0.0)),
        Err(ExprError::UnboundVariable(name)) => Err(EngineError::LoweringFailure(format!(
            "block mask inference cannot read `{name}`"
        ))),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attend_expr::Sym;

    fn causal() -> (ExprGraph, ExprId) {
        let (g, m) = attend_expr::trace(|| {
            let q = Sym::scalar("q_idx");
            let k = Sym::scalar("kv_idx");
            q - k
        })
        .unwrap();
        (g, m.id())
    }

    #[test]
    fn causal_prefill_is_lower_triangular() {
        let (g, m) = causal();
        let meta = ShapeMeta::new(1, 1, 128, 128, 64);
        let bm = BlockMask::infer(&g, m, &meta, 32, 32).unwrap();
        assert_eq!((bm.q_blocks, bm.kv_blocks), (4, 4));
        for qb in 0..4 {
            for kb in 0..4 {
                assert_eq!(bm.is_active(qb, kb), kb <= qb, "block ({qb}, {kb})");
            }
        }
        assert_eq!(bm.active_count(), 10);
    }

    #[test]
    fn causal_decode_sees_every_key() {
        let (g, m) = causal();
        let meta = ShapeMeta::new(1, 8, 1, 100, 64);
        let bm = BlockMask::infer(&g, m, &meta, 64, 32).unwrap();
        assert_eq!(bm.kv_blocks, 4);
        assert_eq!(bm.active_count(), 4);
    }

    #[test]
    fn tensor_masks_cannot_be_inferred() {
        let (g, m) = attend_expr::trace(|| Sym::tensor("doc_ids") - Sym::scalar("kv_idx")).unwrap();
        let meta = ShapeMeta::new(1, 1, 64, 64, 64);
        assert!(matches!(
            BlockMask::infer(&g, m.id(), &meta, 32, 32),
            Err(EngineError::LoweringFailure(_))
        ));
    }

    #[test]
    fn head_dependent_mask_unions_over_heads() {
        // head h keeps keys up to h * 32
        let (g, m) = attend_expr::trace(|| Sym::scalar("h") * 32.0 - Sym::scalar("kv_idx")).unwrap();
        let meta = ShapeMeta::new(1, 3, 128, 128, 64);
        let bm = BlockMask::infer(&g, m.id(), &meta, 64, 32).unwrap();
        // key blocks 0..=2 hold a kept key for some head, block 3 never does
        for qb in 0..2 {
            assert_eq!(
                (0..4).map(|kb| bm.is_active(qb, kb)).collect::<Vec<_>>(),
                vec![true, true, true, false]
            );
        }

        let single = ShapeMeta::new(1, 1, 128, 128, 64);
        assert_eq!(BlockMask::infer(&g, m.id(), &single, 64, 32).unwrap().active_count(), 2);
    }

    #[test]
    fn out_of_range_blocks_are_inactive() {
        let meta = ShapeMeta::new(1, 1, 64, 64, 64);
        let bm = BlockMask::dense(&meta, 32, 32);
        assert!(bm.is_active(1, 1));
        assert!(!bm.is_active(2, 0));
        assert!(!bm.is_active(0, 2));
        assert_eq!(bm.to_bytes(), vec![1; 4]);
    }
}
