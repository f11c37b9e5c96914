//! Grouped-query decode.
//!
//! One thread block per `(key/value head, batch)`; the `GROUP` query heads
//! that share the head are processed together so each key tile is loaded
//! once. A mask, when present, is always turned into a block mask.

use tracing::debug;

use super::mask::BlockMask;
use super::{
    common_defines, finish, forward_parts, pad, render, LoweredKernel, LoweringRequest,
    LoweringTarget, REDUCE_HELPERS,
};
use crate::error::{EngineError, Result};
use crate::select::KernelTemplate;

const FORWARD: &str = r#"#include <cuda_fp16.h>
#include <cuda_bf16.h>
#include <math.h>

{{DEFINES}}
#define KV_BLOCKS ((LK + BLOCK_N - 1) / BLOCK_N)
#define ROWS (GROUP * LQ)
{{REDUCE}}
extern "C" __global__ void __launch_bounds__(NUM_THREADS)
attention_fwd(const elem_t* __restrict__ Q, const elem_t* __restrict__ K,
              const elem_t* __restrict__ V, float* __restrict__ O{{PARAMS}}{{MASK_PARAM}})
{
    const int hk = blockIdx.x;
    const int b = blockIdx.y;
    const size_t kv_head = (size_t)(b * HKV + hk) * LK;
    __shared__ elem_t k_tile[BLOCK_N * HEAD_DIM];
    __shared__ elem_t v_tile[BLOCK_N * DIM];

    for (int r0 = 0; r0 < ROWS; r0 += BLOCK_M) {
        const int r = r0 + (int)threadIdx.x;
        const bool active = threadIdx.x < BLOCK_M && r < ROWS;
        const int h = hk * GROUP + r / LQ;
        const int q_row = r % LQ;
        const int q_idx = q_row + (LK - LQ);
        const int row = (b * HQ + h) * LQ + q_row;
        const elem_t* q = Q + (size_t)row * HEAD_DIM;
        float acc_o[DIM];
        float acc_s[BLOCK_N];
        for (int j = 0; j < DIM; ++j) acc_o[j] = 0.0f;
{{STATE_INIT}}
        for (int kv_block = 0; kv_block < KV_BLOCKS; ++kv_block) {
{{BLOCK_SKIP}}
            const int kv_base = kv_block * BLOCK_N;
            __syncthreads();
            for (int i = threadIdx.x; i < BLOCK_N * HEAD_DIM; i += NUM_THREADS) {
                const int n = kv_base + i / HEAD_DIM;
                k_tile[i] = n < LK ? K[(kv_head + n) * HEAD_DIM + i % HEAD_DIM] : (elem_t)0.0f;
            }
            for (int i = threadIdx.x; i < BLOCK_N * DIM; i += NUM_THREADS) {
                const int n = kv_base + i / DIM;
                v_tile[i] = n < LK ? V[(kv_head + n) * DIM + i % DIM] : (elem_t)0.0f;
            }
            __syncthreads();
            if (!active) continue;
            for (int j = 0; j < BLOCK_N; ++j) {
                const int kv_idx = kv_base + j;
                if (kv_idx >= LK) { acc_s[j] = MASK_VALUE; continue; }
                float s_raw = 0.0f;
                for (int d = 0; d < HEAD_DIM; ++d) s_raw += (float)q[d] * (float)k_tile[j * HEAD_DIM + d];
{{SCORE}}
{{MASK}}
                acc_s[j] = keep ? s : MASK_VALUE;
            }
{{ONLINE}}
            for (int j = 0; j < DIM; ++j) acc_o[j] *= o_scale;
            for (int n = 0; n < BLOCK_N && kv_base + n < LK; ++n)
                for (int j = 0; j < DIM; ++j) acc_o[j] += acc_s[n] * (float)v_tile[n * DIM + j];
        }
        if (!active) continue;
{{EPILOGUE}}
        for (int j = 0; j < DIM; ++j) O[(size_t)row * DIM + j] = acc_o[j];
    }
}
"#;

pub struct DecodeGqaTemplate;

impl LoweringTarget for DecodeGqaTemplate {
    fn template(&self) -> KernelTemplate {
        KernelTemplate::DecodeGqa
    }

    fn lower(&self, req: &LoweringRequest<'_>) -> Result<LoweredKernel> {
        let meta = &req.meta;
        if meta.group_size() < 2 {
            return Err(EngineError::LoweringFailure(format!(
                "decode_gqa needs grouped heads, got q_heads={} kv_heads={}",
                meta.q_heads, meta.kv_heads
            )));
        }
        let t = req.traced;
        let cfg = req.config;
        // Query blocks are indexed by the query position; every query head
        // of the group sees the same mask.
        let block_mask = match t.mask {
            Some(m) => Some(BlockMask::infer(&t.graph, m, meta, cfg.block_m, cfg.block_n)?),
            None => None,
        };
        let (mask_param, skip) = match &block_mask {
            Some(bm) => (
                ", const unsigned char* __restrict__ block_mask".to_string(),
                format!(
                    "if (!block_mask[(q_row / {}) * KV_BLOCKS + kv_block]) continue;",
                    bm.block_m
                ),
            ),
            None => (String::new(), String::new()),
        };

        let fwd = forward_parts(req)?;
        let source = render(
            FORWARD,
            &[
                ("DEFINES", common_defines(req, &cfg)),
                ("REDUCE", REDUCE_HELPERS.to_string()),
                ("PARAMS", fwd.params),
                ("MASK_PARAM", mask_param),
                ("STATE_INIT", pad(&fwd.state_init, 8)),
                ("BLOCK_SKIP", pad(&skip, 12)),
                ("SCORE", pad(&fwd.score, 16)),
                ("MASK", pad(&fwd.mask, 16)),
                ("ONLINE", pad(&fwd.online, 12)),
                ("EPILOGUE", pad(&fwd.epilogue, 8)),
            ],
        );
        debug!(
            template = "decode_gqa",
            group = meta.group_size(),
            block_mask = block_mask.is_some(),
            "lowered kernel"
        );
        finish(KernelTemplate::DecodeGqa, req, source, block_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_io::{CustomIO, CustomInputs};
    use crate::meta::ShapeMeta;
    use crate::online::{AttnIndex, Softmax};
    use crate::trace::trace_configuration;
    use crate::tune::TunedConfig;
    use attend_expr::Sym;

    fn request<'a>(traced: &'a crate::trace::TracedAttention, meta: ShapeMeta) -> LoweringRequest<'a> {
        LoweringRequest {
            traced,
            meta,
            mask_value: f64::NEG_INFINITY,
            config: TunedConfig::default_for(KernelTemplate::DecodeGqa, &meta),
            config_bwd: None,
            infer_mask: false,
        }
    }

    #[test]
    fn sliding_window_mask_is_always_inferred() {
        // Keep the last 100 keys only.
        let window = |idx: &AttnIndex, _: &CustomInputs| {
            Sym::constant(99.0) - (idx.q_idx - idx.kv_idx)
        };
        let traced = trace_configuration(&CustomIO::new(), None, Some(&window), &Softmax, false).unwrap();
        let meta = ShapeMeta::new(1, 32, 1, 1024, 64).with_kv_heads(8);
        let k = DecodeGqaTemplate.lower(&request(&traced, meta)).unwrap();
        let bm = k.block_mask.unwrap();
        assert_eq!(bm.kv_blocks, 16);
        // keys 924..1023 span blocks 14 and 15
        assert_eq!(bm.active_count(), 2);
        assert!(bm.is_active(0, 14) && bm.is_active(0, 15));
        assert!(k.source.contains("#define GROUP 4"));
    }

    #[test]
    fn unmasked_decode_is_dense() {
        let traced = trace_configuration(&CustomIO::new(), None, None, &Softmax, false).unwrap();
        let meta = ShapeMeta::new(1, 32, 1, 1024, 64).with_kv_heads(8);
        let k = DecodeGqaTemplate.lower(&request(&traced, meta)).unwrap();
        assert!(k.block_mask.is_none());
        assert!(!k.source.contains("block_mask"));
    }
}
