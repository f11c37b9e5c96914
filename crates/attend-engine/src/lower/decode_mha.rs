//! Decode with one key/value head per query head.
//!
//! Few query rows against a long key sequence: one thread block per
//! `(query row, head, batch)`. All threads stage key and value tiles in
//! shared memory; the row itself is reduced by a single thread.

use tracing::debug;

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
{{REDUCE}}
extern "C" __global__ void __launch_bounds__(NUM_THREADS)
attention_fwd(const elem_t* __restrict__ Q, const elem_t* __restrict__ K,
              const elem_t* __restrict__ V, float* __restrict__ O{{PARAMS}})
{
    const int q_row = blockIdx.x;
    const int h = blockIdx.y;
    const int b = blockIdx.z;
    const int q_idx = q_row + (LK - LQ);
    const int row = (b * HQ + h) * LQ + q_row;
    const elem_t* q = Q + (size_t)row * HEAD_DIM;
    const size_t kv_head = (size_t)(b * HKV + h) * LK;

    __shared__ elem_t k_tile[BLOCK_N * HEAD_DIM];
    __shared__ elem_t v_tile[BLOCK_N * DIM];
    float acc_o[DIM];
    float acc_s[BLOCK_N];
    for (int j = 0; j < DIM; ++j) acc_o[j] = 0.0f;
{{STATE_INIT}}
    for (int kv_block = 0; kv_block < KV_BLOCKS; ++kv_block) {
        const int kv_base = kv_block * BLOCK_N;
        for (int i = threadIdx.x; i < BLOCK_N * HEAD_DIM; i += NUM_THREADS) {
            const int n = kv_base + i / HEAD_DIM;
            k_tile[i] = n < LK ? K[(kv_head + n) * HEAD_DIM + i % HEAD_DIM] : (elem_t)0.0f;
        }
        for (int i = threadIdx.x; i < BLOCK_N * DIM; i += NUM_THREADS) {
            const int n = kv_base + i / DIM;
            v_tile[i] = n < LK ? V[(kv_head + n) * DIM + i % DIM] : (elem_t)0.0f;
        }
        __syncthreads();
        if (threadIdx.x == 0) {
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
        __syncthreads();
    }
    if (threadIdx.x != 0) return;
{{EPILOGUE}}
    for (int j = 0; j < DIM; ++j) O[(size_t)row * DIM + j] = acc_o[j];
}
"#;

pub struct DecodeMhaTemplate;

impl LoweringTarget for DecodeMhaTemplate {
    fn template(&self) -> KernelTemplate {
        KernelTemplate::DecodeMha
    }

    fn lower(&self, req: &LoweringRequest<'_>) -> Result<LoweredKernel> {
        if req.meta.group_size() != 1 {
            return Err(EngineError::LoweringFailure(format!(
                "decode_mha needs q_heads == kv_heads, got {} and {}",
                req.meta.q_heads, req.meta.kv_heads
            )));
        }
        let fwd = forward_parts(req)?;
        let source = render(
            FORWARD,
            &[
                ("DEFINES", common_defines(req, &req.config)),
                ("REDUCE", REDUCE_HELPERS.to_string()),
                ("PARAMS", fwd.params),
                ("STATE_INIT", pad(&fwd.state_init, 4)),
                ("SCORE", pad(&fwd.score, 16)),
                ("MASK", pad(&fwd.mask, 16)),
                ("ONLINE", pad(&fwd.online, 12)),
                ("EPILOGUE", pad(&fwd.epilogue, 4)),
            ],
        );
        debug!(template = "decode_mha", "lowered kernel");
        finish(KernelTemplate::DecodeMha, req, source, None)
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

    #[test]
    fn decode_mha_has_no_block_mask() {
        let causal = |idx: &AttnIndex, _: &CustomInputs| idx.q_idx - idx.kv_idx;
        let traced = trace_configuration(&CustomIO::new(), None, Some(&causal), &Softmax, false).unwrap();
        let meta = ShapeMeta::new(2, 8, 1, 1000, 128);
        let req = LoweringRequest {
            traced: &traced,
            meta,
            mask_value: f64::NEG_INFINITY,
            config: TunedConfig::default_for(KernelTemplate::DecodeMha, &meta),
            config_bwd: None,
            infer_mask: true,
        };
        let k = DecodeMhaTemplate.lower(&req).unwrap();
        assert!(k.block_mask.is_none());
        assert!(k.source.contains("#define LK 1000"));
        assert!(k.source.contains("#define BLOCK_M 1"));
        assert!(!k.source.contains("attention_bwd"));
    }
}
