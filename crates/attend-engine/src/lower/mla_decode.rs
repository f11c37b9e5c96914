//! Multi-latent-attention decode.
//!
//! Keys and values share one compressed latent cache `KV` of width
//! `HEAD_DIM`; the value is its leading `DIM` columns. Query heads are
//! grouped over the latent heads the same way as grouped-query decode.

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
#define ROWS (GROUP * LQ)
{{REDUCE}}
extern "C" __global__ void __launch_bounds__(NUM_THREADS)
attention_fwd(const elem_t* __restrict__ Q, const elem_t* __restrict__ KV,
              float* __restrict__ O{{PARAMS}})
{
    const int hk = blockIdx.x;
    const int b = blockIdx.y;
    const size_t kv_head = (size_t)(b * HKV + hk) * LK;
    __shared__ elem_t kv_tile[BLOCK_N * HEAD_DIM];

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
            const int kv_base = kv_block * BLOCK_N;
            __syncthreads();
            for (int i = threadIdx.x; i < BLOCK_N * HEAD_DIM; i += NUM_THREADS) {
                const int n = kv_base + i / HEAD_DIM;
                kv_tile[i] = n < LK ? KV[(kv_head + n) * HEAD_DIM + i % HEAD_DIM] : (elem_t)0.0f;
            }
            __syncthreads();
            if (!active) continue;
            for (int j = 0; j < BLOCK_N; ++j) {
                const int kv_idx = kv_base + j;
                if (kv_idx >= LK) { acc_s[j] = MASK_VALUE; continue; }
                float s_raw = 0.0f;
                for (int d = 0; d < HEAD_DIM; ++d) s_raw += (float)q[d] * (float)kv_tile[j * HEAD_DIM + d];
{{SCORE}}
{{MASK}}
                acc_s[j] = keep ? s : MASK_VALUE;
            }
{{ONLINE}}
            for (int j = 0; j < DIM; ++j) acc_o[j] *= o_scale;
            for (int n = 0; n < BLOCK_N && kv_base + n < LK; ++n)
                for (int j = 0; j < DIM; ++j) acc_o[j] += acc_s[n] * (float)kv_tile[n * HEAD_DIM + j];
        }
        if (!active) continue;
{{EPILOGUE}}
        for (int j = 0; j < DIM; ++j) O[(size_t)row * DIM + j] = acc_o[j];
    }
}
"#;

pub struct MlaDecodeTemplate;

impl LoweringTarget for MlaDecodeTemplate {
    fn template(&self) -> KernelTemplate {
        KernelTemplate::MlaDecode
    }

    fn lower(&self, req: &LoweringRequest<'_>) -> Result<LoweredKernel> {
        let meta = &req.meta;
        if meta.value_dim > meta.head_dim {
            return Err(EngineError::LoweringFailure(format!(
                "mla_decode reads values from the latent cache; value_dim {} exceeds head_dim {}",
                meta.value_dim, meta.head_dim
            )));
        }
        let fwd = forward_parts(req)?;
        let source = render(
            FORWARD,
            &[
                ("DEFINES", common_defines(req, &req.config)),
                ("REDUCE", REDUCE_HELPERS.to_string()),
                ("PARAMS", fwd.params),
                ("STATE_INIT", pad(&fwd.state_init, 8)),
                ("SCORE", pad(&fwd.score, 16)),
                ("MASK", pad(&fwd.mask, 16)),
                ("ONLINE", pad(&fwd.online, 12)),
                ("EPILOGUE", pad(&fwd.epilogue, 8)),
            ],
        );
        debug!(template = "mla_decode", latent = meta.head_dim, "lowered kernel");
        finish(KernelTemplate::MlaDecode, req, source, None)
    }
}
