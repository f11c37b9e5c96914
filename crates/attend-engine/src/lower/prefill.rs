//! Prefill: equal query and key lengths, forward and backward kernels.

use tracing::debug;

use super::mask::BlockMask;
use super::{
    backward_parts, common_defines, finish, forward_parts, pad, render, LoweredKernel,
    LoweringRequest, LoweringTarget, REDUCE_HELPERS,
};
use crate::error::Result;
use crate::select::KernelTemplate;

const FORWARD: &str = r#"#include <cuda_fp16.h>
#include <cuda_bf16.h>
#include <math.h>

{{DEFINES}}
#define KV_BLOCKS ((LK + BLOCK_N - 1) / BLOCK_N)
{{REDUCE}}
extern "C" __global__ void __launch_bounds__(NUM_THREADS)
attention_fwd(const elem_t* __restrict__ Q, const elem_t* __restrict__ K,
              const elem_t* __restrict__ V, float* __restrict__ O{{PARAMS}}{{MASK_PARAM}})
{
    const int b = blockIdx.z;
    const int h = blockIdx.y;
    const int hk = h / GROUP;
    const int q_block = blockIdx.x;
    for (int t = threadIdx.x; t < BLOCK_M; t += NUM_THREADS) {
        const int q_row = q_block * BLOCK_M + t;
        if (q_row >= LQ) break;
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
            for (int j = 0; j < BLOCK_N; ++j) {
                const int kv_idx = kv_base + j;
                if (kv_idx >= LK) { acc_s[j] = MASK_VALUE; continue; }
                const elem_t* k = K + ((size_t)(b * HKV + hk) * LK + kv_idx) * HEAD_DIM;
                float s_raw = 0.0f;
                for (int d = 0; d < HEAD_DIM; ++d) s_raw += (float)q[d] * (float)k[d];
{{SCORE}}
{{MASK}}
                acc_s[j] = keep ? s : MASK_VALUE;
            }
{{ONLINE}}
            for (int j = 0; j < DIM; ++j) acc_o[j] *= o_scale;
            for (int n = 0; n < BLOCK_N && kv_base + n < LK; ++n) {
                const elem_t* v = V + ((size_t)(b * HKV + hk) * LK + kv_base + n) * DIM;
                for (int j = 0; j < DIM; ++j) acc_o[j] += acc_s[n] * (float)v[j];
            }
        }
{{EPILOGUE}}
        for (int j = 0; j < DIM; ++j) O[(size_t)row * DIM + j] = acc_o[j];
    }
}
"#;

const BACKWARD: &str = r#"
{{BWD_DEFINES}}
extern "C" __global__ void __launch_bounds__(BWD_NUM_THREADS)
attention_bwd(const elem_t* __restrict__ Q, const elem_t* __restrict__ K,
              const elem_t* __restrict__ V, const float* __restrict__ dO,
              const float* __restrict__ doosum, float* __restrict__ dQ,
              float* __restrict__ dK, float* __restrict__ dV{{PARAMS}}{{MASK_PARAM}})
{
    const int b = blockIdx.z;
    const int h = blockIdx.y;
    const int hk = h / GROUP;
    const int q_block = blockIdx.x;
    for (int t = threadIdx.x; t < BWD_BLOCK_M; t += BWD_NUM_THREADS) {
        const int q_row = q_block * BWD_BLOCK_M + t;
        if (q_row >= LQ) break;
        const int q_idx = q_row + (LK - LQ);
        const int row = (b * HQ + h) * LQ + q_row;
        const elem_t* q = Q + (size_t)row * HEAD_DIM;
        const float* d_o = dO + (size_t)row * DIM;
        const float doosum_row = doosum[row];
{{LOAD_FINAL}}
        float dq[HEAD_DIM];
        for (int d = 0; d < HEAD_DIM; ++d) dq[d] = 0.0f;
        for (int kv_idx = 0; kv_idx < LK; ++kv_idx) {
{{BLOCK_SKIP}}
            const size_t kv_row = (size_t)(b * HKV + hk) * LK + kv_idx;
            const elem_t* k = K + kv_row * HEAD_DIM;
            const elem_t* v = V + kv_row * DIM;
            float s_raw = 0.0f;
            for (int d = 0; d < HEAD_DIM; ++d) s_raw += (float)q[d] * (float)k[d];
{{MASK}}
            if (!keep) continue;
            float dp = 0.0f;
            for (int j = 0; j < DIM; ++j) dp += d_o[j] * (float)v[j];
{{BODY}}
            for (int d = 0; d < HEAD_DIM; ++d) {
                dq[d] += ds * (float)k[d];
                atomicAdd(&dK[kv_row * HEAD_DIM + d], ds * (float)q[d]);
            }
            for (int j = 0; j < DIM; ++j) atomicAdd(&dV[kv_row * DIM + j], p * d_o[j]);
        }
        for (int d = 0; d < HEAD_DIM; ++d) dQ[(size_t)row * HEAD_DIM + d] = dq[d];
    }
}
"#;

const MASK_PARAM: &str = ", const unsigned char* __restrict__ block_mask";
const SKIP_FWD: &str = "if (!block_mask[q_block * KV_BLOCKS + kv_block]) continue;";

pub struct PrefillTemplate;

impl LoweringTarget for PrefillTemplate {
    fn template(&self) -> KernelTemplate {
        KernelTemplate::Prefill
    }

    fn lower(&self, req: &LoweringRequest<'_>) -> Result<LoweredKernel> {
        let t = req.traced;
        let cfg = req.config;
        let block_mask = match t.mask {
            Some(m) if req.infer_mask => {
                Some(BlockMask::infer(&t.graph, m, &req.meta, cfg.block_m, cfg.block_n)?)
            }
            _ => None,
        };
        let (mask_param, skip) = match &block_mask {
            Some(_) => (MASK_PARAM, SKIP_FWD),
            None => ("", ""),
        };

        let fwd = forward_parts(req)?;
        let mut source = render(
            FORWARD,
            &[
                ("DEFINES", common_defines(req, &cfg)),
                ("REDUCE", REDUCE_HELPERS.to_string()),
                ("PARAMS", fwd.params),
                ("MASK_PARAM", mask_param.to_string()),
                ("STATE_INIT", pad(&fwd.state_init, 8)),
                ("BLOCK_SKIP", pad(skip, 12)),
                ("SCORE", pad(&fwd.score, 16)),
                ("MASK", pad(&fwd.mask, 16)),
                ("ONLINE", pad(&fwd.online, 12)),
                ("EPILOGUE", pad(&fwd.epilogue, 8)),
            ],
        );

        if let Some(cfg_bwd) = req.config_bwd {
            let bwd = backward_parts(req)?;
            // The backward kernel walks keys one at a time; the forward
            // block mask still applies per key block.
            let skip_bwd = match &block_mask {
                Some(bm) => format!(
                    "if (!block_mask[(q_row / {}) * KV_BLOCKS + kv_idx / BLOCK_N]) continue;",
                    bm.block_m
                ),
                None => String::new(),
            };
            let defines = format!(
                "#define BWD_BLOCK_M {}\n#define BWD_NUM_THREADS {}\n",
                cfg_bwd.block_m, cfg_bwd.num_threads
            );
            source.push_str(&render(
                BACKWARD,
                &[
                    ("BWD_DEFINES", defines),
                    ("PARAMS", bwd.params),
                    ("MASK_PARAM", mask_param.to_string()),
                    ("LOAD_FINAL", pad(&bwd.load_final, 8)),
                    ("BLOCK_SKIP", pad(&skip_bwd, 12)),
                    ("MASK", pad(&fwd.mask, 12)),
                    ("BODY", pad(&bwd.body, 12)),
                ],
            ));
        }

        debug!(
            template = "prefill",
            backward = req.config_bwd.is_some(),
            block_mask = block_mask.is_some(),
            "lowered kernel"
        );
        finish(KernelTemplate::Prefill, req, source, block_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_io::{CustomIO, CustomInputs, Dim};
    use crate::meta::ShapeMeta;
    use crate::online::{AttnIndex, Softmax};
    use crate::trace::trace_configuration;
    use crate::tune::TunedConfig;
    use attend_expr::Sym;

    fn lower(infer_mask: bool, with_backward: bool) -> LoweredKernel {
        let causal = |idx: &AttnIndex, _: &CustomInputs| idx.q_idx - idx.kv_idx;
        let traced =
            trace_configuration(&CustomIO::new(), None, Some(&causal), &Softmax, with_backward).unwrap();
        let meta = ShapeMeta::new(1, 2, 256, 256, 64);
        let config = TunedConfig::default_for(KernelTemplate::Prefill, &meta);
        let req = LoweringRequest {
            traced: &traced,
            meta,
            mask_value: f64::NEG_INFINITY,
            config,
            config_bwd: with_backward.then_some(config),
            infer_mask,
        };
        PrefillTemplate.lower(&req).unwrap()
    }

    #[test]
    fn forward_and_backward_entries() {
        let k = lower(false, true);
        assert!(k.source.contains("attention_fwd("));
        assert!(k.source.contains("attention_bwd("));
        assert!(k.source.contains("#define MASK_VALUE (-INFINITY)"));
        assert!(k.source.contains("bool keep = ((q_idx - kv_idx)) >= 0.0f;"));
        assert!(!k.source.contains("{{"));
        assert!(k.block_mask.is_none());
    }

    #[test]
    fn block_mask_only_when_inferred() {
        let k = lower(true, false);
        let bm = k.block_mask.unwrap();
        assert_eq!((bm.q_blocks, bm.kv_blocks), (2, 2));
        assert_eq!(bm.active_count(), 3);
        assert!(k.source.contains("block_mask[q_block * KV_BLOCKS + kv_block]"));
        assert!(!k.source.contains("attention_bwd("));
    }

    #[test]
    fn custom_tensors_become_parameters() {
        let io = CustomIO::new().with("alibi", &[Dim::Heads]).unwrap();
        let score = |s: Sym, idx: &AttnIndex, io: &CustomInputs| {
            s + io.get("alibi").unwrap() * (idx.kv_idx - idx.q_idx)
        };
        let traced = trace_configuration(&io, Some(&score), None, &Softmax, false).unwrap();
        let meta = ShapeMeta::new(1, 2, 64, 64, 64);
        let req = LoweringRequest {
            traced: &traced,
            meta,
            mask_value: f64::NEG_INFINITY,
            config: TunedConfig::default_for(KernelTemplate::Prefill, &meta),
            config_bwd: None,
            infer_mask: false,
        };
        let k = PrefillTemplate.lower(&req).unwrap();
        assert!(k.source.contains("const float* __restrict__ io_alibi"));
        assert!(k.source.contains("io_alibi[(0 * HQ + h)]"));
    }
}
