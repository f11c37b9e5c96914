//! attend-engine: compile custom attention variants into kernel source.
//!
//! Builds on [`attend_expr`] to turn user score, mask and online-reduction
//! functions into specialized attention kernels:
//!
//! - **Template selection**: prefill, decode (MHA / GQA) or MLA decode
//!   from the shape metadata
//! - **Lowering**: traced graphs spliced into CUDA C kernel templates,
//!   with a backward kernel for prefill and inferred block masks
//! - **Caching**: generated source stored under its BLAKE3 digest
//! - **Loading**: pluggable [`KernelBackend`]s; [`HostBackend`] runs the
//!   program on the CPU
//!
//! # Example
//!
//! ```no_run
//! use attend_engine::{
//!     AttentionEngine, AttnIndex, CustomIO, CustomInputs, EngineOptions, HostTensor, ShapeMeta,
//!     Softmax,
//! };
//!
//! let meta = ShapeMeta::new(1, 4, 128, 128, 64);
//! let causal = |idx: &AttnIndex, _: &CustomInputs| idx.q_idx - idx.kv_idx;
//! let attn = AttentionEngine::build(
//!     meta,
//!     &CustomIO::new(),
//!     None,
//!     Some(&causal),
//!     &Softmax,
//!     &EngineOptions { infer_mask: true, ..Default::default() },
//! )?;
//!
//! let q = HostTensor::zeros(&[1, 4, 128, 64]);
//! let out = attn.invoke(&q, &q, &q, &[])?;
//! assert_eq!(out.shape(), &[1, 4, 128, 64]);
//! # Ok::<(), attend_engine::EngineError>(())
//! ```

pub mod backend;
pub mod cache;
pub mod custom_io;
mod engine;
pub mod error;
pub mod host;
pub mod lower;
pub mod meta;
pub mod online;
pub mod select;
pub mod tensor;
pub mod trace;
pub mod tune;
pub mod wire;

pub use backend::{AttentionKernel, KernelArg, KernelBackend, LoadedModule};
pub use cache::{CacheEntry, KernelCache};
pub use custom_io::{CustomIO, CustomInputs, Dim, TensorDecl};
pub use engine::{
    AttentionEngine, CacheConfig, CompiledAttention, EngineOptions, CACHE_DIR_ENV, DEFAULT_CACHE_DIR,
};
pub use error::{EngineError, Result};
pub use host::HostBackend;
pub use lower::{BlockMask, KernelManifest, LoweredKernel, LoweringRequest, LoweringTarget};
pub use meta::{DType, ShapeMeta, TensorMeta};
pub use online::{AttnIndex, Identity, OnlineFunc, OnlinePhase, OnlineStep, RowIndex, RowScales, Softmax};
pub use select::{select_template, KernelTemplate};
pub use tensor::HostTensor;
pub use trace::{trace_configuration, MaskFn, ScoreFn, TracedAttention};
pub use tune::{Autotuner, DeviceArch, HeuristicTuner, TunedConfig, TuningOptions};
