//! The top-level compile pipeline.
//!
//! `AttentionEngine::build` validates the shapes, selects a template,
//! traces the user functions, resolves tile configurations, lowers to
//! source, stores the source in the content-addressed cache and loads it
//! through the configured backend.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::{KernelArg, KernelBackend, LoadedModule};
use crate::cache::KernelCache;
use crate::custom_io::CustomIO;
use crate::error::{EngineError, Result};
use crate::host::HostBackend;
use crate::lower::{target_for, BlockMask, LoweringRequest};
use crate::meta::ShapeMeta;
use crate::online::OnlineFunc;
use crate::select::{select_template, KernelTemplate};
use crate::tensor::HostTensor;
use crate::trace::{trace_configuration, MaskFn, ScoreFn};
use crate::tune::{resolve_config, Autotuner, DeviceArch, HeuristicTuner, TunedConfig, TuningOptions};

/// Environment variable naming the kernel cache directory.
pub const CACHE_DIR_ENV: &str = "ATTEND_CACHE_DIR";

/// Cache directory used when the environment does not name one.
pub const DEFAULT_CACHE_DIR: &str = ".cache/attend-kernels";

/// Where generated sources are kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub dir: PathBuf,
}

impl CacheConfig {
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$ATTEND_CACHE_DIR`, or [`DEFAULT_CACHE_DIR`] when unset or blank.
    pub fn from_env() -> Self {
        Self::from_value(std::env::var(CACHE_DIR_ENV).ok())
    }

    fn from_value(value: Option<String>) -> Self {
        match value {
            Some(v) if !v.trim().is_empty() => Self::at(v.trim()),
            _ => Self::at(DEFAULT_CACHE_DIR),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Knobs of one compilation.
#[derive(Clone)]
pub struct EngineOptions {
    /// Score written for masked-out elements.
    pub mask_value: f64,
    /// Force a template instead of selecting one from the shapes.
    pub kernel_template: Option<KernelTemplate>,
    /// Derive a block mask for prefill kernels.
    pub infer_mask: bool,
    pub tuning: TuningOptions,
    pub arch: DeviceArch,
    pub cache: CacheConfig,
    pub backend: Arc<dyn KernelBackend>,
    pub tuner: Arc<dyn Autotuner + Send + Sync>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            mask_value: f64::NEG_INFINITY,
            kernel_template: None,
            infer_mask: false,
            tuning: TuningOptions::default(),
            arch: DeviceArch::default(),
            cache: CacheConfig::default(),
            backend: Arc::new(HostBackend),
            tuner: Arc::new(HeuristicTuner),
        }
    }
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("mask_value", &self.mask_value)
            .field("kernel_template", &self.kernel_template)
            .field("infer_mask", &self.infer_mask)
            .field("tuning", &self.tuning)
            .field("arch", &self.arch)
            .field("cache", &self.cache)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

/// Compiles attention configurations.
pub struct AttentionEngine;

impl AttentionEngine {
    /// Compile one attention configuration.
    pub fn build(
        meta: ShapeMeta,
        custom_io: &CustomIO,
        score_mod: Option<&ScoreFn<'_>>,
        mask_mod: Option<&MaskFn<'_>>,
        online: &dyn OnlineFunc,
        options: &EngineOptions,
    ) -> Result<CompiledAttention> {
        meta.validate()?;
        let template = select_template(&meta, options.kernel_template)?;
        let with_backward = template.has_backward();
        let traced = trace_configuration(custom_io, score_mod, mask_mod, online, with_backward)?;

        let (config, config_bwd) = if template == KernelTemplate::Prefill {
            let t = &options.tuning;
            let tuner = options.tuner.as_ref();
            let fwd = resolve_config(template, &meta, &options.arch, tuner, t.tune, t.tune_file.as_deref())?;
            let bwd = resolve_config(
                template,
                &meta,
                &options.arch,
                tuner,
                t.tune_bwd,
                t.tune_file_bwd.as_deref(),
            )?;
            (fwd, Some(bwd))
        } else {
            (TunedConfig::default_for(template, &meta), None)
        };

        let req = LoweringRequest {
            traced: &traced,
            meta,
            mask_value: options.mask_value,
            config,
            config_bwd,
            infer_mask: options.infer_mask,
        };
        let lowered = target_for(template).lower(&req)?;

        let cache = KernelCache::open(&options.cache.dir)?;
        let entry = cache.store(&lowered.source)?;
        let module = load_cached(&cache, &entry.digest, &lowered.source, options.backend.as_ref())?;

        info!(
            %template,
            digest = %entry.digest,
            fresh = entry.created,
            block_mask = module.block_mask.is_some(),
            program = %traced.describe(),
            "compiled attention"
        );
        Ok(CompiledAttention {
            template,
            meta,
            source: lowered.source,
            digest: entry.digest,
            cache_path: entry.path,
            has_backward: config_bwd.is_some(),
            module,
        })
    }
}

/// Load the cached copy; a copy that fails to load is regenerated once.
fn load_cached(
    cache: &KernelCache,
    digest: &str,
    source: &str,
    backend: &dyn KernelBackend,
) -> Result<LoadedModule> {
    let first = cache.read(digest).and_then(|text| backend.load(&text));
    match first {
        Ok(module) => Ok(module),
        Err(err) => {
            warn!(%digest, backend = backend.name(), error = %err, "cached kernel failed to load, regenerating");
            cache.overwrite(source)?;
            cache
                .read(digest)
                .and_then(|text| backend.load(&text))
                .map_err(|e| EngineError::CacheCorruption {
                    digest: digest.to_string(),
                    reason: e.to_string(),
                })
        }
    }
}

/// A compiled, loaded attention kernel.
#[derive(Debug)]
pub struct CompiledAttention {
    template: KernelTemplate,
    meta: ShapeMeta,
    source: String,
    digest: String,
    cache_path: PathBuf,
    has_backward: bool,
    module: LoadedModule,
}

impl CompiledAttention {
    /// Run the forward kernel on query, key and value plus the custom
    /// tensors in declaration order. The block mask, if any, is appended.
    pub fn invoke(
        &self,
        q: &HostTensor,
        k: &HostTensor,
        v: &HostTensor,
        extra: &[&HostTensor],
    ) -> Result<HostTensor> {
        if self.template == KernelTemplate::MlaDecode {
            return Err(EngineError::Backend(
                "mla_decode reads a single latent cache; use invoke_latent".to_string(),
            ));
        }
        self.launch(&[q, k, v], extra)
    }

    /// Forward call of the `MlaDecode` template: `kv` holds keys, and its
    /// leading `value_dim` columns are the values.
    pub fn invoke_latent(&self, q: &HostTensor, kv: &HostTensor, extra: &[&HostTensor]) -> Result<HostTensor> {
        if self.template != KernelTemplate::MlaDecode {
            return Err(EngineError::Backend(format!(
                "{} takes separate keys and values; use invoke",
                self.template
            )));
        }
        self.launch(&[q, kv], extra)
    }

    fn launch(&self, inputs: &[&HostTensor], extra: &[&HostTensor]) -> Result<HostTensor> {
        let mut args: Vec<KernelArg<'_>> = inputs
            .iter()
            .chain(extra)
            .map(|&t| KernelArg::Tensor(t))
            .collect();
        if let Some(mask) = &self.module.block_mask {
            args.push(KernelArg::BlockMask(mask));
        }
        self.module.forward.launch(&args)
    }

    pub fn template(&self) -> KernelTemplate {
        self.template
    }

    pub fn meta(&self) -> &ShapeMeta {
        &self.meta
    }

    /// Generated kernel source, manifest line included.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Hex BLAKE3 digest of [`source`](Self::source).
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn block_mask(&self) -> Option<&BlockMask> {
        self.module.block_mask.as_ref()
    }

    /// Whether a backward kernel was generated alongside the forward one.
    pub fn has_backward(&self) -> bool {
        self.has_backward
    }
}
