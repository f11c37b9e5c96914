//! Tile configuration and autotuning hooks.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::meta::ShapeMeta;
use crate::select::KernelTemplate;

/// Target GPU description handed to the autotuner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceArch {
    pub name: String,
    /// `(major, minor)` compute capability.
    pub compute_capability: (u32, u32),
    pub shared_mem_per_block: usize,
    pub num_sms: u32,
}

impl DeviceArch {
    pub fn h100() -> Self {
        Self {
            name: "H100".to_string(),
            compute_capability: (9, 0),
            shared_mem_per_block: 227 * 1024,
            num_sms: 132,
        }
    }

    pub fn a100() -> Self {
        Self {
            name: "A100".to_string(),
            compute_capability: (8, 0),
            shared_mem_per_block: 163 * 1024,
            num_sms: 108,
        }
    }

    /// `sm_90`-style architecture string.
    pub fn sm(&self) -> String {
        format!("sm_{}{}", self.compute_capability.0, self.compute_capability.1)
    }
}

impl Default for DeviceArch {
    fn default() -> Self {
        Self::h100()
    }
}

/// Largest CUDA thread block.
pub const MAX_THREADS: usize = 1024;

/// Tile sizes and pipelining of one kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunedConfig {
    pub block_m: usize,
    pub block_n: usize,
    pub num_stages: usize,
    pub num_threads: usize,
}

impl TunedConfig {
    /// Built-in configuration for `template`.
    pub fn default_for(template: KernelTemplate, meta: &ShapeMeta) -> Self {
        match template {
            KernelTemplate::Prefill => Self {
                block_m: 128,
                block_n: if meta.head_dim <= 64 { 128 } else { 64 },
                num_stages: 2,
                num_threads: 256,
            },
            KernelTemplate::DecodeMha => Self {
                block_m: 1,
                block_n: 64,
                num_stages: 2,
                num_threads: 128,
            },
            KernelTemplate::DecodeGqa => Self {
                block_m: 64,
                block_n: 64,
                num_stages: 2,
                num_threads: 128,
            },
            KernelTemplate::MlaDecode => Self {
                block_m: 64,
                block_n: 64,
                num_stages: 2,
                num_threads: 256,
            },
        }
    }

    /// Reject tiles a kernel cannot be launched with.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let fields = [
            ("block_m", self.block_m),
            ("block_n", self.block_n),
            ("num_stages", self.num_stages),
            ("num_threads", self.num_threads),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, v)| *v == 0) {
            return Err(format!("{name} must be non-zero"));
        }
        if self.num_threads > MAX_THREADS {
            return Err(format!(
                "num_threads {} exceeds {MAX_THREADS}",
                self.num_threads
            ));
        }
        Ok(())
    }

    /// Shared memory used by the Q, K and V tiles, in bytes (fp16).
    pub fn shared_mem(&self, meta: &ShapeMeta) -> usize {
        let q = self.block_m * meta.head_dim;
        let kv = self.block_n * (meta.head_dim + meta.value_dim) * self.num_stages;
        (q + kv) * 2
    }
}

/// Supplies tile configurations.
pub trait Autotuner {
    fn tune(&self, template: KernelTemplate, meta: &ShapeMeta, arch: &DeviceArch) -> Result<TunedConfig>;
}

/// Start from the built-in configuration and shrink the key tile, then the
/// pipeline depth, until the tiles fit in shared memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicTuner;

impl Autotuner for HeuristicTuner {
    fn tune(&self, template: KernelTemplate, meta: &ShapeMeta, arch: &DeviceArch) -> Result<TunedConfig> {
        let mut cfg = TunedConfig::default_for(template, meta);
        while cfg.shared_mem(meta) > arch.shared_mem_per_block {
            if cfg.block_n > 16 {
                cfg.block_n /= 2;
            } else if cfg.num_stages > 1 {
                cfg.num_stages -= 1;
            } else if cfg.block_m > 16 {
                cfg.block_m /= 2;
            } else {
                break;
            }
        }
        Ok(cfg)
    }
}

/// Forward and backward tuning switches and their cache files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TuningOptions {
    pub tune: bool,
    pub tune_file: Option<PathBuf>,
    pub tune_bwd: bool,
    pub tune_file_bwd: Option<PathBuf>,
}

/// Resolve one kernel's configuration.
///
/// With tuning disabled the built-in configuration is used. Otherwise a
/// readable tune file wins; if there is none the tuner runs and its result
/// is written to the file.
pub fn resolve_config(
    template: KernelTemplate,
    meta: &ShapeMeta,
    arch: &DeviceArch,
    tuner: &dyn Autotuner,
    enabled: bool,
    file: Option<&Path>,
) -> Result<TunedConfig> {
    if !enabled {
        return Ok(TunedConfig::default_for(template, meta));
    }
    if let Some(path) = file {
        if path.exists() {
            let cfg: TunedConfig = serde_json::from_str(&fs::read_to_string(path)?)?;
            cfg.validate().map_err(|reason| {
                EngineError::UnsupportedConfiguration(format!(
                    "tune file {}: {reason}",
                    path.display()
                ))
            })?;
            debug!(path = %path.display(), ?cfg, "loaded tuned config");
            return Ok(cfg);
        }
    }
    let cfg = tuner.tune(template, meta, arch)?;
    cfg.validate()
        .map_err(|reason| EngineError::UnsupportedConfiguration(format!("tuner result: {reason}")))?;
    if let Some(path) = file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&cfg)?)?;
        debug!(path = %path.display(), ?cfg, "stored tuned config");
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefill_defaults_follow_head_dim() {
        let small = ShapeMeta::new(1, 4, 128, 128, 64);
        let large = ShapeMeta::new(1, 4, 128, 128, 128);
        assert_eq!(TunedConfig::default_for(KernelTemplate::Prefill, &small).block_n, 128);
        assert_eq!(TunedConfig::default_for(KernelTemplate::Prefill, &large).block_n, 64);
    }

    #[test]
    fn heuristic_fits_shared_memory() {
        let meta = ShapeMeta::new(1, 4, 4096, 4096, 256);
        let arch = DeviceArch {
            shared_mem_per_block: 96 * 1024,
            ..DeviceArch::a100()
        };
        let cfg = HeuristicTuner.tune(KernelTemplate::Prefill, &meta, &arch).unwrap();
        assert!(cfg.shared_mem(&meta) <= arch.shared_mem_per_block);
        assert!(cfg.block_n < 64);
    }

    #[test]
    fn disabled_tuning_uses_defaults() {
        let meta = ShapeMeta::new(1, 4, 128, 128, 64);
        let cfg = resolve_config(
            KernelTemplate::Prefill,
            &meta,
            &DeviceArch::h100(),
            &HeuristicTuner,
            false,
            Some(Path::new("/nonexistent/never-written.json")),
        )
        .unwrap();
        assert_eq!(cfg, TunedConfig::default_for(KernelTemplate::Prefill, &meta));
    }

    #[test]
    fn tune_file_written_then_reused() {
        struct Fixed;
        impl Autotuner for Fixed {
            fn tune(&self, _: KernelTemplate, _: &ShapeMeta, _: &DeviceArch) -> Result<TunedConfig> {
                Ok(TunedConfig {
                    block_m: 32,
                    block_n: 16,
                    num_stages: 1,
                    num_threads: 64,
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tune").join("fwd.json");
        let meta = ShapeMeta::new(1, 4, 128, 128, 64);
        let arch = DeviceArch::h100();

        let first = resolve_config(KernelTemplate::Prefill, &meta, &arch, &Fixed, true, Some(&path)).unwrap();
        assert_eq!(first.block_n, 16);
        assert!(path.exists());

        // The heuristic tuner would pick something else; the file wins.
        let second =
            resolve_config(KernelTemplate::Prefill, &meta, &arch, &HeuristicTuner, true, Some(&path)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_tune_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let meta = ShapeMeta::new(1, 4, 128, 128, 64);
        let arch = DeviceArch::h100();
        let cases = [
            (r#"{"block_m":0,"block_n":0,"num_stages":1,"num_threads":1}"#, "block_m"),
            (r#"{"block_m":64,"block_n":0,"num_stages":1,"num_threads":128}"#, "block_n"),
            (r#"{"block_m":64,"block_n":64,"num_stages":1,"num_threads":4096}"#, "num_threads"),
        ];
        for (i, (text, field)) in cases.into_iter().enumerate() {
            let path = dir.path().join(format!("bad{i}.json"));
            fs::write(&path, text).unwrap();
            match resolve_config(KernelTemplate::Prefill, &meta, &arch, &HeuristicTuner, true, Some(&path)) {
                Err(EngineError::UnsupportedConfiguration(msg)) => {
                    assert!(msg.contains(field), "{msg}");
                    assert!(msg.contains(&format!("bad{i}.json")), "{msg}");
                }
                other => panic!("expected rejection, got {other:?}"),
            }
        }
    }
}
