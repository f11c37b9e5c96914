//! Kernel template selection.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::meta::ShapeMeta;

/// The fixed family of lowering targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelTemplate {
    /// Equal query and key lengths; forward and backward kernels.
    Prefill,
    /// Decode with one key/value head per query head.
    DecodeMha,
    /// Decode with grouped query heads; infers its block mask.
    DecodeGqa,
    /// Multi-latent-attention decode. Only chosen by explicit override.
    MlaDecode,
}

impl KernelTemplate {
    pub fn name(self) -> &'static str {
        match self {
            KernelTemplate::Prefill => "prefill",
            KernelTemplate::DecodeMha => "decode_mha",
            KernelTemplate::DecodeGqa => "decode_gqa",
            KernelTemplate::MlaDecode => "mla_decode",
        }
    }

    /// Whether lowering also produces a backward kernel.
    pub fn has_backward(self) -> bool {
        self == KernelTemplate::Prefill
    }
}

impl fmt::Display for KernelTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn classify(meta: &ShapeMeta) -> Result<KernelTemplate> {
    let ShapeMeta {
        q_len,
        kv_len,
        q_heads,
        kv_heads,
        ..
    } = *meta;
    let unsupported = || {
        EngineError::UnsupportedConfiguration(format!(
            "no template for q_len={q_len} kv_len={kv_len} q_heads={q_heads} kv_heads={kv_heads}"
        ))
    };
    if q_len == kv_len {
        return Ok(KernelTemplate::Prefill);
    }
    if q_len > kv_len {
        return Err(unsupported());
    }
    if q_heads > kv_heads {
        if q_len != 1 {
            return Err(EngineError::UnsupportedConfiguration(format!(
                "grouped-query decode needs q_len == 1, got {q_len}"
            )));
        }
        return Ok(KernelTemplate::DecodeGqa);
    }
    if q_heads == kv_heads {
        return Ok(KernelTemplate::DecodeMha);
    }
    Err(unsupported())
}

/// Choose the lowering target for `meta`.
///
/// Pure function of the four shape parameters plus the override. The
/// `MlaDecode` override always wins; any other override must agree with
/// the template the shapes select.
pub fn select_template(meta: &ShapeMeta, force: Option<KernelTemplate>) -> Result<KernelTemplate> {
    let chosen = match force {
        Some(KernelTemplate::MlaDecode) if meta.q_len > meta.kv_len => {
            return Err(EngineError::UnsupportedConfiguration(format!(
                "mla_decode needs q_len <= kv_len, got {} > {}",
                meta.q_len, meta.kv_len
            )));
        }
        Some(KernelTemplate::MlaDecode) => KernelTemplate::MlaDecode,
        Some(forced) => {
            let natural = classify(meta)?;
            if natural != forced {
                return Err(EngineError::UnsupportedConfiguration(format!(
                    "template {forced} requested but shapes select {natural}"
                )));
            }
            natural
        }
        None => classify(meta)?,
    };
    info!(
        template = %chosen,
        q_len = meta.q_len,
        kv_len = meta.kv_len,
        q_heads = meta.q_heads,
        kv_heads = meta.kv_heads,
        "selected kernel template"
    );
    Ok(chosen)
}
