//! CPU reference backend.
//!
//! [`HostBackend`] ignores the CUDA body of a generated source and executes
//! the program described by its manifest: for every query row it streams
//! over key blocks exactly like the kernels do, evaluating the traced score,
//! mask, online step and epilogue graphs on the host. It serves as the
//! numeric oracle for the GPU templates and lets the whole pipeline run
//! without a device.

use std::ops::Range;
use std::sync::Arc;

use attend_expr::{Env, ExprGraph, ExprId, Value};
use tracing::debug;

use crate::backend::{AttentionKernel, KernelArg, KernelBackend, LoadedModule};
use crate::error::{EngineError, Result};
use crate::lower::{BlockMask, KernelManifest, FORWARD_ENTRY};
use crate::online::OnlinePhase;
use crate::select::KernelTemplate;
use crate::tensor::HostTensor;

#[derive(Clone, Copy, Debug, Default)]
pub struct HostBackend;

impl KernelBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn load(&self, source: &str) -> Result<LoadedModule> {
        let manifest = KernelManifest::parse(source)?;
        if manifest.entry != FORWARD_ENTRY {
            return Err(EngineError::Backend(format!(
                "entry point `{}` not found",
                FORWARD_ENTRY
            )));
        }
        let graph = manifest.graph()?;
        let kernel = HostKernel::new(manifest, graph)?;
        let block_mask = kernel.manifest.block_mask.clone();
        debug!(template = %kernel.manifest.template, nodes = kernel.graph.len(), "loaded host kernel");
        Ok(LoadedModule {
            forward: Arc::new(kernel),
            block_mask,
        })
    }
}

struct Phases {
    score: ExprId,
    mask: Option<ExprId>,
    online_scores: ExprId,
    online_state: Vec<(String, ExprId)>,
    o_scale: ExprId,
    epilogue_o: ExprId,
}

struct HostKernel {
    manifest: KernelManifest,
    graph: ExprGraph,
    phases: Phases,
}

/// Validated launch arguments.
struct Inputs<'a> {
    q: &'a HostTensor,
    k: &'a HostTensor,
    v: &'a HostTensor,
    custom: Vec<&'a HostTensor>,
    mask: Option<&'a BlockMask>,
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}

fn scalar(v: &Value, what: &str) -> Result<f64> {
    v.as_scalar()
        .ok_or_else(|| EngineError::TypeMismatch(format!("{what} must be a per-row scalar")))
}

impl HostKernel {
    fn new(manifest: KernelManifest, graph: ExprGraph) -> Result<Self> {
        let id = |i: u32| -> Result<ExprId> {
            let id = ExprId::from_index(i);
            graph.check(id)?;
            Ok(id)
        };
        let p = &manifest.phases;
        let phases = Phases {
            score: id(p.score)?,
            mask: p.mask.map(id).transpose()?,
            online_scores: id(p.online_scores)?,
            online_state: p
                .online_state
                .iter()
                .map(|(n, i)| Ok((n.clone(), id(*i)?)))
                .collect::<Result<_>>()?,
            o_scale: id(p.o_scale)?,
            epilogue_o: id(p.epilogue_o)?,
        };
        // Final state (the LSE for softmax) only feeds the backward kernel.
        for (_, i) in &p.final_state {
            id(*i)?;
        }
        Ok(Self {
            manifest,
            graph,
            phases,
        })
    }

    fn inputs<'a>(&self, args: &[KernelArg<'a>]) -> Result<Inputs<'a>> {
        let m = &self.manifest.meta;
        let latent = self.manifest.template == KernelTemplate::MlaDecode;
        let base = if latent { 2 } else { 3 };
        let decls = self.manifest.io.decls();
        let has_mask = self.manifest.block_mask.is_some();
        let want = base + decls.len() + usize::from(has_mask);
        if args.len() != want {
            return Err(EngineError::Backend(format!(
                "{} expects {want} arguments, got {}",
                self.manifest.template,
                args.len()
            )));
        }
        let tensor = |i: usize| match args[i] {
            KernelArg::Tensor(t) => Ok(t),
            KernelArg::BlockMask(_) => Err(EngineError::Backend(format!(
                "argument {i} must be a tensor"
            ))),
        };

        let q = tensor(0)?;
        q.expect_shape("query", &[m.batch, m.q_heads, m.q_len, m.head_dim])?;
        let (k, v) = if latent {
            let kv = tensor(1)?;
            kv.expect_shape("latent cache", &[m.batch, m.kv_heads, m.kv_len, m.head_dim])?;
            (kv, kv)
        } else {
            let (k, v) = (tensor(1)?, tensor(2)?);
            k.expect_shape("key", &[m.batch, m.kv_heads, m.kv_len, m.head_dim])?;
            v.expect_shape("value", &[m.batch, m.kv_heads, m.kv_len, m.value_dim])?;
            (k, v)
        };
        let mut custom = Vec::with_capacity(decls.len());
        for (i, decl) in decls.iter().enumerate() {
            let t = tensor(base + i)?;
            t.expect_shape(&decl.name, &decl.concrete_shape(m))?;
            custom.push(t);
        }
        let mask = match (&self.manifest.block_mask, args.last()) {
            (None, _) => None,
            (Some(expected), Some(KernelArg::BlockMask(bm))) => {
                if (bm.q_blocks, bm.kv_blocks) != (expected.q_blocks, expected.kv_blocks) {
                    return Err(EngineError::Backend(format!(
                        "block mask is {}x{}, kernel was built for {}x{}",
                        bm.q_blocks, bm.kv_blocks, expected.q_blocks, expected.kv_blocks
                    )));
                }
                Some(*bm)
            }
            (Some(_), _) => {
                return Err(EngineError::Backend(
                    "block mask must be the trailing argument".to_string(),
                ))
            }
        };
        Ok(Inputs { q, k, v, custom, mask })
    }

    /// Bind every custom tensor for one query row over keys `kv`.
    fn bind_custom(&self, env: &mut Env, inputs: &Inputs<'_>, b: usize, h: usize, q_row: usize, kv: Range<usize>) {
        let m = &self.manifest.meta;
        for (decl, t) in self.manifest.io.decls().iter().zip(&inputs.custom) {
            let at = |k: usize| t.data()[decl.offset(m, b, h, q_row, k)] as f64;
            let value = if decl.varies_along_kv() {
                Value::Row(kv.clone().map(at).collect())
            } else {
                Value::Scalar(at(kv.start))
            };
            env.bind(&decl.name, value);
        }
    }

    fn run_row(&self, inputs: &Inputs<'_>, b: usize, h: usize, q_row: usize) -> Result<Vec<f64>> {
        let m = &self.manifest.meta;
        let p = &self.phases;
        let hk = h / m.group_size();
        let q = inputs.q.row(&[b, h, q_row]);
        let block_n = self.manifest.config.block_n.max(1);

        let mut env = Env::new()
            .with("b", Value::Scalar(b as f64))
            .with("h", Value::Scalar(h as f64))
            .with("q_idx", Value::Scalar((q_row + m.kv_len - m.q_len) as f64));
        let mut state: Vec<(String, f64)> = self
            .manifest
            .online_init
            .iter()
            .map(|s| (s.name.clone(), s.init))
            .collect();
        let mut acc = vec![0.0f64; m.value_dim];
        let mut phase = OnlinePhase::Init;

        for kv_block in 0..m.kv_len.div_ceil(block_n) {
            if let Some(bm) = inputs.mask {
                if !bm.is_active(q_row / bm.block_m, kv_block) {
                    continue;
                }
            }
            let keys = kv_block * block_n..((kv_block + 1) * block_n).min(m.kv_len);
            let n = keys.len();
            let raw = keys.clone().map(|kv| dot(q, inputs.k.row(&[b, hk, kv]))).collect();

            env.bind("kv_idx", Value::Row(keys.clone().map(|k| k as f64).collect()));
            env.bind("scores", Value::Row(raw));
            self.bind_custom(&mut env, inputs, b, h, q_row, keys.clone());
            let scores = self.graph.eval(p.score, &env)?.to_row(n)?;
            let keep = match p.mask {
                Some(mask) => self.graph.eval(mask, &env)?.to_row(n)?,
                None => vec![0.0; n],
            };
            let masked = scores
                .iter()
                .zip(&keep)
                .map(|(&s, &k)| if k >= 0.0 { s } else { self.manifest.mask_value })
                .collect();

            env.bind("scores", Value::Row(masked));
            for (name, value) in &state {
                env.bind(name, Value::Scalar(*value));
            }
            let mut outputs = vec![p.online_scores, p.o_scale];
            outputs.extend(p.online_state.iter().map(|(_, id)| *id));
            let vals = self.graph.eval_many(&outputs, &env)?;
            let probs = vals[0].to_row(n)?;
            let o_scale = scalar(&vals[1], "o_scale")?;
            for ((name, _), val) in p.online_state.iter().zip(&vals[2..]) {
                let val = scalar(val, name)?;
                if let Some(slot) = state.iter_mut().find(|(n, _)| n == name) {
                    slot.1 = val;
                }
            }

            for a in &mut acc {
                *a *= o_scale;
            }
            for (w, kv) in probs.iter().zip(keys) {
                let v = &inputs.v.row(&[b, hk, kv])[..m.value_dim];
                for (a, &x) in acc.iter_mut().zip(v) {
                    *a += w * x as f64;
                }
            }
            phase = phase.stream()?;
        }

        phase = phase.epilogue()?;
        env.bind("kv_idx", Value::Scalar(0.0));
        self.bind_custom(&mut env, inputs, b, h, q_row, 0..1);
        env.bind("o", Value::Row(acc));
        for (name, value) in &state {
            env.bind(name, Value::Scalar(*value));
        }
        let o = self.graph.eval(p.epilogue_o, &env)?;
        phase.finish()?;
        Ok(o.to_row(m.value_dim)?)
    }
}

impl AttentionKernel for HostKernel {
    fn entry(&self) -> &str {
        &self.manifest.entry
    }

    fn launch(&self, args: &[KernelArg<'_>]) -> Result<HostTensor> {
        let inputs = self.inputs(args)?;
        let m = &self.manifest.meta;
        let mut out = HostTensor::zeros(&m.output_shape());
        let dv = m.value_dim;
        let mut offset = 0;
        for b in 0..m.batch {
            for h in 0..m.q_heads {
                for q_row in 0..m.q_len {
                    let row = self.run_row(&inputs, b, h, q_row)?;
                    for (dst, src) in out.data_mut()[offset..offset + dv].iter_mut().zip(row) {
                        *dst = src as f32;
                    }
                    offset += dv;
                }
            }
        }
        Ok(out)
    }
}
