//! Lowering targets: traced attention programs to CUDA C kernel source.
//!
//! Every generated source starts with a manifest line,
//!
//! ```text
//! // attend-manifest: {"template":"Prefill",...}
//! ```
//!
//! carrying the traced graph and the shape parameters, followed by a fixed
//! kernel skeleton with the emitted expressions spliced in. The manifest
//! lets a backend rebuild the program from the cached text alone.

mod decode_gqa;
mod decode_mha;
pub mod mask;
mod mla_decode;
mod prefill;

use std::fmt::Write;

use attend_expr::codegen::format_literal;
use attend_expr::{EmitContext, Emitted, ExprGraph, ExprId};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::meta::ShapeMeta;
use crate::select::KernelTemplate;
use crate::trace::TracedAttention;
use crate::tune::TunedConfig;
use crate::wire::WireGraph;
use crate::custom_io::CustomIO;

pub use decode_gqa::DecodeGqaTemplate;
pub use decode_mha::DecodeMhaTemplate;
pub use mask::BlockMask;
pub use mla_decode::MlaDecodeTemplate;
pub use prefill::PrefillTemplate;

/// Prefix of the manifest line.
pub const MANIFEST_PREFIX: &str = "// attend-manifest: ";

/// Name of the forward entry point in every template.
pub const FORWARD_ENTRY: &str = "attention_fwd";

/// Name of the backward entry point (prefill only).
pub const BACKWARD_ENTRY: &str = "attention_bwd";

/// Everything a lowering target receives.
pub struct LoweringRequest<'a> {
    pub traced: &'a TracedAttention,
    pub meta: ShapeMeta,
    /// Score written for masked-out elements.
    pub mask_value: f64,
    pub config: TunedConfig,
    /// Backward tile configuration; prefill only.
    pub config_bwd: Option<TunedConfig>,
    /// Derive a block mask from the mask function.
    pub infer_mask: bool,
}

/// Output of a lowering target.
#[derive(Clone, Debug, PartialEq)]
pub struct LoweredKernel {
    pub source: String,
    pub block_mask: Option<BlockMask>,
}

/// One code-generation strategy.
pub trait LoweringTarget {
    fn template(&self) -> KernelTemplate;

    fn lower(&self, req: &LoweringRequest<'_>) -> Result<LoweredKernel>;
}

/// The target implementing `template`.
pub fn target_for(template: KernelTemplate) -> Box<dyn LoweringTarget> {
    match template {
        KernelTemplate::Prefill => Box::new(PrefillTemplate),
        KernelTemplate::DecodeMha => Box::new(DecodeMhaTemplate),
        KernelTemplate::DecodeGqa => Box::new(DecodeGqaTemplate),
        KernelTemplate::MlaDecode => Box::new(MlaDecodeTemplate),
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// f64 fields that may be infinite are stored as text (`"-inf"`).
mod float_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Initial value of one online state slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSlot {
    pub name: String,
    #[serde(with = "float_text")]
    pub init: f64,
}

/// Graph node indices of every traced phase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOutputs {
    pub score: u32,
    pub mask: Option<u32>,
    pub online_scores: u32,
    pub online_state: Vec<(String, u32)>,
    pub o_scale: u32,
    pub epilogue_o: u32,
    pub final_state: Vec<(String, u32)>,
    pub forward: u32,
    /// `(dscores_mod, dscores)` when a backward kernel was generated.
    pub backward: Option<(u32, u32)>,
}

impl PhaseOutputs {
    fn from_traced(t: &TracedAttention, with_backward: bool) -> Self {
        let named = |v: &[(String, ExprId)]| v.iter().map(|(n, id)| (n.clone(), id.index())).collect();
        Self {
            score: t.score.index(),
            mask: t.mask.map(|m| m.index()),
            online_scores: t.online_fwd.scores.index(),
            online_state: named(&t.online_fwd.state),
            o_scale: t.online_fwd.o_scale.index(),
            epilogue_o: t.epilogue.o.index(),
            final_state: named(&t.epilogue.final_state),
            forward: t.forward.index(),
            backward: t
                .backward
                .as_ref()
                .filter(|_| with_backward)
                .map(|b| (b.dscores_mod.index(), b.dscores.index())),
        }
    }
}

/// Self-description embedded as the first line of generated source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelManifest {
    pub template: KernelTemplate,
    pub entry: String,
    pub meta: ShapeMeta,
    pub config: TunedConfig,
    pub config_bwd: Option<TunedConfig>,
    #[serde(with = "float_text")]
    pub mask_value: f64,
    pub io: CustomIO,
    pub online_init: Vec<StateSlot>,
    pub phases: PhaseOutputs,
    pub block_mask: Option<BlockMask>,
    pub graph: WireGraph,
}

impl KernelManifest {
    pub(crate) fn new(
        template: KernelTemplate,
        req: &LoweringRequest<'_>,
        block_mask: Option<BlockMask>,
    ) -> Self {
        let t = req.traced;
        Self {
            template,
            entry: FORWARD_ENTRY.to_string(),
            meta: req.meta,
            config: req.config,
            config_bwd: req.config_bwd,
            mask_value: req.mask_value,
            io: t.io.clone(),
            online_init: t
                .online_init
                .iter()
                .map(|(name, init)| StateSlot {
                    name: name.clone(),
                    init: *init,
                })
                .collect(),
            phases: PhaseOutputs::from_traced(t, req.config_bwd.is_some()),
            block_mask,
            graph: WireGraph::from_expr_graph(&t.graph),
        }
    }

    /// The manifest line, without a trailing newline.
    pub fn header(&self) -> Result<String> {
        Ok(format!("{MANIFEST_PREFIX}{}", serde_json::to_string(self)?))
    }

    /// Read the manifest from the first line of `source`.
    pub fn parse(source: &str) -> Result<Self> {
        let first = source.lines().next().unwrap_or_default();
        let json = first.strip_prefix(MANIFEST_PREFIX).ok_or_else(|| {
            EngineError::Backend("kernel source has no manifest line".to_string())
        })?;
        Ok(serde_json::from_str(json)?)
    }

    /// Rebuild the traced graph.
    pub fn graph(&self) -> Result<ExprGraph> {
        self.graph.to_expr_graph()
    }
}

// ---------------------------------------------------------------------------
// Shared emission
// ---------------------------------------------------------------------------

/// Substitute `{{NAME}}` placeholders.
pub(crate) fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

fn indent(text: &str, pad: &str) -> String {
    let mut out = String::new();
    for line in text.lines() {
        let _ = writeln!(out, "{pad}{line}");
    }
    out
}

/// Bindings shared by every phase: coordinates and custom tensors.
fn bind_common(ctx: &mut EmitContext<'_>, io: &CustomIO, kv_idx: &str) -> Result<()> {
    ctx.bind("b", "b").bind("h", "h").bind("q_idx", "q_idx").bind("kv_idx", kv_idx);
    for decl in io.decls() {
        decl.check_indexable()?;
        ctx.bind(&decl.name, format!("io_{}[{}]", decl.name, decl.cuda_offset()));
    }
    Ok(())
}

fn require_elementwise(graph: &ExprGraph, id: ExprId, phase: &str) -> Result<()> {
    if graph.contains_reduction(id) {
        return Err(EngineError::LoweringFailure(format!(
            "{phase} must be elementwise but contains a row reduction: {}",
            graph.fmt_expr(id)
        )));
    }
    Ok(())
}

fn statements_then(emitted: &Emitted, tail: String) -> String {
    let mut out = emitted.body("");
    out.push_str(&tail);
    out.push('\n');
    out
}

/// Forward-pass fragments common to all templates.
pub(crate) struct ForwardParts {
    /// Extra kernel parameters, each with a leading comma.
    pub params: String,
    pub state_init: String,
    /// Computes `float s` from `s_raw`.
    pub score: String,
    /// Computes `bool keep`.
    pub mask: String,
    /// One streaming step over `acc_s[BLOCK_N]`.
    pub online: String,
    /// Final scaling of `acc_o[DIM]` and stores of the final state.
    pub epilogue: String,
}

pub(crate) fn forward_parts(req: &LoweringRequest<'_>) -> Result<ForwardParts> {
    let t = req.traced;
    let g = &t.graph;

    let mut params = String::new();
    for decl in t.io.decls() {
        let _ = write!(params, ", const float* __restrict__ io_{}", decl.name);
    }
    for (name, _) in &t.epilogue.final_state {
        let _ = write!(params, ", float* __restrict__ {name}_out");
    }

    let mut state_init = String::new();
    for (name, init) in &t.online_init {
        let _ = writeln!(state_init, "float st_{name} = {};", format_literal(*init));
    }

    let mut ctx = EmitContext::new(g, "sc");
    bind_common(&mut ctx, &t.io, "kv_idx")?;
    ctx.bind("scores", "s_raw");
    require_elementwise(g, t.score, "score function")?;
    let emitted = ctx.emit(&[t.score])?;
    let score = statements_then(&emitted, format!("float s = {};", emitted.results[0]));

    let mask = match t.mask {
        Some(m) => {
            require_elementwise(g, m, "mask function")?;
            let mut ctx = EmitContext::new(g, "mk");
            bind_common(&mut ctx, &t.io, "kv_idx")?;
            let emitted = ctx.emit(&[m])?;
            statements_then(&emitted, format!("bool keep = ({}) >= 0.0f;", emitted.results[0]))
        }
        None => "bool keep = true;\n".to_string(),
    };

    let mut ctx = EmitContext::new(g, "on");
    bind_common(&mut ctx, &t.io, "(kv_base + j)")?;
    ctx.bind("scores", "acc_s[j]");
    for (name, _) in &t.online_init {
        ctx.bind(name, format!("st_{name}"));
    }
    let mut outputs = vec![t.online_fwd.scores, t.online_fwd.o_scale];
    outputs.extend(t.online_fwd.state.iter().map(|(_, id)| *id));
    let emitted = ctx.emit(&outputs)?;
    let mut online = emitted.body("");
    let _ = writeln!(online, "float o_scale = {};", emitted.results[1]);
    for ((name, _), expr) in t.online_fwd.state.iter().zip(&emitted.results[2..]) {
        let _ = writeln!(online, "float st_{name}_next = {expr};");
    }
    let _ = writeln!(online, "for (int j = 0; j < BLOCK_N; ++j) acc_s[j] = {};", emitted.results[0]);
    for (name, _) in &t.online_fwd.state {
        let _ = writeln!(online, "st_{name} = st_{name}_next;");
    }

    let mut ctx = EmitContext::new(g, "ep");
    bind_common(&mut ctx, &t.io, "0")?;
    ctx.bind("o", "acc_o[j]");
    for (name, _) in &t.online_init {
        ctx.bind(name, format!("st_{name}"));
    }
    let mut outputs = vec![t.epilogue.o];
    outputs.extend(t.epilogue.final_state.iter().map(|(_, id)| *id));
    let emitted = ctx.emit(&outputs)?;
    let mut epilogue = emitted.body("");
    let _ = writeln!(epilogue, "for (int j = 0; j < DIM; ++j) acc_o[j] = {};", emitted.results[0]);
    for ((name, _), expr) in t.epilogue.final_state.iter().zip(&emitted.results[1..]) {
        let _ = writeln!(epilogue, "{name}_out[row] = {expr};");
    }

    Ok(ForwardParts {
        params,
        state_init,
        score,
        mask,
        online,
        epilogue,
    })
}

/// Backward-pass fragments (prefill only).
pub(crate) struct BackwardParts {
    /// Extra kernel parameters, each with a leading comma.
    pub params: String,
    /// Loads of the frozen final state for `row`.
    pub load_final: String,
    /// From `s_raw`, `dp` and `doosum_row`: the recomputed probability
    /// `float p` and the raw-score gradient `float ds`.
    pub body: String,
}

pub(crate) fn backward_parts(req: &LoweringRequest<'_>) -> Result<BackwardParts> {
    let t = req.traced;
    let g = &t.graph;
    let bwd = t.backward.as_ref().ok_or_else(|| {
        EngineError::LoweringFailure("backward kernel requested without a traced backward".to_string())
    })?;
    require_elementwise(g, t.forward, "OnlineFunc::forward")?;
    require_elementwise(g, bwd.dscores_mod, "OnlineFunc::backward")?;
    require_elementwise(g, bwd.dscores, "score gradient")?;

    let mut params = String::new();
    for decl in t.io.decls() {
        let _ = write!(params, ", const float* __restrict__ io_{}", decl.name);
    }
    let mut load_final = String::new();
    for (name, _) in &t.epilogue.final_state {
        let _ = write!(params, ", const float* __restrict__ {name}_saved");
        let _ = writeln!(load_final, "const float st_{name} = {name}_saved[row];");
    }

    let mut ctx = EmitContext::new(g, "bw");
    bind_common(&mut ctx, &t.io, "kv_idx")?;
    ctx.bind("scores", "s_raw").bind("dp", "dp").bind("doosum", "doosum_row");
    for (name, _) in &t.epilogue.final_state {
        ctx.bind(name, format!("st_{name}"));
    }
    let emitted = ctx.emit(&[t.forward, bwd.dscores_mod])?;
    let mut body = emitted.body("");
    let _ = writeln!(body, "float p = {};", emitted.results[0]);
    let _ = writeln!(body, "float ds_mod = {};", emitted.results[1]);

    let mut ctx = EmitContext::new(g, "gd");
    bind_common(&mut ctx, &t.io, "kv_idx")?;
    ctx.bind("scores", "s_raw").bind("dscores", "ds_mod");
    let emitted = ctx.emit(&[bwd.dscores])?;
    body.push_str(&statements_then(&emitted, format!("float ds = {};", emitted.results[0])));

    Ok(BackwardParts {
        params,
        load_final,
        body,
    })
}

/// Shape and tile `#define`s shared by all templates.
pub(crate) fn common_defines(req: &LoweringRequest<'_>, cfg: &TunedConfig) -> String {
    let m = &req.meta;
    let mut out = String::new();
    for (name, value) in [
        ("B", m.batch),
        ("HQ", m.q_heads),
        ("HKV", m.kv_heads),
        ("LQ", m.q_len),
        ("LK", m.kv_len),
        ("HEAD_DIM", m.head_dim),
        ("DIM", m.value_dim),
        ("GROUP", m.group_size()),
        ("BLOCK_M", cfg.block_m),
        ("BLOCK_N", cfg.block_n),
        ("NUM_STAGES", cfg.num_stages),
        ("NUM_THREADS", cfg.num_threads),
    ] {
        let _ = writeln!(out, "#define {name} {value}");
    }
    let _ = writeln!(out, "#define MASK_VALUE {}", format_literal(req.mask_value));
    let _ = writeln!(out, "typedef {} elem_t;", m.dtype.cuda_name());
    out
}

/// Row-reduction helpers referenced by emitted `reduce_sum`/`reduce_max`.
pub(crate) const REDUCE_HELPERS: &str = r#"#define reduce_sum(expr) ({ float _acc = 0.0f; for (int j = 0; j < BLOCK_N; ++j) _acc += (expr); _acc; })
#define reduce_max(expr) ({ float _acc = -INFINITY; for (int j = 0; j < BLOCK_N; ++j) _acc = fmaxf(_acc, (expr)); _acc; })
"#;

/// Assemble manifest and body.
pub(crate) fn finish(
    template: KernelTemplate,
    req: &LoweringRequest<'_>,
    body: String,
    block_mask: Option<BlockMask>,
) -> Result<LoweredKernel> {
    let manifest = KernelManifest::new(template, req, block_mask.clone());
    let mut source = manifest.header()?;
    source.push('\n');
    source.push_str(&body);
    Ok(LoweredKernel { source, block_mask })
}

pub(crate) fn pad(text: &str, spaces: usize) -> String {
    indent(text, &" ".repeat(spaces))
}
