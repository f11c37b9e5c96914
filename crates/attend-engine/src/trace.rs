//! Tracing a full attention configuration into one expression graph.

use attend_expr::{ExprGraph, ExprId, Sym, ValueKind};

use crate::custom_io::{CustomIO, CustomInputs, RESERVED_NAMES};
use crate::error::{EngineError, Result};
use crate::online::{AttnIndex, OnlineFunc, RowScales, OUTPUT_AXES, ROW_AXES, SCORE_AXES};

/// Score modification: raw score → modified score, per element.
pub type ScoreFn<'a> = dyn Fn(Sym, &AttnIndex, &CustomInputs) -> Sym + 'a;

/// Mask: an element is kept when the returned value is `>= 0`.
pub type MaskFn<'a> = dyn Fn(&AttnIndex, &CustomInputs) -> Sym + 'a;

/// Outputs of the streaming step.
#[derive(Clone, Debug)]
pub struct OnlineFwdGraph {
    pub scores: ExprId,
    pub state: Vec<(String, ExprId)>,
    pub o_scale: ExprId,
}

/// Outputs of the epilogue.
#[derive(Clone, Debug)]
pub struct EpilogueGraph {
    pub o: ExprId,
    pub final_state: Vec<(String, ExprId)>,
}

/// Outputs only the backward kernel needs.
#[derive(Clone, Debug)]
pub struct BackwardGraph {
    /// `OnlineFunc::backward`: gradient w.r.t. the modified score.
    pub dscores_mod: ExprId,
    /// Gradient w.r.t. the raw score, in terms of the `dscores` variable.
    pub dscores: ExprId,
}

/// Every function of one attention configuration, traced once into a
/// single graph.
///
/// Variables: `b`, `h`, `q_idx`, `kv_idx` (coordinates), `scores` (raw
/// score scalar, or the block of modified scores in the streaming step),
/// `o` (output accumulator), online state names, final state names, `dp`,
/// `doosum`, `dscores` and one tensor placeholder per custom input.
///
/// `forward` is composed on top of `score`, so both it and the backward
/// graphs are expressed in terms of the raw score.
#[derive(Clone, Debug)]
pub struct TracedAttention {
    pub graph: ExprGraph,
    /// User declarations followed by the online function's tensors.
    pub io: CustomIO,
    pub score: ExprId,
    pub mask: Option<ExprId>,
    pub online_init: Vec<(String, f64)>,
    pub online_fwd: OnlineFwdGraph,
    pub epilogue: EpilogueGraph,
    pub forward: ExprId,
    pub backward: Option<BackwardGraph>,
}

struct Recorded {
    score: Sym,
    raw: Sym,
    mask: Option<Sym>,
    step_scores: Sym,
    step_state: RowScales,
    o_scale: Sym,
    o: Sym,
    final_state: RowScales,
    forward: Sym,
    backward: Option<Sym>,
}

fn ids(state: &RowScales) -> Vec<(String, ExprId)> {
    state.iter().map(|(k, v)| (k.clone(), v.id())).collect()
}

fn check_keys(phase: &str, got: &RowScales, want: &[String]) -> Result<()> {
    let mut want = want.to_vec();
    want.sort();
    let got: Vec<_> = got.keys().cloned().collect();
    if got != want {
        return Err(EngineError::LoweringFailure(format!(
            "{phase} returned row scales {got:?}, declared {want:?}"
        )));
    }
    Ok(())
}

/// Trace score, mask and online functions.
///
/// The score gradient is computed only when `with_backward` is set; a
/// score function with no adjoint rule then fails with
/// `UnsupportedGradient`.
pub fn trace_configuration(
    io: &CustomIO,
    score_mod: Option<&ScoreFn<'_>>,
    mask_mod: Option<&MaskFn<'_>>,
    online: &dyn OnlineFunc,
    with_backward: bool,
) -> Result<TracedAttention> {
    let mut all_io = io.clone();
    all_io.merge(&online.external_fwd_tensors())?;

    let online_init = online.online_rowscales();
    let online_names: Vec<String> = online_init.iter().map(|(n, _)| n.clone()).collect();
    let final_names = online.final_rowscales();
    for name in online_names.iter().chain(&final_names) {
        if RESERVED_NAMES.contains(&name.as_str()) || all_io.get(name).is_some() {
            return Err(EngineError::DuplicateDeclaration(name.clone()));
        }
    }

    let (mut graph, rec) = attend_expr::trace(|| {
        let inputs = all_io.placeholders();
        let idx = AttnIndex {
            b: Sym::scalar("b"),
            h: Sym::scalar("h"),
            q_idx: Sym::scalar("q_idx"),
            kv_idx: Sym::scalar("kv_idx"),
        };
        let raw = Sym::scalar("scores");
        let score = match score_mod {
            Some(f) => f(raw, &idx, &inputs),
            None => raw,
        };
        let mask = mask_mod.map(|f| f(&idx, &inputs));

        let row = idx.row();
        let state: RowScales = online_names
            .iter()
            .map(|n| (n.clone(), Sym::row_scalar(n, ROW_AXES)))
            .collect();
        let step = online.online_fwd(Sym::array("scores", SCORE_AXES), state, &row, &inputs);

        let state: RowScales = online_names
            .iter()
            .map(|n| (n.clone(), Sym::row_scalar(n, ROW_AXES)))
            .collect();
        let (o, final_state) =
            online.online_fwd_epilogue(Sym::array("o", OUTPUT_AXES), state, &row, &inputs);

        let frozen: RowScales = final_names
            .iter()
            .map(|n| (n.clone(), Sym::scalar(n)))
            .collect();
        let forward = online.forward(score, &frozen, &idx, &inputs);
        let backward = with_backward.then(|| {
            let dp = Sym::scalar("dp");
            let doosum = Sym::scalar("doosum");
            online.backward(dp, forward, &frozen, doosum, &idx, &inputs)
        });

        Recorded {
            score,
            raw,
            mask,
            step_scores: step.scores,
            step_state: step.state,
            o_scale: step.o_scale,
            o,
            final_state,
            forward,
            backward,
        }
    })?;

    check_keys("online_fwd", &rec.step_state, &online_names)?;
    check_keys("online_fwd_epilogue", &rec.final_state, &final_names)?;
    if graph.kind(rec.score.id()) == ValueKind::Array {
        return Err(EngineError::TypeMismatch(
            "score function must return a per-element scalar".to_string(),
        ));
    }

    let backward = match rec.backward {
        Some(dscores_mod) => {
            let seed = graph.scalar("dscores");
            let grads = graph.backward(rec.score.id(), Some(seed))?;
            let dscores = match grads.get(rec.raw.id()) {
                Some(g) => g,
                None => graph.constant(0.0),
            };
            Some(BackwardGraph {
                dscores_mod: dscores_mod.id(),
                dscores,
            })
        }
        None => None,
    };

    Ok(TracedAttention {
        graph,
        io: all_io,
        score: rec.score.id(),
        mask: rec.mask.map(|m| m.id()),
        online_init,
        online_fwd: OnlineFwdGraph {
            scores: rec.step_scores.id(),
            state: ids(&rec.step_state),
            o_scale: rec.o_scale.id(),
        },
        epilogue: EpilogueGraph {
            o: rec.o.id(),
            final_state: ids(&rec.final_state),
        },
        forward: rec.forward.id(),
        backward,
    })
}

impl TracedAttention {
    /// Render the score and mask expressions, for logging.
    pub fn describe(&self) -> String {
        let mask = self
            .mask
            .map(|m| self.graph.fmt_expr(m))
            .unwrap_or_else(|| "none".to_string());
        format!("score={} mask={mask}", self.graph.fmt_expr(self.score))
    }
}
