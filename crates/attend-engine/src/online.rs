//! The online-function contract.
//!
//! An [`OnlineFunc`] describes a streaming row reduction (softmax being the
//! classic case) as four small symbolic programs:
//!
//! | phase | runs | sees |
//! |---|---|---|
//! | `online_fwd` | once per key block | the block's score row and the carried state |
//! | `online_fwd_epilogue` | once per query row | the accumulated output and final state |
//! | `forward` | per element, backward pass | modified score and frozen final state |
//! | `backward` | per element, backward pass | `dp`, recomputed scores, final state, `doosum` |
//!
//! `forward` and `backward` must be elementwise; lowering rejects row
//! reductions there.

use std::collections::BTreeMap;
use std::fmt;

use attend_expr::{ReduceOp, Sym};

use crate::custom_io::{CustomIO, CustomInputs};
use crate::error::{EngineError, Result};

/// Row-scale state by name.
pub type RowScales = BTreeMap<String, Sym>;

/// Axis labels of per-row state.
pub const ROW_AXES: &[&str] = &["block_M"];
/// Axis labels of one block of scores.
pub const SCORE_AXES: &[&str] = &["block_M", "block_N"];
/// Axis labels of the output accumulator.
pub const OUTPUT_AXES: &[&str] = &["block_M", "dim"];

/// Symbolic coordinates of a query row.
#[derive(Clone, Copy, Debug)]
pub struct RowIndex {
    pub b: Sym,
    pub h: Sym,
    pub q_idx: Sym,
}

/// Symbolic coordinates of one attention element.
#[derive(Clone, Copy, Debug)]
pub struct AttnIndex {
    pub b: Sym,
    pub h: Sym,
    pub q_idx: Sym,
    pub kv_idx: Sym,
}

impl AttnIndex {
    /// The row part of this index.
    pub fn row(&self) -> RowIndex {
        RowIndex {
            b: self.b,
            h: self.h,
            q_idx: self.q_idx,
        }
    }
}

/// Result of one streaming step.
#[derive(Clone, Debug)]
pub struct OnlineStep {
    /// Transformed scores, multiplied into `V`.
    pub scores: Sym,
    /// Updated row-scale state.
    pub state: RowScales,
    /// Factor applied to the output accumulated so far.
    pub o_scale: Sym,
}

/// A streaming reduction over key blocks.
///
/// Every method has a default implementing the no-op reduction: scores pass
/// through unchanged, the output is never rescaled, the final state is the
/// online state and `dscores = dp`.
pub trait OnlineFunc {
    /// Online state slots and their initial values.
    fn online_rowscales(&self) -> Vec<(String, f64)> {
        Vec::new()
    }

    /// Names of the state slots frozen by the epilogue and kept for the
    /// backward pass.
    fn final_rowscales(&self) -> Vec<String> {
        self.online_rowscales().into_iter().map(|(n, _)| n).collect()
    }

    /// Extra forward-only tensors the phases read.
    fn external_fwd_tensors(&self) -> CustomIO {
        CustomIO::new()
    }

    /// One key block: `scores` is an array over `[block_M, block_N]`, each
    /// state entry a per-row scalar.
    fn online_fwd(
        &self,
        scores: Sym,
        state: RowScales,
        _idx: &RowIndex,
        _io: &CustomInputs,
    ) -> OnlineStep {
        OnlineStep {
            scores,
            state,
            o_scale: Sym::constant(1.0),
        }
    }

    /// After the last block: final scaling of `o` and the frozen state.
    fn online_fwd_epilogue(
        &self,
        o: Sym,
        state: RowScales,
        _idx: &RowIndex,
        _io: &CustomInputs,
    ) -> (Sym, RowScales) {
        (o, state)
    }

    /// Recompute transformed scores from modified scores and the final
    /// state.
    fn forward(
        &self,
        scores: Sym,
        _final_state: &RowScales,
        _idx: &AttnIndex,
        _io: &CustomInputs,
    ) -> Sym {
        scores
    }

    /// Local score gradient. `scores` is the output of
    /// [`forward`](Self::forward); `doosum` is the row sum of `dO * O`.
    fn backward(
        &self,
        dp: Sym,
        _scores: Sym,
        _final_state: &RowScales,
        _doosum: Sym,
        _idx: &AttnIndex,
        _io: &CustomInputs,
    ) -> Sym {
        dp
    }
}

/// The no-op reduction.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl OnlineFunc for Identity {}

/// Streaming softmax with running max `m` and running sum `r`; the
/// log-sum-exp `lse` is kept for backward.
#[derive(Clone, Copy, Debug, Default)]
pub struct Softmax;

/// Lower bound for the running max. Finite so that fully masked blocks
/// rescale by `exp(0)` instead of producing `inf - inf`.
const SOFTMAX_FLOOR: f64 = -1e30;

impl OnlineFunc for Softmax {
    fn online_rowscales(&self) -> Vec<(String, f64)> {
        vec![("m".to_string(), SOFTMAX_FLOOR), ("r".to_string(), 0.0)]
    }

    fn final_rowscales(&self) -> Vec<String> {
        vec!["lse".to_string()]
    }

    fn online_fwd(
        &self,
        scores: Sym,
        mut state: RowScales,
        _idx: &RowIndex,
        _io: &CustomInputs,
    ) -> OnlineStep {
        let m = state.get("m").copied().unwrap_or_else(|| Sym::constant(SOFTMAX_FLOOR));
        let r = state.get("r").copied().unwrap_or_else(|| Sym::constant(0.0));
        let m_new = m.max(scores.reduce(ReduceOp::Max));
        let p = (scores - m_new).exp();
        let o_scale = (m - m_new).exp();
        let r_new = r * o_scale + p.reduce(ReduceOp::Sum);
        state.insert("m".to_string(), m_new);
        state.insert("r".to_string(), r_new);
        OnlineStep {
            scores: p,
            state,
            o_scale,
        }
    }

    fn online_fwd_epilogue(
        &self,
        o: Sym,
        state: RowScales,
        _idx: &RowIndex,
        _io: &CustomInputs,
    ) -> (Sym, RowScales) {
        let m = state.get("m").copied().unwrap_or_else(|| Sym::constant(SOFTMAX_FLOOR));
        let r = state.get("r").copied().unwrap_or_else(|| Sym::constant(1.0));
        let mut fin = RowScales::new();
        fin.insert("lse".to_string(), m + r.log());
        (o / r, fin)
    }

    fn forward(
        &self,
        scores: Sym,
        final_state: &RowScales,
        _idx: &AttnIndex,
        _io: &CustomInputs,
    ) -> Sym {
        match final_state.get("lse") {
            Some(&lse) => (scores - lse).exp(),
            None => scores.exp(),
        }
    }

    fn backward(
        &self,
        dp: Sym,
        scores: Sym,
        _final_state: &RowScales,
        doosum: Sym,
        _idx: &AttnIndex,
        _io: &CustomInputs,
    ) -> Sym {
        scores * (dp - doosum)
    }
}

/// Where a query row is in the streaming state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlinePhase {
    Init,
    /// `blocks` key blocks folded in so far.
    Streaming { blocks: usize },
    Epilogue,
    Done,
    Backward,
}

impl fmt::Display for OnlinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnlinePhase::Init => write!(f, "init"),
            OnlinePhase::Streaming { blocks } => write!(f, "streaming ({blocks} blocks)"),
            OnlinePhase::Epilogue => write!(f, "epilogue"),
            OnlinePhase::Done => write!(f, "done"),
            OnlinePhase::Backward => write!(f, "backward"),
        }
    }
}

impl OnlinePhase {
    fn invalid(self, to: &str) -> EngineError {
        EngineError::Backend(format!("online reduction cannot go from {self} to {to}"))
    }

    /// Fold in one more key block.
    pub fn stream(self) -> Result<Self> {
        match self {
            OnlinePhase::Init => Ok(OnlinePhase::Streaming { blocks: 1 }),
            OnlinePhase::Streaming { blocks } => Ok(OnlinePhase::Streaming { blocks: blocks + 1 }),
            other => Err(other.invalid("streaming")),
        }
    }

    /// Enter the epilogue. Allowed straight from `Init` when every block of
    /// the row was skipped.
    pub fn epilogue(self) -> Result<Self> {
        match self {
            OnlinePhase::Init | OnlinePhase::Streaming { .. } => Ok(OnlinePhase::Epilogue),
            other => Err(other.invalid("epilogue")),
        }
    }

    /// Freeze the final state.
    pub fn finish(self) -> Result<Self> {
        match self {
            OnlinePhase::Epilogue => Ok(OnlinePhase::Done),
            other => Err(other.invalid("done")),
        }
    }

    /// Replay against the frozen state.
    pub fn backward(self) -> Result<Self> {
        match self {
            OnlinePhase::Done => Ok(OnlinePhase::Backward),
            other => Err(other.invalid("backward")),
        }
    }
}
