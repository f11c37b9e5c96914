//! attend-expr: expression graphs for custom attention programs.
//!
//! User score, mask and online-reduction functions are written against
//! [`Sym`] handles. Running them inside [`trace`] records every operation
//! into a fresh [`ExprGraph`], which can then be differentiated, evaluated
//! on the host, or emitted as kernel code.
//!
//! # Quick start
//!
//! ```
//! use attend_expr::{trace, Env, Sym, Value};
//!
//! let (mut g, (f, a, b)) = trace(|| {
//!     let a = Sym::scalar("a");
//!     let b = Sym::scalar("b");
//!     ((a + b) * a, a, b)
//! })
//! .unwrap();
//!
//! let grads = g.backward(f.id(), None).unwrap();
//! let da = grads.get(a.id()).unwrap();
//!
//! let env = Env::new().with("a", Value::Scalar(3.0)).with("b", Value::Scalar(4.0));
//! assert_eq!(g.eval(da, &env).unwrap(), Value::Scalar(10.0));
//! # let _ = b;
//! ```

pub mod codegen;
pub mod diff;
pub mod display;
pub mod error;
pub mod eval;
pub mod graph;
pub mod node;
mod sym;

pub use codegen::{EmitContext, Emitted};
pub use diff::Gradients;
pub use error::{ExprError, Result};
pub use eval::{Env, Value};
pub use graph::{ExprGraph, TraceId};
pub use node::{ExprId, Node, ReduceOp, SymbolId, ValueKind};
pub use sym::{Operand, Sym};

use std::cell::RefCell;

/// Graph being recorded on this thread, plus the first error hit by an
/// operator that could not report it directly.
#[derive(Default)]
struct TraceState {
    graph: ExprGraph,
    error: Option<ExprError>,
    active: bool,
}

thread_local! {
    static TRACE: RefCell<TraceState> = RefCell::new(TraceState::default());
}

/// Access the thread-local graph.
///
/// Fails with `NoActiveTrace` outside of [`trace`].
pub fn with_graph<F, R>(f: F) -> Result<R>
where
    F: FnOnce(&mut ExprGraph) -> R,
{
    TRACE.with(|t| {
        let mut state = t.borrow_mut();
        if !state.active {
            return Err(ExprError::NoActiveTrace);
        }
        Ok(f(&mut state.graph))
    })
}

/// Record an error from an infallible operator. Only the first one is kept.
pub(crate) fn poison(err: ExprError) {
    TRACE.with(|t| {
        let mut state = t.borrow_mut();
        if state.error.is_none() {
            state.error = Some(err);
        }
    });
}

/// Run a closure with a fresh graph, returning the graph and result.
///
/// Installs a new empty graph, runs `f` (which builds expressions through
/// `Sym` arithmetic), then extracts the graph. Traces nest: an inner trace
/// records into its own graph and restores the outer one afterwards.
///
/// If any operator recorded an error while `f` ran, that error is returned
/// instead of the graph.
pub fn trace<F, R>(f: F) -> Result<(ExprGraph, R)>
where
    F: FnOnce() -> R,
{
    let fresh = TraceState {
        active: true,
        ..TraceState::default()
    };
    let old = TRACE.with(|t| std::mem::replace(&mut *t.borrow_mut(), fresh));
    let result = f();
    let state = TRACE.with(|t| std::mem::replace(&mut *t.borrow_mut(), old));
    match state.error {
        Some(err) => Err(err),
        None => Ok((state.graph, result)),
    }
}
