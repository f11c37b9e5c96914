//! User-declared auxiliary tensors.
//!
//! A [`CustomIO`] lists extra tensors (per-head biases, per-row scales, ...)
//! that score, mask and online functions may read. Each declaration becomes
//! a tensor placeholder while tracing and an extra kernel argument at run
//! time, in declaration order.

use std::collections::BTreeMap;

use attend_expr::Sym;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::meta::ShapeMeta;

/// Names bound by the engine itself; custom tensors may not shadow them.
pub const RESERVED_NAMES: &[&str] = &[
    "b", "h", "q_idx", "kv_idx", "scores", "dscores", "dp", "doosum", "o",
];

/// One axis of a custom tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    /// A fixed extent. Only `Fixed(1)` (a broadcast axis) can be indexed.
    Fixed(usize),
    Batch,
    Heads,
    QueryLen,
    KvLen,
}

impl Dim {
    fn extent(self, meta: &ShapeMeta) -> usize {
        match self {
            Dim::Fixed(n) => n,
            Dim::Batch => meta.batch,
            Dim::Heads => meta.q_heads,
            Dim::QueryLen => meta.q_len,
            Dim::KvLen => meta.kv_len,
        }
    }
}

/// Declaration of one custom tensor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDecl {
    pub name: String,
    pub shape: Vec<Dim>,
}

impl TensorDecl {
    /// Number of elements for the given problem size.
    pub fn numel(&self, meta: &ShapeMeta) -> usize {
        self.shape.iter().map(|d| d.extent(meta)).product()
    }

    /// Concrete shape for the given problem size.
    pub fn concrete_shape(&self, meta: &ShapeMeta) -> Vec<usize> {
        self.shape.iter().map(|d| d.extent(meta)).collect()
    }

    /// Whether an element depends on the key position.
    pub fn varies_along_kv(&self) -> bool {
        self.shape.contains(&Dim::KvLen)
    }

    /// Reject axes that cannot be indexed elementwise.
    pub fn check_indexable(&self) -> Result<()> {
        match self.shape.iter().find(|d| matches!(d, Dim::Fixed(n) if *n != 1)) {
            Some(d) => Err(EngineError::LoweringFailure(format!(
                "custom tensor `{}` has non-broadcast axis {d:?}",
                self.name
            ))),
            None => Ok(()),
        }
    }

    /// Row-major offset of the element addressed by `(b, h, q, kv)`.
    pub fn offset(&self, meta: &ShapeMeta, b: usize, h: usize, q: usize, kv: usize) -> usize {
        let mut off = 0;
        for d in &self.shape {
            let i = match d {
                Dim::Fixed(_) => 0,
                Dim::Batch => b,
                Dim::Heads => h,
                Dim::QueryLen => q,
                Dim::KvLen => kv,
            };
            off = off * d.extent(meta) + i;
        }
        off
    }

    /// CUDA index expression of the same offset.
    pub(crate) fn cuda_offset(&self) -> String {
        let mut off = String::from("0");
        for d in &self.shape {
            let (extent, idx) = match d {
                Dim::Fixed(_) => ("1", "0"),
                Dim::Batch => ("B", "b"),
                Dim::Heads => ("HQ", "h"),
                Dim::QueryLen => ("LQ", "q_row"),
                Dim::KvLen => ("LK", "kv_idx"),
            };
            off = format!("({off} * {extent} + {idx})");
        }
        off
    }
}

/// Ordered set of custom tensor declarations with unique names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomIO {
    decls: Vec<TensorDecl>,
}

impl CustomIO {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a tensor. Names must be unique and must not shadow a
    /// built-in variable.
    pub fn declare(&mut self, name: &str, shape: &[Dim]) -> Result<()> {
        if self.get(name).is_some() || RESERVED_NAMES.contains(&name) {
            return Err(EngineError::DuplicateDeclaration(name.to_string()));
        }
        self.decls.push(TensorDecl {
            name: name.to_string(),
            shape: shape.to_vec(),
        });
        Ok(())
    }

    /// Builder-style [`declare`](Self::declare).
    pub fn with(mut self, name: &str, shape: &[Dim]) -> Result<Self> {
        self.declare(name, shape)?;
        Ok(self)
    }

    /// Append every declaration of `other`.
    pub fn merge(&mut self, other: &CustomIO) -> Result<()> {
        for d in &other.decls {
            self.declare(&d.name, &d.shape)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TensorDecl> {
        self.decls.iter().find(|d| d.name == name)
    }

    pub fn decls(&self) -> &[TensorDecl] {
        &self.decls
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// Create one tensor placeholder per declaration in the active trace.
    pub(crate) fn placeholders(&self) -> CustomInputs {
        CustomInputs {
            values: self
                .decls
                .iter()
                .map(|d| (d.name.clone(), Sym::tensor(&d.name)))
                .collect(),
        }
    }
}

/// Placeholders of the declared custom tensors, handed to user functions
/// while tracing.
#[derive(Clone, Debug, Default)]
pub struct CustomInputs {
    values: BTreeMap<String, Sym>,
}

impl CustomInputs {
    /// Placeholder for `name`, if declared.
    pub fn get(&self, name: &str) -> Option<Sym> {
        self.values.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_rejected() {
        let mut io = CustomIO::new();
        io.declare("bias", &[Dim::Heads]).unwrap();
        assert!(matches!(
            io.declare("bias", &[Dim::Batch]),
            Err(EngineError::DuplicateDeclaration(n)) if n == "bias"
        ));
        assert!(matches!(
            io.declare("q_idx", &[Dim::QueryLen]),
            Err(EngineError::DuplicateDeclaration(_))
        ));
        assert_eq!(io.len(), 1);
    }

    #[test]
    fn merge_keeps_order_and_uniqueness() {
        let mut a = CustomIO::new().with("slope", &[Dim::Heads]).unwrap();
        let b = CustomIO::new().with("scale", &[Dim::Batch, Dim::Heads, Dim::QueryLen]).unwrap();
        a.merge(&b).unwrap();
        let names: Vec<_> = a.decls().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["slope", "scale"]);
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn offsets_are_row_major() {
        let meta = ShapeMeta::new(2, 3, 5, 7, 16);
        let d = TensorDecl {
            name: "t".into(),
            shape: vec![Dim::Batch, Dim::Fixed(1), Dim::Heads, Dim::KvLen],
        };
        assert_eq!(d.numel(&meta), 2 * 3 * 7);
        assert_eq!(d.offset(&meta, 1, 2, 4, 6), (1 * 3 + 2) * 7 + 6);
        assert!(d.check_indexable().is_ok());
        assert_eq!(d.cuda_offset(), "((((0 * B + b) * 1 + 0) * HQ + h) * LK + kv_idx)");
    }

    #[test]
    fn wide_fixed_axes_not_indexable() {
        let d = TensorDecl {
            name: "lut".into(),
            shape: vec![Dim::Fixed(16)],
        };
        assert!(matches!(d.check_indexable(), Err(EngineError::LoweringFailure(_))));
    }
}
