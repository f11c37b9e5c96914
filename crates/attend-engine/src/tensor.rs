//! Row-major host tensors.

use crate::error::{EngineError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    /// Wrap `data`; its length must match `shape`.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(EngineError::TypeMismatch(format!(
                "{} values for shape {shape:?} ({numel} elements)",
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Fill element `i` with `f(i)`.
    pub fn from_fn(shape: &[usize], f: impl FnMut(usize) -> f32) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: (0..numel).map(f).collect(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Contiguous innermost row at `index` over the leading axes.
    pub(crate) fn row(&self, index: &[usize]) -> &[f32] {
        let inner = self.shape.last().copied().unwrap_or(1);
        let mut off = 0;
        for (i, &extent) in index.iter().zip(&self.shape) {
            off = off * extent + i;
        }
        &self.data[off * inner..(off + 1) * inner]
    }

    pub(crate) fn expect_shape(&self, what: &str, want: &[usize]) -> Result<()> {
        if self.shape != want {
            return Err(EngineError::Backend(format!(
                "{what}: expected shape {want:?}, got {:?}",
                self.shape
            )));
        }
        Ok(())
    }
}
