//! Shape metadata of an attention call.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Element type of the query/key/value tensors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[default]
    F16,
    Bf16,
    F32,
}

impl DType {
    /// CUDA C spelling of the element type.
    pub fn cuda_name(self) -> &'static str {
        match self {
            DType::F16 => "half",
            DType::Bf16 => "__nv_bfloat16",
            DType::F32 => "float",
        }
    }
}

/// Shape and dtype of one input tensor, `[batch, heads, seq, dim]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorMeta {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorMeta {
    pub fn new(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
        }
    }

    fn dims4(&self, what: &str) -> Result<[usize; 4]> {
        match self.shape[..] {
            [b, h, l, d] => Ok([b, h, l, d]),
            _ => Err(EngineError::TypeMismatch(format!(
                "{what} must be [batch, heads, seq, dim], got {:?}",
                self.shape
            ))),
        }
    }
}

/// Everything the template selector and lowering targets need to know about
/// the problem size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeMeta {
    pub batch: usize,
    pub q_len: usize,
    pub kv_len: usize,
    pub q_heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub value_dim: usize,
    pub dtype: DType,
}

impl ShapeMeta {
    /// Multi-head attention shape: equal query and key/value head counts,
    /// `value_dim == head_dim`, fp16.
    pub fn new(batch: usize, heads: usize, q_len: usize, kv_len: usize, head_dim: usize) -> Self {
        Self {
            batch,
            q_len,
            kv_len,
            q_heads: heads,
            kv_heads: heads,
            head_dim,
            value_dim: head_dim,
            dtype: DType::F16,
        }
    }

    pub fn with_kv_heads(mut self, kv_heads: usize) -> Self {
        self.kv_heads = kv_heads;
        self
    }

    pub fn with_value_dim(mut self, value_dim: usize) -> Self {
        self.value_dim = value_dim;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Derive the metadata from query, key and value tensor descriptions.
    pub fn from_tensors(q: &TensorMeta, k: &TensorMeta, v: &TensorMeta) -> Result<Self> {
        let [b, hq, lq, d] = q.dims4("query")?;
        let [kb, hk, lk, kd] = k.dims4("key")?;
        let [vb, vh, vl, dv] = v.dims4("value")?;
        if kb != b || vb != b {
            return Err(EngineError::TypeMismatch(format!(
                "batch sizes differ: q={b}, k={kb}, v={vb}"
            )));
        }
        if kd != d {
            return Err(EngineError::TypeMismatch(format!(
                "query head_dim {d} != key head_dim {kd}"
            )));
        }
        if vh != hk || vl != lk {
            return Err(EngineError::TypeMismatch(format!(
                "key {:?} and value {:?} disagree on heads/length",
                k.shape, v.shape
            )));
        }
        if q.dtype != k.dtype || q.dtype != v.dtype {
            return Err(EngineError::TypeMismatch("mixed q/k/v dtypes".to_string()));
        }
        let meta = Self {
            batch: b,
            q_len: lq,
            kv_len: lk,
            q_heads: hq,
            kv_heads: hk,
            head_dim: d,
            value_dim: dv,
            dtype: q.dtype,
        };
        meta.validate()?;
        Ok(meta)
    }

    /// Reject degenerate sizes and head counts that do not group evenly.
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("batch", self.batch),
            ("q_len", self.q_len),
            ("kv_len", self.kv_len),
            ("q_heads", self.q_heads),
            ("kv_heads", self.kv_heads),
            ("head_dim", self.head_dim),
            ("value_dim", self.value_dim),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(EngineError::UnsupportedConfiguration(format!("{name} is zero")));
        }
        if self.q_heads % self.kv_heads != 0 {
            return Err(EngineError::UnsupportedConfiguration(format!(
                "q_heads {} is not a multiple of kv_heads {}",
                self.q_heads, self.kv_heads
            )));
        }
        Ok(())
    }

    /// Query heads sharing one key/value head.
    pub fn group_size(&self) -> usize {
        self.q_heads / self.kv_heads.max(1)
    }

    /// Expected shape of the attention output.
    pub fn output_shape(&self) -> [usize; 4] {
        [self.batch, self.q_heads, self.q_len, self.value_dim]
    }
}
