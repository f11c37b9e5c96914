//! Shared helpers for attend benchmarks: seeded RNG, input generators and
//! the attention variants the benches compile.

use attend_engine::{AttnIndex, CustomIO, CustomInputs, Dim, HostTensor, Result, ShapeMeta};
use attend_expr::Sym;

/// Simple xoshiro256** PRNG for reproducible benchmarks.
pub struct Rng {
    s: [u64; 4],
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        // SplitMix64 to expand seed into state
        let mut z = seed;
        let mut s = [0u64; 4];
        for slot in &mut s {
            z = z.wrapping_add(0x9e3779b97f4a7c15);
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
            *slot = z ^ (z >> 31);
        }
        Self { s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.s[1].wrapping_mul(5)).rotate_left(7).wrapping_mul(9);
        let t = self.s[1] << 17;
        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);
        result
    }

    /// Uniform f32 in [-1, 1]
    pub fn f32(&mut self) -> f32 {
        ((self.next_u64() as f64) / (u64::MAX as f64) * 2.0 - 1.0) as f32
    }
}

pub fn make_rng() -> Rng {
    Rng::new(0xDEAD_BEEF_CAFE_BABE)
}

pub fn random_tensor(rng: &mut Rng, shape: &[usize]) -> HostTensor {
    HostTensor::from_fn(shape, |_| rng.f32())
}

/// Query, key and value tensors for `meta`.
pub fn random_qkv(meta: &ShapeMeta) -> (HostTensor, HostTensor, HostTensor) {
    let mut rng = make_rng();
    let q = random_tensor(&mut rng, &[meta.batch, meta.q_heads, meta.q_len, meta.head_dim]);
    let k = random_tensor(&mut rng, &[meta.batch, meta.kv_heads, meta.kv_len, meta.head_dim]);
    let v = random_tensor(&mut rng, &[meta.batch, meta.kv_heads, meta.kv_len, meta.value_dim]);
    (q, k, v)
}

// --- attention variants ---

/// One slope per head.
pub fn alibi_io() -> Result<CustomIO> {
    CustomIO::new().with("alibi", &[Dim::Heads])
}

pub fn alibi_slopes(meta: &ShapeMeta) -> HostTensor {
    HostTensor::from_fn(&[meta.q_heads], |h| 2f32.powi(-(h as i32 + 1)))
}

/// ALiBi: score plus slope times key distance.
pub fn alibi_score(s: Sym, idx: &AttnIndex, io: &CustomInputs) -> Sym {
    match io.get("alibi") {
        Some(slope) => s + slope * (idx.kv_idx - idx.q_idx),
        None => s,
    }
}

/// Scores scaled by 1/sqrt(64).
pub fn scaled_score(s: Sym, _: &AttnIndex, _: &CustomInputs) -> Sym {
    s * 0.125
}

pub fn causal_mask(idx: &AttnIndex, _: &CustomInputs) -> Sym {
    idx.q_idx - idx.kv_idx
}

/// Keys at most 255 positions behind the query.
pub fn sliding_window_mask(idx: &AttnIndex, _: &CustomInputs) -> Sym {
    let behind = idx.q_idx - idx.kv_idx;
    -((-behind).max(behind - 255.0))
}
