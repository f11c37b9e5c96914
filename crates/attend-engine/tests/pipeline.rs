use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use attend_engine::{
    AttentionEngine, AttentionKernel, AttnIndex, CacheConfig, CustomIO, CustomInputs, Dim,
    EngineError, EngineOptions, HostBackend, HostTensor, Identity, KernelArg, KernelBackend,
    KernelCache, KernelTemplate, LoadedModule, ShapeMeta, Softmax, TunedConfig, TuningOptions,
};
use attend_expr::Sym;

/// Route engine logs to the test harness; `RUST_LOG=attend_engine=debug`
/// shows cache activity.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options(dir: &Path) -> EngineOptions {
    EngineOptions {
        cache: CacheConfig::at(dir),
        ..Default::default()
    }
}

fn pseudo_random(shape: &[usize], seed: u32) -> HostTensor {
    HostTensor::from_fn(shape, |i| {
        let x = (i as u32).wrapping_mul(2_654_435_761).wrapping_add(seed.wrapping_mul(97));
        ((x >> 7) % 2000) as f32 / 2000.0 - 0.5
    })
}

/// Dense softmax attention over `[B, H, L, D]` tensors with grouped heads
/// and an optional causal mask.
fn reference(q: &HostTensor, k: &HostTensor, v: &HostTensor, causal: bool) -> Vec<f32> {
    let (bs, hq, lq, d) = (q.shape()[0], q.shape()[1], q.shape()[2], q.shape()[3]);
    let (hk, lk, dv) = (k.shape()[1], k.shape()[2], v.shape()[3]);
    let group = hq / hk;
    let at = |t: &HostTensor, b: usize, h: usize, l: usize, width: usize, c: usize| {
        let heads = t.shape()[1];
        let len = t.shape()[2];
        t.data()[((b * heads + h) * len + l) * width + c] as f64
    };
    let mut out = Vec::new();
    for b in 0..bs {
        for h in 0..hq {
            for i in 0..lq {
                let qi = i + lk - lq;
                let s: Vec<f64> = (0..lk)
                    .map(|j| {
                        if causal && j > qi {
                            return f64::NEG_INFINITY;
                        }
                        (0..d).map(|c| at(q, b, h, i, d, c) * at(k, b, h / group, j, d, c)).sum()
                    })
                    .collect();
                let mx = s.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let e: Vec<f64> = s.iter().map(|x| (x - mx).exp()).collect();
                let sum: f64 = e.iter().sum();
                for c in 0..dv {
                    let o: f64 = (0..lk).map(|j| e[j] * at(v, b, h / group, j, dv, c)).sum();
                    out.push((o / sum) as f32);
                }
            }
        }
    }
    out
}

fn assert_close(got: &HostTensor, want: &[f32]) {
    assert_eq!(got.numel(), want.len());
    for (i, (a, b)) in got.data().iter().zip(want).enumerate() {
        assert!((a - b).abs() < 1e-5, "element {i}: {a} vs {b}");
    }
}

#[test]
fn identity_prefill_on_zeros() {
    let dir = tempfile::tempdir().unwrap();
    let meta = ShapeMeta::new(1, 4, 128, 128, 64);
    let score = |s: Sym, _: &AttnIndex, _: &CustomInputs| s;
    let attn = AttentionEngine::build(
        meta,
        &CustomIO::new(),
        Some(&score),
        None,
        &Identity,
        &options(dir.path()),
    )
    .unwrap();

    assert_eq!(attn.template(), KernelTemplate::Prefill);
    assert!(!attn.source().is_empty());
    assert!(attn.has_backward());
    assert!(attn.block_mask().is_none());

    let zeros = HostTensor::zeros(&[1, 4, 128, 64]);
    let out = attn.invoke(&zeros, &zeros, &zeros, &[]).unwrap();
    assert_eq!(out.shape(), &[1, 4, 128, 64]);
    assert!(out.data().iter().all(|&x| x == 0.0));
}

#[test]
fn softmax_prefill_with_tune_file() {
    let dir = tempfile::tempdir().unwrap();
    let tune_file = dir.path().join("fwd.json");
    let small = TunedConfig {
        block_m: 16,
        block_n: 16,
        num_stages: 1,
        num_threads: 64,
    };
    fs::write(&tune_file, serde_json::to_string(&small).unwrap()).unwrap();

    let meta = ShapeMeta::new(2, 2, 40, 40, 8);
    let opts = EngineOptions {
        tuning: TuningOptions {
            tune: true,
            tune_file: Some(tune_file),
            ..Default::default()
        },
        ..options(&dir.path().join("cache"))
    };
    let attn = AttentionEngine::build(meta, &CustomIO::new(), None, None, &Softmax, &opts).unwrap();
    assert!(attn.source().contains("#define BLOCK_N 16"));

    let q = pseudo_random(&[2, 2, 40, 8], 1);
    let k = pseudo_random(&[2, 2, 40, 8], 2);
    let v = pseudo_random(&[2, 2, 40, 8], 3);
    let out = attn.invoke(&q, &k, &v, &[]).unwrap();
    assert_close(&out, &reference(&q, &k, &v, false));
}

#[test]
fn causal_prefill_infers_block_mask() {
    let dir = tempfile::tempdir().unwrap();
    let meta = ShapeMeta::new(1, 2, 256, 256, 16);
    let causal = |idx: &AttnIndex, _: &CustomInputs| idx.q_idx - idx.kv_idx;
    let opts = EngineOptions {
        infer_mask: true,
        ..options(dir.path())
    };
    let attn = AttentionEngine::build(meta, &CustomIO::new(), None, Some(&causal), &Softmax, &opts)
        .unwrap();

    let bm = attn.block_mask().unwrap();
    // 128x128 tiles over a 256x256 lower triangle
    assert_eq!((bm.q_blocks, bm.kv_blocks), (2, 2));
    assert!(!bm.is_active(0, 1));
    assert_eq!(bm.active_count(), 3);

    let q = pseudo_random(&[1, 2, 256, 16], 4);
    let k = pseudo_random(&[1, 2, 256, 16], 5);
    let v = pseudo_random(&[1, 2, 256, 16], 6);
    let out = attn.invoke(&q, &k, &v, &[]).unwrap();
    assert_close(&out, &reference(&q, &k, &v, true));
}

#[test]
fn head_dependent_mask_matches_dense_build() {
    let dir = tempfile::tempdir().unwrap();
    let meta = ShapeMeta::new(1, 2, 256, 256, 16);
    // head 0 keeps key 0 only, head 1 keeps keys up to 128
    let by_head = |idx: &AttnIndex, _: &CustomInputs| idx.h * 128.0 - idx.kv_idx;
    let sparse_opts = EngineOptions {
        infer_mask: true,
        ..options(dir.path())
    };
    let sparse = AttentionEngine::build(meta, &CustomIO::new(), None, Some(&by_head), &Softmax, &sparse_opts)
        .unwrap();
    let dense = AttentionEngine::build(meta, &CustomIO::new(), None, Some(&by_head), &Softmax, &options(dir.path()))
        .unwrap();

    let bm = sparse.block_mask().unwrap();
    assert_eq!(bm.active, vec![true, true, true, true]);
    assert!(dense.block_mask().is_none());

    let q = pseudo_random(&[1, 2, 256, 16], 7);
    let k = pseudo_random(&[1, 2, 256, 16], 8);
    let v = pseudo_random(&[1, 2, 256, 16], 9);
    let want = dense.invoke(&q, &k, &v, &[]).unwrap();
    assert_close(&sparse.invoke(&q, &k, &v, &[]).unwrap(), want.data());
}

#[test]
fn zero_sized_tiles_in_tune_file_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let tune_file = dir.path().join("fwd.json");
    fs::write(
        &tune_file,
        r#"{"block_m":0,"block_n":0,"num_stages":1,"num_threads":1}"#,
    )
    .unwrap();
    let causal = |idx: &AttnIndex, _: &CustomInputs| idx.q_idx - idx.kv_idx;
    let opts = EngineOptions {
        infer_mask: true,
        tuning: TuningOptions {
            tune: true,
            tune_file: Some(tune_file),
            ..Default::default()
        },
        ..options(&dir.path().join("cache"))
    };
    let meta = ShapeMeta::new(1, 2, 64, 64, 8);
    match AttentionEngine::build(meta, &CustomIO::new(), None, Some(&causal), &Softmax, &opts) {
        Err(EngineError::UnsupportedConfiguration(msg)) => assert!(msg.contains("fwd.json"), "{msg}"),
        other => panic!("expected rejection, got {:?}", other.map(|a| a.digest().to_string())),
    }
}

#[test]
fn grouped_decode() {
    let dir = tempfile::tempdir().unwrap();
    let meta = ShapeMeta::new(1, 8, 1, 100, 16).with_kv_heads(2);
    let causal = |idx: &AttnIndex, _: &CustomInputs| idx.q_idx - idx.kv_idx;
    let attn = AttentionEngine::build(
        meta,
        &CustomIO::new(),
        None,
        Some(&causal),
        &Softmax,
        &options(dir.path()),
    )
    .unwrap();
    assert_eq!(attn.template(), KernelTemplate::DecodeGqa);
    assert!(!attn.has_backward());
    // the single query row sees every key
    assert_eq!(attn.block_mask().unwrap().active_count(), 2);

    let q = pseudo_random(&[1, 8, 1, 16], 7);
    let k = pseudo_random(&[1, 2, 100, 16], 8);
    let v = pseudo_random(&[1, 2, 100, 16], 9);
    let out = attn.invoke(&q, &k, &v, &[]).unwrap();
    assert_eq!(out.shape(), &[1, 8, 1, 16]);
    assert_close(&out, &reference(&q, &k, &v, true));
}

#[test]
fn latent_decode() {
    let dir = tempfile::tempdir().unwrap();
    let meta = ShapeMeta::new(1, 4, 1, 30, 12).with_kv_heads(1).with_value_dim(8);
    let opts = EngineOptions {
        kernel_template: Some(KernelTemplate::MlaDecode),
        ..options(dir.path())
    };
    let attn = AttentionEngine::build(meta, &CustomIO::new(), None, None, &Softmax, &opts).unwrap();
    assert_eq!(attn.template(), KernelTemplate::MlaDecode);

    let q = pseudo_random(&[1, 4, 1, 12], 10);
    let kv = pseudo_random(&[1, 1, 30, 12], 11);
    assert!(attn.invoke(&q, &kv, &kv, &[]).is_err());

    let out = attn.invoke_latent(&q, &kv, &[]).unwrap();
    let v = HostTensor::from_fn(&[1, 1, 30, 8], |i| kv.data()[(i / 8) * 12 + i % 8]);
    assert_close(&out, &reference(&q, &kv, &v, false));
}

#[test]
fn custom_tensor_bias() {
    let dir = tempfile::tempdir().unwrap();
    let meta = ShapeMeta::new(1, 2, 8, 8, 4);
    let io = CustomIO::new().with("kv_bias", &[Dim::KvLen]).unwrap();
    let score = |s: Sym, _: &AttnIndex, io: &CustomInputs| match io.get("kv_bias") {
        Some(bias) => s + bias,
        None => s,
    };
    let attn = AttentionEngine::build(meta, &io, Some(&score), None, &Softmax, &options(dir.path()))
        .unwrap();
    assert!(attn.source().contains("io_kv_bias"));

    // A large negative bias on every key but the last one concentrates
    // all weight there.
    let bias = HostTensor::from_fn(&[8], |i| if i == 7 { 0.0 } else { -1e4 });
    let q = pseudo_random(&[1, 2, 8, 4], 12);
    let k = pseudo_random(&[1, 2, 8, 4], 13);
    let v = pseudo_random(&[1, 2, 8, 4], 14);
    let out = attn.invoke(&q, &k, &v, &[&bias]).unwrap();
    for h in 0..2 {
        for i in 0..8 {
            for c in 0..4 {
                let got = out.data()[((h * 8) + i) * 4 + c];
                let want = v.data()[((h * 8) + 7) * 4 + c];
                assert!((got - want).abs() < 1e-5);
            }
        }
    }
    assert!(attn.invoke(&q, &k, &v, &[]).is_err());
}

#[test]
fn identical_configurations_share_a_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    let meta = ShapeMeta::new(1, 2, 32, 32, 8);
    let opts = options(dir.path());
    let a = AttentionEngine::build(meta, &CustomIO::new(), None, None, &Softmax, &opts).unwrap();
    let b = AttentionEngine::build(meta, &CustomIO::new(), None, None, &Softmax, &opts).unwrap();
    assert_eq!(a.digest(), b.digest());
    assert_eq!(a.cache_path(), b.cache_path());
    assert_eq!(a.source(), b.source());
    assert_eq!(fs::read_to_string(a.cache_path()).unwrap(), a.source());
    assert_eq!(KernelCache::open(dir.path()).unwrap().len().unwrap(), 1);

    let scaled = |s: Sym, _: &AttnIndex, _: &CustomInputs| s * 0.5;
    let c = AttentionEngine::build(meta, &CustomIO::new(), Some(&scaled), None, &Softmax, &opts)
        .unwrap();
    assert_ne!(a.digest(), c.digest());
    assert_eq!(KernelCache::open(dir.path()).unwrap().len().unwrap(), 2);
}

#[test]
fn corrupted_entry_is_regenerated() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let meta = ShapeMeta::new(1, 2, 32, 32, 8);
    let opts = options(dir.path());
    let first = AttentionEngine::build(meta, &CustomIO::new(), None, None, &Softmax, &opts).unwrap();
    fs::write(first.cache_path(), "// truncated").unwrap();

    let second = AttentionEngine::build(meta, &CustomIO::new(), None, None, &Softmax, &opts).unwrap();
    assert_eq!(second.digest(), first.digest());
    assert_eq!(fs::read_to_string(second.cache_path()).unwrap(), first.source());

    let zeros = HostTensor::zeros(&[1, 2, 32, 8]);
    assert!(second.invoke(&zeros, &zeros, &zeros, &[]).is_ok());
}

struct Unloadable;

impl KernelBackend for Unloadable {
    fn name(&self) -> &str {
        "unloadable"
    }

    fn load(&self, _source: &str) -> attend_engine::Result<LoadedModule> {
        Err(EngineError::Backend("no device".to_string()))
    }
}

#[test]
fn persistent_load_failure_is_cache_corruption() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let opts = EngineOptions {
        backend: Arc::new(Unloadable),
        ..options(dir.path())
    };
    let err = AttentionEngine::build(
        ShapeMeta::new(1, 2, 32, 32, 8),
        &CustomIO::new(),
        None,
        None,
        &Softmax,
        &opts,
    )
    .unwrap_err();
    match err {
        EngineError::CacheCorruption { reason, .. } => assert!(reason.contains("no device")),
        other => panic!("unexpected error: {other}"),
    }
}

/// Records, per launch, whether the last argument was a block mask.
struct Recording {
    trailing_mask: Arc<Mutex<Vec<bool>>>,
}

struct RecordingKernel {
    inner: Arc<dyn AttentionKernel>,
    trailing_mask: Arc<Mutex<Vec<bool>>>,
}

impl AttentionKernel for RecordingKernel {
    fn entry(&self) -> &str {
        self.inner.entry()
    }

    fn launch(&self, args: &[KernelArg<'_>]) -> attend_engine::Result<HostTensor> {
        let last = matches!(args.last(), Some(KernelArg::BlockMask(_)));
        self.trailing_mask.lock().unwrap().push(last);
        self.inner.launch(args)
    }
}

impl KernelBackend for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    fn load(&self, source: &str) -> attend_engine::Result<LoadedModule> {
        let module = HostBackend.load(source)?;
        Ok(LoadedModule {
            forward: Arc::new(RecordingKernel {
                inner: module.forward,
                trailing_mask: self.trailing_mask.clone(),
            }),
            block_mask: module.block_mask,
        })
    }
}

#[test]
fn block_mask_is_passed_only_when_present() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let opts = EngineOptions {
        backend: Arc::new(Recording {
            trailing_mask: seen.clone(),
        }),
        ..options(dir.path())
    };
    let meta = ShapeMeta::new(1, 1, 16, 16, 4);
    let causal = |idx: &AttnIndex, _: &CustomInputs| idx.q_idx - idx.kv_idx;
    let zeros = HostTensor::zeros(&[1, 1, 16, 4]);

    let dense = AttentionEngine::build(meta, &CustomIO::new(), None, Some(&causal), &Softmax, &opts)
        .unwrap();
    dense.invoke(&zeros, &zeros, &zeros, &[]).unwrap();

    let opts = EngineOptions {
        infer_mask: true,
        ..opts
    };
    let sparse = AttentionEngine::build(meta, &CustomIO::new(), None, Some(&causal), &Softmax, &opts)
        .unwrap();
    sparse.invoke(&zeros, &zeros, &zeros, &[]).unwrap();

    assert_eq!(*seen.lock().unwrap(), [false, true]);
}

#[test]
fn score_without_gradient_rule_fails_for_prefill_only() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());
    let score = |s: Sym, _: &AttnIndex, _: &CustomInputs| s.exp();

    let err = AttentionEngine::build(
        ShapeMeta::new(1, 2, 32, 32, 8),
        &CustomIO::new(),
        Some(&score),
        None,
        &Softmax,
        &opts,
    )
    .unwrap_err();
    assert!(err.is_unsupported_gradient());

    // decode templates have no backward pass
    let decode = AttentionEngine::build(
        ShapeMeta::new(1, 2, 1, 32, 8),
        &CustomIO::new(),
        Some(&score),
        None,
        &Softmax,
        &opts,
    );
    assert!(decode.is_ok());
}

#[test]
fn shapes_without_template_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = AttentionEngine::build(
        ShapeMeta::new(1, 2, 64, 32, 8),
        &CustomIO::new(),
        None,
        None,
        &Softmax,
        &options(dir.path()),
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedConfiguration(_)));
}
