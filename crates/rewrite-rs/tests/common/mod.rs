#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, OnceLock};

use rewrite_rs::layers::{Linear, Relu};
use rewrite_rs::module::NodeId;
use rewrite_rs::{ModuleTree, ModuleTreeBuilder, Shape, Tensor};
use tracing_subscriber::EnvFilter;

pub const BOTTLENECK: &str = "torchvision.models.resnet.Bottleneck";
pub const FEATURES: usize = 4;

static TEST_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serialises tests that touch the process-wide registry.
pub fn acquire_lock() -> MutexGuard<'static, ()> {
    TEST_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn x() -> Tensor {
    Tensor::vector(vec![1.0, 2.0, 3.0, 4.0, 5.0])
}

pub fn y() -> Tensor {
    Tensor::vector(vec![2.0, 4.0, 6.0, 8.0, 10.0])
}

pub fn assert_close(actual: &Tensor, expected: &Tensor) {
    let diff = actual
        .max_abs_diff(expected)
        .expect("tensors should have matching shapes");
    assert!(
        diff <= 1e-5,
        "tensors differ by {diff}: {:?} vs {:?}",
        actual.data(),
        expected.data()
    );
}

/// Deterministic square projection; `seed` varies the weights.
pub fn linear(seed: usize) -> Linear {
    let data = (0..FEATURES * FEATURES)
        .map(|i| ((i * 7 + seed * 3) % 11) as f32 * 0.1 - 0.4)
        .collect();
    let weight = Tensor::from_vec(Shape::new([FEATURES, FEATURES]), data).expect("weight shape");
    let bias = Tensor::vector((0..FEATURES).map(|i| i as f32 * 0.05).collect());
    Linear::new(weight, Some(bias)).expect("linear layer")
}

fn bottleneck(builder: &mut ModuleTreeBuilder, name: &str, seed: usize) -> NodeId {
    let conv1 = builder.layer("conv1", "torch.nn.Linear", linear(seed));
    let relu = builder.layer("relu", "torch.nn.ReLU", Relu);
    let conv2 = builder.layer("conv2", "torch.nn.Linear", linear(seed + 1));
    let body = builder.sequential("body", "torch.nn.Sequential", vec![conv1, relu, conv2]);
    builder.residual(name, BOTTLENECK, body, None)
}

/// Small residual network: `stem -> layer1[0..2] -> fc`, each `layer1` entry a bottleneck.
pub fn resnet() -> ModuleTree {
    let mut builder = ModuleTreeBuilder::new();
    let stem = builder.layer("stem", "torch.nn.Linear", linear(0));
    let block0 = bottleneck(&mut builder, "0", 1);
    let block1 = bottleneck(&mut builder, "1", 3);
    let layer1 = builder.sequential("layer1", "torch.nn.Sequential", vec![block0, block1]);
    let fc = builder.layer("fc", "torch.nn.Linear", linear(5));
    let root = builder.sequential(
        "",
        "torchvision.models.resnet.ResNet",
        vec![stem, layer1, fc],
    );
    builder.build(root).expect("resnet fixture")
}

pub fn image() -> Tensor {
    Tensor::from_vec(Shape::new([2, FEATURES]), vec![0.5, -1.0, 0.25, 2.0, 1.5, 0.0, -0.5, 1.0])
        .expect("input shape")
}
