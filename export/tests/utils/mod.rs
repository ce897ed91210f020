#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use ndarray_npy::NpzWriter;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tfexport::export::InferenceGraph;
use tfexport::tfpb::tensorflow::DataType;
use tfexport::Config;
use tract_tensorflow::prelude::*;

pub type Values = BTreeMap<String, ArrayD<f32>>;

pub fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("TFEXPORT_LOG").try_init();
}

pub fn config(model_name: &str, num_classes: usize, input_size: usize) -> Config {
    Config::from_yaml(&format!(
        r#"
MODEL_NAME: {model_name}
NUM_CLASSES: {num_classes}
BATCH_SIZE: 32
IMAGE_PROCESSING:
  INPUT_SIZE: {input_size}
SESSION_CONFIG:
  LOG_DEVICE_PLACEMENT: false
  PER_PROCESS_GPU_MEMORY_FRACTION: 0.9
"#
    ))
    .unwrap()
}

/// Random values for every float variable of `model`.
pub fn random_values(model: &InferenceGraph, seed: u64) -> Values {
    let mut rng = SmallRng::seed_from_u64(seed);
    model
        .graph
        .variables()
        .iter()
        .filter(|v| v.dtype == DataType::DtFloat)
        .map(|v| {
            let len = v.shape.iter().product::<usize>();
            let data: Vec<f32> = if v.name.ends_with("moving_variance") {
                (0..len).map(|_| rng.gen_range(0.5..1.5)).collect()
            } else {
                (0..len).map(|_| rng.gen_range(-0.1..0.1)).collect()
            };
            (v.name.clone(), ArrayD::from_shape_vec(IxDyn(&v.shape), data).unwrap())
        })
        .collect()
}

/// Writes `<dir>/model.ckpt-<step>.npz` holding `values` and the global step.
pub fn write_checkpoint(dir: &Path, step: i64, values: &Values) -> PathBuf {
    let path = dir.join(format!("model.ckpt-{step}.npz"));
    let mut npz = NpzWriter::new(std::fs::File::create(&path).unwrap());
    npz.add_array("global_step", &ndarray::arr0(step)).unwrap();
    for (name, value) in values {
        npz.add_array(name.as_str(), value).unwrap();
    }
    npz.finish().unwrap();
    path
}

pub fn random_input(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Runs a frozen graph on a single flattened image.
pub fn run(path: &Path, cfg: &Config, input: &[f32]) -> Vec<f32> {
    let plan = tfexport::verify::load_frozen_graph(path, cfg).unwrap();
    let input = Tensor::from_shape(&[1, input.len()], input).unwrap();
    let outputs = plan.run(tvec!(input.into())).unwrap();
    outputs[0].as_slice::<f32>().unwrap().to_vec()
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}
