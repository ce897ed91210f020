//! Layer helpers creating their variables under a named scope.

use anyhow::{bail, ensure};
use tract_core::prelude::*;

use crate::graph::{Graph, Output, Padding};
use crate::tfpb::tensorflow::DataType;

/// Layer defaults shared by the layers of a network.
#[derive(Clone, Debug, Default)]
pub struct ArgScope {
    /// Normalize convolution outputs instead of adding biases.
    pub conv_normalizer: Option<BatchNormParams>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchNormParams {
    pub epsilon: f32,
    /// Learn a `gamma` multiplier. A constant one is used otherwise.
    pub scale: bool,
}

impl Default for BatchNormParams {
    fn default() -> BatchNormParams {
        BatchNormParams { epsilon: 0.001, scale: false }
    }
}

fn weights(g: &mut Graph, shape: &[usize]) -> anyhow::Result<Output> {
    g.variable_node("weights", DataType::DtFloat, shape, true, true)
}

fn biases(g: &mut Graph, size: usize) -> anyhow::Result<Output> {
    g.variable_node("biases", DataType::DtFloat, &[size], true, true)
}

/// SAME-padded, stride 1 convolution followed by bias (or batch norm) and relu.
pub fn conv2d(
    g: &mut Graph,
    x: &Output,
    num_outputs: usize,
    kernel: [usize; 2],
    scope: &str,
    arg_scope: &ArgScope,
) -> anyhow::Result<Output> {
    let channels = x.channels()?;
    g.with_scope(scope, |g| {
        let w = weights(g, &[kernel[0], kernel[1], channels, num_outputs])?;
        let net = g.conv2d(x, &w, [1, 1], Padding::Same)?;
        let net = match &arg_scope.conv_normalizer {
            Some(params) => batch_norm(g, &net, params)?,
            None => {
                let b = biases(g, num_outputs)?;
                g.bias_add(&net, &b)?
            }
        };
        Ok(g.relu(&net))
    })
}

pub fn batch_norm(g: &mut Graph, x: &Output, params: &BatchNormParams) -> anyhow::Result<Output> {
    let channels = x.channels()?;
    g.with_scope("BatchNorm", |g| {
        let beta = g.variable_node("beta", DataType::DtFloat, &[channels], true, true)?;
        let gamma = if params.scale {
            g.variable_node("gamma", DataType::DtFloat, &[channels], true, true)?
        } else {
            g.constant("Const", &Tensor::from_shape(&[channels], &vec![1f32; channels])?)?
        };
        let mean = g.variable_node("moving_mean", DataType::DtFloat, &[channels], true, false)?;
        let variance =
            g.variable_node("moving_variance", DataType::DtFloat, &[channels], true, false)?;
        g.fused_batch_norm(x, &gamma, &beta, &mean, &variance, params.epsilon)
    })
}

pub fn max_pool2d(g: &mut Graph, x: &Output, kernel: usize, stride: usize, scope: &str) -> anyhow::Result<Output> {
    g.with_scope(scope, |g| g.max_pool(x, [kernel, kernel], [stride, stride], Padding::Valid))
}

/// Collapses every dimension but the batch one.
pub fn flatten(g: &mut Graph, x: &Output) -> anyhow::Result<Output> {
    ensure!(x.rank() >= 2, "Inputs to Flatten must have at least rank 2, got {:?}", x.shape);
    let inner = &x.shape[1..];
    if inner.iter().any(|&d| d < 0) {
        bail!("Flatten needs known inner dimensions, got {:?}", x.shape);
    }
    let size: i64 = inner.iter().product();
    g.with_scope("Flatten", |g| g.with_scope("flatten", |g| g.reshape(x, &[-1, size])))
}

pub fn fully_connected(
    g: &mut Graph,
    x: &Output,
    num_outputs: usize,
    scope: &str,
    relu: bool,
) -> anyhow::Result<Output> {
    let inputs = x.channels()?;
    g.with_scope(scope, |g| {
        let w = weights(g, &[inputs, num_outputs])?;
        let net = g.mat_mul(x, &w)?;
        let b = biases(g, num_outputs)?;
        let net = g.bias_add(&net, &b)?;
        Ok(if relu { g.relu(&net) } else { net })
    })
}

/// Dropout is the identity at inference time; training graphs are not built.
pub fn dropout(x: &Output, is_training: bool) -> anyhow::Result<Output> {
    ensure!(!is_training, "Only inference graphs can be built (dropout after {})", x.node);
    Ok(x.clone())
}

pub fn softmax(g: &mut Graph, logits: &Output) -> anyhow::Result<Output> {
    g.with_scope("Predictions", |g| Ok(g.softmax(logits)))
}
