use super::layers::{self, ArgScope, BatchNormParams};
use super::{EndPoints, NetRegister, Network};
use crate::graph::{Graph, Output};

pub fn register_all_nets(reg: &mut NetRegister) {
    reg.insert("lenet", Network::new(lenet_arg_scope, lenet, 28));
    reg.insert("lenet_bn", Network::new(lenet_bn_arg_scope, lenet, 28));
}

pub fn lenet_arg_scope() -> ArgScope {
    ArgScope::default()
}

/// LeNet with batch normalization after each convolution.
pub fn lenet_bn_arg_scope() -> ArgScope {
    ArgScope { conv_normalizer: Some(BatchNormParams::default()) }
}

/// Two conv/pool stages and two dense layers.
pub fn lenet(
    g: &mut Graph,
    images: &Output,
    num_classes: usize,
    is_training: bool,
    arg_scope: &ArgScope,
) -> anyhow::Result<(Output, EndPoints)> {
    let mut end_points = EndPoints::new();
    let logits = g.with_scope("LeNet", |g| {
        let net = layers::conv2d(g, images, 32, [5, 5], "conv1", arg_scope)?;
        end_points.insert("conv1".into(), net.clone());
        let net = layers::max_pool2d(g, &net, 2, 2, "pool1")?;
        end_points.insert("pool1".into(), net.clone());
        let net = layers::conv2d(g, &net, 64, [5, 5], "conv2", arg_scope)?;
        end_points.insert("conv2".into(), net.clone());
        let net = layers::max_pool2d(g, &net, 2, 2, "pool2")?;
        end_points.insert("pool2".into(), net.clone());
        let net = layers::flatten(g, &net)?;
        end_points.insert("Flatten".into(), net.clone());
        let net = layers::fully_connected(g, &net, 1024, "fc3", true)?;
        end_points.insert("fc3".into(), net.clone());
        let net = layers::dropout(&net, is_training)?;
        layers::fully_connected(g, &net, num_classes, "fc4", false)
    })?;
    end_points.insert("Logits".into(), logits.clone());
    end_points.insert("Predictions".into(), layers::softmax(g, &logits)?);
    Ok((logits, end_points))
}
