use super::layers::{self, ArgScope};
use super::{EndPoints, NetRegister, Network};
use crate::graph::{Graph, Output};

pub fn register_all_nets(reg: &mut NetRegister) {
    reg.insert("mlp", Network::new(ArgScope::default, mlp, 28));
}

/// One hidden layer of 256 rectified units.
pub fn mlp(
    g: &mut Graph,
    images: &Output,
    num_classes: usize,
    is_training: bool,
    _arg_scope: &ArgScope,
) -> anyhow::Result<(Output, EndPoints)> {
    let mut end_points = EndPoints::new();
    let logits = g.with_scope("MLP", |g| {
        let net = layers::flatten(g, images)?;
        let net = layers::fully_connected(g, &net, 256, "fc1", true)?;
        end_points.insert("fc1".into(), net.clone());
        let net = layers::dropout(&net, is_training)?;
        layers::fully_connected(g, &net, num_classes, "logits", false)
    })?;
    end_points.insert("Logits".into(), logits.clone());
    end_points.insert("Predictions".into(), layers::softmax(g, &logits)?);
    Ok((logits, end_points))
}
