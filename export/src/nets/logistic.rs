use super::layers::{self, ArgScope};
use super::{EndPoints, NetRegister, Network};
use crate::graph::{Graph, Output};

pub fn register_all_nets(reg: &mut NetRegister) {
    reg.insert("logistic", Network::new(ArgScope::default, logistic, 28));
}

/// Multinomial logistic regression on the raw pixels.
pub fn logistic(
    g: &mut Graph,
    images: &Output,
    num_classes: usize,
    _is_training: bool,
    _arg_scope: &ArgScope,
) -> anyhow::Result<(Output, EndPoints)> {
    let mut end_points = EndPoints::new();
    let logits = g.with_scope("Logistic", |g| {
        let net = layers::flatten(g, images)?;
        layers::fully_connected(g, &net, num_classes, "logits", false)
    })?;
    end_points.insert("Logits".into(), logits.clone());
    end_points.insert("Predictions".into(), layers::softmax(g, &logits)?);
    Ok((logits, end_points))
}
