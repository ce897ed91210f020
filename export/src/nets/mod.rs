//! Classification networks, looked up by name.
//!
//! Each network comes with an [`ArgScope`] holding the layer defaults it was
//! trained with, and builds its inference graph into a [`Graph`] from an NHWC
//! image batch.

use std::collections::{BTreeMap, HashMap};

use anyhow::format_err;

use crate::graph::{Graph, Output};

pub mod layers;
mod lenet;
mod logistic;
mod mlp;

pub use layers::{ArgScope, BatchNormParams};

/// Named intermediate tensors of a network. Always holds `Logits` and
/// `Predictions`.
pub type EndPoints = BTreeMap<String, Output>;

/// `(graph, images, num_classes, is_training, arg_scope) -> (logits, end_points)`
pub type NetworkFn =
    fn(&mut Graph, &Output, usize, bool, &ArgScope) -> anyhow::Result<(Output, EndPoints)>;

#[derive(Clone, Debug, new)]
pub struct Network {
    pub arg_scope: fn() -> ArgScope,
    pub network_fn: NetworkFn,
    /// Input size the network was designed for.
    pub default_image_size: usize,
}

impl Network {
    pub fn build(
        &self,
        graph: &mut Graph,
        images: &Output,
        num_classes: usize,
        is_training: bool,
    ) -> anyhow::Result<(Output, EndPoints)> {
        (self.network_fn)(graph, images, num_classes, is_training, &(self.arg_scope)())
    }
}

#[derive(Clone, Debug, Default)]
pub struct NetRegister(pub HashMap<String, Network>);

impl NetRegister {
    pub fn insert(&mut self, name: &str, network: Network) {
        self.0.insert(name.to_string(), network);
    }

    pub fn get(&self, name: &str) -> anyhow::Result<&Network> {
        self.0.get(name).ok_or_else(|| {
            format_err!("Unknown architecture {}. Known architectures: {}", name, self.names().join(", "))
        })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.0.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

pub fn register_all_nets(reg: &mut NetRegister) {
    lenet::register_all_nets(reg);
    logistic::register_all_nets(reg);
    mlp::register_all_nets(reg);
}

pub fn nets() -> NetRegister {
    let mut reg = NetRegister::default();
    register_all_nets(&mut reg);
    reg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tfpb::tensorflow::DataType;

    fn images(g: &mut Graph, size: i64) -> anyhow::Result<Output> {
        let x = g.placeholder("images", DataType::DtFloat, &[-1, size * size * 3]);
        g.reshape(&x, &[-1, size, size, 3])
    }

    #[test]
    fn unknown_network() {
        let e = nets().get("resnet_v9").unwrap_err().to_string();
        assert!(e.contains("Unknown architecture resnet_v9"), "{e}");
        assert!(e.contains("lenet, lenet_bn, logistic, mlp"), "{e}");
    }

    #[test]
    fn every_network_builds() -> anyhow::Result<()> {
        let reg = nets();
        for name in reg.names() {
            let mut g = Graph::default();
            let images = images(&mut g, 8)?;
            let (logits, end_points) = reg.get(name)?.build(&mut g, &images, 5, false)?;
            assert_eq!(logits.shape, vec![-1, 5], "{name}");
            assert_eq!(end_points["Logits"], logits);
            let predictions = &end_points["Predictions"];
            assert_eq!(predictions.shape, vec![-1, 5]);
            assert_eq!(g.node(&predictions.node).unwrap().op, "Softmax");
            assert!(g.variables().iter().all(|v| v.model), "{name}");
        }
        Ok(())
    }

    #[test]
    fn training_graphs_are_rejected() -> anyhow::Result<()> {
        let mut g = Graph::default();
        let images = images(&mut g, 8)?;
        assert!(nets().get("lenet")?.build(&mut g, &images, 5, true).is_err());
        Ok(())
    }
}
