//! Variable values, restored from a checkpoint.
//!
//! A [`Session`] holds one tensor per graph variable. A [`Saver`] maps
//! checkpoint entries onto graph variables, optionally reading their
//! moving-average shadows instead of the raw values.

use std::collections::BTreeMap;

use anyhow::{bail, ensure, format_err};
use tract_core::prelude::*;

use crate::checkpoint::Checkpoint;
use crate::config::SessionConfig;
use crate::graph::{Graph, Variable};
use crate::tfpb::tensorflow::GraphDef;

pub const MOVING_AVERAGE_SUFFIX: &str = "ExponentialMovingAverage";

/// Device every node is placed on.
pub const CPU_DEVICE: &str = "/job:localhost/replica:0/task:0/device:CPU:0";

/// Maps checkpoint entry names to the variable they restore.
pub type VarList = BTreeMap<String, Variable>;

#[derive(Clone, Debug, new)]
pub struct ExponentialMovingAverage {
    pub decay: f32,
}

impl ExponentialMovingAverage {
    pub fn average_name(&self, var: &Variable) -> String {
        format!("{}/{}", var.name, MOVING_AVERAGE_SUFFIX)
    }

    /// Model variables restore from their shadow, the others from themselves.
    pub fn variables_to_restore(&self, graph: &Graph) -> VarList {
        debug!("Restoring moving averages of model variables (decay {})", self.decay);
        graph
            .variables()
            .iter()
            .map(|v| {
                let key = if v.model { self.average_name(v) } else { v.name.clone() };
                (key, v.clone())
            })
            .collect()
    }
}

/// Every variable, restored under its own name.
pub fn variables_to_restore(graph: &Graph) -> VarList {
    graph.variables().iter().map(|v| (v.name.clone(), v.clone())).collect()
}

#[derive(Clone, Debug)]
pub struct Saver {
    var_list: VarList,
    reshape: bool,
}

impl Saver {
    pub fn new(var_list: VarList) -> Saver {
        Saver { var_list, reshape: false }
    }

    /// Accept checkpoint tensors with the variable's element count but a
    /// different shape.
    pub fn with_reshape(self, reshape: bool) -> Saver {
        Saver { reshape, ..self }
    }

    pub fn restore(&self, session: &mut Session, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        info!("Restoring parameters from {:?}", checkpoint.path());
        for (key, var) in &self.var_list {
            let tensor = match checkpoint.get(key) {
                Some(t) => t,
                None if key.ends_with(MOVING_AVERAGE_SUFFIX) => {
                    let t = checkpoint.get(&var.name).ok_or_else(|| {
                        format_err!("Key {} not found in checkpoint {:?}", key, checkpoint.path())
                    })?;
                    warn!("No moving average for {}, restoring the raw variable", var.name);
                    t
                }
                None => bail!("Key {} not found in checkpoint {:?}", key, checkpoint.path()),
            };
            let tensor = self.conform(var, tensor)?;
            session.set_variable(&var.name, tensor)?;
        }
        Ok(())
    }

    fn conform(&self, var: &Variable, tensor: &Tensor) -> anyhow::Result<Tensor> {
        let dt = DatumType::try_from(var.dtype)?;
        ensure!(
            tensor.datum_type() == dt,
            "Checkpoint value for {} is {:?}, variable expects {:?}",
            var.name,
            tensor.datum_type(),
            dt
        );
        if tensor.shape() == &*var.shape {
            return Ok(tensor.clone());
        }
        if self.reshape && tensor.len() == var.shape.iter().product::<usize>() {
            debug!("Reshaping {} from {:?} to {:?}", var.name, tensor.shape(), var.shape);
            return tensor.clone().into_shape(&var.shape);
        }
        bail!(
            "Assign requires shapes of both tensors to match. {} expects {:?}, checkpoint has {:?}",
            var.name,
            var.shape,
            tensor.shape()
        )
    }
}

#[derive(Debug)]
pub struct Session<'g> {
    graph: &'g Graph,
    config: SessionConfig,
    values: BTreeMap<String, Tensor>,
}

impl<'g> Session<'g> {
    pub fn new(graph: &'g Graph, config: &SessionConfig) -> Session<'g> {
        debug!(
            "Session on {} (per process GPU memory fraction {})",
            CPU_DEVICE, config.per_process_gpu_memory_fraction
        );
        Session { graph, config: config.clone(), values: BTreeMap::new() }
    }

    pub fn set_variable(&mut self, name: &str, value: Tensor) -> anyhow::Result<()> {
        let var = self
            .graph
            .variable(name)
            .ok_or_else(|| format_err!("Variable {} is not in the graph", name))?;
        ensure!(
            value.shape() == &*var.shape && value.datum_type() == DatumType::try_from(var.dtype)?,
            "Can not assign {:?} to {} ({:?} {:?})",
            value,
            name,
            var.dtype,
            var.shape
        );
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    pub fn variable_value(&self, name: &str) -> Option<&Tensor> {
        self.values.get(name)
    }

    /// Variables with no restored value.
    pub fn uninitialized_variables(&self) -> Vec<&str> {
        self.graph
            .variables()
            .iter()
            .filter(|v| !self.values.contains_key(&v.name))
            .map(|v| v.name.as_str())
            .collect()
    }

    /// Logs the placement of every node of `graph_def` when the session
    /// config asks for it, and returns the logged lines.
    pub fn log_device_placement(&self, graph_def: &GraphDef) -> Vec<String> {
        if !self.config.log_device_placement {
            return vec![];
        }
        graph_def
            .node
            .iter()
            .map(|node| {
                let placement = format!("{}: ({}): {}", node.name, node.op, CPU_DEVICE);
                info!("{}", placement);
                placement
            })
            .collect()
    }
}
