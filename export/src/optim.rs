//! Inference-time graph rewrites on frozen graphs.
//!
//! [`optimize_for_inference`] chains the passes: inputs become placeholders,
//! everything the outputs do not need is dropped, identities are spliced
//! out and batch normalizations following a convolution are folded into
//! the convolution filter.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, ensure, format_err};
use tract_core::prelude::*;

use crate::freeze::extract_sub_graph;
use crate::tfpb::tensorflow::{DataType, GraphDef, NodeDef, TensorProto};
use crate::tfpb::{node, node_name};

const TRAINING_OPS: &[&str] = &["Identity", "CheckNumerics"];
const BATCH_NORM_OPS: &[&str] = &["FusedBatchNorm", "FusedBatchNormV3"];

pub fn optimize_for_inference<S: AsRef<str>>(
    graph_def: &GraphDef,
    input_node_names: &[S],
    output_node_names: &[S],
    placeholder_type: DataType,
) -> anyhow::Result<GraphDef> {
    ensure_graph_is_valid(graph_def)?;
    let optimized = strip_unused(graph_def, input_node_names, output_node_names, placeholder_type)?;
    let optimized = remove_training_nodes(&optimized, output_node_names);
    let optimized = fold_batch_norms(&optimized)?;
    let optimized = extract_sub_graph(&optimized, output_node_names)?;
    ensure_graph_is_valid(&optimized)?;
    debug!(
        "Optimized graph from {} to {} nodes",
        graph_def.node.len(),
        optimized.node.len()
    );
    Ok(optimized)
}

/// Names are unique and every input refers to an existing node.
pub fn ensure_graph_is_valid(graph_def: &GraphDef) -> anyhow::Result<()> {
    let mut names = HashSet::new();
    for n in &graph_def.node {
        if !names.insert(n.name.as_str()) {
            bail!("Duplicate node names detected for {}", n.name);
        }
    }
    for n in &graph_def.node {
        for input in n.input_node_names() {
            if !names.contains(input) {
                bail!("Input for {} not found: {}", n.name, input);
            }
        }
    }
    Ok(())
}

/// Turns the inputs into placeholders and keeps what the outputs need.
pub fn strip_unused<S: AsRef<str>>(
    graph_def: &GraphDef,
    input_node_names: &[S],
    output_node_names: &[S],
    placeholder_type: DataType,
) -> anyhow::Result<GraphDef> {
    let mut not_found: HashSet<&str> = input_node_names.iter().map(|s| s.as_ref()).collect();
    let mut inputs_replaced = GraphDef { node: vec![], ..graph_def.clone() };
    for n in &graph_def.node {
        if not_found.remove(n.name.as_str()) {
            let mut placeholder =
                node().name(&n.name).op("Placeholder").attr("dtype", placeholder_type);
            for key in ["shape", "_output_shapes"] {
                if let Some(value) = n.attr.get(key) {
                    placeholder.attr.insert(key.to_string(), value.clone());
                }
            }
            inputs_replaced.node.push(placeholder);
        } else {
            inputs_replaced.node.push(n.clone());
        }
    }
    if !not_found.is_empty() {
        let mut missing: Vec<&str> = not_found.into_iter().collect();
        missing.sort();
        bail!("The following input nodes were not found: {:?}", missing);
    }
    extract_sub_graph(&inputs_replaced, output_node_names)
}

/// Splices out identity-like nodes, except protected ones and those
/// carrying control dependencies.
pub fn remove_training_nodes<S: AsRef<str>>(graph_def: &GraphDef, protected: &[S]) -> GraphDef {
    let protected: HashSet<&str> = protected.iter().map(|s| s.as_ref()).collect();
    let splice: HashMap<&str, &str> = graph_def
        .node
        .iter()
        .filter(|n| {
            TRAINING_OPS.contains(&&*n.op)
                && !protected.contains(n.name.as_str())
                && !n.input.is_empty()
                && !n.input.iter().any(|i| i.starts_with('^'))
        })
        .map(|n| (n.name.as_str(), n.input[0].as_str()))
        .collect();
    let resolve = |input: &str| -> String {
        let control = input.starts_with('^');
        let mut current = input.trim_start_matches('^').to_string();
        while let Some(target) = splice.get(node_name(&current)) {
            // only slot 0 of an identity exists
            current = target.to_string();
        }
        if control { format!("^{}", node_name(&current)) } else { current }
    };
    let node = graph_def
        .node
        .iter()
        .filter(|n| !splice.contains_key(n.name.as_str()))
        .map(|n| {
            let mut n = n.clone();
            n.input = n.input.iter().map(|i| resolve(i)).collect();
            n
        })
        .collect();
    GraphDef { node, ..graph_def.clone() }
}

fn consumers(graph_def: &GraphDef) -> HashMap<&str, Vec<&str>> {
    let mut consumers: HashMap<&str, Vec<&str>> = HashMap::new();
    for n in &graph_def.node {
        for input in &n.input {
            if !input.starts_with('^') {
                consumers.entry(node_name(input)).or_default().push(input);
            }
        }
    }
    consumers
}

struct Fold {
    weights: String,
    scaled_weights: Tensor,
    offset: Tensor,
}

/// Computes the folding of batch norm `bn` in its input convolution, if the
/// pattern matches.
fn plan_fold(
    graph_def: &GraphDef,
    consumers: &HashMap<&str, Vec<&str>>,
    bn: &NodeDef,
) -> anyhow::Result<Option<Fold>> {
    if bn.get_attr_opt_bool("is_training")?.unwrap_or(true) {
        return Ok(None);
    }
    if bn.input.len() < 5 || node_name(&bn.input[0]) != bn.input[0] {
        return Ok(None);
    }
    // Only the normalized output may be used.
    if consumers.get(bn.name.as_str()).into_iter().flatten().any(|i| *i != bn.name) {
        return Ok(None);
    }
    let by_name = |name: &str| {
        graph_def.node_by_name(node_name(name)).ok_or_else(|| format_err!("{} is not in graph", name))
    };
    let conv = by_name(&bn.input[0])?;
    if conv.op != "Conv2D"
        || conv.input.len() < 2
        || consumers.get(conv.name.as_str()).map(|c| c.len()) != Some(1)
    {
        return Ok(None);
    }
    if conv.get_attr_opt_raw_str("data_format")?.unwrap_or(b"NHWC") != b"NHWC" {
        return Ok(None);
    }
    let weights = by_name(&conv.input[1])?;
    if weights.op != "Const" || consumers.get(weights.name.as_str()).map(|c| c.len()) != Some(1) {
        return Ok(None);
    }
    let mut params = vec![];
    for input in &bn.input[1..5] {
        let param = by_name(input)?;
        if param.op != "Const" {
            return Ok(None);
        }
        params.push(param.get_attr_tensor("value")?.cast_to::<f32>()?.into_owned());
    }
    let epsilon = bn.get_attr_float("epsilon")?;
    let filter = weights.get_attr_tensor("value")?;
    ensure!(filter.rank() == 4, "Conv2D {} filter is not 4D: {:?}", conv.name, filter.shape());
    let channels = filter.shape()[3];
    let (gamma, beta, mean, variance) = (
        params[0].as_slice::<f32>()?,
        params[1].as_slice::<f32>()?,
        params[2].as_slice::<f32>()?,
        params[3].as_slice::<f32>()?,
    );
    ensure!(
        [gamma, beta, mean, variance].iter().all(|p| p.len() == channels),
        "Batch norm {} parameters do not match the {} channels of {}",
        bn.name,
        channels,
        conv.name
    );
    let scale: Vec<f32> =
        gamma.iter().zip(variance).map(|(g, v)| g / (v + epsilon).sqrt()).collect();
    let offset: Vec<f32> =
        beta.iter().zip(mean).zip(&scale).map(|((b, m), s)| b - m * s).collect();
    let mut scaled = filter.cast_to::<f32>()?.into_owned();
    for (ix, w) in scaled.as_slice_mut::<f32>()?.iter_mut().enumerate() {
        *w *= scale[ix % channels];
    }
    Ok(Some(Fold {
        weights: weights.name.clone(),
        scaled_weights: scaled,
        offset: Tensor::from_shape(&[channels], &offset)?,
    }))
}

/// Folds inference batch normalizations into the filter of the
/// convolution they follow.
///
/// The batch norm node is replaced by a `BiasAdd` of the same name, fed by a
/// new `<name>_bn_offset` constant.
pub fn fold_batch_norms(graph_def: &GraphDef) -> anyhow::Result<GraphDef> {
    let consumers = consumers(graph_def);
    let mut folds: HashMap<&str, Fold> = HashMap::new();
    for bn in graph_def.node.iter().filter(|n| BATCH_NORM_OPS.contains(&&*n.op)) {
        if let Some(fold) = plan_fold(graph_def, &consumers, bn)? {
            debug!("Folding {} into {}", bn.name, bn.input[0]);
            folds.insert(bn.name.as_str(), fold);
        }
    }
    let scaled: HashMap<&str, &Tensor> =
        folds.values().map(|f| (f.weights.as_str(), &f.scaled_weights)).collect();
    let mut result = GraphDef { node: vec![], ..graph_def.clone() };
    for n in &graph_def.node {
        if let Some(tensor) = scaled.get(n.name.as_str()) {
            let mut weights = n.clone();
            weights.attr.insert("value".to_string(), TensorProto::try_from(*tensor)?.into());
            result.node.push(weights);
        } else if let Some(fold) = folds.get(n.name.as_str()) {
            let offset_name = format!("{}_bn_offset", n.name);
            result.node.push(
                node()
                    .name(&offset_name)
                    .op("Const")
                    .attr("dtype", DataType::DtFloat)
                    .attr("value", TensorProto::try_from(&fold.offset)?),
            );
            let mut bias_add = node()
                .name(&n.name)
                .op("BiasAdd")
                .input(&n.input[0])
                .input(&offset_name)
                .attr("T", DataType::DtFloat)
                .attr("data_format", "NHWC");
            bias_add.input.extend(n.input.iter().filter(|i| i.starts_with('^')).cloned());
            bias_add.device = n.device.clone();
            result.node.push(bias_add);
        } else {
            result.node.push(n.clone());
        }
    }
    Ok(result)
}
