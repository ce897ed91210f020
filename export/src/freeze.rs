//! Graph freezing: pruning to the nodes an output needs and inlining
//! variable values as constants.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, format_err};

use crate::session::Session;
use crate::tfpb::tensorflow::{DataType, GraphDef, NodeDef, TensorProto};
use crate::tfpb::{self, node, node_name};

pub const VARIABLE_OPS: &[&str] = &["Variable", "VariableV2", "VarHandleOp"];

/// Keeps the nodes `dest_nodes` transitively depend on, in their original
/// order.
pub fn extract_sub_graph<S: AsRef<str>>(
    graph_def: &GraphDef,
    dest_nodes: &[S],
) -> anyhow::Result<GraphDef> {
    let by_name: HashMap<&str, &NodeDef> =
        graph_def.node.iter().map(|n| (n.name.as_str(), n)).collect();
    let mut keep: HashSet<&str> = HashSet::new();
    let mut todo: Vec<&str> = vec![];
    for dest in dest_nodes {
        let dest = dest.as_ref();
        if !by_name.contains_key(dest) {
            bail!("{} is not in graph", dest);
        }
        todo.push(dest);
    }
    while let Some(name) = todo.pop() {
        if !keep.insert(name) {
            continue;
        }
        let n = by_name[name];
        for input in n.input_node_names() {
            if !by_name.contains_key(input) {
                bail!("Node {} has input {} which is not in graph", n.name, input);
            }
            todo.push(input);
        }
    }
    Ok(GraphDef {
        node: graph_def.node.iter().filter(|n| keep.contains(n.name.as_str())).cloned().collect(),
        versions: graph_def.versions.clone(),
        version: graph_def.version,
    })
}

fn const_from_variable(n: &NodeDef, value: &TensorProto) -> anyhow::Result<NodeDef> {
    let dtype = n.get_attr_datum_type("dtype")?;
    let value_dtype = DataType::from_i32(value.dtype)
        .ok_or_else(|| format_err!("Invalid dtype for value of {}", n.name))?;
    if dtype != value_dtype {
        bail!("Variable {} is {:?} but its value is {:?}", n.name, dtype, value_dtype);
    }
    let mut konst = node().name(&n.name).op("Const").attr("dtype", dtype).attr("value", value.clone());
    konst.device = n.device.clone();
    Ok(konst)
}

/// Replaces the variables `output_node_names` depend on by constants
/// holding their value in `session`.
pub fn convert_variables_to_constants<S: AsRef<str>>(
    session: &Session,
    graph_def: &GraphDef,
    output_node_names: &[S],
) -> anyhow::Result<GraphDef> {
    let inference_graph = extract_sub_graph(graph_def, output_node_names)?;
    let mut output = GraphDef { node: vec![], ..tfpb::graph() };
    output.versions = inference_graph.versions.clone();
    let mut how_many_converted = 0;
    for n in &inference_graph.node {
        if VARIABLE_OPS.contains(&&*n.op) {
            let value = session
                .variable_value(&n.name)
                .ok_or_else(|| format_err!("Variable {} was not restored", n.name))?;
            let value = TensorProto::try_from(value)?;
            output.node.push(const_from_variable(n, &value)?);
            how_many_converted += 1;
        } else if n.op == "ReadVariableOp" {
            let mut identity = n.clone();
            identity.op = "Identity".to_string();
            let dtype = n.get_attr_datum_type("dtype")?;
            identity.attr.remove("dtype");
            identity.attr.insert("T".to_string(), dtype.into());
            output.node.push(identity);
        } else {
            output.node.push(n.clone());
        }
    }
    info!("Froze {} variables.", how_many_converted);
    info!("Converted {} variables to const ops.", how_many_converted);
    Ok(output)
}

/// Names of the nodes of `graph_def` holding mutable state.
pub fn variable_nodes(graph_def: &GraphDef) -> Vec<&str> {
    graph_def
        .node
        .iter()
        .filter(|n| VARIABLE_OPS.contains(&&*n.op))
        .map(|n| n.name.as_str())
        .collect()
}

/// Reads back the value of a `Const` node.
pub fn const_value(graph_def: &GraphDef, name: &str) -> anyhow::Result<tract_core::prelude::Tensor> {
    let n = graph_def
        .node_by_name(node_name(name))
        .ok_or_else(|| format_err!("{} is not in graph", name))?;
    if n.op != "Const" {
        bail!("{} is a {}, not a Const", n.name, n.op);
    }
    n.get_attr_tensor("value")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::graph::Graph;
    use tract_core::prelude::*;

    fn config() -> SessionConfig {
        SessionConfig { log_device_placement: false, per_process_gpu_memory_fraction: 1.0 }
    }

    fn graph() -> anyhow::Result<(Graph, String)> {
        let mut g = Graph::default();
        g.get_or_create_global_step()?;
        let x = g.placeholder("x", DataType::DtFloat, &[-1, 3]);
        let w = g.variable_node("w", DataType::DtFloat, &[3, 2], true, true)?;
        let y = g.mat_mul(&x, &w)?;
        let y = g.softmax(&y);
        g.placeholder("unused", DataType::DtFloat, &[1]);
        Ok((g, y.node))
    }

    #[test]
    fn sub_graph() -> anyhow::Result<()> {
        let (g, output) = graph()?;
        let sub = extract_sub_graph(&g.as_graph_def(), &[&output])?;
        let names: Vec<&str> = sub.node.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["x", "w", "w/read", "MatMul", "Softmax"]);
        assert!(extract_sub_graph(&g.as_graph_def(), &["nope"]).is_err());
        Ok(())
    }

    #[test]
    fn variables_become_constants() -> anyhow::Result<()> {
        let (g, output) = graph()?;
        let mut session = Session::new(&g, &config());
        let w = Tensor::from_shape(&[3, 2], &[1f32, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        session.set_variable("w", w.clone())?;
        let frozen = convert_variables_to_constants(&session, &g.as_graph_def(), &[&output])?;
        assert!(variable_nodes(&frozen).is_empty());
        assert!(frozen.node_by_name("global_step").is_none());
        assert_eq!(const_value(&frozen, "w")?, w);
        assert_eq!(frozen.node_by_name("w/read").unwrap().op, "Identity");
        Ok(())
    }

    #[test]
    fn unrestored_variable() -> anyhow::Result<()> {
        let (g, output) = graph()?;
        let session = Session::new(&g, &config());
        let e = convert_variables_to_constants(&session, &g.as_graph_def(), &[&output]).unwrap_err();
        assert!(e.to_string().contains("Variable w was not restored"), "{e}");
        Ok(())
    }
}
