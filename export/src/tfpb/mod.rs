use std::path::Path;

use anyhow::{Context, format_err};
use prost::Message;
use tract_core::prelude::Tensor;

pub mod tensorflow;

use self::tensorflow::attr_value::{ListValue, Value};
use self::tensorflow::tensor_shape_proto::Dim;
use self::tensorflow::{AttrValue, DataType, GraphDef, NodeDef, TensorProto, TensorShapeProto};

/// GraphDef producer version stamped on exported graphs.
pub const GRAPH_DEF_VERSION: i32 = 26;

pub fn graph() -> GraphDef {
    GraphDef {
        node: vec![],
        versions: Some(tensorflow::VersionDef {
            producer: GRAPH_DEF_VERSION,
            min_consumer: 0,
            bad_consumers: vec![],
        }),
        version: 0,
    }
}

pub fn node() -> NodeDef {
    NodeDef::default()
}

pub fn shape(dims: &[i64]) -> TensorShapeProto {
    TensorShapeProto {
        dim: dims.iter().map(|&size| Dim { size, name: String::new() }).collect(),
        unknown_rank: false,
    }
}

impl GraphDef {
    pub fn node(mut self, n: NodeDef) -> Self {
        self.node.push(n);
        self
    }

    pub fn node_by_name(&self, name: &str) -> Option<&NodeDef> {
        self.node.iter().find(|n| n.name == name)
    }

    pub fn write_to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf).map_err(|e| format_err!("Prost/Protobuf encoding error : {:?}", e))?;
        Ok(buf)
    }

    pub fn save_to<P: AsRef<Path>>(&self, p: P) -> anyhow::Result<()> {
        let buf = self.write_to_bytes()?;
        fs_err::write(p.as_ref(), buf)?;
        Ok(())
    }

    pub fn for_path<P: AsRef<Path>>(p: P) -> anyhow::Result<GraphDef> {
        let bytes = fs_err::read(p.as_ref())?;
        GraphDef::decode(&*bytes)
            .with_context(|| format!("Decoding GraphDef from {:?}", p.as_ref()))
    }
}

impl NodeDef {
    pub fn name<S: ToString>(mut self, n: S) -> NodeDef {
        self.name = n.to_string();
        self
    }
    pub fn op<S: ToString>(mut self, n: S) -> NodeDef {
        self.op = n.to_string();
        self
    }
    pub fn input<S: ToString>(mut self, n: S) -> NodeDef {
        self.input.push(n.to_string());
        self
    }
    pub fn attr<S: ToString, V: Into<AttrValue>>(mut self, n: S, v: V) -> NodeDef {
        self.attr.insert(n.to_string(), v.into());
        self
    }

    /// Names of the nodes this node reads from, data and control inputs alike.
    pub fn input_node_names(&self) -> impl Iterator<Item = &str> {
        self.input.iter().map(|i| node_name(i))
    }
}

/// Strips the control marker and output slot from an input reference.
///
/// From the node_def.proto documentation: each input is "node:src_output"
/// with "node" being a string name and "src_output" indicating which output
/// tensor to use from "node". If "src_output" is 0 the ":0" suffix can be
/// omitted. Regular inputs may optionally be followed by control inputs that
/// have the format "^node".
pub fn node_name(input: &str) -> &str {
    let input = input.strip_prefix('^').unwrap_or(input);
    match input.rsplit_once(':') {
        Some((name, slot)) if slot.chars().all(|c| c.is_ascii_digit()) => name,
        _ => input,
    }
}

impl NodeDef {
    pub fn get_attr_raw_str(&self, name: &str) -> anyhow::Result<&[u8]> {
        self.get_attr_opt_raw_str(name)?.ok_or_else(|| {
            format_err!("Node {} ({}) expected string attribute '{}'", self.name, self.op, name)
        })
    }

    pub fn get_attr_opt_raw_str(&self, name: &str) -> anyhow::Result<Option<&[u8]>> {
        if let Some(Value::S(bytes)) = self.attr.get(name).and_then(|a| a.value.as_ref()) {
            return Ok(Some(bytes));
        }
        Ok(None)
    }

    pub fn get_attr_str(&self, name: &str) -> anyhow::Result<String> {
        let bytes = self.get_attr_raw_str(name)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            format_err!(
                "Node {} ({}) expected an UTF-8 string for attribute '{}'",
                self.name,
                self.op,
                name
            )
        })
    }

    pub fn get_attr_opt_bool(&self, name: &str) -> anyhow::Result<Option<bool>> {
        if let Some(Value::B(v)) = self.attr.get(name).and_then(|a| a.value.as_ref()) {
            return Ok(Some(*v));
        }
        Ok(None)
    }

    pub fn get_attr_datum_type(&self, name: &str) -> anyhow::Result<DataType> {
        self.get_attr_opt_datum_type(name)?.ok_or_else(|| {
            format_err!("Node {} ({}) expected datum_type attribute '{}'", self.name, self.op, name)
        })
    }

    pub fn get_attr_opt_datum_type(&self, name: &str) -> anyhow::Result<Option<DataType>> {
        if let Some(Value::Type(v)) = self.attr.get(name).and_then(|a| a.value.as_ref()) {
            let dt = DataType::from_i32(*v)
                .ok_or_else(|| format_err!("Node {} has invalid data type {}", self.name, v))?;
            return Ok(Some(dt));
        }
        Ok(None)
    }

    pub fn get_attr_tensor(&self, name: &str) -> anyhow::Result<Tensor> {
        self.get_attr_opt_tensor(name)?.ok_or_else(|| {
            format_err!("Node {} ({}) expected tensor attribute '{}'", self.name, self.op, name)
        })
    }

    pub fn get_attr_opt_tensor(
        &self,
        name: &str,
    ) -> anyhow::Result<Option<Tensor>> {
        if let Some(Value::Tensor(t)) = self.attr.get(name).and_then(|a| a.value.as_ref()) {
            return Ok(Some(
                Tensor::try_from(t)
                    .with_context(|| format!("Reading tensor of node {}", self.name))?,
            ));
        }
        Ok(None)
    }

    pub fn get_attr_float(&self, name: &str) -> anyhow::Result<f32> {
        if let Some(Value::F(f)) = self.attr.get(name).and_then(|a| a.value.as_ref()) {
            return Ok(*f);
        }
        Err(format_err!("Node {} ({}) expected float attribute '{}'", self.name, self.op, name))
    }
}

impl From<DataType> for AttrValue {
    fn from(t: DataType) -> AttrValue {
        AttrValue { value: Some(Value::Type(t.into())) }
    }
}

impl<'a> From<&'a str> for AttrValue {
    fn from(t: &'a str) -> AttrValue {
        AttrValue { value: Some(Value::S(t.as_bytes().to_vec())) }
    }
}

impl From<bool> for AttrValue {
    fn from(t: bool) -> AttrValue {
        AttrValue { value: Some(Value::B(t)) }
    }
}

impl From<i32> for AttrValue {
    fn from(t: i32) -> AttrValue {
        AttrValue::from(t as i64)
    }
}

impl From<i64> for AttrValue {
    fn from(t: i64) -> AttrValue {
        AttrValue { value: Some(Value::I(t)) }
    }
}

impl From<f32> for AttrValue {
    fn from(t: f32) -> AttrValue {
        AttrValue { value: Some(Value::F(t)) }
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(t: Vec<i64>) -> AttrValue {
        AttrValue { value: Some(Value::List(ListValue { i: t, ..ListValue::default() })) }
    }
}

impl From<Vec<TensorShapeProto>> for AttrValue {
    fn from(t: Vec<TensorShapeProto>) -> AttrValue {
        AttrValue { value: Some(Value::List(ListValue { shape: t, ..ListValue::default() })) }
    }
}

impl From<TensorProto> for AttrValue {
    fn from(t: TensorProto) -> AttrValue {
        AttrValue { value: Some(Value::Tensor(t)) }
    }
}

impl From<TensorShapeProto> for AttrValue {
    fn from(t: TensorShapeProto) -> AttrValue {
        AttrValue { value: Some(Value::Shape(t)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_references() {
        assert_eq!(node_name("conv1/Conv2D"), "conv1/Conv2D");
        assert_eq!(node_name("TopKV2:1"), "TopKV2");
        assert_eq!(node_name("^legacy_init_op"), "legacy_init_op");
        assert_eq!(node_name("weird:name"), "weird:name");
    }

    #[test]
    fn attributes() -> anyhow::Result<()> {
        let n = node()
            .name("pool")
            .op("MaxPool")
            .attr("T", DataType::DtFloat)
            .attr("padding", "VALID")
            .attr("ksize", vec![1i64, 2, 2, 1])
            .attr("epsilon", 0.001f32)
            .attr("is_training", false);
        assert_eq!(n.get_attr_datum_type("T")?, DataType::DtFloat);
        assert_eq!(n.get_attr_str("padding")?, "VALID");
        assert_eq!(n.get_attr_float("epsilon")?, 0.001);
        assert_eq!(n.get_attr_opt_bool("is_training")?, Some(false));
        assert!(n.get_attr_str("data_format").is_err());
        assert!(n.get_attr_opt_tensor("value")?.is_none());
        Ok(())
    }

    #[test]
    fn graph_encoding_is_stable() -> anyhow::Result<()> {
        let mk = || {
            graph().node(
                node()
                    .name("a")
                    .op("Placeholder")
                    .attr("shape", shape(&[-1, 4]))
                    .attr("dtype", DataType::DtFloat)
                    .attr("_class", "x"),
            )
        };
        let bytes = mk().write_to_bytes()?;
        assert_eq!(bytes, mk().write_to_bytes()?);
        assert_eq!(GraphDef::decode(&*bytes)?, mk());
        Ok(())
    }
}
