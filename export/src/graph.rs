//! Explicit graph-construction context.
//!
//! `Graph` accumulates `NodeDef`s the way TensorFlow's Python graph builder
//! does, with name scopes and unique naming, but as a plain value threaded
//! through the network builders. Every produced tensor is an [`Output`]
//! carrying its static type and shape (`-1` for unknown dimensions).

use std::collections::HashSet;

use anyhow::{bail, ensure, format_err};
use itertools::Itertools;
use tract_core::prelude::Tensor;

use crate::tfpb::tensorflow::{DataType, GraphDef, NodeDef, TensorProto};
use crate::tfpb::{self, node};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output {
    pub node: String,
    pub slot: usize,
    pub dtype: DataType,
    pub shape: Vec<i64>,
}

impl Output {
    /// Name of the tensor, as referenced by signatures: `node:slot`.
    pub fn tensor_name(&self) -> String {
        format!("{}:{}", self.node, self.slot)
    }

    /// Reference to the tensor as a node input.
    pub fn input_ref(&self) -> String {
        if self.slot == 0 { self.node.clone() } else { self.tensor_name() }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Innermost dimension, which must be known.
    pub fn channels(&self) -> anyhow::Result<usize> {
        match self.shape.last() {
            Some(&c) if c >= 0 => Ok(c as usize),
            _ => bail!("{} has no known innermost dimension ({:?})", self.node, self.shape),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub dtype: DataType,
    pub shape: Vec<usize>,
    /// Model variables are the ones tracked by moving averages.
    pub model: bool,
    pub trainable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Padding {
    Same,
    Valid,
}

impl Padding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Padding::Same => "SAME",
            Padding::Valid => "VALID",
        }
    }

    fn output_dim(&self, input: i64, kernel: usize, stride: usize) -> anyhow::Result<i64> {
        if input < 0 {
            return Ok(-1);
        }
        let input = input as usize;
        let out = match self {
            Padding::Same => input.div_ceil(stride),
            Padding::Valid => {
                ensure!(
                    kernel <= input,
                    "Negative dimension size caused by subtracting {} from {}",
                    kernel,
                    input
                );
                (input + 1 - kernel).div_ceil(stride)
            }
        };
        Ok(out as i64)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<NodeDef>,
    names: HashSet<String>,
    scopes: Vec<String>,
    variables: Vec<Variable>,
}

impl Graph {
    pub fn nodes(&self) -> &[NodeDef] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn as_graph_def(&self) -> GraphDef {
        GraphDef { node: self.nodes.clone(), ..tfpb::graph() }
    }

    /// Runs `f` with `scope` pushed on the name scope stack.
    pub fn with_scope<R>(
        &mut self,
        scope: &str,
        f: impl FnOnce(&mut Graph) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        self.scopes.push(scope.to_string());
        let result = f(self);
        self.scopes.pop();
        result
    }

    fn scoped_name(&self, name: &str) -> String {
        self.scopes.iter().map(|s| s.as_str()).chain(std::iter::once(name)).join("/")
    }

    /// Reserves a node name in the current scope, suffixing `_1`, `_2`, ...
    /// on collision.
    pub fn unique_name(&mut self, name: &str) -> String {
        let base = self.scoped_name(name);
        let mut candidate = base.clone();
        let mut ix = 0;
        while self.names.contains(&candidate) {
            ix += 1;
            candidate = format!("{base}_{ix}");
        }
        self.names.insert(candidate.clone());
        candidate
    }

    fn push(&mut self, node: NodeDef) -> String {
        let name = node.name.clone();
        self.names.insert(name.clone());
        self.nodes.push(node);
        name
    }

    fn output(node: String, slot: usize, dtype: DataType, shape: Vec<i64>) -> Output {
        Output { node, slot, dtype, shape }
    }

    pub fn placeholder(&mut self, name: &str, dtype: DataType, shape: &[i64]) -> Output {
        let name = self.unique_name(name);
        let name = self.push(
            node()
                .name(name)
                .op("Placeholder")
                .attr("dtype", dtype)
                .attr("shape", tfpb::shape(shape)),
        );
        Self::output(name, 0, dtype, shape.to_vec())
    }

    pub fn constant(&mut self, name: &str, tensor: &Tensor) -> anyhow::Result<Output> {
        let name = self.unique_name(name);
        self.named_constant(name, tensor)
    }

    fn named_constant(&mut self, name: String, tensor: &Tensor) -> anyhow::Result<Output> {
        let value = TensorProto::try_from(tensor)?;
        let dtype = DataType::try_from(tensor.datum_type())?;
        let name = self.push(node().name(name).op("Const").attr("dtype", dtype).attr("value", value));
        Ok(Self::output(name, 0, dtype, tensor.shape().iter().map(|&d| d as i64).collect()))
    }

    /// Creates a `VariableV2` and its `read` identity, returning the latter.
    pub fn variable_node(
        &mut self,
        name: &str,
        dtype: DataType,
        shape: &[usize],
        model: bool,
        trainable: bool,
    ) -> anyhow::Result<Output> {
        let name = self.scoped_name(name);
        ensure!(!self.names.contains(&name), "Variable {} already exists", name);
        let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
        let var = self.push(
            node()
                .name(&name)
                .op("VariableV2")
                .attr("dtype", dtype)
                .attr("shape", tfpb::shape(&dims))
                .attr("container", "")
                .attr("shared_name", ""),
        );
        self.variables.push(Variable {
            name: var.clone(),
            dtype,
            shape: shape.to_vec(),
            model,
            trainable,
        });
        let read =
            self.push(node().name(format!("{var}/read")).op("Identity").input(&var).attr("T", dtype));
        Ok(Self::output(read, 0, dtype, dims))
    }

    /// The training step counter, created on first use.
    pub fn get_or_create_global_step(&mut self) -> anyhow::Result<Output> {
        if let Some(var) = self.variable("global_step") {
            let read = format!("{}/read", var.name);
            return Ok(Self::output(read, 0, var.dtype, vec![]));
        }
        let scopes = std::mem::take(&mut self.scopes);
        let step = self.variable_node("global_step", DataType::DtInt64, &[], false, false);
        self.scopes = scopes;
        step
    }

    fn unary(&mut self, op: &str, x: &Output) -> Output {
        let name = self.unique_name(op);
        let name = self.push(node().name(name).op(op).input(x.input_ref()).attr("T", x.dtype));
        Self::output(name, 0, x.dtype, x.shape.clone())
    }

    pub fn identity(&mut self, x: &Output) -> Output {
        self.unary("Identity", x)
    }

    pub fn relu(&mut self, x: &Output) -> Output {
        self.unary("Relu", x)
    }

    pub fn softmax(&mut self, x: &Output) -> Output {
        self.unary("Softmax", x)
    }

    /// Reshapes `x`, resolving a single `-1` when the input size is known.
    pub fn reshape(&mut self, x: &Output, shape: &[i64]) -> anyhow::Result<Output> {
        ensure!(shape.iter().filter(|&&d| d == -1).count() <= 1, "Reshape to {:?}", shape);
        let mut out = shape.to_vec();
        if x.shape.iter().all(|&d| d >= 0) {
            let len: i64 = x.shape.iter().product();
            let known: i64 = shape.iter().filter(|&&d| d >= 0).product();
            match shape.iter().position(|&d| d == -1) {
                Some(ix) if known > 0 && len % known == 0 => out[ix] = len / known,
                None if known == len => (),
                _ => bail!("Can not reshape {} from {:?} to {:?}", x.node, x.shape, shape),
            }
        }
        let name = self.unique_name("Reshape");
        let shape_tensor =
            Tensor::from_shape(&[shape.len()], &shape.iter().map(|&d| d as i32).collect::<Vec<_>>())?;
        let shape_const = self.named_constant(format!("{name}/shape"), &shape_tensor)?;
        let name = self.push(
            node()
                .name(name)
                .op("Reshape")
                .input(x.input_ref())
                .input(shape_const.input_ref())
                .attr("T", x.dtype)
                .attr("Tshape", DataType::DtInt32),
        );
        Ok(Self::output(name, 0, x.dtype, out))
    }

    pub fn mat_mul(&mut self, a: &Output, b: &Output) -> anyhow::Result<Output> {
        ensure!(a.rank() == 2 && b.rank() == 2, "MatMul expects matrices, got {:?} {:?}", a, b);
        if a.shape[1] >= 0 && b.shape[0] >= 0 && a.shape[1] != b.shape[0] {
            bail!("MatMul dimension mismatch: {:?} x {:?}", a.shape, b.shape);
        }
        let name = self.unique_name("MatMul");
        let name = self.push(
            node()
                .name(name)
                .op("MatMul")
                .input(a.input_ref())
                .input(b.input_ref())
                .attr("T", a.dtype)
                .attr("transpose_a", false)
                .attr("transpose_b", false),
        );
        Ok(Self::output(name, 0, a.dtype, vec![a.shape[0], b.shape[1]]))
    }

    pub fn bias_add(&mut self, x: &Output, bias: &Output) -> anyhow::Result<Output> {
        ensure!(
            bias.rank() == 1 && x.channels()? == bias.channels()?,
            "BiasAdd: bias {:?} does not match {:?}",
            bias.shape,
            x.shape
        );
        let name = self.unique_name("BiasAdd");
        let name = self.push(
            node()
                .name(name)
                .op("BiasAdd")
                .input(x.input_ref())
                .input(bias.input_ref())
                .attr("T", x.dtype)
                .attr("data_format", "NHWC"),
        );
        Ok(Self::output(name, 0, x.dtype, x.shape.clone()))
    }

    /// NHWC convolution with an HWIO filter.
    pub fn conv2d(
        &mut self,
        x: &Output,
        filter: &Output,
        strides: [usize; 2],
        padding: Padding,
    ) -> anyhow::Result<Output> {
        ensure!(x.rank() == 4 && filter.rank() == 4, "Conv2D expects NHWC input and HWIO filter");
        let input_channels = x.channels()?;
        ensure!(
            filter.shape[2] == input_channels as i64,
            "Conv2D filter {:?} does not match input {:?}",
            filter.shape,
            x.shape
        );
        let shape = vec![
            x.shape[0],
            padding.output_dim(x.shape[1], filter.shape[0] as usize, strides[0])?,
            padding.output_dim(x.shape[2], filter.shape[1] as usize, strides[1])?,
            filter.shape[3],
        ];
        let name = self.unique_name("Conv2D");
        let name = self.push(
            node()
                .name(name)
                .op("Conv2D")
                .input(x.input_ref())
                .input(filter.input_ref())
                .attr("T", x.dtype)
                .attr("data_format", "NHWC")
                .attr("dilations", vec![1i64, 1, 1, 1])
                .attr("padding", padding.as_str())
                .attr("strides", vec![1, strides[0] as i64, strides[1] as i64, 1])
                .attr("use_cudnn_on_gpu", true),
        );
        Ok(Self::output(name, 0, x.dtype, shape))
    }

    pub fn max_pool(
        &mut self,
        x: &Output,
        ksize: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
    ) -> anyhow::Result<Output> {
        ensure!(x.rank() == 4, "MaxPool expects NHWC input, got {:?}", x.shape);
        let shape = vec![
            x.shape[0],
            padding.output_dim(x.shape[1], ksize[0], strides[0])?,
            padding.output_dim(x.shape[2], ksize[1], strides[1])?,
            x.shape[3],
        ];
        let name = self.unique_name("MaxPool");
        let name = self.push(
            node()
                .name(name)
                .op("MaxPool")
                .input(x.input_ref())
                .attr("T", x.dtype)
                .attr("data_format", "NHWC")
                .attr("ksize", vec![1, ksize[0] as i64, ksize[1] as i64, 1])
                .attr("padding", padding.as_str())
                .attr("strides", vec![1, strides[0] as i64, strides[1] as i64, 1]),
        );
        Ok(Self::output(name, 0, x.dtype, shape))
    }

    /// Inference-mode batch normalization. Only the `y` output is exposed.
    pub fn fused_batch_norm(
        &mut self,
        x: &Output,
        scale: &Output,
        offset: &Output,
        mean: &Output,
        variance: &Output,
        epsilon: f32,
    ) -> anyhow::Result<Output> {
        let channels = x.channels()?;
        for param in [scale, offset, mean, variance] {
            ensure!(
                param.shape == [channels as i64],
                "FusedBatchNorm parameter {} has shape {:?}, expected [{}]",
                param.node,
                param.shape,
                channels
            );
        }
        let name = self.unique_name("FusedBatchNorm");
        let name = self.push(
            node()
                .name(name)
                .op("FusedBatchNorm")
                .input(x.input_ref())
                .input(scale.input_ref())
                .input(offset.input_ref())
                .input(mean.input_ref())
                .input(variance.input_ref())
                .attr("T", x.dtype)
                .attr("data_format", "NHWC")
                .attr("epsilon", epsilon)
                .attr("is_training", false),
        );
        Ok(Self::output(name, 0, x.dtype, x.shape.clone()))
    }

    /// Values and indices of the `k` largest entries of the last dimension.
    pub fn top_k(&mut self, x: &Output, k: usize) -> anyhow::Result<(Output, Output)> {
        let last = x.channels()?;
        ensure!(k >= 1 && k <= last, "TopKV2: k={} for an innermost dimension of {}", k, last);
        let name = self.unique_name("TopKV2");
        let k_const = self.named_constant(format!("{name}/k"), &tract_core::prelude::tensor0(k as i32))?;
        let name = self.push(
            node()
                .name(name)
                .op("TopKV2")
                .input(x.input_ref())
                .input(k_const.input_ref())
                .attr("T", x.dtype)
                .attr("sorted", true),
        );
        let mut shape = x.shape.clone();
        *shape.last_mut().ok_or_else(|| format_err!("TopKV2 on a scalar"))? = k as i64;
        Ok((
            Self::output(name.clone(), 0, x.dtype, shape.clone()),
            Self::output(name, 1, DataType::DtInt32, shape),
        ))
    }

    /// A `NoOp` depending on `control_inputs`.
    pub fn no_op(&mut self, name: &str, control_inputs: &[&str]) -> String {
        let name = self.unique_name(name);
        let mut n = node().name(name).op("NoOp");
        for dep in control_inputs {
            n = n.input(format!("^{dep}"));
        }
        self.push(n)
    }
}
