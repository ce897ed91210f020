//! Checkpoint export driver.
//!
//! Builds the inference graph of the configured network, restores its
//! variables from a checkpoint, freezes and optimizes the graph and writes
//! it either as a standalone frozen graph or as a SavedModel for serving.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::checkpoint::{Checkpoint, resolve_checkpoint};
use crate::config::Config;
use crate::freeze::convert_variables_to_constants;
use crate::graph::{Graph, Output};
use crate::nets::{self, EndPoints};
use crate::optim::optimize_for_inference;
use crate::saved_model::{
    LEGACY_INIT_OP_KEY, SavedModelBuilder, classification_signature_def, predict_signature_def,
    signature_constants, tag_constants,
};
use crate::session::{ExponentialMovingAverage, Saver, Session, VarList, variables_to_restore};
use crate::tfpb::tensorflow::{DataType, GraphDef};

/// Name of the input placeholder: a batch of flattened `S x S x 3` images.
pub const INPUT_NODE_NAME: &str = "images";

#[derive(Clone, Debug)]
pub struct InferenceGraph {
    pub graph: Graph,
    pub global_step: Output,
    /// Flattened input placeholder.
    pub image_data: Output,
    /// NHWC view of `image_data`.
    pub images: Output,
    pub logits: Output,
    pub end_points: EndPoints,
    /// Class probabilities, the `Predictions` end point.
    pub predictions: Output,
    pub class_scores: Output,
    pub predicted_classes: Output,
}

pub fn build_inference_graph(cfg: &Config) -> anyhow::Result<InferenceGraph> {
    let registry = nets::nets();
    let network = registry.get(&cfg.model_name)?;
    let size = cfg.input_size();
    if size != network.default_image_size {
        debug!(
            "{} is built for {}x{} inputs, exporting for {}x{}",
            cfg.model_name, network.default_image_size, network.default_image_size, size, size
        );
    }
    let mut graph = Graph::default();
    let global_step = graph.get_or_create_global_step()?;
    let side = size as i64;
    let image_data = graph.placeholder(INPUT_NODE_NAME, DataType::DtFloat, &[-1, side * side * 3]);
    let images = graph.reshape(&image_data, &[-1, side, side, 3])?;
    let (logits, end_points) = network.build(&mut graph, &images, cfg.num_classes, false)?;
    let predictions = end_points
        .get("Predictions")
        .ok_or_else(|| anyhow::format_err!("{} has no Predictions end point", cfg.model_name))?
        .clone();
    let (class_scores, predicted_classes) = graph.top_k(&predictions, cfg.num_classes)?;
    Ok(InferenceGraph {
        graph,
        global_step,
        image_data,
        images,
        logits,
        end_points,
        predictions,
        class_scores,
        predicted_classes,
    })
}

/// Checkpoint entries to restore, honoring moving averages when configured.
pub fn variables_to_restore_for(cfg: &Config, graph: &Graph) -> VarList {
    match cfg.moving_average_decay() {
        Some(decay) => ExponentialMovingAverage::new(decay).variables_to_restore(graph),
        None => variables_to_restore(graph),
    }
}

#[derive(Clone, Debug)]
pub struct FrozenModel {
    pub checkpoint: PathBuf,
    pub output_node_names: Vec<String>,
    /// Variables inlined, before optimization.
    pub constant_graph_def: GraphDef,
    pub optimized_graph_def: GraphDef,
    /// Node placements, when the session config logs them.
    pub device_placement: Vec<String>,
}

/// Restores `model` from a checkpoint and freezes the parts needed by the
/// exported outputs: the predictions, plus the top-k node when serving.
pub fn freeze(
    model: &InferenceGraph,
    checkpoint_path: impl AsRef<Path>,
    export_for_serving: bool,
    cfg: &Config,
) -> anyhow::Result<FrozenModel> {
    let saver = Saver::new(variables_to_restore_for(cfg, &model.graph)).with_reshape(true);
    let checkpoint = resolve_checkpoint(checkpoint_path)?;
    info!("Exporting model: {}", checkpoint.display());

    let mut session = Session::new(&model.graph, &cfg.session_config);
    saver.restore(&mut session, &Checkpoint::open(&checkpoint)?)?;

    let input_node_names = vec![model.image_data.node.clone()];
    let mut output_node_names = vec![model.predictions.node.clone()];
    if export_for_serving {
        output_node_names.push(model.class_scores.node.clone());
    }
    let constant_graph_def =
        convert_variables_to_constants(&session, &model.graph.as_graph_def(), &output_node_names)?;
    let optimized_graph_def = optimize_for_inference(
        &constant_graph_def,
        &input_node_names,
        &output_node_names,
        DataType::DtFloat,
    )?;
    let device_placement = session.log_device_placement(&optimized_graph_def);
    Ok(FrozenModel {
        checkpoint,
        output_node_names,
        constant_graph_def,
        optimized_graph_def,
        device_placement,
    })
}

pub fn frozen_graph_path(export_dir: impl AsRef<Path>, export_version: u64) -> PathBuf {
    export_dir.as_ref().join(format!("optimized_model-{export_version}.pb"))
}

/// Writes `optimized_model-<version>.pb`, creating `export_dir` if needed.
pub fn write_frozen_graph(
    graph_def: &GraphDef,
    export_dir: impl AsRef<Path>,
    export_version: u64,
) -> anyhow::Result<PathBuf> {
    fs_err::create_dir_all(export_dir.as_ref())?;
    let path = frozen_graph_path(export_dir, export_version);
    graph_def.save_to(&path)?;
    info!("Frozen graph written to: {:?}", path);
    Ok(path)
}

/// Writes a SavedModel bundle under `<export_dir>/<version>`, with a
/// classification signature as the serving default and a predict one.
pub fn write_saved_model(
    model: &InferenceGraph,
    frozen: &FrozenModel,
    export_dir: impl AsRef<Path>,
    export_version: u64,
) -> anyhow::Result<PathBuf> {
    let mut graph_def = frozen.optimized_graph_def.clone();
    graph_def.node.push(crate::tfpb::node().name(LEGACY_INIT_OP_KEY).op("NoOp"));

    let classification_signature =
        classification_signature_def(&model.image_data, &model.predicted_classes, &model.class_scores);
    let prediction_signature =
        predict_signature_def(&[("images", &model.image_data)], &[("scores", &model.predictions)]);
    let mut signature_def_map = BTreeMap::new();
    signature_def_map.insert("predict_images".to_string(), prediction_signature);
    signature_def_map.insert(
        signature_constants::DEFAULT_SERVING_SIGNATURE_DEF_KEY.to_string(),
        classification_signature,
    );

    let mut builder = SavedModelBuilder::new(export_dir.as_ref().join(export_version.to_string()));
    builder.add_meta_graph(
        graph_def,
        &[tag_constants::SERVING],
        signature_def_map,
        Some(LEGACY_INIT_OP_KEY),
    )?;
    builder.save()
}

/// Exports a checkpoint of the configured network.
///
/// `checkpoint_path` is a checkpoint file or prefix, or a directory in which
/// case its latest checkpoint is used. Returns the written frozen graph, or
/// the SavedModel directory when `export_for_serving` is set.
pub fn export(
    checkpoint_path: impl AsRef<Path>,
    export_dir: impl AsRef<Path>,
    export_version: u64,
    export_for_serving: bool,
    cfg: &Config,
) -> anyhow::Result<PathBuf> {
    let model = build_inference_graph(cfg)?;
    let frozen = freeze(&model, checkpoint_path, export_for_serving, cfg)?;
    if export_for_serving {
        write_saved_model(&model, &frozen, export_dir, export_version)
    } else {
        write_frozen_graph(&frozen.optimized_graph_def, export_dir, export_version)
    }
}
