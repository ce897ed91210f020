//! SavedModel bundles for serving.
//!
//! A bundle is a directory holding `saved_model.pb` (a [`SavedModel`]
//! protobuf) and a `variables/` directory. Exported graphs are frozen, so
//! the latter stays empty.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, format_err};
use prost::Message;

use crate::graph::Output;
use crate::tfpb::node_name;
use crate::tfpb::tensorflow::collection_def::{Kind, NodeList};
use crate::tfpb::tensorflow::meta_graph_def::MetaInfoDef;
use crate::tfpb::tensorflow::{
    CollectionDef, GraphDef, MetaGraphDef, SavedModel, SignatureDef, TensorInfo, tensor_info,
};
use crate::tfpb;

pub const SAVED_MODEL_SCHEMA_VERSION: i64 = 1;
pub const SAVED_MODEL_FILENAME_PB: &str = "saved_model.pb";
pub const VARIABLES_DIRECTORY: &str = "variables";
pub const LEGACY_INIT_OP_KEY: &str = "legacy_init_op";

pub mod tag_constants {
    pub const SERVING: &str = "serve";
}

pub mod signature_constants {
    pub const DEFAULT_SERVING_SIGNATURE_DEF_KEY: &str = "serving_default";
    pub const CLASSIFY_INPUTS: &str = "inputs";
    pub const CLASSIFY_OUTPUT_CLASSES: &str = "classes";
    pub const CLASSIFY_OUTPUT_SCORES: &str = "scores";
    pub const CLASSIFY_METHOD_NAME: &str = "tensorflow/serving/classify";
    pub const PREDICT_METHOD_NAME: &str = "tensorflow/serving/predict";
}

pub fn build_tensor_info(output: &Output) -> TensorInfo {
    TensorInfo {
        dtype: output.dtype.into(),
        tensor_shape: Some(tfpb::shape(&output.shape)),
        encoding: Some(tensor_info::Encoding::Name(output.tensor_name())),
    }
}

pub fn build_signature_def(
    inputs: BTreeMap<String, TensorInfo>,
    outputs: BTreeMap<String, TensorInfo>,
    method_name: &str,
) -> SignatureDef {
    SignatureDef { inputs, outputs, method_name: method_name.to_string() }
}

fn tensor_infos(named: &[(&str, &Output)]) -> BTreeMap<String, TensorInfo> {
    named.iter().map(|(k, o)| (k.to_string(), build_tensor_info(o))).collect()
}

pub fn classification_signature_def(input: &Output, classes: &Output, scores: &Output) -> SignatureDef {
    use signature_constants::*;
    build_signature_def(
        tensor_infos(&[(CLASSIFY_INPUTS, input)]),
        tensor_infos(&[(CLASSIFY_OUTPUT_CLASSES, classes), (CLASSIFY_OUTPUT_SCORES, scores)]),
        CLASSIFY_METHOD_NAME,
    )
}

pub fn predict_signature_def(inputs: &[(&str, &Output)], outputs: &[(&str, &Output)]) -> SignatureDef {
    build_signature_def(
        tensor_infos(inputs),
        tensor_infos(outputs),
        signature_constants::PREDICT_METHOD_NAME,
    )
}

fn tensor_name(info: &TensorInfo) -> anyhow::Result<&str> {
    match &info.encoding {
        Some(tensor_info::Encoding::Name(name)) => Ok(name),
        None => bail!("TensorInfo without a tensor name"),
    }
}

/// Checks every tensor a signature names exists in `graph_def`.
pub fn validate_signature(
    key: &str,
    signature: &SignatureDef,
    graph_def: &GraphDef,
) -> anyhow::Result<()> {
    ensure!(!signature.method_name.is_empty(), "Signature {} has no method name", key);
    for (name, info) in signature.inputs.iter().chain(signature.outputs.iter()) {
        let tensor = tensor_name(info)?;
        if graph_def.node_by_name(node_name(tensor)).is_none() {
            bail!("Signature {} binds {} to {}, which is not in the graph", key, name, tensor);
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct SavedModelBuilder {
    export_dir: PathBuf,
    saved_model: SavedModel,
}

impl SavedModelBuilder {
    pub fn new(export_dir: impl AsRef<Path>) -> SavedModelBuilder {
        SavedModelBuilder {
            export_dir: export_dir.as_ref().to_owned(),
            saved_model: SavedModel {
                saved_model_schema_version: SAVED_MODEL_SCHEMA_VERSION,
                meta_graphs: vec![],
            },
        }
    }

    pub fn add_meta_graph(
        &mut self,
        graph_def: GraphDef,
        tags: &[&str],
        signature_def_map: BTreeMap<String, SignatureDef>,
        legacy_init_op: Option<&str>,
    ) -> anyhow::Result<()> {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        if self.saved_model.meta_graphs.iter().any(|mg| {
            mg.meta_info_def.as_ref().map(|info| info.tags == tags).unwrap_or(false)
        }) {
            bail!("A meta graph with tags {:?} was already added", tags);
        }
        for (key, signature) in &signature_def_map {
            validate_signature(key, signature, &graph_def)?;
        }
        let mut collection_def = BTreeMap::new();
        if let Some(op) = legacy_init_op {
            ensure!(
                graph_def.node_by_name(op).is_some(),
                "Legacy init op {} is not in the graph",
                op
            );
            collection_def.insert(
                LEGACY_INIT_OP_KEY.to_string(),
                CollectionDef { kind: Some(Kind::NodeList(NodeList { value: vec![op.to_string()] })) },
            );
        }
        self.saved_model.meta_graphs.push(MetaGraphDef {
            meta_info_def: Some(MetaInfoDef {
                tags,
                stripped_default_attrs: false,
                ..MetaInfoDef::default()
            }),
            graph_def: Some(graph_def),
            collection_def,
            signature_def: signature_def_map,
        });
        Ok(())
    }

    /// Writes the bundle, replacing a previous `saved_model.pb`.
    pub fn save(self) -> anyhow::Result<PathBuf> {
        ensure!(!self.saved_model.meta_graphs.is_empty(), "No meta graph to save");
        if self.export_dir.exists() {
            warn!("Replacing existing SavedModel at {:?}", self.export_dir);
            fs_err::remove_dir_all(&self.export_dir)?;
        }
        fs_err::create_dir_all(self.export_dir.join(VARIABLES_DIRECTORY))?;
        let path = self.export_dir.join(SAVED_MODEL_FILENAME_PB);
        let mut buf = Vec::with_capacity(self.saved_model.encoded_len());
        self.saved_model
            .encode(&mut buf)
            .map_err(|e| format_err!("Prost/Protobuf encoding error : {:?}", e))?;
        fs_err::write(&path, buf)?;
        info!("SavedModel written to: {:?}", path);
        Ok(self.export_dir)
    }
}

/// Reads back the `saved_model.pb` of a bundle directory.
pub fn load(export_dir: impl AsRef<Path>) -> anyhow::Result<SavedModel> {
    let path = export_dir.as_ref().join(SAVED_MODEL_FILENAME_PB);
    let bytes = fs_err::read(&path)?;
    Ok(SavedModel::decode(&*bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::tfpb::tensorflow::DataType;

    fn graph() -> anyhow::Result<(Graph, Output, Output, Output, Output)> {
        let mut g = Graph::default();
        let x = g.placeholder("images", DataType::DtFloat, &[-1, 4]);
        let y = g.softmax(&x);
        let (scores, classes) = g.top_k(&y, 4)?;
        g.no_op(LEGACY_INIT_OP_KEY, &[]);
        Ok((g, x, y, scores, classes))
    }

    #[test]
    fn bundle() -> anyhow::Result<()> {
        let (g, x, y, scores, classes) = graph()?;
        let dir = tempfile::tempdir()?;
        let mut builder = SavedModelBuilder::new(dir.path().join("1"));
        let mut signatures = BTreeMap::new();
        signatures.insert(
            signature_constants::DEFAULT_SERVING_SIGNATURE_DEF_KEY.to_string(),
            classification_signature_def(&x, &classes, &scores),
        );
        signatures.insert("predict_images".to_string(), predict_signature_def(&[("images", &x)], &[("scores", &y)]));
        builder.add_meta_graph(g.as_graph_def(), &[tag_constants::SERVING], signatures, Some(LEGACY_INIT_OP_KEY))?;
        let out = builder.save()?;
        assert!(out.join(VARIABLES_DIRECTORY).is_dir());

        let model = load(&out)?;
        assert_eq!(model.saved_model_schema_version, 1);
        let mg = &model.meta_graphs[0];
        assert_eq!(mg.meta_info_def.as_ref().unwrap().tags, vec!["serve"]);
        let classify = &mg.signature_def["serving_default"];
        assert_eq!(classify.method_name, "tensorflow/serving/classify");
        assert_eq!(tensor_name(&classify.inputs["inputs"])?, "images:0");
        assert_eq!(tensor_name(&classify.outputs["classes"])?, "TopKV2:1");
        assert_eq!(tensor_name(&classify.outputs["scores"])?, "TopKV2:0");
        assert_eq!(classify.outputs["classes"].dtype, i32::from(DataType::DtInt32));
        let predict = &mg.signature_def["predict_images"];
        assert_eq!(tensor_name(&predict.outputs["scores"])?, "Softmax:0");
        assert!(mg.collection_def.contains_key(LEGACY_INIT_OP_KEY));
        Ok(())
    }

    #[test]
    fn saving_replaces_the_bundle() -> anyhow::Result<()> {
        let (g, x, y, _, _) = graph()?;
        let dir = tempfile::tempdir()?;
        let bundle = dir.path().join("4");
        let stale = bundle.join(VARIABLES_DIRECTORY).join("variables.index");
        fs_err::create_dir_all(stale.parent().unwrap())?;
        fs_err::write(&stale, b"stale")?;
        let mut builder = SavedModelBuilder::new(&bundle);
        let mut signatures = BTreeMap::new();
        signatures.insert("predict_images".to_string(), predict_signature_def(&[("images", &x)], &[("scores", &y)]));
        builder.add_meta_graph(g.as_graph_def(), &[tag_constants::SERVING], signatures, None)?;
        builder.save()?;
        assert!(!stale.exists());
        assert!(bundle.join(VARIABLES_DIRECTORY).is_dir());
        assert_eq!(load(&bundle)?.meta_graphs.len(), 1);
        Ok(())
    }

    #[test]
    fn dangling_signature() -> anyhow::Result<()> {
        let (g, x, _, scores, classes) = graph()?;
        let mut builder = SavedModelBuilder::new("unused");
        let mut signatures = BTreeMap::new();
        let mut ghost = classes.clone();
        ghost.node = "Ghost".to_string();
        signatures.insert("broken".to_string(), classification_signature_def(&x, &ghost, &scores));
        let e = builder.add_meta_graph(g.as_graph_def(), &["serve"], signatures, None).unwrap_err();
        assert!(e.to_string().contains("Ghost"), "{e}");
        Ok(())
    }

    #[test]
    fn duplicate_tags() -> anyhow::Result<()> {
        let (g, ..) = graph()?;
        let mut builder = SavedModelBuilder::new("unused");
        builder.add_meta_graph(g.as_graph_def(), &["serve"], BTreeMap::new(), None)?;
        assert!(builder.add_meta_graph(g.as_graph_def(), &["serve"], BTreeMap::new(), None).is_err());
        Ok(())
    }
}
