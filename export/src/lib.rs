//! # tfexport
//!
//! Export trained image classifier checkpoints for inference.
//!
//! The network named in the configuration is rebuilt as a TensorFlow graph,
//! its variables are restored from a checkpoint and inlined as constants,
//! and the graph is optimized for inference. The result is written either as
//! a frozen `GraphDef` or as a SavedModel bundle with serving signatures.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! let cfg = tfexport::Config::for_path("config.yaml")?;
//! let path = tfexport::export("checkpoints/", "export/", 1, false, &cfg)?;
//! tfexport::verify::check_frozen_graph(&path, &cfg)?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate derive_new;
#[allow(unused_imports)]
#[macro_use]
extern crate log;

pub mod checkpoint;
pub mod config;
pub mod export;
pub mod freeze;
pub mod graph;
pub mod nets;
pub mod optim;
pub mod preprocess;
pub mod saved_model;
pub mod session;
pub mod tensor;
pub mod tfpb;
pub mod verify;

pub use config::Config;
pub use export::export;

pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, latest_checkpoint, resolve_checkpoint};
    pub use crate::config::Config;
    pub use crate::export::{FrozenModel, InferenceGraph, build_inference_graph, export, freeze};
    pub use crate::graph::{Graph, Output, Variable};
    pub use crate::nets::nets;
    pub use crate::preprocess::preprocess_image;
    pub use crate::tfpb::tensorflow::{GraphDef, SavedModel};
    pub use crate::verify::check_frozen_graph;
}

#[cfg(test)]
fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("TFEXPORT_LOG").try_init();
}
