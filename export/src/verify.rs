//! Reloads an exported frozen graph with tract and runs it once.

use std::path::Path;

use anyhow::ensure;
use tract_tensorflow::prelude::*;

use crate::config::Config;

/// Loads the frozen graph at `path` for a single flattened image.
pub fn load_frozen_graph(path: impl AsRef<Path>, cfg: &Config) -> anyhow::Result<TypedRunnableModel<TypedModel>> {
    let features = cfg.input_size() * cfg.input_size() * 3;
    let mut model = tensorflow().model_for_path(path.as_ref())?;
    model.set_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), tvec!(1, features)))?;
    Ok(model.into_optimized()?.into_runnable()?)
}

/// Runs the frozen graph at `path` on a blank image and checks it yields one
/// finite score per class. Returns the scores.
pub fn check_frozen_graph(path: impl AsRef<Path>, cfg: &Config) -> anyhow::Result<Tensor> {
    let path = path.as_ref();
    let plan = load_frozen_graph(path, cfg)?;
    let features = cfg.input_size() * cfg.input_size() * 3;
    let input = Tensor::zero::<f32>(&[1, features])?;
    let mut outputs = plan.run(tvec!(input.into()))?;
    ensure!(outputs.len() == 1, "{:?} has {} outputs, expected 1", path, outputs.len());
    let scores = outputs.remove(0).into_tensor();
    ensure!(
        scores.shape() == [1, cfg.num_classes],
        "{:?} produces {:?}, expected [1, {}]",
        path,
        scores.shape(),
        cfg.num_classes
    );
    ensure!(
        scores.as_slice::<f32>()?.iter().all(|s| s.is_finite()),
        "{:?} produces non finite scores: {:?}",
        path,
        scores
    );
    info!("Verified {:?}: {:?}", path, scores);
    Ok(scores)
}
