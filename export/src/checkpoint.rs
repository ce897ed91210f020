//! Checkpoint discovery and reading.
//!
//! A checkpoint is an `.npz` archive holding one array per graph variable,
//! named after the variable (`LeNet/conv1/weights`, `global_step`, ...).
//! Checkpoint directories follow the TensorFlow layout: several
//! `<prefix>-<global step>` checkpoints and an optional `checkpoint` state
//! file pointing at the most recent one.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use ndarray::{ArrayD, OwnedRepr};
use ndarray_npy::{NpzReader, ReadableElement};
use tract_core::prelude::*;

/// Name of the state file recording the latest checkpoint of a directory.
pub const CHECKPOINT_STATE_FILE: &str = "checkpoint";

const CHECKPOINT_EXTENSION: &str = "npz";

#[derive(Clone, Debug)]
pub struct Checkpoint {
    path: PathBuf,
    tensors: BTreeMap<String, Tensor>,
}

impl Checkpoint {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Checkpoint> {
        let path = path.as_ref();
        let file = fs_err::File::open(path)?;
        let mut npz = NpzReader::new(file).with_context(|| format!("Opening checkpoint {path:?}"))?;
        let mut tensors = BTreeMap::new();
        for entry in npz.names()? {
            let tensor = read_entry(&mut npz, &entry)
                .with_context(|| format!("Reading {entry} from checkpoint {path:?}"))?;
            let name = entry.strip_suffix(".npy").unwrap_or(&entry).to_string();
            debug!("Checkpoint {:?} contains {}: {:?}", path, name, tensor);
            tensors.insert(name, tensor);
        }
        Ok(Checkpoint { path: path.to_owned(), tensors })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }
}

fn read_as<T: Datum + Copy + ReadableElement>(
    npz: &mut NpzReader<fs_err::File>,
    entry: &str,
) -> anyhow::Result<Tensor> {
    let array: ArrayD<T> = npz.by_name::<OwnedRepr<T>, _>(entry)?;
    let data: Vec<T> = array.iter().copied().collect();
    Tensor::from_shape(array.shape(), &data)
}

fn read_entry(npz: &mut NpzReader<fs_err::File>, entry: &str) -> anyhow::Result<Tensor> {
    let first = match read_as::<f32>(npz, entry) {
        Ok(t) => return Ok(t),
        Err(e) => e,
    };
    if let Ok(t) = read_as::<f64>(npz, entry) {
        return Ok(t);
    }
    if let Ok(t) = read_as::<i64>(npz, entry) {
        return Ok(t);
    }
    if let Ok(t) = read_as::<i32>(npz, entry) {
        return Ok(t);
    }
    Err(first.context(format!("{entry} is not an array of f32, f64, i64 or i32")))
}

fn with_checkpoint_extension(prefix: &Path) -> PathBuf {
    let mut s: OsString = prefix.as_os_str().to_owned();
    s.push(".");
    s.push(CHECKPOINT_EXTENSION);
    PathBuf::from(s)
}

/// Maps a checkpoint prefix to the file holding it, if any.
fn checkpoint_file(prefix: &Path) -> Option<PathBuf> {
    if prefix.is_file() {
        return Some(prefix.to_owned());
    }
    let file = with_checkpoint_extension(prefix);
    file.is_file().then_some(file)
}

/// Reads `model_checkpoint_path` from a checkpoint state file.
fn state_file_prefix(dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let state = dir.join(CHECKPOINT_STATE_FILE);
    if !state.is_file() {
        return Ok(None);
    }
    let content = fs_err::read_to_string(&state)?;
    for line in content.lines() {
        if let Some(value) = line.trim().strip_prefix("model_checkpoint_path:") {
            let value = value.trim().trim_matches('"');
            let prefix = Path::new(value);
            return Ok(Some(if prefix.is_absolute() {
                prefix.to_owned()
            } else {
                dir.join(prefix)
            }));
        }
    }
    Ok(None)
}

fn global_step(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    stem.rsplit_once('-')?.1.parse().ok()
}

/// Finds the most recent checkpoint of a directory.
///
/// The state file wins when present. Otherwise the checkpoint with the
/// highest global step suffix is picked.
pub fn latest_checkpoint(dir: impl AsRef<Path>) -> anyhow::Result<Option<PathBuf>> {
    let dir = dir.as_ref();
    if let Some(prefix) = state_file_prefix(dir)? {
        let found = checkpoint_file(&prefix);
        if found.is_none() {
            error!("Couldn't match files for checkpoint {:?}", prefix);
        }
        return Ok(found);
    }
    let mut candidates = vec![];
    for entry in fs_err::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && path.extension().map(|e| e == CHECKPOINT_EXTENSION).unwrap_or(false)
        {
            candidates.push(path);
        }
    }
    Ok(candidates.into_iter().max_by(|a, b| (global_step(a), a).cmp(&(global_step(b), b))))
}

/// Resolves the checkpoint argument: a directory (latest checkpoint inside),
/// a checkpoint file, or a checkpoint prefix.
pub fn resolve_checkpoint(path: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
    let path = path.as_ref();
    if path.is_dir() {
        return match latest_checkpoint(path)? {
            Some(ckpt) => Ok(ckpt),
            None => bail!("Unable to find a model checkpoint in the directory {}", path.display()),
        };
    }
    match checkpoint_file(path) {
        Some(file) => Ok(file),
        None => bail!("Checkpoint {} not found", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_npy::NpzWriter;

    fn write_checkpoint(path: &Path) -> anyhow::Result<()> {
        let mut npz = NpzWriter::new(std::fs::File::create(path)?);
        npz.add_array("fc/weights", &ndarray::arr2(&[[1f32, 2.0], [3.0, 4.0]]))?;
        npz.add_array("global_step", &ndarray::arr0(1200i64))?;
        npz.finish()?;
        Ok(())
    }

    #[test]
    fn open_checkpoint() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.ckpt-1200.npz");
        write_checkpoint(&path)?;
        let ckpt = Checkpoint::open(&path)?;
        assert_eq!(ckpt.names().collect::<Vec<_>>(), vec!["fc/weights", "global_step"]);
        assert_eq!(
            ckpt.get("fc/weights").unwrap(),
            &Tensor::from_shape(&[2, 2], &[1f32, 2.0, 3.0, 4.0])?
        );
        assert_eq!(ckpt.get("global_step").unwrap(), &tensor0(1200i64));
        Ok(())
    }

    #[test]
    fn unsupported_entry_type() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.ckpt-1.npz");
        let mut npz = NpzWriter::new(std::fs::File::create(&path)?);
        npz.add_array("mask", &ndarray::arr1(&[1u8, 0, 1]))?;
        npz.finish()?;
        let e = Checkpoint::open(&path).unwrap_err();
        let msg = format!("{e:?}");
        assert!(msg.contains("Reading mask"), "{msg}");
        assert!(msg.contains("not an array of f32, f64, i64 or i32"), "{msg}");
        Ok(())
    }

    #[test]
    fn latest_by_global_step() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for step in [900, 12000, 3000] {
            write_checkpoint(&dir.path().join(format!("model.ckpt-{step}.npz")))?;
        }
        let found = resolve_checkpoint(dir.path())?;
        assert_eq!(found, dir.path().join("model.ckpt-12000.npz"));
        Ok(())
    }

    #[test]
    fn latest_from_state_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for step in [900, 3000] {
            write_checkpoint(&dir.path().join(format!("model.ckpt-{step}.npz")))?;
        }
        std::fs::write(
            dir.path().join(CHECKPOINT_STATE_FILE),
            "model_checkpoint_path: \"model.ckpt-900\"\nall_model_checkpoint_paths: \"model.ckpt-900\"\n",
        )?;
        assert_eq!(resolve_checkpoint(dir.path())?, dir.path().join("model.ckpt-900.npz"));
        Ok(())
    }

    #[test]
    fn prefix_resolution() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_checkpoint(&dir.path().join("model.ckpt-5.npz"))?;
        let prefix = dir.path().join("model.ckpt-5");
        assert_eq!(resolve_checkpoint(&prefix)?, dir.path().join("model.ckpt-5.npz"));
        assert!(resolve_checkpoint(dir.path().join("model.ckpt-6")).is_err());
        Ok(())
    }

    #[test]
    fn empty_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let e = resolve_checkpoint(dir.path()).unwrap_err();
        assert!(e.to_string().contains("Unable to find a model checkpoint"));
        assert!(e.to_string().contains(&*dir.path().display().to_string()));
        Ok(())
    }
}
