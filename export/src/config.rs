//! Export configuration.
//!
//! The configuration file is the one used at training time: a YAML (or JSON)
//! document with upper-case keys. Only the keys the exporter needs are
//! modelled; everything else is ignored.
//!
//! ```yaml
//! MODEL_NAME: lenet
//! NUM_CLASSES: 10
//! MOVING_AVERAGE_DECAY: 0.9999
//! IMAGE_PROCESSING:
//!   INPUT_SIZE: 28
//! SESSION_CONFIG:
//!   LOG_DEVICE_PLACEMENT: false
//!   PER_PROCESS_GPU_MEMORY_FRACTION: 0.9
//! ```

use std::path::Path;

use anyhow::{Context, bail, ensure};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    /// Architecture name, looked up in the network registry.
    pub model_name: String,
    pub num_classes: usize,
    pub image_processing: ImageProcessing,
    pub session_config: SessionConfig,
    /// Restore moving-average shadow variables instead of raw weights when
    /// strictly positive.
    #[serde(default)]
    pub moving_average_decay: Option<f32>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ImageProcessing {
    /// Side of the square input images.
    pub input_size: usize,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SessionConfig {
    pub log_device_placement: bool,
    pub per_process_gpu_memory_fraction: f32,
}

impl Config {
    /// Parses a configuration file, YAML or JSON according to its extension.
    pub fn for_path(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        let content = fs_err::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Config::from_json(&content),
            Some("yaml") | Some("yml") | None => Config::from_yaml(&content),
            Some(other) => bail!("Unsupported config file extension {:?} for {:?}", other, path),
        };
        config.with_context(|| format!("Parsing config file {path:?}"))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Config> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Config> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.num_classes > 0, "NUM_CLASSES must be positive");
        ensure!(self.image_processing.input_size > 0, "IMAGE_PROCESSING.INPUT_SIZE must be positive");
        let fraction = self.session_config.per_process_gpu_memory_fraction;
        ensure!(
            fraction > 0.0 && fraction <= 1.0,
            "SESSION_CONFIG.PER_PROCESS_GPU_MEMORY_FRACTION must be in (0, 1], got {}",
            fraction
        );
        Ok(())
    }

    pub fn input_size(&self) -> usize {
        self.image_processing.input_size
    }

    /// The decay to use for moving-average restoration, if enabled.
    pub fn moving_average_decay(&self) -> Option<f32> {
        self.moving_average_decay.filter(|d| *d > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
MODEL_NAME: lenet
NUM_CLASSES: 10
BATCH_SIZE: 32
IMAGE_PROCESSING:
  INPUT_SIZE: 28
  RANDOM_FLIP: true
SESSION_CONFIG:
  LOG_DEVICE_PLACEMENT: false
  PER_PROCESS_GPU_MEMORY_FRACTION: 0.9
"#;

    #[test]
    fn yaml_with_extra_keys() -> anyhow::Result<()> {
        let config = Config::from_yaml(YAML)?;
        assert_eq!(config.model_name, "lenet");
        assert_eq!(config.num_classes, 10);
        assert_eq!(config.input_size(), 28);
        assert!(!config.session_config.log_device_placement);
        assert_eq!(config.moving_average_decay(), None);
        Ok(())
    }

    #[test]
    fn moving_average_decay() -> anyhow::Result<()> {
        let config = Config::from_yaml(&format!("{YAML}MOVING_AVERAGE_DECAY: 0.9999\n"))?;
        assert_eq!(config.moving_average_decay(), Some(0.9999));
        let config = Config::from_yaml(&format!("{YAML}MOVING_AVERAGE_DECAY: 0\n"))?;
        assert_eq!(config.moving_average_decay(), None);
        Ok(())
    }

    #[test]
    fn json() -> anyhow::Result<()> {
        let config = Config::from_json(
            r#"{"MODEL_NAME": "mlp", "NUM_CLASSES": 3,
                "IMAGE_PROCESSING": {"INPUT_SIZE": 4},
                "SESSION_CONFIG": {"LOG_DEVICE_PLACEMENT": true, "PER_PROCESS_GPU_MEMORY_FRACTION": 1.0}}"#,
        )?;
        assert_eq!(config.model_name, "mlp");
        assert!(config.session_config.log_device_placement);
        Ok(())
    }

    #[test]
    fn missing_key() {
        let e = Config::from_yaml("MODEL_NAME: lenet\nNUM_CLASSES: 10\n").unwrap_err();
        assert!(e.to_string().contains("IMAGE_PROCESSING"), "{e}");
    }

    #[test]
    fn invalid_values() {
        assert!(Config::from_yaml(&YAML.replace("NUM_CLASSES: 10", "NUM_CLASSES: 0")).is_err());
        assert!(Config::from_yaml(&YAML.replace("0.9", "1.5")).is_err());
    }

    #[test]
    fn from_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, YAML)?;
        assert_eq!(Config::for_path(&path)?.num_classes, 10);
        let path = dir.path().join("config.toml");
        std::fs::write(&path, YAML)?;
        assert!(Config::for_path(&path).is_err());
        Ok(())
    }
}
