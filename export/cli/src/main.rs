use anyhow::{Context, Result};
use std::path::PathBuf;
use structopt::StructOpt;
use tfexport::prelude::*;

fn main() {
    // Collecting user arguments
    let cli_args = CliArgs::from_args();

    // Setting up log level, RUST_LOG wins if set
    let level = match cli_args.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = cli_args.run() {
        log::error!("{e:?}");
        std::process::exit(1)
    }
}

/// Export a trained image classifier checkpoint.
#[derive(Debug, StructOpt)]
#[structopt(name = "export", about = "Export a model checkpoint for inference")]
pub struct CliArgs {
    #[structopt(short = "v", parse(from_occurrences))]
    pub verbosity: usize,
    /// Path to the specific model you want to export.
    #[structopt(long = "checkpoint_path")]
    pub checkpoint_path: PathBuf,
    /// Path to a directory where the exported model will be saved.
    #[structopt(long = "export_dir")]
    pub export_dir: PathBuf,
    /// Version number of the model.
    #[structopt(long = "export_version")]
    pub export_version: u64,
    /// Path to the configuration file
    #[structopt(long = "config")]
    pub config_file: PathBuf,
    /// Export for TensorFlow Serving usage. Otherwise, a constant graph will be generated.
    #[structopt(long = "serving")]
    pub serving: bool,
    /// Run the exported constant graph once before exiting.
    #[structopt(long = "verify")]
    pub verify: bool,
}

impl CliArgs {
    pub fn run(&self) -> Result<()> {
        let cfg = Config::for_path(&self.config_file)?;
        let exported = export(
            &self.checkpoint_path,
            &self.export_dir,
            self.export_version,
            self.serving,
            &cfg,
        )
        .with_context(|| format!("Exporting {:?}", self.checkpoint_path))?;
        if self.verify {
            if self.serving {
                log::warn!("--verify only applies to constant graph exports, skipping");
            } else {
                check_frozen_graph(&exported, &cfg)?;
            }
        }
        log::info!("Exported {:?}", exported);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use ndarray_npy::NpzWriter;
    use std::path::Path;
    use tfexport::tfpb::tensorflow::DataType;

    const CONFIG: &str = "MODEL_NAME: logistic\nNUM_CLASSES: 3\nIMAGE_PROCESSING:\n  INPUT_SIZE: 4\n\
                          SESSION_CONFIG:\n  LOG_DEVICE_PLACEMENT: true\n  PER_PROCESS_GPU_MEMORY_FRACTION: 0.5\n";

    /// A config file and a zero-valued checkpoint for it.
    fn workspace(dir: &Path) -> Result<()> {
        fs_err::write(dir.join("config.yaml"), CONFIG)?;
        let model = build_inference_graph(&Config::from_yaml(CONFIG)?)?;
        let mut npz = NpzWriter::new(std::fs::File::create(dir.join("model.ckpt-1.npz"))?);
        for var in model.graph.variables() {
            let shape = IxDyn(&var.shape);
            if var.dtype == DataType::DtInt64 {
                npz.add_array(var.name.as_str(), &ArrayD::<i64>::zeros(shape))?;
            } else {
                npz.add_array(var.name.as_str(), &ArrayD::<f32>::zeros(shape))?;
            }
        }
        npz.finish()?;
        Ok(())
    }

    fn args(dir: &Path, extra: &[&str]) -> CliArgs {
        let dir = dir.to_str().unwrap();
        let mut argv = vec![
            "export".to_string(),
            "--checkpoint_path".to_string(),
            dir.to_string(),
            "--export_dir".to_string(),
            format!("{dir}/out"),
            "--export_version".to_string(),
            "2".to_string(),
            "--config".to_string(),
            format!("{dir}/config.yaml"),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        CliArgs::from_iter_safe(argv).unwrap()
    }

    #[test]
    fn run_and_verify() -> Result<()> {
        let dir = tempfile::tempdir()?;
        workspace(dir.path())?;
        args(dir.path(), &["--verify"]).run()?;
        assert!(dir.path().join("out/optimized_model-2.pb").is_file());
        Ok(())
    }

    #[test]
    fn verify_is_skipped_for_serving() -> Result<()> {
        let dir = tempfile::tempdir()?;
        workspace(dir.path())?;
        args(dir.path(), &["--serving", "--verify"]).run()?;
        assert!(dir.path().join("out/2/saved_model.pb").is_file());
        assert!(!dir.path().join("out/optimized_model-2.pb").exists());
        Ok(())
    }

    #[test]
    fn arguments() {
        let args = CliArgs::from_iter_safe([
            "export",
            "--checkpoint_path",
            "logs/",
            "--export_dir",
            "out",
            "--export_version",
            "3",
            "--config",
            "config.yaml",
            "--serving",
            "-vv",
        ])
        .unwrap();
        assert_eq!(args.checkpoint_path, PathBuf::from("logs/"));
        assert_eq!(args.export_version, 3);
        assert!(args.serving);
        assert!(!args.verify);
        assert_eq!(args.verbosity, 2);
    }

    #[test]
    fn required_arguments() {
        assert!(CliArgs::from_iter_safe(["export", "--checkpoint_path", "logs/"]).is_err());
        assert!(
            CliArgs::from_iter_safe([
                "export",
                "--checkpoint_path",
                "logs/",
                "--export_dir",
                "out",
                "--export_version",
                "-1",
                "--config",
                "config.yaml",
            ])
            .is_err()
        );
    }
}
