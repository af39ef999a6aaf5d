//! Model persistence. Weights are written with burn's named MessagePack recorder; the
//! `ModelConfig` they belong to goes next to them as JSON.

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    model::{GenerativeModel, ModelConfig},
};

type Recorder = NamedMpkFileRecorder<FullPrecisionSettings>;

#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointPaths {
    pub weights: PathBuf,
    pub config: PathBuf,
}

impl CheckpointPaths {
    /// `<dir>/<n_levels><save_name>`, with the extension replaced by `mpk` for the weights and
    /// `json` for the config. E.g. `models/5gen.mpk` and `models/5gen.json`.
    pub fn new(dir: &Path, n_levels: usize, save_name: &str) -> Self {
        let base = dir.join(format!("{n_levels}{save_name}"));
        Self {
            weights: base.with_extension("mpk"),
            config: base.with_extension("json"),
        }
    }

    pub fn exists(&self) -> bool {
        self.weights.is_file() && self.config.is_file()
    }
}

pub fn save<B: Backend>(
    model: &GenerativeModel<B>,
    config: &ModelConfig,
    paths: &CheckpointPaths,
) -> Result<()> {
    if let Some(parent) = paths.weights.parent() {
        fs::create_dir_all(parent)?;
    }

    model
        .clone()
        .save_file(paths.weights.clone(), &Recorder::new())?;

    let config_file = fs::File::create(&paths.config)?;
    serde_json::to_writer_pretty(config_file, config)?;

    debug!("Saved checkpoint to {:?}", paths.weights);
    Ok(())
}

pub fn load_config(paths: &CheckpointPaths) -> Result<ModelConfig> {
    let bytes = fs::read(&paths.config)?;
    let config: ModelConfig = serde_json::from_slice(&bytes)?;
    config.validate()?;
    Ok(config)
}

/// Load a checkpoint into a model built from `expected`. Fails with `CheckpointMismatch` if the
/// saved config differs, or if the stored weights don't cover the model's parameters exactly.
pub fn load_strict<B: Backend>(
    paths: &CheckpointPaths,
    expected: &ModelConfig,
    device: &B::Device,
) -> Result<GenerativeModel<B>> {
    let saved = load_config(paths)?;
    if &saved != expected {
        return Err(Error::CheckpointMismatch {
            path: paths.config.clone(),
            reason: format!("saved config {saved:?} differs from {expected:?}"),
        });
    }

    let fresh = expected.init::<B>(device);
    let n_expected = fresh.num_params();

    let model = fresh
        .load_file(paths.weights.clone(), &Recorder::new(), device)
        .map_err(|e| Error::CheckpointMismatch {
            path: paths.weights.clone(),
            reason: e.to_string(),
        })?;

    let n_loaded = model.num_params();
    if n_loaded != n_expected {
        return Err(Error::CheckpointMismatch {
            path: paths.weights.clone(),
            reason: format!("{n_loaded} parameters stored; the model has {n_expected}"),
        });
    }

    Ok(model)
}

/// Load a checkpoint using whatever config was saved with it.
pub fn load<B: Backend>(
    paths: &CheckpointPaths,
    device: &B::Device,
) -> Result<(GenerativeModel<B>, ModelConfig)> {
    if !paths.weights.is_file() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no checkpoint at {:?}", paths.weights),
        )));
    }

    let config = load_config(paths)?;
    let model = load_strict(paths, &config, device)?;

    info!(
        "Loaded model from {:?} ({} parameters)",
        paths.weights,
        model.num_params()
    );
    Ok((model, config))
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, prelude::Int, tensor::Tensor, tensor::TensorData};

    use super::*;

    type B = NdArray;

    fn config() -> ModelConfig {
        ModelConfig::new(6)
            .with_input_size(4)
            .with_hidden_size(8)
            .with_n_levels(2)
    }

    #[test]
    fn path_layout() {
        let paths = CheckpointPaths::new(Path::new("models"), 5, "gen.mpk");
        assert_eq!(paths.weights, Path::new("models/5gen.mpk"));
        assert_eq!(paths.config, Path::new("models/5gen.json"));

        let paths = CheckpointPaths::new(Path::new("models"), 3, "gen.pt");
        assert_eq!(paths.weights, Path::new("models/3gen.mpk"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths::new(dir.path(), 2, "gen.mpk");
        let device = Default::default();

        let cfg = config();
        let model = cfg.init::<B>(&device);
        save(&model, &cfg, &paths).unwrap();
        assert!(paths.exists());

        let (loaded, loaded_cfg) = load::<B>(&paths, &device).unwrap();
        assert_eq!(loaded_cfg, cfg);

        let x: Tensor<B, 2, Int> =
            Tensor::from_data(TensorData::new(vec![1i64, 3, 4, 5], [1, 4]), &device);
        let a = model.forward(x.clone()).into_data().to_vec::<f32>().unwrap();
        let b = loaded.forward(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn changed_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths::new(dir.path(), 2, "gen.mpk");
        let device = Default::default();

        let cfg = config();
        save(&cfg.init::<B>(&device), &cfg, &paths).unwrap();

        let deeper = cfg.clone().with_hidden_size(12);
        let result = load_strict::<B>(&paths, &deeper, &device);
        assert!(matches!(result, Err(Error::CheckpointMismatch { .. })));
    }

    #[test]
    fn degenerate_saved_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths::new(dir.path(), 2, "gen.mpk");
        let device = Default::default();

        let cfg = config();
        save(&cfg.init::<B>(&device), &cfg, &paths).unwrap();
        let broken = serde_json::to_vec(&cfg.with_kernel_size(0)).unwrap();
        fs::write(&paths.config, broken).unwrap();

        assert!(matches!(load::<B>(&paths, &device), Err(Error::Config(_))));
    }

    #[test]
    fn missing_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths::new(dir.path(), 2, "gen.mpk");
        assert!(load::<B>(&paths, &Default::default()).is_err());
        assert!(load_strict::<B>(&paths, &config(), &Default::default()).is_err());
    }
}
