//! Next-token training. Each epoch runs one optimizer step per training batch, then measures
//! the mean validation loss; the weights are checkpointed whenever that loss beats the best so
//! far. After the last epoch (or a cancellation) the best checkpoint is reloaded and scored on
//! the test split.

pub mod scheduler;

use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamConfig, AdamWConfig, GradientsParams, Optimizer, SgdConfig},
    tensor::{
        ElementConversion, Tensor,
        backend::{AutodiffBackend, Backend},
    },
};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use scheduler::{PlateauConfig, ReduceLrOnPlateau};

use crate::{
    checkpoint::{self, CheckpointPaths},
    dataset::{DataSplits, Sequence, SequenceBatch, SequenceBatcher, batch_indices},
    error::{self, Error},
    model::{GenerativeModel, ModelConfig},
};

/// Validation loss a checkpoint has to beat before the first save.
pub const INITIAL_BEST_LOSS: f64 = 100.;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[default]
    Adam,
    AdamW,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = Error;

    fn from_str(s: &str) -> error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::Adam),
            "adamw" => Ok(Self::AdamW),
            "sgd" => Ok(Self::Sgd),
            _ => Err(Error::UnknownOptimizer(s.to_owned())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = match self {
            Self::Adam => "Adam",
            Self::AdamW => "AdamW",
            Self::Sgd => "SGD",
        };
        write!(f, "{v}")
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    #[config(default = 200)]
    pub num_epochs: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = "OptimizerKind::Adam")]
    pub optimizer: OptimizerKind,
    #[config(default = 1024)]
    pub seed: u64,
    #[config(default = "PlateauConfig::new()")]
    pub plateau: PlateauConfig,
    /// Sequences longer than this are truncated when batched.
    #[config(default = "None")]
    pub max_len: Option<usize>,
}

/// Shared flag used to stop a run early. Training checks it between epochs, so an epoch in
/// flight always completes; sampling checks it between draws.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug)]
pub struct EpochReport {
    /// 1-based.
    pub epoch: usize,
    pub train_loss: f64,
    pub valid_loss: f64,
    /// The learning rate after the scheduler has seen this epoch's validation loss.
    pub lr: f64,
    /// Whether this epoch's weights were checkpointed.
    pub saved: bool,
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
pub struct TrainingSummary {
    pub epochs: Vec<EpochReport>,
    pub cancelled: bool,
    pub best_valid_loss: Option<f64>,
    /// `None` if the test split is empty.
    pub test_loss: Option<f64>,
}

impl TrainingSummary {
    /// Validation losses of the epochs that were checkpointed, in order.
    pub fn saved_losses(&self) -> Vec<f64> {
        self.epochs
            .iter()
            .filter(|e| e.saved)
            .map(|e| e.valid_loss)
            .collect()
    }
}

pub fn perplexity(loss: f64) -> f64 {
    loss.exp()
}

/// Mean cross-entropy between each position's logits and the token that follows it. Padding
/// positions count towards the mean.
pub fn sequence_loss<B: Backend>(
    model: &GenerativeModel<B>,
    batch: SequenceBatch<B>,
) -> Tensor<B, 1> {
    let logits = model.forward(batch.inputs);
    let [batch_size, len, vocab] = logits.dims();

    let logits = logits.reshape([batch_size * len, vocab]);
    let targets = batch.targets.reshape([batch_size * len]);

    CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits, targets)
}

/// Mean of the per-batch losses over `data`, in order, without updating anything.
pub fn evaluate<B: Backend>(
    model: &GenerativeModel<B>,
    data: &[Sequence],
    batcher: &SequenceBatcher,
    batch_size: usize,
    device: &B::Device,
) -> error::Result<f64> {
    if data.is_empty() {
        return Err(Error::Config("can't evaluate on an empty split".into()));
    }

    let batches = batch_indices(data.len(), batch_size, None);
    let mut total = 0.;
    for indices in &batches {
        let items: Vec<&Sequence> = indices.iter().map(|&i| &data[i]).collect();
        let loss = sequence_loss(model, batcher.batch::<B>(&items, device));
        total += loss.into_scalar().elem::<f64>();
    }

    Ok(total / batches.len() as f64)
}

/// Owns everything a training run mutates: the model, the optimizer and its schedule, and the
/// shuffling RNG.
pub struct Trainer<B: AutodiffBackend, O: Optimizer<GenerativeModel<B>, B>> {
    model: GenerativeModel<B>,
    optim: O,
    scheduler: ReduceLrOnPlateau,
    batcher: SequenceBatcher,
    config: TrainingConfig,
    checkpoint: CheckpointPaths,
    rng: StdRng,
    device: B::Device,
}

impl<B: AutodiffBackend, O: Optimizer<GenerativeModel<B>, B>> Trainer<B, O> {
    pub fn new(
        model: GenerativeModel<B>,
        optim: O,
        config: &TrainingConfig,
        checkpoint: CheckpointPaths,
        device: &B::Device,
    ) -> Self {
        Self {
            model,
            optim,
            scheduler: config.plateau.init(config.learning_rate),
            batcher: SequenceBatcher::new(config.max_len),
            config: config.clone(),
            checkpoint,
            rng: StdRng::seed_from_u64(config.seed),
            device: device.clone(),
        }
    }

    pub fn model(&self) -> &GenerativeModel<B> {
        &self.model
    }

    pub fn lr(&self) -> f64 {
        self.scheduler.lr()
    }

    /// One pass over `data` in a fresh random order. Returns the mean batch loss.
    pub fn train_epoch(&mut self, data: &[Sequence]) -> error::Result<f64> {
        if data.is_empty() {
            return Err(Error::Config("the training split is empty".into()));
        }

        let batches = batch_indices(data.len(), self.config.batch_size, Some(&mut self.rng));
        let lr = self.scheduler.lr();

        let mut total = 0.;
        for indices in &batches {
            let items: Vec<&Sequence> = indices.iter().map(|&i| &data[i]).collect();
            let batch = self.batcher.batch::<B>(&items, &self.device);

            let loss = sequence_loss(&self.model, batch);
            total += loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            self.model = self.optim.step(lr, self.model.clone(), grads);
        }

        Ok(total / batches.len() as f64)
    }

    pub fn evaluate(&self, data: &[Sequence]) -> error::Result<f64> {
        evaluate(
            &self.model.valid(),
            data,
            &self.batcher,
            self.config.batch_size,
            &self.device,
        )
    }

    /// Train until `num_epochs` or until `cancel` is set, then score the best checkpoint on the
    /// test split. Returns that model on the inference backend.
    pub fn fit(
        mut self,
        splits: &DataSplits,
        cancel: &CancelToken,
    ) -> error::Result<(GenerativeModel<B::InnerBackend>, TrainingSummary)> {
        info!(
            "Training {} parameters on {} sequences ({} validation); receptive field {}",
            self.model.num_params(),
            splits.train.len(),
            splits.valid.len(),
            self.model.receptive_field()
        );

        let mut best = INITIAL_BEST_LOSS;
        let mut any_saved = false;
        let mut reports = Vec::new();
        let mut cancelled = false;

        for epoch in 1..=self.config.num_epochs {
            if cancel.is_cancelled() {
                cancelled = true;
                info!("Exiting from training early");
                break;
            }

            let start = Instant::now();
            let train_loss = self.train_epoch(&splits.train)?;
            let n_batches = splits.train.len().div_ceil(self.config.batch_size.max(1));
            info!(
                "| epoch {epoch:3} | ms/batch {:5.4} | train loss {train_loss:5.6} |",
                start.elapsed().as_secs_f64() * 1_000. / n_batches as f64
            );

            let valid_loss = self.evaluate(&splits.valid)?;
            let lr = self.scheduler.step(valid_loss);
            let elapsed = start.elapsed();

            info!(
                "| end of epoch {epoch:3} | time: {:5.4}s | valid loss {valid_loss:5.6} | valid ppl {:8.4} |",
                elapsed.as_secs_f64(),
                perplexity(valid_loss)
            );

            let saved = valid_loss < best;
            if saved {
                checkpoint::save(&self.model, &self.config.model, &self.checkpoint)?;
                info!("Saved model to {:?}", self.checkpoint.weights);
                best = valid_loss;
                any_saved = true;
            }

            reports.push(EpochReport {
                epoch,
                train_loss,
                valid_loss,
                lr,
                saved,
                elapsed,
            });
        }

        // A cancel that lands during the last epoch still counts.
        cancelled |= cancel.is_cancelled();

        let model = if any_saved {
            checkpoint::load_strict::<B::InnerBackend>(
                &self.checkpoint,
                &self.config.model,
                &self.device,
            )?
        } else {
            warn!("No checkpoint was saved; evaluating the weights in memory");
            self.model.valid()
        };

        let test_loss = if splits.test.is_empty() {
            debug!("Empty test split; skipping the final evaluation");
            None
        } else {
            let loss = evaluate(
                &model,
                &splits.test,
                &self.batcher,
                self.config.batch_size,
                &self.device,
            )?;
            info!(
                "| End of training | test loss {loss:5.4} | test ppl {:8.4} |",
                perplexity(loss)
            );
            Some(loss)
        };

        let summary = TrainingSummary {
            epochs: reports,
            cancelled,
            best_valid_loss: any_saved.then_some(best),
            test_loss,
        };

        Ok((model, summary))
    }
}

/// Seed the backend, build a fresh model and the configured optimizer, and run [`Trainer::fit`].
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    splits: &DataSplits,
    checkpoint: CheckpointPaths,
    cancel: &CancelToken,
    device: &B::Device,
) -> error::Result<(GenerativeModel<B::InnerBackend>, TrainingSummary)> {
    config.model.validate()?;
    if config.batch_size == 0 {
        return Err(Error::Config("batch size must be at least 1".into()));
    }

    B::seed(device, config.seed);
    let model = config.model.init::<B>(device);

    info!(
        "Optimizer: {}, learning rate {}, batch size {}",
        config.optimizer, config.learning_rate, config.batch_size
    );

    match config.optimizer {
        OptimizerKind::Adam => {
            Trainer::new(model, AdamConfig::new().init(), config, checkpoint, device)
                .fit(splits, cancel)
        }
        OptimizerKind::AdamW => {
            Trainer::new(model, AdamWConfig::new().init(), config, checkpoint, device)
                .fit(splits, cancel)
        }
        OptimizerKind::Sgd => {
            Trainer::new(model, SgdConfig::new().init(), config, checkpoint, device)
                .fit(splits, cancel)
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use burn::backend::{Autodiff, NdArray};

    use super::*;
    use crate::vocab::{END_TOKEN, START_TOKEN};

    type B = NdArray;
    type AB = Autodiff<NdArray>;

    fn seq(tokens: &[u32]) -> Sequence {
        Sequence::new(tokens.to_vec()).unwrap()
    }

    fn tiny_model() -> ModelConfig {
        ModelConfig::new(6)
            .with_input_size(8)
            .with_hidden_size(16)
            .with_n_levels(2)
            .with_dropout(0.)
            .with_emb_dropout(0.)
    }

    fn splits() -> DataSplits {
        let data: Vec<Sequence> = (0..12)
            .map(|i| {
                if i % 2 == 0 {
                    seq(&[START_TOKEN, 3, 4, END_TOKEN])
                } else {
                    seq(&[START_TOKEN, 5, 3, 4, END_TOKEN])
                }
            })
            .collect();
        DataSplits {
            train: data[..8].to_vec(),
            valid: data[8..10].to_vec(),
            test: data[10..].to_vec(),
        }
    }

    #[test]
    fn optimizer_names() {
        assert_eq!("Adam".parse::<OptimizerKind>().unwrap(), OptimizerKind::Adam);
        assert_eq!("adamw".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamW);
        assert_eq!("SGD".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert!(matches!(
            "RMSprop".parse::<OptimizerKind>(),
            Err(Error::UnknownOptimizer(_))
        ));
    }

    #[test]
    fn training_config_defaults() {
        let cfg = TrainingConfig::new(ModelConfig::new(10));
        assert_eq!(cfg.num_epochs, 200);
        assert_eq!(cfg.batch_size, 32);
        assert_relative_eq!(cfg.learning_rate, 1e-3);
        assert_eq!(cfg.optimizer, OptimizerKind::Adam);
        assert_eq!(cfg.seed, 1024);
    }

    #[test]
    fn training_config_survives_a_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("5training.json");

        let cfg = TrainingConfig::new(tiny_model())
            .with_optimizer(OptimizerKind::Sgd)
            .with_max_len(Some(40));
        cfg.save(&path).unwrap();

        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.model, cfg.model);
        assert_eq!(loaded.optimizer, OptimizerKind::Sgd);
        assert_eq!(loaded.max_len, Some(40));
        assert_eq!(loaded.num_epochs, 200);
    }

    #[test]
    fn loss_ignores_order_within_a_batch() {
        let device = Default::default();
        let model = tiny_model().init::<B>(&device);
        let batcher = SequenceBatcher::default();

        let a = seq(&[1, 3, 4, 2]);
        let b = seq(&[1, 5, 2]);
        let c = seq(&[1, 4, 4, 3, 2]);

        let forward = sequence_loss(&model, batcher.batch::<B>(&[&a, &b, &c], &device))
            .into_scalar()
            .elem::<f64>();
        let reversed = sequence_loss(&model, batcher.batch::<B>(&[&c, &b, &a], &device))
            .into_scalar()
            .elem::<f64>();

        assert_relative_eq!(forward, reversed, epsilon = 1e-6);
    }

    #[test]
    fn saved_losses_never_increase() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = TrainingConfig::new(tiny_model())
            .with_num_epochs(6)
            .with_batch_size(4)
            .with_learning_rate(1e-2);

        let paths = CheckpointPaths::new(dir.path(), 2, "gen.mpk");
        let (_, summary) =
            train::<AB>(&config, &splits(), paths.clone(), &CancelToken::new(), &device).unwrap();

        assert_eq!(summary.epochs.len(), 6);
        assert!(!summary.cancelled);
        assert!(paths.exists());

        let saved = summary.saved_losses();
        assert!(!saved.is_empty());
        for w in saved.windows(2) {
            assert!(w[1] < w[0]);
        }
        assert!(summary.test_loss.unwrap().is_finite());
    }

    #[test]
    fn cancelled_before_start_runs_no_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = TrainingConfig::new(tiny_model()).with_num_epochs(5);

        let cancel = CancelToken::new();
        cancel.cancel();

        let paths = CheckpointPaths::new(dir.path(), 2, "gen.mpk");
        let (_, summary) = train::<AB>(&config, &splits(), paths.clone(), &cancel, &device).unwrap();

        assert!(summary.cancelled);
        assert!(summary.epochs.is_empty());
        assert!(summary.best_valid_loss.is_none());
        assert!(!paths.exists());
        // Still scored, on the untrained weights.
        assert!(summary.test_loss.is_some());
    }

    #[test]
    fn cancel_is_reported_without_epochs_to_skip() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = TrainingConfig::new(tiny_model()).with_num_epochs(0);

        let cancel = CancelToken::new();
        cancel.cancel();

        let paths = CheckpointPaths::new(dir.path(), 2, "gen.mpk");
        let (_, summary) = train::<AB>(&config, &splits(), paths, &cancel, &device).unwrap();

        assert!(summary.cancelled);
        assert!(summary.epochs.is_empty());
    }

    #[test]
    fn degenerate_configs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let paths = CheckpointPaths::new(dir.path(), 2, "gen.mpk");

        for config in [
            TrainingConfig::new(tiny_model().with_kernel_size(0)),
            TrainingConfig::new(tiny_model().with_n_levels(0)),
            TrainingConfig::new(tiny_model()).with_batch_size(0),
        ] {
            let result = train::<AB>(&config, &splits(), paths.clone(), &CancelToken::new(), &device);
            assert!(matches!(result, Err(Error::Config(_))));
        }
        assert!(!paths.exists());
    }

    #[test]
    fn empty_training_split_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = TrainingConfig::new(tiny_model()).with_num_epochs(1);

        let mut data = splits();
        data.train.clear();

        let paths = CheckpointPaths::new(dir.path(), 2, "gen.mpk");
        assert!(train::<AB>(&config, &data, paths, &CancelToken::new(), &device).is_err());
    }
}
