//! Autoregressive sampling. Each sample starts from the start token; the model is rerun on the
//! whole prefix, and the next token is drawn from the softmax over the last position's logits,
//! until it draws the terminator. Completed strings go through the validity oracle, and valid
//! ones not seen before, either in the reference corpus or earlier in the run, are kept.

use std::{
    collections::HashSet,
    fs,
    io::{self, Write},
    path::Path,
    time::Instant,
};

use burn::{
    prelude::Int,
    tensor::{Tensor, TensorData, activation, backend::Backend},
};
use rand::{
    Rng, SeedableRng,
    distr::{Distribution, weighted::WeightedIndex},
    rngs::StdRng,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Error, Result},
    model::GenerativeModel,
    smiles::ValidityOracle,
    train::CancelToken,
    vocab::{END_TOKEN, START_TOKEN, Vocabulary},
};

/// Used when the longest training sequence isn't known.
pub const DEFAULT_MAX_LEN: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub num_samples: usize,
    /// A sample that reaches this many tokens (start token included) without drawing the
    /// terminator is abandoned.
    pub max_len: usize,
    /// Log progress every this many samples. 0 disables it.
    pub report_every: usize,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_samples: 100_000,
            max_len: DEFAULT_MAX_LEN,
            report_every: 10_000,
            seed: 1024,
        }
    }
}

impl SamplerConfig {
    /// Twice the longest sequence seen in training.
    pub fn max_len_for(longest_sequence: usize) -> usize {
        if longest_sequence == 0 {
            DEFAULT_MAX_LEN
        } else {
            2 * longest_sequence
        }
    }
}

/// Distinct strings, kept in the order they were first inserted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeneratedSet {
    items: Vec<String>,
    seen: HashSet<String>,
}

impl GeneratedSet {
    /// Returns false, leaving the set unchanged, if `item` is already present.
    pub fn insert(&mut self, item: String) -> bool {
        if self.seen.contains(&item) {
            return false;
        }
        self.seen.insert(item.clone());
        self.items.push(item);
        true
    }

    pub fn contains(&self, item: &str) -> bool {
        self.seen.contains(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.items
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Tokens from the start token through the terminator.
    Completed(Vec<u32>),
    /// Hit the length limit before the terminator.
    Truncated(Vec<u32>),
}

#[derive(Clone, Debug)]
pub struct SamplingReport {
    /// Draws actually made; fewer than requested if the run was cancelled.
    pub num_samples: usize,
    pub cancelled: bool,
    pub valid_count: usize,
    pub truncated: usize,
    /// Valid and novel molecules, in order of discovery.
    pub generated: GeneratedSet,
}

impl SamplingReport {
    pub fn validity_rate(&self) -> f64 {
        if self.num_samples == 0 {
            return 0.;
        }
        self.valid_count as f64 / self.num_samples as f64
    }
}

/// Draws molecules from a model. Use the inference backend, so dropout is off.
pub struct Sampler<'a, B: Backend> {
    model: &'a GenerativeModel<B>,
    vocab: &'a Vocabulary,
    device: B::Device,
    cancel: Option<CancelToken>,
}

impl<'a, B: Backend> Sampler<'a, B> {
    pub fn new(model: &'a GenerativeModel<B>, vocab: &'a Vocabulary, device: &B::Device) -> Self {
        Self {
            model,
            vocab,
            device: device.clone(),
            cancel: None,
        }
    }

    /// Stop between draws once `cancel` is set. What was drawn so far is still reported.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Next-token probabilities given a prefix.
    pub fn next_token_probs(&self, prefix: &[u32]) -> Result<Vec<f32>> {
        let input: Tensor<B, 2, Int> = Tensor::from_data(
            TensorData::new(
                prefix.iter().map(|&t| t as i64).collect::<Vec<_>>(),
                [1, prefix.len()],
            ),
            &self.device,
        );

        let logits = self.model.forward(input);
        let [_, len, vocab] = logits.dims();
        let last = logits.slice([0..1, len - 1..len, 0..vocab]).reshape([vocab]);

        activation::softmax(last, 0)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::Tensor(format!("{e:?}")))
    }

    pub fn sample_one<R: Rng>(&self, rng: &mut R, max_len: usize) -> Result<SampleOutcome> {
        let mut tokens = vec![START_TOKEN];

        loop {
            if tokens.len() >= max_len {
                return Ok(SampleOutcome::Truncated(tokens));
            }

            let probs = self.next_token_probs(&tokens)?;
            let dist = WeightedIndex::new(&probs).map_err(|e| Error::Sampling(e.to_string()))?;
            let next = dist.sample(rng) as u32;

            tokens.push(next);
            if next == END_TOKEN {
                return Ok(SampleOutcome::Completed(tokens));
            }
        }
    }

    /// Draw `config.num_samples` molecules. `reference` holds the training molecules; valid
    /// samples found there don't count as new.
    pub fn sample(
        &self,
        config: &SamplerConfig,
        reference: &HashSet<String>,
        oracle: &dyn ValidityOracle,
    ) -> Result<SamplingReport> {
        if config.max_len < 2 {
            return Err(Error::Config(format!(
                "max sample length must be at least 2; got {}",
                config.max_len
            )));
        }

        let start = Instant::now();
        let mut rng = StdRng::seed_from_u64(config.seed);

        let mut generated = GeneratedSet::default();
        let mut valid_count = 0;
        let mut truncated = 0;
        let mut last_reported = 0;
        let mut drawn = 0;
        let mut cancelled = false;

        for i in 0..config.num_samples {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                info!("Exiting from sampling early, after {drawn} samples");
                cancelled = true;
                break;
            }
            match self.sample_one(&mut rng, config.max_len)? {
                SampleOutcome::Truncated(_) => truncated += 1,
                SampleOutcome::Completed(tokens) => {
                    let smiles = self.vocab.decode(&tokens);
                    if oracle.is_valid(&smiles) {
                        valid_count += 1;
                        if !reference.contains(&smiles) {
                            generated.insert(smiles);
                        }
                    }
                }
            }
            drawn += 1;

            if config.report_every > 0 && i != 0 && i % config.report_every == 0 {
                info!(
                    "Sample {i}: {} new molecules since the last report",
                    generated.len() - last_reported
                );
                last_reported = generated.len();
            }
        }

        let report = SamplingReport {
            num_samples: drawn,
            cancelled,
            valid_count,
            truncated,
            generated,
        };

        info!(
            "Sampled {} molecules in {:.1}s. Validity: {:.4}, new: {}, hit the length limit: {}",
            report.num_samples,
            start.elapsed().as_secs_f32(),
            report.validity_rate(),
            report.generated.len(),
            report.truncated,
        );

        Ok(report)
    }
}

/// Reference molecules, one SMILES per line. Surrounding whitespace is trimmed and blank lines
/// skipped.
pub fn load_reference(path: &Path) -> Result<HashSet<String>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

pub fn write_samples(path: &Path, samples: &GeneratedSet) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = io::BufWriter::new(fs::File::create(path)?);
    for smiles in samples.iter() {
        writeln!(file, "{smiles}")?;
    }
    file.flush()?;

    info!("Wrote {} molecules to {path:?}", samples.len());
    Ok(())
}
