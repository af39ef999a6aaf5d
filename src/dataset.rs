//! Token sequences, the train/validation/test split, and batching into padded tensors.

use std::{fs, path::Path};

use burn::{
    prelude::Int,
    tensor::{Tensor, TensorData, backend::Backend},
};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    smiles::ValidityOracle,
    vocab::{END_TOKEN, PAD_TOKEN, START_TOKEN, Vocabulary},
};

/// One molecule as tokens: the start token, the SMILES characters, then the terminator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct Sequence(Vec<u32>);

impl Sequence {
    /// Requires at least two tokens, a leading start token, and exactly one terminator, in last
    /// position.
    pub fn new(tokens: Vec<u32>) -> Result<Self> {
        if tokens.len() < 2 {
            return Err(Error::InvalidSequence(format!(
                "need at least 2 tokens; got {}",
                tokens.len()
            )));
        }
        if tokens[0] != START_TOKEN {
            return Err(Error::InvalidSequence(
                "sequence must begin with the start token".into(),
            ));
        }
        let n_end = tokens.iter().filter(|&&t| t == END_TOKEN).count();
        if n_end != 1 || tokens[tokens.len() - 1] != END_TOKEN {
            return Err(Error::InvalidSequence(
                "sequence must end with exactly one terminator".into(),
            ));
        }
        Ok(Self(tokens))
    }

    pub fn tokens(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shorten to at most `max_len` tokens, keeping the terminator as the last token.
    pub fn truncated(&self, max_len: usize) -> Self {
        let max_len = max_len.max(2);
        if self.0.len() <= max_len {
            return self.clone();
        }
        let mut tokens = self.0[..max_len - 1].to_vec();
        tokens.push(END_TOKEN);
        Self(tokens)
    }
}

impl TryFrom<Vec<u32>> for Sequence {
    type Error = Error;

    fn try_from(tokens: Vec<u32>) -> Result<Self> {
        Self::new(tokens)
    }
}

impl From<Sequence> for Vec<u32> {
    fn from(seq: Sequence) -> Self {
        seq.0
    }
}

/// Train, validation and test sequences.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DataSplits {
    pub train: Vec<Sequence>,
    pub valid: Vec<Sequence>,
    pub test: Vec<Sequence>,
}

impl DataSplits {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let splits: Self = serde_json::from_slice(&bytes)?;

        info!(
            "Loaded {} train, {} validation and {} test sequences from {path:?}",
            splits.train.len(),
            splits.valid.len(),
            splits.test.len()
        );
        Ok(splits)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    /// Encode SMILES strings and shuffle them into the three splits. Strings the vocabulary
    /// can't encode are skipped with a warning.
    pub fn from_smiles(
        smiles: &[String],
        vocab: &Vocabulary,
        valid_frac: f64,
        test_frac: f64,
        seed: u64,
    ) -> Result<Self> {
        if !(0.0..1.0).contains(&(valid_frac + test_frac)) || valid_frac < 0. || test_frac < 0. {
            return Err(Error::Config(format!(
                "validation ({valid_frac}) and test ({test_frac}) fractions must sum to less than 1"
            )));
        }

        let mut seqs = Vec::with_capacity(smiles.len());
        for smi in smiles {
            match vocab.encode(smi) {
                Ok(s) => seqs.push(s),
                Err(e) => warn!("Skipping {smi:?}: {e}"),
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        seqs.shuffle(&mut rng);

        let n = seqs.len();
        let n_valid = (n as f64 * valid_frac).round() as usize;
        let n_test = (n as f64 * test_frac).round() as usize;

        let test = seqs.split_off(n - n_test);
        let valid = seqs.split_off(n - n_test - n_valid);

        Ok(Self {
            train: seqs,
            valid,
            test,
        })
    }

    /// Length of the longest sequence in any split, in tokens.
    pub fn max_len(&self) -> usize {
        self.train
            .iter()
            .chain(&self.valid)
            .chain(&self.test)
            .map(Sequence::len)
            .max()
            .unwrap_or(0)
    }
}

/// Read a SMILES file, one molecule per line. Blank lines are skipped. If an oracle is passed,
/// molecules it rejects are skipped too.
pub fn read_smiles(path: &Path, oracle: Option<&dyn ValidityOracle>) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)?;

    let mut result = Vec::new();
    let mut rejected = 0;
    for line in text.lines() {
        let smi = line.trim();
        if smi.is_empty() {
            continue;
        }
        if let Some(o) = oracle {
            if !o.is_valid(smi) {
                rejected += 1;
                continue;
            }
        }
        result.push(smi.to_owned());
    }

    if rejected > 0 {
        warn!("Skipped {rejected} invalid molecules in {path:?}");
    }
    Ok(result)
}

/// A padded batch, aligned for next-token prediction: `targets[:, i]` is the token following
/// `inputs[:, i]`.
#[derive(Clone, Debug)]
pub struct SequenceBatch<B: Backend> {
    /// [batch, len - 1]
    pub inputs: Tensor<B, 2, Int>,
    /// [batch, len - 1]
    pub targets: Tensor<B, 2, Int>,
}

/// Pads sequences to the longest in the batch, optionally truncating to `max_len` first.
#[derive(Clone, Debug, Default)]
pub struct SequenceBatcher {
    pub max_len: Option<usize>,
}

impl SequenceBatcher {
    pub fn new(max_len: Option<usize>) -> Self {
        Self { max_len }
    }

    /// Pad to a uniform length, returning the flat row-major token buffer and that length.
    pub fn pad(&self, items: &[&Sequence]) -> (Vec<i64>, usize) {
        let seqs: Vec<Sequence> = items
            .iter()
            .map(|s| match self.max_len {
                Some(max) => s.truncated(max),
                None => (*s).clone(),
            })
            .collect();

        let len = seqs.iter().map(Sequence::len).max().unwrap_or(2);

        let mut tokens = Vec::with_capacity(seqs.len() * len);
        for seq in &seqs {
            tokens.extend(seq.tokens().iter().map(|&t| t as i64));
            tokens.extend(std::iter::repeat_n(PAD_TOKEN as i64, len - seq.len()));
        }

        (tokens, len)
    }

    pub fn batch<B: Backend>(&self, items: &[&Sequence], device: &B::Device) -> SequenceBatch<B> {
        let batch_size = items.len();
        let (tokens, len) = self.pad(items);

        let all: Tensor<B, 2, Int> =
            Tensor::from_data(TensorData::new(tokens, [batch_size, len]), device);

        SequenceBatch {
            inputs: all.clone().slice([0..batch_size, 0..len - 1]),
            targets: all.slice([0..batch_size, 1..len]),
        }
    }
}

/// Split `n` item indices into batches. With an RNG, indices are shuffled first.
pub fn batch_indices(n: usize, batch_size: usize, rng: Option<&mut StdRng>) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..n).collect();
    if let Some(rng) = rng {
        indices.shuffle(rng);
    }

    indices
        .chunks(batch_size.max(1))
        .map(|c| c.to_vec())
        .collect()
}
