#![allow(clippy::too_many_arguments)]

//! Command line entry point: `prepare` a SMILES corpus, `train` a model on it, and `sample`
//! new molecules from a checkpoint.
//!
//! `cargo r --release -- prepare --input data/smi.txt`
//! `cargo r --release -- train --levels 5 --epochs 200`
//! `cargo r --release --features wgpu -- sample --gpu --num-samples 10000`

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    process::ExitCode,
};

#[cfg(feature = "wgpu")]
use burn::backend::Wgpu;
use burn::{
    backend::{Autodiff, NdArray},
    config::Config,
    tensor::backend::{AutodiffBackend, Backend},
};
use clap::{Args, Parser, Subcommand, ValueHint, builder::RangedU64ValueParser};
use smiles_gen::{
    Error, Result,
    checkpoint::{self, CheckpointPaths},
    dataset::{DataSplits, read_smiles},
    logging::init_tracing,
    model::{GenerativeModel, ModelConfig},
    sample::{Sampler, SamplerConfig, load_reference, write_samples},
    smiles::{SmilesValidator, ValidityOracle},
    train::{CancelToken, OptimizerKind, TrainingConfig, train},
    vocab::Vocabulary,
};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Generate molecules with a gated temporal convolutional network over SMILES"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the vocabulary and the train/validation/test split from a SMILES file
    Prepare(PrepareArgs),

    /// Train a model, keep the checkpoint with the best validation loss, then sample from it
    Train(TrainArgs),

    /// Sample molecules from a saved checkpoint
    Sample(SampleArgs),
}

#[derive(Args)]
struct PrepareArgs {
    /// SMILES corpus, one molecule per line
    #[arg(long, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Where `vocab.json` and `data.json` are written
    #[arg(long, default_value = "data", value_hint = ValueHint::DirPath)]
    out_dir: PathBuf,

    #[arg(long, default_value_t = 0.1)]
    valid_frac: f64,

    #[arg(long, default_value_t = 0.1)]
    test_frac: f64,

    /// Drop molecules the SMILES checker rejects
    #[arg(long)]
    filter_invalid: bool,

    #[arg(long, default_value_t = 1024)]
    seed: u64,
}

/// Parses a count that must be at least 1.
fn positive() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::new().range(1..)
}

#[derive(Args)]
struct ModelArgs {
    /// Size of the token embeddings
    #[arg(long, default_value_t = 32, value_parser = positive())]
    emsize: usize,

    /// Hidden units per conv layer
    #[arg(long, default_value_t = 256, value_parser = positive())]
    nhid: usize,

    /// Number of gated conv blocks
    #[arg(long, default_value_t = 5, value_parser = positive())]
    levels: usize,

    /// Convolution kernel size
    #[arg(long, default_value_t = 3, value_parser = positive())]
    ksize: usize,

    /// Dropout applied inside the conv blocks
    #[arg(long, default_value_t = 0.2)]
    dropout: f64,

    /// Dropout applied to the embeddings
    #[arg(long, default_value_t = 0.1)]
    emb_dropout: f64,
}

impl ModelArgs {
    fn to_config(&self, vocab_size: usize) -> ModelConfig {
        ModelConfig::new(vocab_size)
            .with_input_size(self.emsize)
            .with_hidden_size(self.nhid)
            .with_n_levels(self.levels)
            .with_kernel_size(self.ksize)
            .with_dropout(self.dropout)
            .with_emb_dropout(self.emb_dropout)
    }
}

#[derive(Args)]
struct SamplingArgs {
    #[arg(long, default_value_t = 100_000)]
    num_samples: usize,

    /// Abandon samples that reach this many tokens. Defaults to twice the longest sequence in
    /// the dataset.
    #[arg(long)]
    max_len: Option<usize>,

    /// Log the number of new molecules every this many samples
    #[arg(long, default_value_t = 10_000)]
    report_every: usize,

    /// Known molecules, one per line. Defaults to every molecule in the dataset.
    #[arg(long, value_hint = ValueHint::FilePath)]
    reference: Option<PathBuf>,

    /// Output file. Defaults to `results/<levels>sample.txt`.
    #[arg(long, value_hint = ValueHint::FilePath)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct TrainArgs {
    #[arg(long, default_value = "data/vocab.json", value_hint = ValueHint::FilePath)]
    vocab: PathBuf,

    #[arg(long, default_value = "data/data.json", value_hint = ValueHint::FilePath)]
    data: PathBuf,

    #[arg(long, default_value = "results/saved_models", value_hint = ValueHint::DirPath)]
    model_dir: PathBuf,

    /// Checkpoint name; saved as `<model_dir>/<levels><save_name>`
    #[arg(long, default_value = "gen.mpk")]
    save_name: String,

    #[command(flatten)]
    model: ModelArgs,

    #[arg(long, default_value_t = 32, value_parser = positive())]
    batch_size: usize,

    #[arg(long, default_value_t = 200)]
    epochs: usize,

    #[arg(long, default_value_t = 0.001)]
    lr: f64,

    /// Adam, AdamW or SGD
    #[arg(long, default_value = "Adam")]
    optim: OptimizerKind,

    #[arg(long, default_value_t = 1024)]
    seed: u64,

    /// Truncate training sequences to this many tokens, keeping the terminator
    #[arg(long, value_parser = RangedU64ValueParser::<usize>::new().range(2..))]
    train_max_len: Option<usize>,

    /// Run on the GPU. Requires the `wgpu` feature.
    #[arg(long)]
    gpu: bool,

    /// Stop after the test evaluation
    #[arg(long)]
    no_sample: bool,

    #[command(flatten)]
    sampling: SamplingArgs,
}

#[derive(Args)]
struct SampleArgs {
    #[arg(long, default_value = "data/vocab.json", value_hint = ValueHint::FilePath)]
    vocab: PathBuf,

    /// Used for the default max length and reference set
    #[arg(long, default_value = "data/data.json", value_hint = ValueHint::FilePath)]
    data: PathBuf,

    #[arg(long, default_value = "results/saved_models", value_hint = ValueHint::DirPath)]
    model_dir: PathBuf,

    #[arg(long, default_value = "gen.mpk")]
    save_name: String,

    /// Depth of the saved model; part of the checkpoint file name
    #[arg(long, default_value_t = 5, value_parser = positive())]
    levels: usize,

    #[arg(long, default_value_t = 1024)]
    seed: u64,

    #[arg(long)]
    gpu: bool,

    #[command(flatten)]
    sampling: SamplingArgs,
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Prepare(args) => prepare(&args),
        Command::Train(args) => dispatch_train(&args),
        Command::Sample(args) => dispatch_sample(&args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn prepare(args: &PrepareArgs) -> Result<()> {
    let validator = SmilesValidator;
    let oracle: Option<&dyn ValidityOracle> = if args.filter_invalid {
        Some(&validator)
    } else {
        None
    };

    let smiles = read_smiles(&args.input, oracle)?;
    let vocab = Vocabulary::build(smiles.iter().map(String::as_str))?;
    let splits =
        DataSplits::from_smiles(&smiles, &vocab, args.valid_frac, args.test_frac, args.seed)?;

    let vocab_path = args.out_dir.join("vocab.json");
    let data_path = args.out_dir.join("data.json");
    vocab.save(&vocab_path)?;
    splits.save(&data_path)?;

    info!(
        "{} symbols written to {vocab_path:?}; {} / {} / {} sequences written to {data_path:?}",
        vocab.len(),
        splits.train.len(),
        splits.valid.len(),
        splits.test.len()
    );
    Ok(())
}

fn dispatch_train(args: &TrainArgs) -> Result<()> {
    if args.gpu {
        #[cfg(feature = "wgpu")]
        return run_train::<Autodiff<Wgpu>>(args, &Default::default());

        #[cfg(not(feature = "wgpu"))]
        warn!("Built without the `wgpu` feature; training on the CPU");
    }
    run_train::<Autodiff<NdArray>>(args, &Default::default())
}

fn dispatch_sample(args: &SampleArgs) -> Result<()> {
    if args.gpu {
        #[cfg(feature = "wgpu")]
        return run_sample::<Wgpu>(args, &Default::default());

        #[cfg(not(feature = "wgpu"))]
        warn!("Built without the `wgpu` feature; sampling on the CPU");
    }
    run_sample::<NdArray>(args, &Default::default())
}

fn run_train<B: AutodiffBackend>(args: &TrainArgs, device: &B::Device) -> Result<()> {
    let vocab = Vocabulary::load(&args.vocab)?;
    let splits = DataSplits::load(&args.data)?;

    let config = TrainingConfig::new(args.model.to_config(vocab.len()))
        .with_num_epochs(args.epochs)
        .with_batch_size(args.batch_size)
        .with_learning_rate(args.lr)
        .with_optimizer(args.optim)
        .with_seed(args.seed)
        .with_max_len(args.train_max_len);

    std::fs::create_dir_all(&args.model_dir)?;
    config.save(args.model_dir.join(format!("{}training.json", args.model.levels)))?;

    let cancel = interrupt_handler()?;
    let paths = CheckpointPaths::new(&args.model_dir, args.model.levels, &args.save_name);
    let (model, summary) = train::<B>(&config, &splits, paths, &cancel, device)?;

    if let Some(best) = summary.best_valid_loss {
        info!(
            "Best validation loss {best:.6} over {} epochs",
            summary.epochs.len()
        );
    }

    if args.no_sample {
        return Ok(());
    }
    // An interrupt that ended training shouldn't also skip sampling.
    cancel.reset();

    let reference = reference_set(args.sampling.reference.as_deref(), &splits, &vocab)?;
    run_sampling(
        &model,
        &vocab,
        &args.sampling,
        splits.max_len(),
        args.seed,
        args.model.levels,
        &reference,
        &cancel,
        device,
    )
}

fn run_sample<B: Backend>(args: &SampleArgs, device: &B::Device) -> Result<()> {
    let vocab = Vocabulary::load(&args.vocab)?;
    let paths = CheckpointPaths::new(&args.model_dir, args.levels, &args.save_name);
    let (model, config) = checkpoint::load::<B>(&paths, device)?;

    if config.vocab_size != vocab.len() {
        return Err(Error::CheckpointMismatch {
            path: paths.config,
            reason: format!(
                "model has {} outputs; the vocabulary has {} symbols",
                config.vocab_size,
                vocab.len()
            ),
        });
    }

    // The dataset is optional here: without it, an explicit reference file and the fallback max
    // length are used.
    let splits = if args.data.is_file() {
        DataSplits::load(&args.data)?
    } else {
        warn!("No dataset at {:?}", args.data);
        DataSplits::default()
    };

    let cancel = interrupt_handler()?;
    let reference = reference_set(args.sampling.reference.as_deref(), &splits, &vocab)?;
    run_sampling(
        &model,
        &vocab,
        &args.sampling,
        splits.max_len(),
        args.seed,
        args.levels,
        &reference,
        &cancel,
        device,
    )
}

/// The first Ctrl-C sets the returned token, letting the current epoch or sample finish. A
/// second one, before the token is reset, exits.
fn interrupt_handler() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            warn!("Interrupted again; exiting");
            std::process::exit(130);
        }
        warn!("Interrupted; stopping after the current epoch or sample. Ctrl-C again exits");
        handler_token.cancel();
    })
    .map_err(|e| Error::Io(io::Error::other(e)))?;

    Ok(cancel)
}

/// Molecules generated samples must differ from: an explicit file if given, otherwise every
/// molecule in the dataset.
fn reference_set(
    path: Option<&Path>,
    splits: &DataSplits,
    vocab: &Vocabulary,
) -> Result<HashSet<String>> {
    if let Some(p) = path {
        return load_reference(p);
    }

    Ok(splits
        .train
        .iter()
        .chain(&splits.valid)
        .chain(&splits.test)
        .map(|s| vocab.decode(s.tokens()))
        .collect())
}

fn run_sampling<B: Backend>(
    model: &GenerativeModel<B>,
    vocab: &Vocabulary,
    args: &SamplingArgs,
    longest_sequence: usize,
    seed: u64,
    levels: usize,
    reference: &HashSet<String>,
    cancel: &CancelToken,
    device: &B::Device,
) -> Result<()> {
    let config = SamplerConfig {
        num_samples: args.num_samples,
        max_len: args
            .max_len
            .unwrap_or_else(|| SamplerConfig::max_len_for(longest_sequence)),
        report_every: args.report_every,
        seed,
    };

    let report = Sampler::new(model, vocab, device)
        .with_cancel(cancel.clone())
        .sample(&config, reference, &SmilesValidator)?;
    info!("Validity rate: {:.4}", report.validity_rate());

    let out = args
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from("results").join(format!("{levels}sample.txt")));
    write_samples(&out, &report.generated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("smiles-gen").chain(args.iter().copied()))
    }

    #[test]
    fn zero_sized_models_are_refused_at_the_command_line() {
        for flag in ["--ksize", "--levels", "--nhid", "--emsize", "--batch-size"] {
            assert!(parse(&["train", flag, "0"]).is_err(), "{flag} 0");
        }
        assert!(parse(&["sample", "--levels", "0"]).is_err());
        assert!(parse(&["train", "--ksize", "2", "--levels", "1"]).is_ok());
    }

    #[test]
    fn train_max_len_flag() {
        let Command::Train(args) = parse(&["train", "--train-max-len", "40"]).unwrap().command
        else {
            panic!("expected the train command");
        };
        assert_eq!(args.train_max_len, Some(40));

        let Command::Train(args) = parse(&["train"]).unwrap().command else {
            panic!("expected the train command");
        };
        assert_eq!(args.train_max_len, None);
        assert!(parse(&["train", "--train-max-len", "1"]).is_err());
    }
}
