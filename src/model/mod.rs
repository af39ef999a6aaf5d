//! The generative model: token embedding, a stack of gated dilated causal convolutions, and a
//! linear decoder to per-position vocabulary logits.

pub mod conv;
pub mod encoder;

use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig},
    prelude::Int,
    tensor::{Tensor, backend::Backend},
};

use crate::{
    error::{self, Error},
    model::encoder::{DilatedConvStack, DilatedConvStackConfig},
};

/// Saved alongside the weights as JSON, so a checkpoint can be rebuilt without the CLI flags it
/// was trained with.
#[derive(Config, Debug, PartialEq)]
pub struct ModelConfig {
    pub vocab_size: usize,
    /// Embedding size.
    #[config(default = 32)]
    pub input_size: usize,
    #[config(default = 256)]
    pub hidden_size: usize,
    #[config(default = 5)]
    pub n_levels: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 0.2)]
    pub dropout: f64,
    #[config(default = 0.1)]
    pub emb_dropout: f64,
}

impl ModelConfig {
    /// Reject shapes [`ModelConfig::init`] can't build. Configs read back from disk go through
    /// this too.
    pub fn validate(&self) -> error::Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("input_size", self.input_size),
            ("hidden_size", self.hidden_size),
            ("n_levels", self.n_levels),
            ("kernel_size", self.kernel_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be at least 1")));
        }

        for (name, p) in [("dropout", self.dropout), ("emb_dropout", self.emb_dropout)] {
            if !(0. ..1.).contains(&p) {
                return Err(Error::Config(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> GenerativeModel<B> {
        let embedding = EmbeddingConfig::new(self.vocab_size, self.input_size)
            .with_initializer(Initializer::Uniform {
                min: -0.1,
                max: 0.1,
            })
            .init(device);

        let encoder = DilatedConvStackConfig::new(self.input_size, self.hidden_size, self.n_levels)
            .with_kernel_size(self.kernel_size)
            .with_dropout(self.dropout)
            .init(device);

        GenerativeModel {
            embedding,
            emb_dropout: DropoutConfig::new(self.emb_dropout).init(),
            encoder,
            decoder: LinearConfig::new(self.hidden_size, self.vocab_size).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct GenerativeModel<B: Backend> {
    embedding: Embedding<B>,
    emb_dropout: Dropout,
    encoder: DilatedConvStack<B>,
    /// No activation; callers apply softmax or cross-entropy.
    pub decoder: Linear<B>,
}

impl<B: Backend> GenerativeModel<B> {
    /// [batch, len] tokens → [batch, len, vocab] logits. The logits at position `t` depend only
    /// on tokens `..=t`.
    pub fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let emb = self.emb_dropout.forward(self.embedding.forward(tokens));

        // Convolutions run channel-first.
        let hidden = self.encoder.forward(emb.swap_dims(1, 2)).swap_dims(1, 2);

        self.decoder.forward(hidden)
    }

    pub fn receptive_field(&self) -> usize {
        self.encoder.receptive_field()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use burn::{backend::NdArray, tensor::TensorData};

    use super::*;

    type B = NdArray;

    fn small_config() -> ModelConfig {
        ModelConfig::new(7)
            .with_input_size(8)
            .with_hidden_size(16)
            .with_n_levels(3)
    }

    fn tokens(rows: Vec<Vec<i64>>) -> Tensor<B, 2, Int> {
        let batch = rows.len();
        let len = rows[0].len();
        let flat: Vec<i64> = rows.into_iter().flatten().collect();
        Tensor::from_data(TensorData::new(flat, [batch, len]), &Default::default())
    }

    #[test]
    fn defaults() {
        let cfg = ModelConfig::new(40);
        assert_eq!(cfg.input_size, 32);
        assert_eq!(cfg.hidden_size, 256);
        assert_eq!(cfg.n_levels, 5);
        assert_eq!(cfg.kernel_size, 3);
    }

    #[test]
    fn validate_rejects_empty_shapes() {
        assert!(small_config().validate().is_ok());
        assert!(ModelConfig::new(40).validate().is_ok());

        for cfg in [
            small_config().with_kernel_size(0),
            small_config().with_n_levels(0),
            small_config().with_hidden_size(0),
            ModelConfig::new(0),
            small_config().with_dropout(1.),
            small_config().with_emb_dropout(-0.1),
        ] {
            assert!(matches!(cfg.validate(), Err(Error::Config(_))), "{cfg:?}");
        }
    }

    #[test]
    fn logits_match_input_length() {
        let model = small_config().init::<B>(&Default::default());
        for len in [2, 5, 30] {
            let x = tokens(vec![vec![1; len], vec![3; len]]);
            assert_eq!(model.forward(x).dims(), [2, len, 7]);
        }
    }

    #[test]
    fn changing_a_token_leaves_earlier_logits_alone() {
        let model = small_config().init::<B>(&Default::default());
        let a = vec![1, 3, 4, 5, 6, 3, 4, 2];
        let mut b = a.clone();
        let changed_at = 4;
        b[changed_at] = 3;

        let len = a.len();
        let out_a = model.forward(tokens(vec![a])).into_data().to_vec::<f32>().unwrap();
        let out_b = model.forward(tokens(vec![b])).into_data().to_vec::<f32>().unwrap();

        // Row-major [1, len, vocab].
        let vocab = out_a.len() / len;
        for i in 0..changed_at * vocab {
            assert_abs_diff_eq!(out_a[i], out_b[i], epsilon = 1e-6);
        }
        // The changed position itself must see the change.
        let changed = (changed_at * vocab..(changed_at + 1) * vocab)
            .any(|i| (out_a[i] - out_b[i]).abs() > 1e-7);
        assert!(changed);
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = small_config();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
