//! Causal convolution building blocks: a weight-normalised dilated 1-D convolution, and the gated
//! residual block built on top of it.

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        Dropout, DropoutConfig, Initializer,
        conv::{Conv1d, Conv1dConfig},
    },
    tensor::{
        Distribution, Tensor, activation, backend::Backend, module::conv1d, ops::ConvOptions,
    },
};

/// Std dev of the normal distribution conv weights are drawn from.
const WEIGHT_STD: f64 = 0.01;

/// Per-output-channel L2 norm of a conv weight of shape [out, in, kernel]. Returns [out, 1, 1].
fn channel_norm<B: Backend>(v: Tensor<B, 3>) -> Tensor<B, 3> {
    v.powf_scalar(2.)
        .sum_dim(2)
        .sum_dim(1)
        .sqrt()
        .clamp_min(1e-12)
}

/// A 1-D convolution with its weight split into a direction `v` and a per-channel magnitude `g`:
/// `w = g · v / ‖v‖`. Input [batch, channels_in, len].
#[derive(Module, Debug)]
pub struct WeightNormConv1d<B: Backend> {
    /// [channels_out, channels_in, kernel_size]
    pub direction: Param<Tensor<B, 3>>,
    /// [channels_out, 1, 1]
    pub magnitude: Param<Tensor<B, 3>>,
    /// [channels_out]
    pub bias: Param<Tensor<B, 1>>,
    #[module(skip)]
    pub dilation: usize,
    #[module(skip)]
    pub padding: usize,
}

impl<B: Backend> WeightNormConv1d<B> {
    /// `v ~ N(0, 0.01)`, and `g = ‖v‖`, so the effective weight starts out equal to `v`.
    pub fn new(
        channels_in: usize,
        channels_out: usize,
        kernel_size: usize,
        dilation: usize,
        padding: usize,
        device: &B::Device,
    ) -> Self {
        let v = Tensor::<B, 3>::random(
            [channels_out, channels_in, kernel_size],
            Distribution::Normal(0., WEIGHT_STD),
            device,
        );
        let g = channel_norm(v.clone());

        let bias = Initializer::Normal {
            mean: 0.,
            std: WEIGHT_STD,
        }
        .init([channels_out], device);

        Self {
            direction: Param::from_tensor(v),
            magnitude: Param::from_tensor(g),
            bias,
            dilation,
            padding,
        }
    }

    /// The effective convolution weight.
    pub fn weight(&self) -> Tensor<B, 3> {
        let v = self.direction.val();
        let norm = channel_norm(v.clone());
        v * (self.magnitude.val() / norm)
    }

    /// Output length is `len + 2 · padding − dilation · (kernel_size − 1)`.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        conv1d(
            x,
            self.weight(),
            Some(self.bias.val()),
            ConvOptions::new([1], [self.padding], [self.dilation], 1),
        )
    }
}

#[derive(Config, Debug)]
pub struct GatedResidualConvBlockConfig {
    pub channels_in: usize,
    pub channels_out: usize,
    pub kernel_size: usize,
    pub dilation: usize,
    #[config(default = 0.2)]
    pub dropout: f64,
}

impl GatedResidualConvBlockConfig {
    /// Causal padding: `(kernel_size − 1) · dilation`.
    pub fn padding(&self) -> usize {
        self.kernel_size.saturating_sub(1) * self.dilation
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> GatedResidualConvBlock<B> {
        let conv = WeightNormConv1d::new(
            self.channels_in,
            self.channels_out * 2,
            self.kernel_size,
            self.dilation,
            self.padding(),
            device,
        );

        let projection = (self.channels_in != self.channels_out).then(|| {
            Conv1dConfig::new(self.channels_in, self.channels_out, 1)
                .with_initializer(Initializer::Normal {
                    mean: 0.,
                    std: WEIGHT_STD,
                })
                .init(device)
        });

        GatedResidualConvBlock {
            conv,
            dropout: DropoutConfig::new(self.dropout).init(),
            projection,
        }
    }
}

/// Causal dilated conv, then a gated linear unit, dropout, and a residual connection. The input
/// goes through a 1×1 projection on the residual path only when channel counts differ.
#[derive(Module, Debug)]
pub struct GatedResidualConvBlock<B: Backend> {
    conv: WeightNormConv1d<B>,
    dropout: Dropout,
    projection: Option<Conv1d<B>>,
}

impl<B: Backend> GatedResidualConvBlock<B> {
    pub fn has_projection(&self) -> bool {
        self.projection.is_some()
    }

    /// Convolution and GLU, before dropout and the residual. [batch, c_in, len] →
    /// [batch, c_out, len].
    pub fn gated(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [_, _, len] = x.dims();

        let y = self.conv.forward(x);
        let [batch, channels, _] = y.dims();

        // Padding was added on both sides; dropping the trailing positions leaves position `t`
        // depending on inputs `..=t` only, and restores the input length.
        let y = y.slice([0..batch, 0..channels, 0..len]);

        let half = channels / 2;
        let value = y.clone().slice([0..batch, 0..half, 0..len]);
        let gate = y.slice([0..batch, half..channels, 0..len]);

        value * activation::sigmoid(gate)
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let out = self.dropout.forward(self.gated(x.clone()));

        let residual = match &self.projection {
            Some(proj) => proj.forward(x),
            None => x,
        };

        out + residual
    }
}
