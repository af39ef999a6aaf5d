//! The conv stack between embedding and decoder: `n_levels` gated residual blocks whose dilation
//! doubles at each level, so the receptive field grows exponentially with depth.

use burn::{config::Config, module::Module, tensor::Tensor, tensor::backend::Backend};

use super::conv::{GatedResidualConvBlock, GatedResidualConvBlockConfig};

/// Number of input positions that can influence one output position, for a stack of `n_levels`
/// blocks with dilations 1, 2, 4, ..
pub fn receptive_field(kernel_size: usize, n_levels: usize) -> usize {
    1 + kernel_size.saturating_sub(1) * ((1 << n_levels) - 1)
}

#[derive(Config, Debug)]
pub struct DilatedConvStackConfig {
    pub channels_in: usize,
    pub hidden_size: usize,
    pub n_levels: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 0.2)]
    pub dropout: f64,
}

impl DilatedConvStackConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DilatedConvStack<B> {
        let blocks = (0..self.n_levels)
            .map(|i| {
                let channels_in = if i == 0 {
                    self.channels_in
                } else {
                    self.hidden_size
                };
                GatedResidualConvBlockConfig::new(
                    channels_in,
                    self.hidden_size,
                    self.kernel_size,
                    1 << i,
                )
                .with_dropout(self.dropout)
                .init(device)
            })
            .collect();

        DilatedConvStack {
            blocks,
            kernel_size: self.kernel_size,
        }
    }
}

/// Gated residual blocks applied in sequence, block `i` with dilation `2^i`.
/// [batch, channels_in, len] → [batch, hidden_size, len].
#[derive(Module, Debug)]
pub struct DilatedConvStack<B: Backend> {
    blocks: Vec<GatedResidualConvBlock<B>>,
    #[module(skip)]
    kernel_size: usize,
}

impl<B: Backend> DilatedConvStack<B> {
    pub fn n_levels(&self) -> usize {
        self.blocks.len()
    }

    pub fn receptive_field(&self) -> usize {
        receptive_field(self.kernel_size, self.blocks.len())
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.blocks.iter().fold(x, |h, block| block.forward(h))
    }
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, tensor::Distribution};

    use super::*;

    type B = NdArray;

    #[test]
    fn receptive_field_grows_exponentially() {
        assert_eq!(receptive_field(3, 1), 3);
        assert_eq!(receptive_field(3, 5), 63);
        assert_eq!(receptive_field(2, 4), 16);
    }

    #[test]
    fn stack_shapes() {
        let device = Default::default();
        let stack = DilatedConvStackConfig::new(8, 16, 4).init::<B>(&device);
        assert_eq!(stack.n_levels(), 4);
        assert_eq!(stack.receptive_field(), 31);

        let x = Tensor::<B, 3>::random([3, 8, 20], Distribution::Normal(0., 1.), &device);
        assert_eq!(stack.forward(x).dims(), [3, 16, 20]);
    }
}
