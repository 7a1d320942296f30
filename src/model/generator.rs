use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Height and width of generator inputs must be multiples of this.
pub const SPATIAL_STRIDE: usize = 4;

/// Configuration for the residual encoder/decoder generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub generator_dim: usize,
    pub residual_blocks: usize,
    #[config(default = 3)]
    pub channels: usize,
}

/// Conv -> batch norm, the unit every generator stage is built from.
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
}

impl<B: Backend> ConvNorm<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init(device);
        Self {
            conv,
            norm: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}

/// Two 3x3 conv-norm layers with an identity shortcut.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    first: ConvNorm<B>,
    second: ConvNorm<B>,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            first: ConvNorm::new(channels, channels, 3, 1, device),
            second: ConvNorm::new(channels, channels, 3, 1, device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = self.second.forward(relu(self.first.forward(x.clone())));
        x.add(residual)
    }
}

/// Upsampling stage: transposed conv doubling the spatial size, then batch norm.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    conv: ConvTranspose2d<B>,
    norm: BatchNorm<B>,
}

impl<B: Backend> UpBlock<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
            .with_stride([2, 2])
            .with_padding([1, 1])
            .init(device);
        Self {
            conv,
            norm: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}

/// Residual generator mapping hazy images in [-1, 1] to dehazed estimates.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    stem: ConvNorm<B>,
    down: Vec<ConvNorm<B>>,
    blocks: Vec<ResidualBlock<B>>,
    up: Vec<UpBlock<B>>,
    head: Conv2d<B>,
}

impl GeneratorConfig {
    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let dim = self.generator_dim;
        let stem = ConvNorm::new(self.channels, dim, 7, 1, device);
        let down = vec![
            ConvNorm::new(dim, dim * 2, 3, 2, device),
            ConvNorm::new(dim * 2, dim * 4, 3, 2, device),
        ];
        let blocks = (0..self.residual_blocks)
            .map(|_| ResidualBlock::new(dim * 4, device))
            .collect();
        let up = vec![
            UpBlock::new(dim * 4, dim * 2, device),
            UpBlock::new(dim * 2, dim, device),
        ];
        let head = Conv2dConfig::new([dim, self.channels], [7, 7])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .init(device);

        Generator {
            stem,
            down,
            blocks,
            up,
            head,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Dehaze a [batch, 3, H, W] batch; H and W must be multiples of [`SPATIAL_STRIDE`].
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = relu(self.stem.forward(images.clone()));
        for layer in &self.down {
            x = relu(layer.forward(x));
        }
        for block in &self.blocks {
            x = block.forward(x);
        }
        for layer in &self.up {
            x = relu(layer.forward(x));
        }
        // Global skip: average the prediction with the input.
        self.head.forward(x).tanh().add(images).div_scalar(2.0)
    }
}
