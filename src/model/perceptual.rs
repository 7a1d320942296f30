use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::relu;

/// VGG16 layout up to `block3_conv3`, used as a fixed feature space.
#[derive(Config, Debug)]
pub struct PerceptualConfig {
    pub base_dim: usize,
    #[config(default = 3)]
    pub channels: usize,
}

/// Convolution stacks separated by 2x2 max pooling.
#[derive(Module, Debug)]
pub struct PerceptualFeatures<B: Backend> {
    blocks: Vec<Vec<Conv2d<B>>>,
    pool: MaxPool2d,
}

impl PerceptualConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PerceptualFeatures<B> {
        let dim = self.base_dim;
        let layout = [
            vec![(self.channels, dim), (dim, dim)],
            vec![(dim, dim * 2), (dim * 2, dim * 2)],
            vec![(dim * 2, dim * 4), (dim * 4, dim * 4), (dim * 4, dim * 4)],
        ];
        let blocks = layout
            .iter()
            .map(|block| {
                block
                    .iter()
                    .map(|&(input, output)| {
                        Conv2dConfig::new([input, output], [3, 3])
                            .with_padding(PaddingConfig2d::Explicit(1, 1))
                            .init(device)
                    })
                    .collect()
            })
            .collect();
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        PerceptualFeatures { blocks, pool }
    }
}

impl<B: Backend> PerceptualFeatures<B> {
    /// Feature maps after the last convolution of the third block.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = images;
        for (idx, block) in self.blocks.iter().enumerate() {
            if idx > 0 {
                x = self.pool.forward(x);
            }
            for conv in block {
                x = relu(conv.forward(x));
            }
        }
        x
    }
}
