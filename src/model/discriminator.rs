use anyhow::Result;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the patch critic with a dense scoring head.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub discriminator_dim: usize,
    pub hidden_dim: usize,
    pub image_height: usize,
    pub image_width: usize,
    #[config(default = 3)]
    pub channels: usize,
}

/// Critic returning one unbounded realism score per image.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    bns: Vec<BatchNorm<B>>,
    patch: Conv2d<B>,
    fc_hidden: Linear<B>,
    fc_score: Linear<B>,
}

impl DiscriminatorConfig {
    /// Initialize the critic layers on the given device.
    ///
    /// Fails when the image is too small to leave a patch map for the dense head.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Discriminator<B>> {
        let dim = self.discriminator_dim;
        let convs = vec![
            conv(self.channels, dim, 2, device),
            conv(dim, dim * 2, 2, device),
            conv(dim * 2, dim * 4, 2, device),
            conv(dim * 4, dim * 8, 1, device),
        ];
        let bns = vec![
            BatchNormConfig::new(dim * 2).init(device),
            BatchNormConfig::new(dim * 4).init(device),
            BatchNormConfig::new(dim * 8).init(device),
        ];
        let patch = conv(dim * 8, 1, 1, device);

        let [height, width] = self.patch_size()?;
        let fc_hidden = LinearConfig::new(height * width, self.hidden_dim).init(device);
        let fc_score = LinearConfig::new(self.hidden_dim, 1).init(device);

        Ok(Discriminator {
            convs,
            bns,
            patch,
            fc_hidden,
            fc_score,
        })
    }

    /// Spatial size of the single-channel patch map fed to the dense head.
    pub fn patch_size(&self) -> Result<[usize; 2]> {
        let shrink = |mut size: usize| {
            for stride in [2, 2, 2, 1, 1] {
                size = conv_out(size, 4, stride, 1)?;
            }
            Some(size)
        };
        match (shrink(self.image_height), shrink(self.image_width)) {
            (Some(height), Some(width)) => Ok([height, width]),
            _ => Err(anyhow::anyhow!(
                "{}x{} images are too small for the critic",
                self.image_height,
                self.image_width
            )),
        }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Score a [batch, 3, H, W] batch, returning [batch, 1].
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = leaky_relu(self.convs[0].forward(images), 0.2);
        for (conv, bn) in self.convs[1..].iter().zip(&self.bns) {
            x = leaky_relu(bn.forward(conv.forward(x)), 0.2);
        }
        let x = self.patch.forward(x);

        let [batch, channels, height, width] = x.dims();
        let flat = x.reshape([batch, channels * height * width]);
        let hidden = self.fc_hidden.forward(flat).tanh();
        self.fc_score.forward(hidden)
    }
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// Output size of a convolution, `None` when the kernel does not fit.
fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let span = (input + 2 * padding).checked_sub(kernel)?;
    Some(span / stride + 1)
}
