pub mod discriminator;
pub mod generator;
pub mod perceptual;

use anyhow::{Context, Result};
use burn::prelude::*;
use burn::record::CompactRecorder;
use tracing::warn;

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use generator::{Generator, GeneratorConfig, SPATIAL_STRIDE};
pub use perceptual::{PerceptualConfig, PerceptualFeatures};

/// Hyperparameters for the generator, critic and perceptual extractor.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub image_height: usize,
    pub image_width: usize,
    #[config(default = 64)]
    pub generator_dim: usize,
    #[config(default = 9)]
    pub residual_blocks: usize,
    #[config(default = 64)]
    pub discriminator_dim: usize,
    #[config(default = 1024)]
    pub discriminator_hidden: usize,
    #[config(default = 64)]
    pub perceptual_dim: usize,
    /// Pretrained extractor weights saved with `CompactRecorder`.
    pub perceptual_weights: Option<String>,
}

/// Weighting for the generator's loss terms.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 100.0)]
    pub perceptual_weight: f64,
    #[config(default = 1.0)]
    pub adversarial_weight: f64,
}

impl ModelConfig {
    /// Check the training image size against the generator stride and the critic depth.
    pub fn validate(&self) -> Result<()> {
        let (height, width) = (self.image_height, self.image_width);
        if height == 0
            || width == 0
            || height % SPATIAL_STRIDE != 0
            || width % SPATIAL_STRIDE != 0
        {
            return Err(anyhow::anyhow!(
                "image size {height}x{width} must be a positive multiple of {SPATIAL_STRIDE}"
            ));
        }
        self.discriminator_config().patch_size()?;
        Ok(())
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(self.generator_dim, self.residual_blocks)
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig::new(
            self.discriminator_dim,
            self.discriminator_hidden,
            self.image_height,
            self.image_width,
        )
    }

    pub fn perceptual_config(&self) -> PerceptualConfig {
        PerceptualConfig::new(self.perceptual_dim)
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.generator_config().init(device)
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Result<Discriminator<B>> {
        self.discriminator_config().init(device)
    }

    /// Build the frozen feature extractor, loading pretrained weights when configured.
    pub fn init_perceptual<B: Backend>(&self, device: &B::Device) -> Result<PerceptualFeatures<B>> {
        let features = self.perceptual_config().init(device);
        let features = match &self.perceptual_weights {
            Some(path) => features
                .load_file(path, &CompactRecorder::new(), device)
                .with_context(|| format!("failed to load perceptual weights from {path}"))?,
            None => {
                warn!("no perceptual_weights configured, using a randomly initialized extractor");
                features
            }
        };
        Ok(features.no_grad())
    }
}

/// Critic loss: mean of target (+1 real, -1 fake) times score.
pub fn wasserstein_loss<B: Backend>(target: Tensor<B, 2>, score: Tensor<B, 2>) -> Tensor<B, 1> {
    target.mul(score).mean()
}

/// Mean squared distance between extractor features of two image batches.
pub fn perceptual_loss<B: Backend>(
    features: &PerceptualFeatures<B>,
    generated: Tensor<B, 4>,
    target: Tensor<B, 4>,
) -> Tensor<B, 1> {
    features
        .forward(target)
        .sub(features.forward(generated))
        .square()
        .mean()
}

/// Loss terms of one generator update.
#[derive(Debug)]
pub struct GeneratorLosses<B: Backend> {
    pub total: Tensor<B, 1>,
    pub perceptual: Tensor<B, 1>,
    pub adversarial: Tensor<B, 1>,
}

/// Weighted perceptual + adversarial loss of the generator on a hazy batch.
pub fn generator_losses<B: Backend>(
    generator: &Generator<B>,
    discriminator: &Discriminator<B>,
    features: &PerceptualFeatures<B>,
    loss_config: &LossConfig,
    hazy: Tensor<B, 4>,
    clear: Tensor<B, 4>,
) -> GeneratorLosses<B> {
    let dehazed = generator.forward(hazy);
    let batch = dehazed.dims()[0];
    let real_target = Tensor::<B, 2>::ones([batch, 1], &dehazed.device());

    let perceptual = perceptual_loss(features, dehazed.clone(), clear)
        .mul_scalar(loss_config.perceptual_weight);
    let adversarial = wasserstein_loss(real_target, discriminator.forward(dehazed))
        .mul_scalar(loss_config.adversarial_weight);
    let total = perceptual.clone().add(adversarial.clone());

    GeneratorLosses {
        total,
        perceptual,
        adversarial,
    }
}
