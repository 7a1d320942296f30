use crate::checkpoint::{
    discriminator_name, latest_generator, load_discriminator, load_generator, save_checkpoint,
};
use crate::data::{Batch, DataConfig, PairIndex, SplitMode, SplitRanges, SplitSampler};
use crate::model::{
    generator_losses, wasserstein_loss, Discriminator, Generator, LossConfig, ModelConfig,
    PerceptualFeatures,
};
use crate::utils::{batch_to_tensor, save_comparison, tensor_to_batch};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{s, Array4};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub loss: LossConfig,
    pub data: DataConfig,
    /// Checkpoints, `config.json` and `losses.json` land here.
    pub model_dir: String,
    /// Comparison images written every `sample_steps` batches.
    pub sample_dir: String,
    #[config(default = 50)]
    pub num_epochs: usize,
    #[config(default = 1)]
    pub batch_size: usize,
    #[config(default = 5)]
    pub critic_updates: usize,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = 50)]
    pub sample_steps: usize,
    /// Defaults to `total_pairs / batch_size`.
    pub steps_per_epoch: Option<usize>,
    #[config(default = 0)]
    pub seed: u64,
    #[config(default = false)]
    pub resume: bool,
    pub optimizer_gen: AdamConfig,
    pub optimizer_disc: AdamConfig,
}

/// Mean losses of one epoch, persisted to `losses.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochLosses {
    pub epoch: usize,
    pub critic: f64,
    pub generator: f64,
    pub perceptual: f64,
    pub adversarial: f64,
    /// Wall-clock seconds spent on the epoch, sampling and checkpointing included.
    #[serde(default)]
    pub elapsed_secs: f64,
}

/// Scalar losses of one generator update.
#[derive(Clone, Copy, Debug, Default)]
pub struct GeneratorStep {
    pub total: f64,
    pub perceptual: f64,
    pub adversarial: f64,
}

type GeneratorOptimizer<B> = OptimizerAdaptor<Adam, Generator<B>, B>;
type DiscriminatorOptimizer<B> = OptimizerAdaptor<Adam, Discriminator<B>, B>;

/// Generator, critic and their optimizers.
///
/// The critic and generator are updated by separate procedures, each of which
/// collects gradients for and steps only its own network.
pub struct Trainer<B: AutodiffBackend> {
    pub generator: Generator<B>,
    pub discriminator: Discriminator<B>,
    features: PerceptualFeatures<B>,
    optim_gen: GeneratorOptimizer<B>,
    optim_disc: DiscriminatorOptimizer<B>,
    loss: LossConfig,
    learning_rate: f64,
    critic_updates: usize,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: &TrainingConfig, device: &B::Device) -> Result<Self> {
        config.model.validate()?;
        Ok(Self {
            generator: config.model.init_generator(device),
            discriminator: config.model.init_discriminator(device)?,
            features: config.model.init_perceptual(device)?,
            optim_gen: config.optimizer_gen.init::<B, Generator<B>>(),
            optim_disc: config.optimizer_disc.init::<B, Discriminator<B>>(),
            loss: config.loss.clone(),
            learning_rate: config.learning_rate,
            critic_updates: config.critic_updates,
        })
    }

    /// Replace both networks, e.g. with weights restored from a checkpoint.
    pub fn with_networks(mut self, generator: Generator<B>, discriminator: Discriminator<B>) -> Self {
        self.generator = generator;
        self.discriminator = discriminator;
        self
    }

    /// One critic update towards `target` (+1 real, -1 generated).
    pub fn critic_step(&mut self, images: Tensor<B, 4>, target: f32) -> f64 {
        let batch = images.dims()[0];
        let target = Tensor::<B, 2>::full([batch, 1], target, &images.device());
        let loss = wasserstein_loss(target, self.discriminator.forward(images));
        let value = loss.clone().into_scalar().elem::<f64>();

        let grads = GradientsParams::from_grads(loss.backward(), &self.discriminator);
        self.discriminator =
            self.optim_disc
                .step(self.learning_rate, self.discriminator.clone(), grads);
        value
    }

    /// `critic_updates` rounds of real then generated critic steps.
    ///
    /// Returns the mean of `0.5 * (real + fake)` over the rounds.
    pub fn critic_round(&mut self, hazy: Tensor<B, 4>, clear: Tensor<B, 4>) -> f64 {
        let fakes = self.generator.forward(hazy).detach();
        let mut total = 0.0;
        for _ in 0..self.critic_updates {
            let real = self.critic_step(clear.clone(), 1.0);
            let fake = self.critic_step(fakes.clone(), -1.0);
            total += 0.5 * (real + fake);
        }
        total / self.critic_updates.max(1) as f64
    }

    /// One generator update on perceptual + adversarial loss.
    pub fn generator_step(&mut self, hazy: Tensor<B, 4>, clear: Tensor<B, 4>) -> GeneratorStep {
        let losses = generator_losses(
            &self.generator,
            &self.discriminator,
            &self.features,
            &self.loss,
            hazy,
            clear,
        );
        let step = GeneratorStep {
            total: losses.total.clone().into_scalar().elem::<f64>(),
            perceptual: losses.perceptual.into_scalar().elem::<f64>(),
            adversarial: losses.adversarial.into_scalar().elem::<f64>(),
        };

        let grads = GradientsParams::from_grads(losses.total.backward(), &self.generator);
        self.generator = self
            .optim_gen
            .step(self.learning_rate, self.generator.clone(), grads);
        step
    }

    /// Critic round followed by a generator step on the filled rows of `batch`.
    pub fn train_batch(&mut self, batch: &Batch, device: &B::Device) -> Result<(f64, GeneratorStep)> {
        let (hazy, clear) = filled_rows(batch)?;
        let hazy = batch_to_tensor::<B>(&hazy, device);
        let clear = batch_to_tensor::<B>(&clear, device);

        let critic = self.critic_round(hazy.clone(), clear.clone());
        let generator = self.generator_step(hazy, clear);
        Ok((critic, generator))
    }

    /// Dehaze a batch with the generator in inference mode, returning [0, 255] intensities.
    pub fn dehaze_batch(&self, hazy: &Array4<f32>, device: &B::Device) -> Result<Array4<f32>> {
        let generator = self.generator.valid();
        let input = batch_to_tensor::<B::InnerBackend>(hazy, device);
        tensor_to_batch(generator.forward(input))
    }
}

fn filled_rows(batch: &Batch) -> Result<(Array4<f32>, Array4<f32>)> {
    if batch.filled == 0 {
        return Err(anyhow::anyhow!("batch holds no pairs"));
    }
    let filled = batch.filled;
    Ok((
        batch.hazy.slice(s![..filled, .., .., ..]).to_owned(),
        batch.clear.slice(s![..filled, .., .., ..]).to_owned(),
    ))
}

fn losses_path(model_dir: &Path) -> PathBuf {
    model_dir.join("losses.json")
}

/// Loss history from `losses.json`, empty when none was written yet.
pub fn load_history(model_dir: &Path) -> Result<Vec<EpochLosses>> {
    let path = losses_path(model_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_history(model_dir: &Path, history: &[EpochLosses]) -> Result<()> {
    let path = losses_path(model_dir);
    let contents = serde_json::to_string_pretty(history)?;
    fs::write(&path, contents).with_context(|| format!("failed to write {}", path.display()))
}

/// Bar over every batch of the remaining epochs.
fn progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn save_sample<B: AutodiffBackend>(
    trainer: &Trainer<B>,
    sampler: &mut SplitSampler,
    path: &Path,
    device: &B::Device,
) -> Result<()> {
    let batch = sampler
        .next()
        .ok_or_else(|| anyhow::anyhow!("sample iterator ended"))??;
    let (hazy, clear) = filled_rows(&batch)?;
    let dehazed = trainer.dehaze_batch(&hazy, device)?;
    save_comparison(&hazy, &clear, &dehazed, path)
}

/// Train the dehazing GAN, returning the loss history of every epoch.
pub fn train<B: AutodiffBackend>(
    config: TrainingConfig,
    device: B::Device,
) -> Result<Vec<EpochLosses>> {
    config.model.validate()?;
    let model_dir = PathBuf::from(&config.model_dir);
    let sample_dir = PathBuf::from(&config.sample_dir);
    fs::create_dir_all(&model_dir)
        .with_context(|| format!("failed to create {}", model_dir.display()))?;
    fs::create_dir_all(&sample_dir)
        .with_context(|| format!("failed to create {}", sample_dir.display()))?;
    config.save(model_dir.join("config.json"))?;

    B::seed(&device, config.seed);

    let pairs = PairIndex::from_config(&config.data).build()?;
    let ranges = SplitRanges::from_config(pairs.len(), &config.data)?;
    info!(
        "pairs -> {}, train -> {}, validation -> {}, test -> {}",
        pairs.len(),
        ranges.train.len(),
        ranges.validation.len(),
        ranges.test.len()
    );

    let pairs = Arc::new(pairs);
    let image_shape = [config.model.image_height, config.model.image_width];
    let mut train_batches = SplitSampler::new(
        pairs.clone(),
        &ranges,
        SplitMode::Train,
        config.batch_size,
        image_shape,
        config.seed,
    )?;
    if train_batches.is_empty() {
        return Err(anyhow::anyhow!("no training pairs found"));
    }
    let mut sample_batches = if ranges.test.is_empty() {
        warn!("test split is empty, no samples will be saved");
        None
    } else {
        Some(SplitSampler::new(
            pairs.clone(),
            &ranges,
            SplitMode::Test,
            config.batch_size,
            image_shape,
            config.seed.wrapping_add(1),
        )?)
    };

    let mut trainer = Trainer::<B>::new(&config, &device)?;
    let mut start_epoch = 0;
    if config.resume {
        match latest_generator(&model_dir)? {
            Some(checkpoint) => {
                let generator = load_generator::<B>(&config.model, &checkpoint.path, &device)?;
                let discriminator = load_discriminator::<B>(
                    &config.model,
                    &model_dir.join(discriminator_name(checkpoint.epoch)),
                    &device,
                )?;
                trainer = trainer.with_networks(generator, discriminator);
                start_epoch = checkpoint.epoch + 1;
                info!(
                    "resumed from {} at epoch {}",
                    checkpoint.path.display(),
                    start_epoch
                );
            }
            None => warn!("no checkpoint in {}, starting fresh", model_dir.display()),
        }
    }

    let mut history: Vec<EpochLosses> = if config.resume {
        load_history(&model_dir)?
            .into_iter()
            .filter(|entry| entry.epoch < start_epoch)
            .collect()
    } else {
        Vec::new()
    };

    let steps = config
        .steps_per_epoch
        .unwrap_or(pairs.len() / config.batch_size)
        .max(1);
    info!(
        "training epochs {}..{} with {} batches per epoch",
        start_epoch, config.num_epochs, steps
    );

    let epochs_left = config.num_epochs.saturating_sub(start_epoch);
    let pb = progress_bar((epochs_left * steps) as u64)?;

    for epoch in start_epoch..config.num_epochs {
        let started = Instant::now();
        let mut totals = EpochLosses {
            epoch,
            ..Default::default()
        };

        for index in 0..steps {
            let batch = train_batches
                .next()
                .ok_or_else(|| anyhow::anyhow!("training iterator ended"))??;
            let (critic, generator) = trainer.train_batch(&batch, &device)?;
            debug!(
                "epoch {} batch {}/{}: d loss {:.5}, d_on_g loss {:.5}",
                epoch,
                index + 1,
                steps,
                critic,
                generator.total
            );
            pb.set_message(format!(
                "epoch {epoch} d loss {critic:.5} d_on_g loss {:.5}",
                generator.total
            ));
            pb.inc(1);
            totals.critic += critic;
            totals.generator += generator.total;
            totals.perceptual += generator.perceptual;
            totals.adversarial += generator.adversarial;

            if config.sample_steps > 0 && index % config.sample_steps == 0 {
                if let Some(sampler) = sample_batches.as_mut() {
                    let path = sample_dir.join(format!("{epoch}-{index}.jpg"));
                    save_sample(&trainer, sampler, &path, &device)?;
                }
            }
        }

        let count = steps as f64;
        let mut losses = EpochLosses {
            epoch,
            critic: totals.critic / count,
            generator: totals.generator / count,
            perceptual: totals.perceptual / count,
            adversarial: totals.adversarial / count,
            elapsed_secs: 0.0,
        };

        let (generator_path, _) = save_checkpoint(
            &model_dir,
            epoch,
            losses.generator as i64,
            &trainer.generator,
            &trainer.discriminator,
        )?;
        debug!("saved {}", generator_path.display());

        losses.elapsed_secs = started.elapsed().as_secs_f64();
        pb.suspend(|| {
            info!(
                "epoch {}: d loss {:.5}, d_on_g loss {:.5} (perceptual {:.5}, adversarial {:.5}), spend time {:.1}s",
                epoch,
                losses.critic,
                losses.generator,
                losses.perceptual,
                losses.adversarial,
                losses.elapsed_secs
            )
        });

        history.push(losses);
        write_history(&model_dir, &history)?;
    }

    pb.finish_with_message(match history.last() {
        Some(last) => format!("done, d_on_g loss {:.5}", last.generator),
        None => "done".to_string(),
    });
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::write_dataset;
    use crate::model::tests::small_config;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::{Module, ModuleVisitor, Param};

    type TestBackend = Autodiff<NdArray<f32>>;

    /// Flattened convolution and dense weights.
    ///
    /// Per-channel vectors are skipped: they hold biases, affine norm parameters
    /// and the BatchNorm running statistics, which every training-mode forward
    /// pass moves regardless of which network is stepped.
    struct WeightCollector(Vec<f32>);

    impl<B: Backend> ModuleVisitor<B> for WeightCollector {
        fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
            if D > 1 {
                self.0
                    .extend(param.val().into_data().to_vec::<f32>().unwrap());
            }
        }
    }

    fn weights<B: Backend, M: Module<B>>(module: &M) -> Vec<f32> {
        let mut collector = WeightCollector(Vec::new());
        module.visit(&mut collector);
        collector.0
    }

    fn config(root: &Path) -> TrainingConfig {
        let (clear_dir, haze_dir) = write_dataset(root, 4, 2, 32, 32);
        let data = DataConfig::new(
            clear_dir.to_string_lossy().into_owned(),
            haze_dir.to_string_lossy().into_owned(),
            root.join("pairs.pkl").to_string_lossy().into_owned(),
        )
        .with_train_fraction(0.5)
        .with_validation_fraction(0.25);
        TrainingConfig::new(
            small_config(),
            LossConfig::new(),
            data,
            root.join("model").to_string_lossy().into_owned(),
            root.join("samples").to_string_lossy().into_owned(),
            AdamConfig::new(),
            AdamConfig::new(),
        )
        .with_learning_rate(1e-2)
        .with_critic_updates(1)
    }

    fn images(value: f32) -> Tensor<TestBackend, 4> {
        Tensor::full([2, 3, 32, 32], value, &Default::default())
    }

    #[test]
    fn critic_step_only_updates_the_critic() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut trainer = Trainer::<TestBackend>::new(&config(dir.path()), &device).unwrap();
        let generator_before = weights(&trainer.generator);
        let critic_before = weights(&trainer.discriminator);

        let fakes = trainer.generator.forward(images(-0.5)).detach();
        trainer.critic_step(fakes, -1.0);

        assert_eq!(weights(&trainer.generator), generator_before);
        assert_ne!(weights(&trainer.discriminator), critic_before);
    }

    /// Critic scores in inference mode, which read the BatchNorm running statistics.
    fn running_scores(trainer: &Trainer<TestBackend>) -> Vec<f32> {
        let input = Tensor::<NdArray<f32>, 4>::full([2, 3, 32, 32], 0.25, &Default::default());
        trainer
            .discriminator
            .valid()
            .forward(input)
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn generator_step_only_updates_generator_weights() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut trainer = Trainer::<TestBackend>::new(&config(dir.path()), &device).unwrap();
        let generator_before = weights(&trainer.generator);
        let critic_before = weights(&trainer.discriminator);
        let scores_before = running_scores(&trainer);

        let step = trainer.generator_step(images(-0.5), images(0.5));

        // The critic's trained weights stay fixed, but its forward pass in the
        // generator loss still advances its BatchNorm running statistics.
        assert_ne!(running_scores(&trainer), scores_before);

        assert!(step.total.is_finite());
        let sum = step.perceptual + step.adversarial;
        assert!((step.total - sum).abs() < 1e-4 * step.total.abs().max(1.0));
        assert_ne!(weights(&trainer.generator), generator_before);
        assert_eq!(weights(&trainer.discriminator), critic_before);
    }

    #[test]
    fn invalid_image_sizes_fail_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut config = config(dir.path());
        for (height, width) in [(30, 30), (8, 8)] {
            config.model.image_height = height;
            config.model.image_width = width;
            assert!(Trainer::<TestBackend>::new(&config, &device).is_err());
            assert!(train::<TestBackend>(config.clone(), Default::default()).is_err());
        }
        assert!(!Path::new(&config.model_dir).join("config.json").exists());
    }

    #[test]
    fn progress_bar_spans_all_batches() {
        let pb = progress_bar(12).unwrap();
        pb.inc(5);
        assert_eq!(pb.length(), Some(12));
        assert_eq!(pb.position(), 5);
    }

    #[test]
    fn empty_batches_are_rejected() {
        let batch = Batch::zeros(2, 4, 4);
        assert!(filled_rows(&batch).is_err());
    }

    #[test]
    fn training_writes_checkpoints_history_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path())
            .with_num_epochs(2)
            .with_steps_per_epoch(Some(2))
            .with_sample_steps(1);
        let model_dir = PathBuf::from(&config.model_dir);
        let sample_dir = PathBuf::from(&config.sample_dir);

        let history = train::<TestBackend>(config.clone(), Default::default()).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].epoch, 1);
        assert!(history.iter().all(|entry| entry.generator.is_finite()));
        assert!(history.iter().all(|entry| entry.elapsed_secs > 0.0));

        assert!(model_dir.join("config.json").is_file());
        let stored = load_history(&model_dir).unwrap();
        assert_eq!(stored.len(), 2);
        assert!((stored[1].generator - history[1].generator).abs() < 1e-9);
        assert!((stored[1].elapsed_secs - history[1].elapsed_secs).abs() < 1e-9);
        assert!(model_dir.join("discriminator_1.mpk").is_file());
        assert_eq!(latest_generator(&model_dir).unwrap().unwrap().epoch, 1);
        for name in ["0-0.jpg", "0-1.jpg", "1-0.jpg", "1-1.jpg"] {
            assert!(sample_dir.join(name).is_file(), "{name}");
        }

        let resumed = train::<TestBackend>(
            config.with_resume(true).with_num_epochs(3),
            Default::default(),
        )
        .unwrap();
        assert_eq!(resumed.len(), 3);
        let epochs: Vec<_> = resumed.iter().map(|entry| entry.epoch).collect();
        assert_eq!(epochs, vec![0, 1, 2]);
        assert!((resumed[0].critic - history[0].critic).abs() < 1e-9);
        assert_eq!(latest_generator(&model_dir).unwrap().unwrap().epoch, 2);
    }
}
