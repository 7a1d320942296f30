#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::graphics::AutoGraphicsApi;
use burn::backend::wgpu::{init_setup, RuntimeOptions, WgpuDevice};
use burn::backend::{Autodiff, WebGpu};
use burn::config::Config;
use clap::Parser;
use dehaze_burn::model::ModelConfig;
use dehaze_burn::training::TrainingConfig;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Train the dehazing GAN with Burn")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Continue from the latest checkpoint in `model_dir`.
    #[arg(long, default_value_t = false)]
    resume: bool,
    /// Override the number of epochs from the config file.
    #[arg(long)]
    num_epochs: Option<usize>,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if args.resume {
        config.resume = true;
    }
    if let Some(num_epochs) = args.num_epochs {
        config.num_epochs = num_epochs;
    }
    config.model.validate()?;

    type Backend = WebGpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;
    let device = WgpuDevice::default();
    let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
    let max_storage_buffer_binding_size =
        setup.device.limits().max_storage_buffer_binding_size as u64;
    adjust_batch_size_for_wgpu(&mut config, max_storage_buffer_binding_size)?;

    let history = dehaze_burn::training::train::<AutodiffBackend>(config, device)?;
    if let Some(last) = history.last() {
        info!(
            "finished at epoch {} with d_on_g loss {:.5}",
            last.epoch, last.generator
        );
    }
    Ok(())
}

fn adjust_batch_size_for_wgpu(
    config: &mut TrainingConfig,
    max_storage_buffer_binding_size: u64,
) -> Result<()> {
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample_bytes =
        estimate_max_conv_workspace_elems(&config.model).saturating_mul(elem_bytes);
    if per_sample_bytes == 0 {
        return Ok(());
    }

    let safe_limit = max_storage_buffer_binding_size.saturating_sub(1);
    let max_batch = (safe_limit / per_sample_bytes) as usize;
    if max_batch == 0 {
        return Err(anyhow::anyhow!(
            "WGPU max storage buffer size ({max_storage_buffer_binding_size} bytes) is too small for a single sample (estimated {per_sample_bytes} bytes). Reduce the image size or model dims."
        ));
    }

    if config.batch_size > max_batch {
        warn!(
            "wgpu max storage buffer size {} bytes; estimated max conv workspace per sample {} bytes. lowering batch_size from {} to {}.",
            max_storage_buffer_binding_size, per_sample_bytes, config.batch_size, max_batch
        );
        config.batch_size = max_batch;
    }

    Ok(())
}

/// Largest im2col buffer (input channels x output positions x kernel area) of any conv.
fn estimate_max_conv_workspace_elems(model: &ModelConfig) -> u64 {
    let height = model.image_height as u64;
    let width = model.image_width as u64;
    let dim = model.generator_dim as u64;
    let mut max_elems = 0u64;
    let mut track = |in_channels: u64, out_height: u64, out_width: u64, kernel: u64| {
        max_elems = max_elems.max(in_channels * out_height * out_width * kernel * kernel);
    };

    // Generator: 7x7 stem and head at full resolution, two strided 3x3 convs,
    // 3x3 residual convs at quarter resolution, 4x4 transposed convs.
    track(3, height, width, 7);
    track(dim, height / 2, width / 2, 3);
    track(dim * 2, height / 4, width / 4, 3);
    if model.residual_blocks > 0 {
        track(dim * 4, height / 4, width / 4, 3);
    }
    track(dim * 2, height / 4, width / 4, 4);
    track(dim, height / 2, width / 2, 4);
    track(dim, height, width, 7);

    // Critic conv stack.
    let mut size = [height, width];
    let mut in_channels = 3u64;
    let disc_dim = model.discriminator_dim as u64;
    for (out_channels, stride) in [
        (disc_dim, 2),
        (disc_dim * 2, 2),
        (disc_dim * 4, 2),
        (disc_dim * 8, 1),
        (1, 1),
    ] {
        size = size.map(|s| conv_out(s, 4, stride, 1));
        track(in_channels, size[0], size[1], 4);
        in_channels = out_channels;
    }

    // Perceptual extractor, first block at full resolution.
    let base = model.perceptual_dim as u64;
    track(base, height, width, 3);
    track(base * 2, height / 2, width / 2, 3);
    track(base * 4, height / 4, width / 4, 3);

    max_elems
}

fn conv_out(input: u64, kernel: u64, stride: u64, padding: u64) -> u64 {
    (input + 2 * padding).saturating_sub(kernel) / stride + 1
}
