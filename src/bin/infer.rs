#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::WgpuDevice;
use burn::backend::WebGpu;
use burn::config::Config;
use clap::Parser;
use dehaze_burn::checkpoint::{load_generator, resolve_generator};
use dehaze_burn::inference;
use dehaze_burn::training::TrainingConfig;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Dehaze a directory of images with a trained generator")]
struct Args {
    /// Model directory holding `config.json` and checkpoints.
    #[arg(long, default_value = "model_save")]
    model_dir: PathBuf,
    /// Generator checkpoint; defaults to the latest epoch in `model_dir`.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Training config; defaults to `model_dir/config.json`.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    input_dir: PathBuf,
    #[arg(long)]
    output_dir: PathBuf,
    /// Ground-truth images, in the same order as the inputs, for PSNR/SSIM.
    #[arg(long)]
    clear_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    type Backend = WebGpu<f32, i32>;
    let device = WgpuDevice::default();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.model_dir.join("config.json"));
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config.model.validate()?;

    let checkpoint = args.checkpoint.as_ref().unwrap_or(&args.model_dir);
    let checkpoint_path =
        resolve_generator(checkpoint).context("failed to resolve generator checkpoint")?;
    info!("loading generator from {}", checkpoint_path.display());
    let generator = load_generator::<Backend>(&config.model, &checkpoint_path, &device)?;

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("failed to create {}", args.output_dir.display()))?;
    let scores = inference::run(
        &generator,
        &args.input_dir,
        &args.output_dir,
        args.clear_dir.as_deref(),
        &device,
    )?;

    if let Some(scores) = scores {
        let path = args.output_dir.join("scores.json");
        fs::write(&path, serde_json::to_string_pretty(&scores)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!(
            "PSNR {:.4} SSIM {:.4} ({} images)",
            scores.psnr, scores.ssim, scores.count
        );
    }
    Ok(())
}
