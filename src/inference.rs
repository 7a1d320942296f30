use anyhow::{Context, Result};
use burn::prelude::*;
use ndarray::{s, Array3, Axis};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::data::load_array;
use crate::metrics::{psnr, ssim, to_u8};
use crate::model::generator::SPATIAL_STRIDE;
use crate::model::Generator;
use crate::utils::{array_to_image, batch_to_tensor, image_to_array, save_image, tensor_to_batch};

/// Mean quality scores of dehazed images against their ground truth.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Scores {
    pub psnr: f64,
    pub ssim: f64,
    pub count: usize,
}

/// Dehaze images one at a time so each may have its own size.
///
/// Inputs and outputs are HWC arrays of intensities in [0, 255].
pub fn dehaze<B: Backend>(
    generator: &Generator<B>,
    images: &[Array3<f32>],
    device: &B::Device,
) -> Result<Vec<Array3<f32>>> {
    images
        .iter()
        .map(|image| dehaze_image(generator, image, device))
        .collect()
}

/// Dehaze a single image, padding it to the generator's stride and cropping back.
pub fn dehaze_image<B: Backend>(
    generator: &Generator<B>,
    image: &Array3<f32>,
    device: &B::Device,
) -> Result<Array3<f32>> {
    let (height, width, channels) = image.dim();
    if height == 0 || width == 0 || channels != 3 {
        return Err(anyhow::anyhow!(
            "expected a non-empty RGB image, got shape {:?}",
            image.dim()
        ));
    }

    let padded = pad_edge(image, SPATIAL_STRIDE).insert_axis(Axis(0));
    let input = batch_to_tensor::<B>(&padded, device);
    let output = tensor_to_batch(generator.forward(input))?;
    Ok(output.slice(s![0, ..height, ..width, ..]).to_owned())
}

/// Replicate the last row and column until both sides are multiples of `multiple`.
fn pad_edge(image: &Array3<f32>, multiple: usize) -> Array3<f32> {
    let (height, width, channels) = image.dim();
    let padded_height = height.div_ceil(multiple) * multiple;
    let padded_width = width.div_ceil(multiple) * multiple;
    if (padded_height, padded_width) == (height, width) {
        return image.clone();
    }
    Array3::from_shape_fn((padded_height, padded_width, channels), |(y, x, c)| {
        image[[y.min(height - 1), x.min(width - 1), c]]
    })
}

/// Mean PSNR and SSIM of dehazed images against same-sized ground truth.
pub fn score(dehazed: &[Array3<f32>], clear: &[Array3<f32>]) -> Result<Scores> {
    if dehazed.len() != clear.len() {
        return Err(anyhow::anyhow!(
            "{} dehazed images but {} ground-truth images",
            dehazed.len(),
            clear.len()
        ));
    }
    if dehazed.is_empty() {
        return Err(anyhow::anyhow!("no images to score"));
    }

    let mut psnr_total = 0.0;
    let mut ssim_total = 0.0;
    for (idx, (output, truth)) in dehazed.iter().zip(clear).enumerate() {
        let output = to_u8(output.view());
        let truth = to_u8(truth.view());
        psnr_total += psnr(truth.view(), output.view())
            .with_context(|| format!("failed to score image {}", idx + 1))?;
        ssim_total += ssim(truth.view(), output.view())
            .with_context(|| format!("failed to score image {}", idx + 1))?;
    }

    let count = dehazed.len();
    Ok(Scores {
        psnr: psnr_total / count as f64,
        ssim: ssim_total / count as f64,
        count,
    })
}

/// Load `*.jpg` and `*.npy` images from `dir`, ordered by file name.
pub fn load_images(dir: &Path) -> Result<Vec<(PathBuf, Array3<f32>)>> {
    let mut paths = Vec::new();
    for ext in ["jpg", "npy"] {
        let pattern = format!("{}/*.{ext}", glob::Pattern::escape(&dir.to_string_lossy()));
        paths.extend(glob::glob(&pattern)?.filter_map(Result::ok));
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let array = if path.extension().map_or(false, |ext| ext == "npy") {
                load_array(&path)?
            } else {
                let img = image::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?
                    .to_rgb8();
                image_to_array(&img)
            };
            Ok((path, array))
        })
        .collect()
}

/// Write images as `001.jpg`, `002.jpg`, ... into `dir`.
pub fn save_outputs(dir: &Path, images: &[Array3<f32>]) -> Result<Vec<PathBuf>> {
    images
        .iter()
        .enumerate()
        .map(|(idx, image)| {
            let path = dir.join(format!("{:03}.jpg", idx + 1));
            save_image(&array_to_image(image.view())?, &path)?;
            Ok(path)
        })
        .collect()
}

/// Dehaze every image in `haze_dir` into `output_dir`, scoring against `clear_dir` if given.
pub fn run<B: Backend>(
    generator: &Generator<B>,
    haze_dir: &Path,
    output_dir: &Path,
    clear_dir: Option<&Path>,
    device: &B::Device,
) -> Result<Option<Scores>> {
    let hazy: Vec<_> = load_images(haze_dir)?
        .into_iter()
        .map(|(_, image)| image)
        .collect();
    if hazy.is_empty() {
        return Err(anyhow::anyhow!("no images found in {}", haze_dir.display()));
    }
    info!("dehazing {} images from {}", hazy.len(), haze_dir.display());

    let dehazed = dehaze(generator, &hazy, device)?;
    let written = save_outputs(output_dir, &dehazed)?;
    info!("wrote {} images to {}", written.len(), output_dir.display());

    let Some(clear_dir) = clear_dir else {
        return Ok(None);
    };
    let clear: Vec<_> = load_images(clear_dir)?
        .into_iter()
        .map(|(_, image)| image)
        .collect();
    let scores = score(&dehazed, &clear)?;
    info!(
        "PSNR {:.4} SSIM {:.4} over {} images",
        scores.psnr, scores.ssim, scores.count
    );
    Ok(Some(scores))
}
