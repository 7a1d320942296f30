use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::TensorData;
use image::{GenericImage, Rgb, RgbImage};
use ndarray::{Array3, Array4, ArrayView3, Axis};
use std::path::Path;

/// Map raw pixel intensities in [0, 255] to [-1, 1].
pub fn normalize(value: f32) -> f32 {
    value / 127.5 - 1.0
}

/// Map [-1, 1] normalized values back to [0, 255].
pub fn denormalize(value: f32) -> f32 {
    (value + 1.0) * 127.5
}

/// Convert an NHWC array of raw intensities to a normalized NCHW tensor.
pub fn batch_to_tensor<B: Backend>(batch: &Array4<f32>, device: &B::Device) -> Tensor<B, 4> {
    let (n, h, w, c) = batch.dim();
    let values: Vec<f32> = batch.iter().map(|&v| normalize(v)).collect();
    Tensor::<B, 4>::from_data(TensorData::new(values, [n, h, w, c]), device).permute([0, 3, 1, 2])
}

/// Convert a normalized NCHW tensor back to an NHWC array in [0, 255].
pub fn tensor_to_batch<B: Backend>(tensor: Tensor<B, 4>) -> Result<Array4<f32>> {
    let [n, c, h, w] = tensor.dims();
    let data = tensor.permute([0, 2, 3, 1]).into_data().convert::<f32>();
    let values = data
        .to_vec::<f32>()
        .context("failed to read tensor data as f32")?;
    let values = values
        .into_iter()
        .map(|v| denormalize(v).clamp(0.0, 255.0))
        .collect();
    Array4::from_shape_vec((n, h, w, c), values).context("tensor data does not match its shape")
}

/// Convert an HWC array of intensities to an RGB image, truncating like a u8 cast.
pub fn array_to_image(array: ArrayView3<f32>) -> Result<RgbImage> {
    let (height, width, channels) = array.dim();
    if channels != 3 {
        return Err(anyhow::anyhow!(
            "expected 3 channels for images, got {channels}"
        ));
    }
    let mut img = RgbImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            let px = |ch: usize| array[[y, x, ch]].clamp(0.0, 255.0) as u8;
            img.put_pixel(x as u32, y as u32, Rgb([px(0), px(1), px(2)]));
        }
    }
    Ok(img)
}

/// Convert an RGB image to an HWC array of raw intensities.
pub fn image_to_array(img: &RgbImage) -> Array3<f32> {
    let (width, height) = img.dimensions();
    Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
        img.get_pixel(x as u32, y as u32).0[c] as f32
    })
}

/// Convert every row of an NHWC batch into an RGB image.
pub fn batch_to_images(batch: &Array4<f32>) -> Result<Vec<RgbImage>> {
    batch
        .axis_iter(Axis(0))
        .map(array_to_image)
        .collect()
}

/// Merge images into a fixed grid (rows x cols).
pub fn merge_images(images: &[RgbImage], rows: usize, cols: usize) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to merge"));
    }
    let width = images[0].width();
    let height = images[0].height();
    let mut out = RgbImage::new(width * cols as u32, height * rows as u32);

    for (idx, img) in images.iter().enumerate() {
        let row = idx / cols;
        let col = idx % cols;
        if row >= rows {
            break;
        }
        out.copy_from(img, (col as u32) * width, (row as u32) * height)
            .context("failed to copy image into grid")?;
    }

    Ok(out)
}

/// Concatenate images horizontally.
pub fn concat_images_horiz(images: &[RgbImage]) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to concatenate"));
    }
    let height = images.iter().map(|img| img.height()).max().unwrap_or(0);
    let total_width: u32 = images.iter().map(|img| img.width()).sum();
    let mut out = RgbImage::new(total_width, height);

    let mut offset_x = 0;
    for img in images {
        out.copy_from(img, offset_x, 0)
            .context("failed to concatenate image")?;
        offset_x += img.width();
    }

    Ok(out)
}

/// Save an RGB image, creating the parent directory first.
pub fn save_image(img: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    img.save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

/// Save a horizontal concatenation of images to disk.
pub fn save_concat_images(images: &[RgbImage], path: &Path) -> Result<()> {
    let output = concat_images_horiz(images)?;
    save_image(&output, path)
}

/// Save a (haze | ground truth | dehazed) comparison, one batch row per grid row.
pub fn save_comparison(
    haze: &Array4<f32>,
    clear: &Array4<f32>,
    dehazed: &Array4<f32>,
    path: &Path,
) -> Result<()> {
    let rows = haze.dim().0;
    let columns = [haze, clear, dehazed]
        .into_iter()
        .map(|batch| merge_images(&batch_to_images(batch)?, rows, 1))
        .collect::<Result<Vec<_>>>()?;
    save_concat_images(&columns, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn normalization_round_trip() {
        for v in 0..=255 {
            let v = v as f32;
            let restored = denormalize(normalize(v));
            assert!((restored - v).abs() < 1e-3, "{v} -> {restored}");
        }
        assert_eq!(normalize(0.0), -1.0);
        assert_eq!(normalize(255.0), 1.0);
    }

    #[test]
    fn batch_tensor_conversion_keeps_layout() {
        let device = Default::default();
        let batch = Array4::from_shape_fn((2, 3, 4, 3), |(n, y, x, c)| {
            (n * 60 + y * 12 + x * 3 + c) as f32
        });
        let tensor = batch_to_tensor::<TestBackend>(&batch, &device);
        assert_eq!(tensor.dims(), [2, 3, 3, 4]);

        let restored = tensor_to_batch(tensor).unwrap();
        assert_eq!(restored.dim(), (2, 3, 4, 3));
        for (a, b) in batch.iter().zip(restored.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn image_array_conversion() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(2, 1, Rgb([10, 20, 30]));
        let array = image_to_array(&img);
        assert_eq!(array.dim(), (2, 3, 3));
        assert_eq!(array[[1, 2, 1]], 20.0);
        assert_eq!(array_to_image(array.view()).unwrap(), img);
    }

    #[test]
    fn comparison_grid_has_three_columns() {
        let dir = tempfile::tempdir().unwrap();
        let batch = Array4::<f32>::from_elem((2, 4, 5, 3), 128.0);
        let path = dir.path().join("nested").join("0-0.jpg");
        save_comparison(&batch, &batch, &batch, &path).unwrap();

        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (15, 8));
    }
}
