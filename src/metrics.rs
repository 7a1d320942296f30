//! Image quality scores on 8-bit RGB arrays.
//!
//! Both metrics use a data range of 255. SSIM follows the usual 7x7 uniform
//! window formulation with sample covariance, averaged over the window
//! positions that fit entirely inside the image and then over channels.

use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

const DATA_RANGE: f64 = 255.0;
const SSIM_WINDOW: usize = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;

/// Truncate intensities to `u8` the way a numeric cast would, after clamping.
pub fn to_u8(array: ArrayView3<f32>) -> Array3<u8> {
    array.mapv(|v| v.clamp(0.0, 255.0) as u8)
}

fn check_shapes(reference: &ArrayView3<u8>, test: &ArrayView3<u8>) -> Result<()> {
    if reference.dim() != test.dim() {
        return Err(anyhow::anyhow!(
            "cannot compare images of shape {:?} and {:?}",
            reference.dim(),
            test.dim()
        ));
    }
    Ok(())
}

/// Peak signal-to-noise ratio in dB; infinite for identical images.
pub fn psnr(reference: ArrayView3<u8>, test: ArrayView3<u8>) -> Result<f64> {
    check_shapes(&reference, &test)?;
    let count = reference.len();
    if count == 0 {
        return Err(anyhow::anyhow!("cannot compute PSNR of an empty image"));
    }
    let sum_sq: f64 = reference
        .iter()
        .zip(test.iter())
        .map(|(&a, &b)| {
            let diff = a as f64 - b as f64;
            diff * diff
        })
        .sum();
    let mse = sum_sq / count as f64;
    if mse == 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(10.0 * (DATA_RANGE * DATA_RANGE / mse).log10())
}

/// Mean structural similarity over all channels.
pub fn ssim(reference: ArrayView3<u8>, test: ArrayView3<u8>) -> Result<f64> {
    check_shapes(&reference, &test)?;
    let (height, width, channels) = reference.dim();
    if height < SSIM_WINDOW || width < SSIM_WINDOW {
        return Err(anyhow::anyhow!(
            "SSIM needs images of at least {SSIM_WINDOW}x{SSIM_WINDOW}, got {height}x{width}"
        ));
    }
    if channels == 0 {
        return Err(anyhow::anyhow!("cannot compute SSIM of an image without channels"));
    }

    let total: f64 = (0..channels)
        .map(|c| {
            channel_ssim(
                reference.index_axis(Axis(2), c),
                test.index_axis(Axis(2), c),
            )
        })
        .sum();
    Ok(total / channels as f64)
}

fn channel_ssim(x: ArrayView2<u8>, y: ArrayView2<u8>) -> f64 {
    let (height, width) = x.dim();
    let x = x.mapv(f64::from);
    let y = y.mapv(f64::from);

    let sum_x = integral(&x);
    let sum_y = integral(&y);
    let sum_xx = integral(&(&x * &x));
    let sum_yy = integral(&(&y * &y));
    let sum_xy = integral(&(&x * &y));

    let n = (SSIM_WINDOW * SSIM_WINDOW) as f64;
    let cov_norm = n / (n - 1.0);
    let c1 = (SSIM_K1 * DATA_RANGE).powi(2);
    let c2 = (SSIM_K2 * DATA_RANGE).powi(2);

    let rows = height - SSIM_WINDOW + 1;
    let cols = width - SSIM_WINDOW + 1;
    let mut total = 0.0;
    for top in 0..rows {
        for left in 0..cols {
            let window = |table: &Array2<f64>| window_sum(table, top, left) / n;
            let ux = window(&sum_x);
            let uy = window(&sum_y);
            let vx = cov_norm * (window(&sum_xx) - ux * ux);
            let vy = cov_norm * (window(&sum_yy) - uy * uy);
            let vxy = cov_norm * (window(&sum_xy) - ux * uy);

            let numerator = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
            let denominator = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += numerator / denominator;
        }
    }
    total / (rows * cols) as f64
}

/// Summed-area table with a leading zero row and column.
fn integral(values: &Array2<f64>) -> Array2<f64> {
    let (height, width) = values.dim();
    let mut table = Array2::<f64>::zeros((height + 1, width + 1));
    for y in 0..height {
        for x in 0..width {
            table[[y + 1, x + 1]] =
                values[[y, x]] + table[[y, x + 1]] + table[[y + 1, x]] - table[[y, x]];
        }
    }
    table
}

fn window_sum(table: &Array2<f64>, top: usize, left: usize) -> f64 {
    let bottom = top + SSIM_WINDOW;
    let right = left + SSIM_WINDOW;
    table[[bottom, right]] - table[[top, right]] - table[[bottom, left]] + table[[top, left]]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(height: usize, width: usize) -> Array3<u8> {
        Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
            ((y * 13 + x * 7 + c * 31) % 256) as u8
        })
    }

    #[test]
    fn identical_images_score_perfectly() {
        let img = gradient(16, 12);
        assert_eq!(psnr(img.view(), img.view()).unwrap(), f64::INFINITY);
        assert!((ssim(img.view(), img.view()).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn psnr_of_constant_offset() {
        let a = Array3::<u8>::from_elem((8, 8, 3), 100);
        let b = Array3::<u8>::from_elem((8, 8, 3), 110);
        let expected = 10.0 * (255.0f64 * 255.0 / 100.0).log10();
        assert!((psnr(a.view(), b.view()).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn ssim_is_negative_for_inverted_structure() {
        let clean = gradient(20, 20);
        let inverted = clean.mapv(|v| 255 - v);
        let score = ssim(clean.view(), inverted.view()).unwrap();
        assert!(score < 0.5, "ssim {score}");
        assert!(score >= -1.0);
    }

    #[test]
    fn mismatched_or_tiny_images_are_rejected() {
        let a = gradient(8, 8);
        let b = gradient(8, 9);
        assert!(psnr(a.view(), b.view()).is_err());
        assert!(ssim(a.view(), b.view()).is_err());
        let tiny = gradient(5, 5);
        assert!(ssim(tiny.view(), tiny.view()).is_err());
    }

    #[test]
    fn u8_conversion_truncates_and_clamps() {
        let values = Array3::from_shape_vec((1, 1, 3), vec![-3.0f32, 12.9, 300.0]).unwrap();
        let bytes: Vec<u8> = to_u8(values.view()).iter().copied().collect();
        assert_eq!(bytes, vec![0, 12, 255]);
    }
}
