pub mod pairs;
pub mod sampler;

use anyhow::{Context, Result};
use burn::prelude::*;
use ndarray::{Array3, Array4};
use ndarray_npy::{read_npy, ReadNpyError};
use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

pub use pairs::{build_pairs, Pair, PairIndex};
pub use sampler::SplitSampler;

/// Dataset locations and split fractions, nested in `config.json`.
#[derive(Config, Debug)]
pub struct DataConfig {
    pub clear_dir: String,
    pub haze_dir: String,
    pub cache_path: String,
    #[config(default = 0.9)]
    pub train_fraction: f64,
    #[config(default = 0.05)]
    pub validation_fraction: f64,
    /// Rebuild the pair cache when the source directories changed.
    #[config(default = true)]
    pub verify_cache: bool,
}

/// Which contiguous range of the pair list a sampler draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitMode {
    Train,
    Validation,
    Test,
}

impl FromStr for SplitMode {
    type Err = anyhow::Error;

    fn from_str(mode: &str) -> Result<Self> {
        match mode {
            "train" => Ok(Self::Train),
            "validation" => Ok(Self::Validation),
            "test" => Ok(Self::Test),
            other => Err(anyhow::anyhow!(
                "invalid split mode {other:?}, expected train | validation | test"
            )),
        }
    }
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Test => "test",
        };
        f.write_str(name)
    }
}

/// Train / validation / test index ranges over the pair list, in discovery order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitRanges {
    pub train: Range<usize>,
    pub validation: Range<usize>,
    pub test: Range<usize>,
}

impl SplitRanges {
    /// Truncate `total * fraction` for train and validation; test takes the rest.
    pub fn new(total: usize, train_fraction: f64, validation_fraction: f64) -> Result<Self> {
        let valid = |f: f64| (0.0..=1.0).contains(&f);
        if !valid(train_fraction)
            || !valid(validation_fraction)
            || train_fraction + validation_fraction > 1.0
        {
            return Err(anyhow::anyhow!(
                "invalid split fractions train={train_fraction} validation={validation_fraction}"
            ));
        }
        let train_end = (total as f64 * train_fraction) as usize;
        let validation_len = (total as f64 * validation_fraction) as usize;
        let validation_end = (train_end + validation_len).min(total);
        Ok(Self {
            train: 0..train_end,
            validation: train_end..validation_end,
            test: validation_end..total,
        })
    }

    pub fn from_config(total: usize, config: &DataConfig) -> Result<Self> {
        Self::new(total, config.train_fraction, config.validation_fraction)
    }

    pub fn range(&self, mode: SplitMode) -> Range<usize> {
        match mode {
            SplitMode::Train => self.train.clone(),
            SplitMode::Validation => self.validation.clone(),
            SplitMode::Test => self.test.clone(),
        }
    }
}

/// Paired hazy/clear images as raw NHWC intensities in [0, 255].
#[derive(Clone, Debug)]
pub struct Batch {
    pub hazy: Array4<f32>,
    pub clear: Array4<f32>,
    /// Rows holding real data; the rest are zero when the split is too small.
    pub filled: usize,
    /// Pair indices used for each filled row.
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn zeros(batch_size: usize, height: usize, width: usize) -> Self {
        Self {
            hazy: Array4::zeros((batch_size, height, width, 3)),
            clear: Array4::zeros((batch_size, height, width, 3)),
            filled: 0,
            indices: Vec::with_capacity(batch_size),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.hazy.dim().0
    }
}

/// Load an HWC image array stored as `.npy` (f32, f64 or u8 elements).
pub fn load_array(path: &Path) -> Result<Array3<f32>> {
    match read_npy::<_, Array3<f32>>(path) {
        Ok(array) => return Ok(array),
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
    match read_npy::<_, Array3<f64>>(path) {
        Ok(array) => return Ok(array.mapv(|v| v as f32)),
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
    let array = read_npy::<_, Array3<u8>>(path)
        .with_context(|| format!("unsupported array type in {}", path.display()))?;
    Ok(array.mapv(f32::from))
}

/// Load an array and check it matches the expected `[height, width, 3]` shape.
pub fn load_image_array(path: &Path, height: usize, width: usize) -> Result<Array3<f32>> {
    let array = load_array(path)?;
    if array.dim() != (height, width, 3) {
        return Err(anyhow::anyhow!(
            "{} has shape {:?}, expected ({height}, {width}, 3)",
            path.display(),
            array.dim()
        ));
    }
    Ok(array)
}
