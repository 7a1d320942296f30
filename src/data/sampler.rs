use anyhow::{Context, Result};
use ndarray::Axis;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use std::ops::Range;
use std::sync::Arc;

use super::{load_image_array, Batch, Pair, SplitMode, SplitRanges};

/// Endless shuffled batches over one split of the pair list.
///
/// Every cycle draws a fresh permutation of the split. When the split holds at
/// least `batch_size` pairs it yields `count / batch_size` disjoint batches and
/// drops the remainder; otherwise it yields one partially filled batch. The
/// iterator never ends, so the consumer decides how many batches to pull.
pub struct SplitSampler {
    pairs: Arc<Vec<Pair>>,
    range: Range<usize>,
    mode: SplitMode,
    batch_size: usize,
    height: usize,
    width: usize,
    rng: StdRng,
    permutation: Vec<usize>,
    cursor: usize,
}

impl SplitSampler {
    pub fn new(
        pairs: Arc<Vec<Pair>>,
        ranges: &SplitRanges,
        mode: SplitMode,
        batch_size: usize,
        image_shape: [usize; 2],
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(anyhow::anyhow!("batch_size must be positive"));
        }
        let range = ranges.range(mode);
        if range.end > pairs.len() {
            return Err(anyhow::anyhow!(
                "{mode} range {range:?} exceeds {} pairs",
                pairs.len()
            ));
        }
        let [height, width] = image_shape;
        Ok(Self {
            pairs,
            permutation: range.clone().collect(),
            range,
            mode,
            batch_size,
            height,
            width,
            rng: StdRng::seed_from_u64(seed),
            cursor: 0,
        })
    }

    /// Same as [`SplitSampler::new`] with the mode given by name.
    pub fn for_mode(
        pairs: Arc<Vec<Pair>>,
        ranges: &SplitRanges,
        mode: &str,
        batch_size: usize,
        image_shape: [usize; 2],
        seed: u64,
    ) -> Result<Self> {
        let mode = mode.parse()?;
        Self::new(pairs, ranges, mode, batch_size, image_shape, seed)
    }

    pub fn mode(&self) -> SplitMode {
        self.mode
    }

    /// Number of pairs in this split.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn batches_per_cycle(&self) -> usize {
        (self.len() / self.batch_size).max(1)
    }

    fn next_batch(&mut self) -> Result<Batch> {
        if self.cursor == 0 {
            self.permutation.shuffle(&mut self.rng);
        }
        let rows = if self.len() < self.batch_size {
            0..self.len()
        } else {
            self.cursor * self.batch_size..(self.cursor + 1) * self.batch_size
        };
        self.cursor = (self.cursor + 1) % self.batches_per_cycle();

        let mut batch = Batch::zeros(self.batch_size, self.height, self.width);
        for (row, &index) in self.permutation[rows].iter().enumerate() {
            let pair = &self.pairs[index];
            let haze = pair.haze.choose(&mut self.rng).ok_or_else(|| {
                anyhow::anyhow!("{} has no haze variants", pair.clear.display())
            })?;
            let hazy = load_image_array(haze, self.height, self.width)?;
            let clear = load_image_array(&pair.clear, self.height, self.width)
                .with_context(|| format!("failed to load clear image for pair {index}"))?;
            batch.hazy.index_axis_mut(Axis(0), row).assign(&hazy);
            batch.clear.index_axis_mut(Axis(0), row).assign(&clear);
            batch.indices.push(index);
            batch.filled += 1;
        }
        Ok(batch)
    }
}

impl Iterator for SplitSampler {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}
