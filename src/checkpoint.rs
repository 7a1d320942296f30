use anyhow::{Context, Result};
use burn::prelude::*;
use burn::record::CompactRecorder;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::{Discriminator, Generator, ModelConfig};

/// Extension `CompactRecorder` appends to checkpoint paths.
pub const CHECKPOINT_EXTENSION: &str = "mpk";

const GENERATOR_PREFIX: &str = "generator_";
const DISCRIMINATOR_PREFIX: &str = "discriminator_";

/// Generator checkpoint stem: `generator_{epoch}_{loss}`.
pub fn generator_name(epoch: usize, loss: i64) -> String {
    format!("{GENERATOR_PREFIX}{epoch}_{loss}")
}

/// Critic checkpoint stem: `discriminator_{epoch}`.
pub fn discriminator_name(epoch: usize) -> String {
    format!("{DISCRIMINATOR_PREFIX}{epoch}")
}

/// Epoch encoded in a generator checkpoint file name.
pub fn generator_epoch(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_string_lossy();
    let rest = stem.strip_prefix(GENERATOR_PREFIX)?;
    let (epoch, loss) = rest.split_once('_')?;
    loss.parse::<i64>().ok()?;
    epoch.parse().ok()
}

/// A generator checkpoint found on disk, with the path `CompactRecorder` expects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratorCheckpoint {
    pub epoch: usize,
    pub path: PathBuf,
}

/// The generator checkpoint with the greatest epoch in `dir`.
///
/// Ties between files of the same epoch go to the greatest file name.
pub fn latest_generator(dir: &Path) -> Result<Option<GeneratorCheckpoint>> {
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("failed to list {}", dir.display()))?
            .path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != CHECKPOINT_EXTENSION) {
            continue;
        }
        let Some(epoch) = generator_epoch(&path) else {
            continue;
        };
        let update = match &best {
            Some((best_epoch, best_path)) => (epoch, &path) > (*best_epoch, best_path),
            None => true,
        };
        if update {
            best = Some((epoch, path));
        }
    }

    Ok(best.map(|(epoch, path)| GeneratorCheckpoint {
        epoch,
        path: path.with_extension(""),
    }))
}

/// Resolve a generator checkpoint from a file path or a model directory.
pub fn resolve_generator(path: &Path) -> Result<PathBuf> {
    if path.is_dir() {
        return latest_generator(path)?
            .map(|checkpoint| checkpoint.path)
            .ok_or_else(|| {
                anyhow::anyhow!("no generator checkpoints found in {}", path.display())
            });
    }

    let stem = if path.extension().map_or(false, |ext| ext == CHECKPOINT_EXTENSION) {
        path.with_extension("")
    } else {
        path.to_path_buf()
    };
    if !stem.with_extension(CHECKPOINT_EXTENSION).is_file() {
        return Err(anyhow::anyhow!(
            "generator checkpoint not found: {}",
            path.display()
        ));
    }
    Ok(stem)
}

/// Save both networks for `epoch`, returning the generator and critic paths.
pub fn save_checkpoint<B: Backend>(
    dir: &Path,
    epoch: usize,
    loss: i64,
    generator: &Generator<B>,
    discriminator: &Discriminator<B>,
) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let recorder = CompactRecorder::new();

    let generator_path = dir.join(generator_name(epoch, loss));
    generator
        .clone()
        .save_file(generator_path.clone(), &recorder)
        .with_context(|| format!("failed to save {}", generator_path.display()))?;

    let discriminator_path = dir.join(discriminator_name(epoch));
    discriminator
        .clone()
        .save_file(discriminator_path.clone(), &recorder)
        .with_context(|| format!("failed to save {}", discriminator_path.display()))?;

    Ok((generator_path, discriminator_path))
}

pub fn load_generator<B: Backend>(
    config: &ModelConfig,
    path: &Path,
    device: &B::Device,
) -> Result<Generator<B>> {
    config
        .init_generator::<B>(device)
        .load_file(path.to_path_buf(), &CompactRecorder::new(), device)
        .with_context(|| format!("failed to load generator from {}", path.display()))
}

pub fn load_discriminator<B: Backend>(
    config: &ModelConfig,
    path: &Path,
    device: &B::Device,
) -> Result<Discriminator<B>> {
    config
        .init_discriminator::<B>(device)?
        .load_file(path.to_path_buf(), &CompactRecorder::new(), device)
        .with_context(|| format!("failed to load discriminator from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::small_config;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn names_encode_epoch_and_loss() {
        assert_eq!(generator_name(3, 33), "generator_3_33");
        assert_eq!(discriminator_name(49), "discriminator_49");
        assert_eq!(generator_epoch(Path::new("m/generator_12_-4.mpk")), Some(12));
        assert_eq!(generator_epoch(Path::new("m/generator.mpk")), None);
        assert_eq!(generator_epoch(Path::new("m/discriminator_12.mpk")), None);
    }

    #[test]
    fn latest_generator_uses_numeric_epoch() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "generator_9_40.mpk");
        touch(dir.path(), "generator_10_35.mpk");
        touch(dir.path(), "generator_2_90.mpk");
        touch(dir.path(), "discriminator_11.mpk");
        touch(dir.path(), "generator_11_20.json");

        let latest = latest_generator(dir.path()).unwrap().unwrap();
        assert_eq!(latest.epoch, 10);
        assert_eq!(latest.path, dir.path().join("generator_10_35"));
        assert_eq!(resolve_generator(dir.path()).unwrap(), latest.path);
    }

    #[test]
    fn explicit_paths_are_used_as_given() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "generator_1_5.mpk");
        touch(dir.path(), "generator_7_5.mpk");

        let file = dir.path().join("generator_1_5.mpk");
        assert_eq!(resolve_generator(&file).unwrap(), dir.path().join("generator_1_5"));
        assert_eq!(
            resolve_generator(&dir.path().join("generator_1_5")).unwrap(),
            dir.path().join("generator_1_5")
        );
        assert!(resolve_generator(&dir.path().join("generator_3_5")).is_err());

        let empty = tempfile::tempdir().unwrap();
        assert!(resolve_generator(empty.path()).is_err());
    }

    #[test]
    fn checkpoints_round_trip_through_the_recorder() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let config = small_config();
        let generator = config.init_generator::<TestBackend>(&device);
        let discriminator = config.init_discriminator::<TestBackend>(&device).unwrap();

        let (generator_path, discriminator_path) =
            save_checkpoint(dir.path(), 4, 17, &generator, &discriminator).unwrap();
        assert!(dir.path().join("generator_4_17.mpk").is_file());
        assert!(dir.path().join("discriminator_4.mpk").is_file());

        let input = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let restored = load_generator::<TestBackend>(&config, &generator_path, &device).unwrap();
        let expected = generator.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = restored.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        for (a, b) in expected.iter().zip(&actual) {
            assert!((a - b).abs() < 5e-2);
        }

        let critic = load_discriminator::<TestBackend>(&config, &discriminator_path, &device).unwrap();
        assert_eq!(critic.forward(input).dims(), [1, 1]);
    }
}
