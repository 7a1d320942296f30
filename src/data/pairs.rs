use anyhow::{Context, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_pickle::{DeOptions, SerOptions};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::DataConfig;

/// One clear image and the hazy variants rendered from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub clear: PathBuf,
    pub haze: Vec<PathBuf>,
}

/// Cache file contents: the pairs plus a digest of the listings they came from.
#[derive(Debug, Serialize, Deserialize)]
struct PairCache {
    digest: String,
    pairs: Vec<Pair>,
}

/// Builds the clear -> haze mapping and persists it to a pickle cache.
#[derive(Clone, Debug)]
pub struct PairIndex {
    clear_dir: PathBuf,
    haze_dir: PathBuf,
    cache_path: PathBuf,
    verify_cache: bool,
}

impl PairIndex {
    pub fn new(
        clear_dir: impl Into<PathBuf>,
        haze_dir: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            clear_dir: clear_dir.into(),
            haze_dir: haze_dir.into(),
            cache_path: cache_path.into(),
            verify_cache: true,
        }
    }

    pub fn from_config(config: &DataConfig) -> Self {
        Self::new(&config.clear_dir, &config.haze_dir, &config.cache_path)
            .with_verify_cache(config.verify_cache)
    }

    /// When disabled, an existing cache is served without looking at the directories.
    pub fn with_verify_cache(mut self, verify_cache: bool) -> Self {
        self.verify_cache = verify_cache;
        self
    }

    /// Load the cached pairs, or scan both directories and write a fresh cache.
    pub fn build(&self) -> Result<Vec<Pair>> {
        if self.cache_path.exists() {
            let cache = self.read_cache()?;
            if !self.verify_cache {
                return Ok(cache.pairs);
            }
            let digest = self.listing_digest()?;
            if digest == cache.digest {
                return Ok(cache.pairs);
            }
            warn!(
                "pair cache {} is stale, rebuilding",
                self.cache_path.display()
            );
        }

        let cache = PairCache {
            digest: self.listing_digest()?,
            pairs: self.scan()?,
        };
        self.write_cache(&cache)?;
        Ok(cache.pairs)
    }

    fn scan(&self) -> Result<Vec<Pair>> {
        let clear_files = list_files(&self.clear_dir)?;
        ensure_dir(&self.haze_dir)?;
        let haze_root = Pattern::escape(&self.haze_dir.to_string_lossy());

        let mut pairs = Vec::with_capacity(clear_files.len());
        for clear in clear_files {
            let stem = clear
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let pattern = format!("{haze_root}/{}*", Pattern::escape(&stem));
            let mut haze: Vec<PathBuf> = glob::glob(&pattern)
                .with_context(|| format!("invalid haze pattern {pattern}"))?
                .filter_map(Result::ok)
                .filter(|path| path.is_file())
                .collect();
            haze.sort();
            pairs.push(Pair { clear, haze });
        }

        info!(
            "indexed {} clear images with {} haze variants",
            pairs.len(),
            pairs.iter().map(|pair| pair.haze.len()).sum::<usize>()
        );
        Ok(pairs)
    }

    /// Read the cache, accepting a bare list of pairs written without a digest.
    fn read_cache(&self) -> Result<PairCache> {
        let bytes = fs::read(&self.cache_path)
            .with_context(|| format!("failed to open {}", self.cache_path.display()))?;
        if let Ok(cache) = serde_pickle::from_slice::<PairCache>(&bytes, DeOptions::default()) {
            return Ok(cache);
        }
        let pairs: Vec<Pair> = serde_pickle::from_slice(&bytes, DeOptions::default())
            .with_context(|| format!("failed to decode {}", self.cache_path.display()))?;
        Ok(PairCache {
            digest: String::new(),
            pairs,
        })
    }

    fn write_cache(&self, cache: &PairCache) -> Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = File::create(&self.cache_path)
            .with_context(|| format!("failed to create {}", self.cache_path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_pickle::to_writer(&mut writer, cache, SerOptions::default())
            .with_context(|| format!("failed to write {}", self.cache_path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.cache_path.display()))
    }

    /// SHA-256 over file names and sizes in both directories.
    fn listing_digest(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for dir in [&self.clear_dir, &self.haze_dir] {
            ensure_dir(dir)?;
            let mut entries = fs::read_dir(dir)
                .with_context(|| format!("failed to read {}", dir.display()))?
                .map(|entry| {
                    let entry = entry?;
                    Ok((entry.file_name(), entry.metadata()?.len()))
                })
                .collect::<std::io::Result<Vec<_>>>()
                .with_context(|| format!("failed to list {}", dir.display()))?;
            entries.sort();
            for (name, len) in entries {
                hasher.update(name.to_string_lossy().as_bytes());
                hasher.update(len.to_le_bytes());
            }
            hasher.update([0u8]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Build (or load) the pair list with cache verification enabled.
pub fn build_pairs(
    clear_dir: impl Into<PathBuf>,
    haze_dir: impl Into<PathBuf>,
    cache_path: impl Into<PathBuf>,
) -> Result<Vec<Pair>> {
    PairIndex::new(clear_dir, haze_dir, cache_path).build()
}

fn ensure_dir(dir: &Path) -> Result<()> {
    let meta = fs::metadata(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    if !meta.is_dir() {
        return Err(anyhow::anyhow!("{} is not a directory", dir.display()));
    }
    Ok(())
}

/// Files with an extension directly under `dir`, sorted by name.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("failed to list {}", dir.display()))?
            .path();
        if path.is_file() && path.extension().is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::write_dataset;

    #[test]
    fn haze_variants_share_the_clear_stem() {
        let dir = tempfile::tempdir().unwrap();
        let (clear_dir, haze_dir) = write_dataset(dir.path(), 10, 2, 4, 4);
        let cache = dir.path().join("cache").join("data_paris.pkl");

        let pairs = build_pairs(&clear_dir, &haze_dir, &cache).unwrap();
        assert_eq!(pairs.len(), 10);
        assert!(cache.exists());
        for pair in &pairs {
            assert_eq!(pair.haze.len(), 2);
            let stem = pair.clear.file_stem().unwrap().to_string_lossy().into_owned();
            for haze in &pair.haze {
                assert!(haze.file_name().unwrap().to_string_lossy().starts_with(&stem));
            }
        }
        assert!(pairs[0].clear.ends_with("img00.npy"));
        assert!(pairs[9].clear.ends_with("img09.npy"));
    }

    #[test]
    fn cached_pairs_are_returned_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let (clear_dir, haze_dir) = write_dataset(dir.path(), 3, 2, 4, 4);
        let cache = dir.path().join("data_paris.pkl");

        let first = build_pairs(&clear_dir, &haze_dir, &cache).unwrap();
        let bytes = fs::read(&cache).unwrap();
        let second = build_pairs(&clear_dir, &haze_dir, &cache).unwrap();
        assert_eq!(first, second);
        assert_eq!(bytes, fs::read(&cache).unwrap());
    }

    #[test]
    fn stale_cache_is_rebuilt_unless_verification_is_off() {
        let dir = tempfile::tempdir().unwrap();
        let (clear_dir, haze_dir) = write_dataset(dir.path(), 2, 1, 4, 4);
        let cache = dir.path().join("data_paris.pkl");
        assert_eq!(build_pairs(&clear_dir, &haze_dir, &cache).unwrap()[0].haze.len(), 1);

        fs::copy(haze_dir.join("img00_0.npy"), haze_dir.join("img00_9.npy")).unwrap();

        let legacy = PairIndex::new(&clear_dir, &haze_dir, &cache)
            .with_verify_cache(false)
            .build()
            .unwrap();
        assert_eq!(legacy[0].haze.len(), 1);

        let fresh = build_pairs(&clear_dir, &haze_dir, &cache).unwrap();
        assert_eq!(fresh[0].haze.len(), 2);
    }

    #[test]
    fn list_shaped_cache_is_read_and_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let (clear_dir, haze_dir) = write_dataset(dir.path(), 2, 1, 4, 4);
        let cache = dir.path().join("data_paris.pkl");
        let listed = vec![Pair {
            clear: clear_dir.join("img01.npy"),
            haze: vec![haze_dir.join("img01_0.npy")],
        }];
        let file = File::create(&cache).unwrap();
        serde_pickle::to_writer(&mut BufWriter::new(file), &listed, SerOptions::default()).unwrap();

        let legacy = PairIndex::new(&clear_dir, &haze_dir, &cache)
            .with_verify_cache(false)
            .build()
            .unwrap();
        assert_eq!(legacy, listed);

        let fresh = build_pairs(&clear_dir, &haze_dir, &cache).unwrap();
        assert_eq!(fresh.len(), 2);
        assert_eq!(build_pairs(&clear_dir, &haze_dir, &cache).unwrap(), fresh);
    }

    #[test]
    fn empty_clear_directory_gives_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (clear_dir, haze_dir) = write_dataset(dir.path(), 0, 0, 4, 4);
        let cache = dir.path().join("data_paris.pkl");

        let pairs = build_pairs(&clear_dir, &haze_dir, &cache).unwrap();
        assert!(pairs.is_empty());
        assert!(cache.exists());
        assert!(build_pairs(&clear_dir, &haze_dir, &cache).unwrap().is_empty());
    }

    #[test]
    fn missing_directories_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("data_paris.pkl");
        let missing = dir.path().join("missing");
        assert!(build_pairs(&missing, &missing, &cache).is_err());
        assert!(!cache.exists());
    }
}
