use anyhow::{Context, Result};
use burn::config::Config;
use clap::Parser;
use dehaze_burn::data::{PairIndex, SplitRanges};
use dehaze_burn::training::TrainingConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Build or refresh the clear/haze pair cache")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Rebuild even if the cache file exists.
    #[arg(long, default_value_t = false)]
    rebuild: bool,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    let data = config.data;

    if args.rebuild {
        let cache = PathBuf::from(&data.cache_path);
        if cache.exists() {
            std::fs::remove_file(&cache)
                .with_context(|| format!("failed to remove {}", cache.display()))?;
        }
    }

    let pairs = PairIndex::from_config(&data).build()?;
    let haze_total: usize = pairs.iter().map(|pair| pair.haze.len()).sum();
    let ranges = SplitRanges::from_config(pairs.len(), &data)?;

    println!("{} pairs, {} hazy images -> {}", pairs.len(), haze_total, data.cache_path);
    println!(
        "train {:?}, validation {:?}, test {:?}",
        ranges.train, ranges.validation, ranges.test
    );
    Ok(())
}
