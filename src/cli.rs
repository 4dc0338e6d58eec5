use clap::Parser;
use std::path::PathBuf;

use crate::config::CacheSettings;
use crate::core::control::Weighting;

// Build version with decoder info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Decoders: image 0.25 (png, jpeg, tiff, tga, webp)\n",
    "Target:   ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Browse a folder of images through the look-ahead cache and report hit rates
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Folder with images (JPEG, PNG, TIFF, TGA, WebP)
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,

    /// Cache budget in MB (overrides config file)
    #[arg(short = 'm', long = "mem", value_name = "MB")]
    pub max_mb: Option<f64>,

    /// Lower bound the budget never shrinks below, in MB
    #[arg(long = "min-mem", value_name = "MB")]
    pub min_mb: Option<f64>,

    /// Decoder threads (0 = one per CPU)
    #[arg(short = 'w', long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Ahead:behind weighting (1:1, 2:1, 3:1, 4:1, 9:1, 100:1)
    #[arg(short = 'W', long = "weighting", value_name = "A:B")]
    pub weighting: Option<Weighting>,

    /// Items moved per navigation step (negative = start walking backward)
    #[arg(short = 's', long = "step", value_name = "N", default_value_t = 1, allow_hyphen_values = true)]
    pub step: i64,

    /// Pause between navigation steps
    #[arg(short = 'd', long = "delay-ms", value_name = "MS", default_value_t = 50)]
    pub delay_ms: u64,

    /// Number of navigation steps to simulate
    #[arg(short = 'n', long = "steps", value_name = "N", default_value_t = 200)]
    pub steps: usize,

    /// Write the effective settings back to the config file
    #[arg(long = "save-config")]
    pub save_config: bool,

    /// Enable logging to file (default: pixcache.log in the config dir)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

impl Args {
    /// Apply command-line overrides on top of loaded settings
    pub fn apply_to(&self, settings: &mut CacheSettings) {
        if let Some(max_mb) = self.max_mb {
            settings.max_mb = max_mb;
        }
        if let Some(min_mb) = self.min_mb {
            settings.min_mb = min_mb;
        }
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
        if let Some(weighting) = self.weighting {
            settings.weighting = weighting;
        }
    }
}
