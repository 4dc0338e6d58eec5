use pixcache::cli::Args;
use pixcache::config::{CacheSettings, LOG_FILE, PathConfig};
use pixcache::core::{
    CacheStatus, DecodeGaveUp, DecodeParams, ImageCache, ImageCrateDecoder, ItemMetadata,
    ItemSource,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, info, trace, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Extensions the default decoder handles
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "tga", "webp"];

/// Items per metadata message
const METADATA_BATCH: usize = 32;

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| path_config.file(LOG_FILE));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

/// Images directly inside `dir`, sorted by name
fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = Path::new(&glob::Pattern::escape(&dir.to_string_lossy())).join("*");
    let entries = glob::glob(&pattern.to_string_lossy())
        .with_context(|| format!("Invalid folder pattern: {}", pattern.display()))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Read image dimensions off the browsing thread and feed them to the cache
fn spawn_metadata_reader(
    cache: Arc<ImageCache>,
    files: Vec<PathBuf>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("pixcache-metadata".into())
        .spawn(move || {
            let started = Instant::now();
            let mut batch = Vec::with_capacity(METADATA_BATCH);
            let mut read = 0usize;

            for path in files {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                match image::image_dimensions(&path) {
                    Ok((width, height)) => {
                        let meta = ItemMetadata {
                            width,
                            height,
                            params: DecodeParams::default(),
                        };
                        batch.push((path, meta));
                        read += 1;
                    }
                    Err(e) => debug!("No dimensions for {}: {}", path.display(), e),
                }
                if batch.len() >= METADATA_BATCH {
                    cache.update_metadata(std::mem::take(&mut batch));
                }
            }
            cache.update_metadata(batch);
            info!("Metadata read for {} images in {:.2?}", read, started.elapsed());
        })
}

/// Walk the list like a user paging through photos. Bounces at both ends.
fn browse(cache: &ImageCache, files: &[PathBuf], args: &Args) -> (u64, u64) {
    let last = files.len() as i64 - 1;
    let mut key: i64 = 0;
    let mut step = if args.step == 0 { 1 } else { args.step };
    let (mut hits, mut misses) = (0u64, 0u64);

    for _ in 0..args.steps {
        let next = key + step;
        if next < 0 || next > last {
            step = -step;
        }
        key = (key + step).clamp(0, last.max(0));

        cache.navigate(key as usize);
        thread::sleep(Duration::from_millis(args.delay_ms));

        match cache.get(&files[key as usize]) {
            Some(image) => {
                hits += 1;
                trace!("Hit {} ({}x{})", key, image.width(), image.height());
            }
            None => {
                misses += 1;
                debug!("Miss {} {}", key, files[key as usize].display());
            }
        }
    }
    (hits, misses)
}

fn print_summary(status: &CacheStatus, hits: u64, misses: u64) -> Result<()> {
    let total = hits + misses;
    let rate = if total == 0 { 0.0 } else { hits as f64 * 100.0 / total as f64 };
    println!("Displayed: {} images, {} ready ({:.1}%), {} not ready", total, hits, rate, misses);
    println!(
        "Cache: {:.1}/{:.1} MB, {} of {} images decoded, window {:?}..={:?}",
        status.current_mb,
        status.max_mb,
        status.cached_items,
        status.total_items,
        status.target_first,
        status.target_last
    );
    println!(
        "Table lookups: {} hits, {} misses ({:.1}% hit rate)",
        status.hits,
        status.misses,
        status.hit_rate() * 100.0
    );
    println!("{}", serde_json::to_string_pretty(status).context("Failed to serialize status")?);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = path_config.ensure_dir() {
        eprintln!("Warning: {:#}", e);
    }

    init_logging(&args, &path_config)?;
    info!("pixcache {} starting", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let settings_path = path_config.settings_file();
    info!("Config path: {}", settings_path.display());
    let mut settings = CacheSettings::load(&settings_path)?;
    args.apply_to(&mut settings);
    if args.save_config {
        settings.save(&settings_path)?;
        info!("Settings saved to {}", settings_path.display());
    }

    let files = list_images(&args.dir)?;
    if files.is_empty() {
        bail!("No images found in {}", args.dir.display());
    }
    info!("Found {} images in {}", files.len(), args.dir.display());

    let cache = Arc::new(
        ImageCache::new(&settings, Arc::new(ImageCrateDecoder)).context("Failed to start image cache")?,
    );
    cache.events().subscribe::<DecodeGaveUp, _>(|e| {
        eprintln!("Cannot decode {}: {}", e.path.display(), e.error);
    });

    let sources = files
        .iter()
        .enumerate()
        .map(|(i, path)| ItemSource::new(i, path.clone(), None))
        .collect();
    cache.rebuild(sources, 0);

    let stop = Arc::new(AtomicBool::new(false));
    let metadata = spawn_metadata_reader(Arc::clone(&cache), files.clone(), Arc::clone(&stop))
        .context("Failed to start metadata thread")?;

    let (hits, misses) = browse(&cache, &files, &args);

    stop.store(true, Ordering::Relaxed);
    if metadata.join().is_err() {
        warn!("Metadata thread panicked");
    }
    if !cache.wait_idle(Duration::from_secs(30)) {
        warn!("Cache still busy after 30s");
    }

    print_summary(&cache.status(), hits, misses)
}
