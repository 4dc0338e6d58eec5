//! Cache settings and config-dir resolution.
//!
//! Settings live in `pixcache.json`. The directory is resolved:
//! 1. `--config-dir` CLI argument
//! 2. `PIXCACHE_CONFIG_DIR` environment variable
//! 3. Local folder IF a `pixcache.json` or `pixcache.log` exists there
//! 4. Platform config directory from dirs-next
//!
//! Platform paths:
//! - Linux: ~/.config/pixcache/
//! - macOS: ~/Library/Application Support/pixcache/
//! - Windows: %APPDATA%\pixcache\

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::control::Weighting;
use crate::core::dispatcher::{DispatcherConfig, MAX_ATTEMPTS};

pub const SETTINGS_FILE: &str = "pixcache.json";
pub const LOG_FILE: &str = "pixcache.log";
pub const CONFIG_DIR_ENV: &str = "PIXCACHE_CONFIG_DIR";

/// When stale reservations and out-of-window images are swept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrphanSweep {
    /// Every time dispatching settles
    #[default]
    OnSettle,
    /// Once the cache has been quiet for `delay_ms`
    Debounced { delay_ms: u64 },
    Off,
}

/// Cache preferences (persistent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_mb: f64,
    pub min_mb: f64,
    /// Added to the wanted room when comparing against available memory
    pub headroom_mb: f64,
    pub weighting: Weighting,
    pub max_attempts: u32,
    /// 0 = one decoder per logical CPU
    pub workers: usize,
    pub orphan_sweep: OrphanSweep,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_mb: 2048.0,
            min_mb: 256.0,
            headroom_mb: 0.0,
            weighting: Weighting::Even,
            max_attempts: MAX_ATTEMPTS,
            workers: 0,
            orphan_sweep: OrphanSweep::OnSettle,
        }
    }
}

impl CacheSettings {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        let settings: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let text = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write settings: {}", path.display()))?;
        Ok(())
    }

    /// Decoder count with `0` resolved to the CPU count
    pub fn decoder_count(&self) -> usize {
        if self.workers == 0 { num_cpus::get().max(1) } else { self.workers }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_mb: self.max_mb,
            min_mb: self.min_mb,
            weighting: self.weighting,
            max_attempts: self.max_attempts,
            sweep_on_settle: self.orphan_sweep == OrphanSweep::OnSettle,
        }
    }
}

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        if let Some(dir) = &self.config_dir {
            return dir.clone();
        }

        if let Ok(current_dir) = std::env::current_dir() {
            if [SETTINGS_FILE, LOG_FILE].iter().any(|f| current_dir.join(f).exists()) {
                return current_dir;
            }
        }

        if let Some(dir) = dirs_next::config_dir() {
            return dir.join("pixcache");
        }

        PathBuf::from(".")
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.config_dir().join(name)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.file(SETTINGS_FILE)
    }

    /// Create the config directory if missing
    pub fn ensure_dir(&self) -> Result<()> {
        let dir = self.config_dir();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pixcache_cfg_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_file_with_custom_dir() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };
        assert_eq!(config.settings_file(), PathBuf::from("/custom/pixcache.json"));
    }

    #[test]
    fn test_cli_dir_wins() {
        let config = PathConfig::from_env_and_cli(Some(PathBuf::from("/from/cli")));
        assert_eq!(config.config_dir, Some(PathBuf::from("/from/cli")));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = temp_dir("missing");
        let settings = CacheSettings::load(&dir.join(SETTINGS_FILE)).unwrap();
        assert_eq!(settings, CacheSettings::default());
    }

    #[test]
    fn test_save_load() {
        let dir = temp_dir("save");
        let path = dir.join(SETTINGS_FILE);
        let settings = CacheSettings {
            max_mb: 512.0,
            weighting: Weighting::Ahead4,
            orphan_sweep: OrphanSweep::Debounced { delay_ms: 250 },
            ..Default::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(CacheSettings::load(&path).unwrap(), settings);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = temp_dir("partial");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(SETTINGS_FILE);
        std::fs::write(&path, r#"{ "max_mb": 100.0, "workers": 3 }"#).unwrap();

        let settings = CacheSettings::load(&path).unwrap();
        assert_eq!(settings.max_mb, 100.0);
        assert_eq!(settings.decoder_count(), 3);
        assert_eq!(settings.min_mb, 256.0);
        assert_eq!(settings.orphan_sweep, OrphanSweep::OnSettle);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bad_json_is_error() {
        let dir = temp_dir("bad");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(SETTINGS_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(CacheSettings::load(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_dispatcher_config_maps_sweep() {
        let mut settings = CacheSettings::default();
        assert!(settings.dispatcher_config().sweep_on_settle);
        settings.orphan_sweep = OrphanSweep::Off;
        assert!(!settings.dispatcher_config().sweep_on_settle);
    }
}
