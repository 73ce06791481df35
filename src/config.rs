use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::{BUCKET_BOUND_MAX, BUCKET_BOUND_MIN};

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults — the config file is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Summary buckets per channel. Clamped to [2048, 4092] at use sites.
    pub num_samples: usize,
    /// Skip tracks longer than this many minutes. -1 scans every track.
    pub max_track_minutes: i64,
    /// Look summaries up in, and persist them to, the disk cache.
    pub cache_enabled: bool,
    /// Custom cache directory (overrides XDG default).
    pub cache_dir: Option<PathBuf>,
    /// Number of parallel workers for batch precompute. 0 = auto-detect
    /// (cores / 2, min 1).
    pub workers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            num_samples: BUCKET_BOUND_MIN,
            max_track_minutes: 180,
            cache_enabled: true,
            cache_dir: None,
            workers: 0,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/seekwave/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// The per-channel bucket bound, clamped to the supported range.
    pub fn bucket_bound(&self) -> usize {
        self.num_samples.clamp(BUCKET_BOUND_MIN, BUCKET_BOUND_MAX)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Resolve the cache directory: config override > XDG default.
    pub fn resolve_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default cache directory using the XDG cache home.
pub fn default_cache_dir() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        dirs.cache_dir().to_path_buf()
    } else {
        // Fallback: hidden directory under the working directory
        PathBuf::from(".seekwave-cache")
    }
}
