//! Viewer configuration
//!
//! Loaded from `<config dir>/folio/config.toml` when present, then overridden
//! by `FOLIO_*` environment variables.

use folio_cache::{env_override, CacheConfig, ConfigError};
use folio_scheduler::{
    default_worker_count, ViewportTrackerConfig, WorkerPoolConfig, MAX_WORKERS, MIN_WORKERS,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Worker threads; unset means available parallelism clamped to 2..=8
    pub workers: Option<usize>,
    /// Render attempts per key before the failure is persistent
    pub max_render_attempts: u32,
    /// Pages prefetched either side of the settled center page
    pub prefetch_radius: u32,
    pub initial_scale: f32,
    /// Zoom requests above this are clamped to it
    pub max_scale: f32,
    pub load_timeout_ms: u64,
    pub settle_window_ms: u64,
    /// Scroll movement below this counts as still, for navigation completion
    pub navigation_epsilon: f32,
    pub cache: CacheConfig,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_render_attempts: 2,
            prefetch_radius: 2,
            initial_scale: 1.0,
            max_scale: 16.0,
            load_timeout_ms: 10_000,
            settle_window_ms: 100,
            navigation_epsilon: 1.0,
            cache: CacheConfig::default(),
        }
    }
}

impl ViewerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_initial_scale(mut self, scale: f32) -> Self {
        self.initial_scale = scale;
        self
    }

    pub fn with_max_scale(mut self, scale: f32) -> Self {
        self.max_scale = scale;
        self
    }

    pub fn with_prefetch_radius(mut self, radius: u32) -> Self {
        self.prefetch_radius = radius;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// `<config dir>/folio/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("folio").join("config.toml"))
    }

    /// Default file (if it exists), then environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let base = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        base.apply_env()
    }

    /// Environment variables:
    /// - `FOLIO_WORKERS`: worker thread count
    /// - `FOLIO_PREFETCH_RADIUS`: prefetch radius in pages
    /// - `FOLIO_SETTLE_MS`: settle window in milliseconds
    /// - `FOLIO_CACHE_HOT` / `FOLIO_CACHE_WARM` / `FOLIO_CACHE_COLD`: tier capacities
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(workers) = env_override("FOLIO_WORKERS")? {
            self.workers = Some(workers);
        }
        if let Some(radius) = env_override("FOLIO_PREFETCH_RADIUS")? {
            self.prefetch_radius = radius;
        }
        if let Some(ms) = env_override("FOLIO_SETTLE_MS")? {
            self.settle_window_ms = ms;
        }
        self.cache = self.cache.apply_env()?;
        Ok(self)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(workers) = self.workers {
            if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
                return Err(ConfigError::Invalid(format!(
                    "workers must be between {MIN_WORKERS} and {MAX_WORKERS}, got {workers}"
                )));
            }
        }
        if self.max_render_attempts == 0 {
            return Err(ConfigError::Invalid("max_render_attempts must be at least 1".to_owned()));
        }
        if !self.initial_scale.is_finite() || self.initial_scale <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "initial_scale must be positive, got {}",
                self.initial_scale
            )));
        }
        if !self.max_scale.is_finite() || self.max_scale < self.initial_scale {
            return Err(ConfigError::Invalid(format!(
                "max_scale must be at least initial_scale ({}), got {}",
                self.initial_scale, self.max_scale
            )));
        }
        if !self.navigation_epsilon.is_finite() || self.navigation_epsilon < 0.0 {
            return Err(ConfigError::Invalid("navigation_epsilon must be >= 0".to_owned()));
        }
        self.cache.validate()
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.workers.unwrap_or_else(default_worker_count))
    }

    pub fn tracker_config(&self) -> ViewportTrackerConfig {
        ViewportTrackerConfig {
            settle_window: Duration::from_millis(self.settle_window_ms),
            navigation_epsilon: self.navigation_epsilon,
            near_radius: self.prefetch_radius,
            ..ViewportTrackerConfig::default()
        }
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}
