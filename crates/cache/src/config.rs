//! Cache configuration for tier radii and tier capacities.
//!
//! Configuration can be loaded from a TOML file, environment variables,
//! or created programmatically.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

/// Tier layout of the raster cache.
///
/// Capacities are counted in page-equivalents: one full-page bitmap, or all
/// tiles of one page at one scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Page slots allowed in the Hot tier
    pub hot_capacity: usize,
    /// Page slots allowed in the Warm tier
    pub warm_capacity: usize,
    /// Page slots allowed in the Cold tier before LRU destruction
    pub cold_capacity: usize,
    /// Pages within this distance of the center page are Hot
    pub hot_radius: u32,
    /// Pages within this distance of the center page (and not Hot) are Warm
    pub warm_radius: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 5,
            warm_capacity: 15,
            cold_capacity: 30,
            hot_radius: 2,
            warm_radius: 5,
        }
    }
}

impl CacheConfig {
    /// Sets the Hot tier capacity.
    pub fn with_hot_capacity(mut self, slots: usize) -> Self {
        self.hot_capacity = slots;
        self
    }

    /// Sets the Warm tier capacity.
    pub fn with_warm_capacity(mut self, slots: usize) -> Self {
        self.warm_capacity = slots;
        self
    }

    /// Sets the Cold tier capacity.
    pub fn with_cold_capacity(mut self, slots: usize) -> Self {
        self.cold_capacity = slots;
        self
    }

    /// Sets the Hot and Warm radii.
    pub fn with_radii(mut self, hot: u32, warm: u32) -> Self {
        self.hot_radius = hot;
        self.warm_radius = warm;
        self
    }

    /// Applies environment overrides on top of `self`.
    ///
    /// Environment variables:
    /// - `FOLIO_CACHE_HOT`: Hot tier capacity
    /// - `FOLIO_CACHE_WARM`: Warm tier capacity
    /// - `FOLIO_CACHE_COLD`: Cold tier capacity
    ///
    /// # Errors
    /// Returns an error if any variable does not parse.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(value) = env_override("FOLIO_CACHE_HOT")? {
            self.hot_capacity = value;
        }
        if let Some(value) = env_override("FOLIO_CACHE_WARM")? {
            self.warm_capacity = value;
        }
        if let Some(value) = env_override("FOLIO_CACHE_COLD")? {
            self.cold_capacity = value;
        }
        Ok(self)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// hot_capacity = 5
    /// warm_capacity = 15
    /// cold_capacity = 30
    /// hot_radius = 2
    /// warm_radius = 5
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string. Missing keys keep defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serializes configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Saves configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Checks that the tier layout can hold every page its radius covers.
    ///
    /// With these bounds met, capacity pressure never pushes a near page into
    /// a colder tier than a farther one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warm_radius < self.hot_radius {
            return Err(ConfigError::Invalid(format!(
                "warm_radius ({}) must be >= hot_radius ({})",
                self.warm_radius, self.hot_radius
            )));
        }

        let hot_span = 2 * self.hot_radius as usize + 1;
        if self.hot_capacity < hot_span {
            return Err(ConfigError::Invalid(format!(
                "hot_capacity ({}) must cover the {} pages within hot_radius",
                self.hot_capacity, hot_span
            )));
        }

        let warm_span = 2 * (self.warm_radius - self.hot_radius) as usize;
        if self.warm_capacity < warm_span.max(1) {
            return Err(ConfigError::Invalid(format!(
                "warm_capacity ({}) must cover the {} pages between hot_radius and warm_radius",
                self.warm_capacity,
                warm_span.max(1)
            )));
        }

        if self.cold_capacity == 0 {
            return Err(ConfigError::Invalid("cold_capacity must be at least 1".to_owned()));
        }

        Ok(())
    }
}

/// Reads and parses one environment variable, `None` if unset.
pub fn env_override<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key: key.to_owned(), value }),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.hot_capacity, 5);
        assert_eq!(config.warm_capacity, 15);
        assert_eq!(config.cold_capacity, 30);
        assert_eq!(config.hot_radius, 2);
        assert_eq!(config.warm_radius, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::default()
            .with_hot_capacity(7)
            .with_warm_capacity(20)
            .with_cold_capacity(40)
            .with_radii(3, 6);

        assert_eq!(config.hot_capacity, 7);
        assert_eq!(config.warm_capacity, 20);
        assert_eq!(config.cold_capacity, 40);
        assert_eq!((config.hot_radius, config.warm_radius), (3, 6));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_undersized_hot_tier() {
        let config = CacheConfig::default().with_hot_capacity(4);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_radii() {
        let config = CacheConfig::default().with_radii(5, 2);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_cold_tier() {
        let config = CacheConfig::default().with_cold_capacity(0);
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&["FOLIO_CACHE_HOT", "FOLIO_CACHE_WARM", "FOLIO_CACHE_COLD"]);

        env::set_var("FOLIO_CACHE_HOT", "9");
        env::set_var("FOLIO_CACHE_WARM", "18");
        env::remove_var("FOLIO_CACHE_COLD");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.hot_capacity, 9);
        assert_eq!(config.warm_capacity, 18);
        assert_eq!(config.cold_capacity, 30); // default
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&["FOLIO_CACHE_HOT"]);

        env::set_var("FOLIO_CACHE_HOT", "lots");
        let err = CacheConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "FOLIO_CACHE_HOT"
        ));
    }

    // Saves and restores environment variables around a test
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_from_toml_partial() {
        let config = CacheConfig::from_toml("cold_capacity = 12\n").unwrap();
        assert_eq!(config.cold_capacity, 12);
        assert_eq!(config.hot_capacity, 5); // default
    }

    #[test]
    fn test_from_toml_rejects_wrong_types() {
        let err = CacheConfig::from_toml("hot_capacity = \"five\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.toml");

        let config = CacheConfig::default().with_cold_capacity(64).with_radii(1, 4);
        config.save_to_file(&path).unwrap();

        let loaded = CacheConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = CacheConfig::from_file("/definitely/not/here/cache.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
