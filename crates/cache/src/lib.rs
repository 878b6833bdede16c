//! Folio Cache Library
//!
//! Tiered Hot/Warm/Cold cache for rendered pages and tiles, keyed by page
//! distance from the viewport center.

pub mod config;
pub mod raster_cache;
pub mod tier;

pub use config::{env_override, CacheConfig, ConfigError};
pub use raster_cache::{CacheStats, RasterCache};
pub use tier::{CacheTier, TierPolicy};
