//! Cache tiers and the distance policy that assigns them

use crate::config::CacheConfig;
use serde::Serialize;

/// Residency class of a cached page slot, warmest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CacheTier {
    Hot,
    Warm,
    Cold,
}

impl CacheTier {
    pub const ALL: [CacheTier; 3] = [CacheTier::Hot, CacheTier::Warm, CacheTier::Cold];

    /// Tier an overflowing slot migrates into; `None` for Cold
    pub fn colder(self) -> Option<CacheTier> {
        match self {
            CacheTier::Hot => Some(CacheTier::Warm),
            CacheTier::Warm => Some(CacheTier::Cold),
            CacheTier::Cold => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            CacheTier::Hot => 0,
            CacheTier::Warm => 1,
            CacheTier::Cold => 2,
        }
    }
}

/// Radii and capacities resolved from a [`CacheConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub hot_radius: u32,
    pub warm_radius: u32,
    capacities: [usize; 3],
}

impl TierPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            hot_radius: config.hot_radius,
            warm_radius: config.warm_radius.max(config.hot_radius),
            capacities: [
                config.hot_capacity.max(1),
                config.warm_capacity.max(1),
                config.cold_capacity.max(1),
            ],
        }
    }

    pub fn tier_for_distance(&self, distance: u32) -> CacheTier {
        if distance <= self.hot_radius {
            CacheTier::Hot
        } else if distance <= self.warm_radius {
            CacheTier::Warm
        } else {
            CacheTier::Cold
        }
    }

    pub fn capacity(&self, tier: CacheTier) -> usize {
        self.capacities[tier.index()]
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}
