//! Tiered raster cache
//!
//! Rendered bitmaps are grouped into page slots: every tile of one page at one
//! scale shares a slot with that page's full-page bitmap, and a slot holds
//! one partitioning or the other, never both. Each slot sits in a tier chosen
//! from its page distance to the current center page. When a tier holds more
//! slots than its capacity, its least recently used slot migrates into the
//! next colder tier; an overflowing Cold tier destroys its LRU slot.
//!
//! Every bitmap leaving the cache goes through one release path, so
//! `released_entries` in [`CacheStats`] counts each bitmap exactly once.

use crate::config::CacheConfig;
use crate::tier::{CacheTier, TierPolicy};
use folio_render::{DocId, PageKey, RasterResult, ScaleKey, SlotKey, TileCoord};
use serde::Serialize;
use std::collections::HashMap;

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hot_slots: usize,
    pub warm_slots: usize,
    pub cold_slots: usize,
    /// Bitmaps currently held (tiles count individually)
    pub entries: usize,
    /// Pixel bytes currently held
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    /// Slots pushed into a colder tier by capacity pressure
    pub migrations: u64,
    /// Slots destroyed because the Cold tier was full
    pub evictions: u64,
    /// Slots moved to a warmer tier by a `get` near the center
    pub promotions: u64,
    /// Bitmaps released, for any reason
    pub released_entries: u64,
    pub released_bytes: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn slots(&self) -> usize {
        self.hot_slots + self.warm_slots + self.cold_slots
    }
}

#[derive(Debug)]
struct Slot {
    tier: CacheTier,
    last_access: u64,
    full: Option<RasterResult>,
    tiles: HashMap<TileCoord, RasterResult>,
}

impl Slot {
    fn new(tier: CacheTier, last_access: u64) -> Self {
        Self { tier, last_access, full: None, tiles: HashMap::new() }
    }

    fn get(&self, tile: Option<TileCoord>) -> Option<&RasterResult> {
        match tile {
            None => self.full.as_ref(),
            Some(coord) => self.tiles.get(&coord),
        }
    }

    fn entry_count(&self) -> usize {
        usize::from(self.full.is_some()) + self.tiles.len()
    }

    fn byte_size(&self) -> usize {
        self.full.iter().chain(self.tiles.values()).map(RasterResult::byte_size).sum()
    }

    fn into_results(self) -> impl Iterator<Item = RasterResult> {
        self.full.into_iter().chain(self.tiles.into_values())
    }
}

/// Tiered Hot/Warm/Cold cache of rendered pages and tiles
///
/// Owned by the coordinating thread; no internal locking.
#[derive(Debug)]
pub struct RasterCache {
    policy: TierPolicy,
    slots: HashMap<SlotKey, Slot>,
    tier_counts: [usize; 3],
    center: Option<(DocId, u32)>,
    clock: u64,
    stats: CacheStats,
}

impl RasterCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_policy(TierPolicy::from_config(config))
    }

    pub fn with_policy(policy: TierPolicy) -> Self {
        Self {
            policy,
            slots: HashMap::new(),
            tier_counts: [0; 3],
            center: None,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// Document and page the tiers are currently computed around
    pub fn center(&self) -> Option<(DocId, u32)> {
        self.center
    }

    /// Look up a bitmap, refreshing its recency
    ///
    /// A slot sitting colder than its distance to the center warrants is
    /// promoted.
    pub fn get(&mut self, key: &PageKey) -> Option<&RasterResult> {
        let slot_key = key.slot();
        let desired =
            self.center.map(|(doc, page)| self.tier_around(doc, page, key.doc, key.page_index));

        let Some(slot) = self.slots.get_mut(&slot_key) else {
            self.stats.misses += 1;
            return None;
        };
        if slot.get(key.tile).is_none() {
            self.stats.misses += 1;
            return None;
        }

        self.clock += 1;
        slot.last_access = self.clock;
        let current = slot.tier;
        self.stats.hits += 1;

        if let Some(desired) = desired {
            if desired < current {
                tracing::trace!(%key, from = ?current, to = ?desired, "promoting cache slot");
                self.move_slot(slot_key, desired);
                self.stats.promotions += 1;
                self.enforce_capacities();
            }
        }

        self.slots.get(&slot_key).and_then(|slot| slot.get(key.tile))
    }

    /// Look up a bitmap without touching recency or statistics
    pub fn peek(&self, key: &PageKey) -> Option<&RasterResult> {
        self.slots.get(&key.slot()).and_then(|slot| slot.get(key.tile))
    }

    pub fn contains(&self, key: &PageKey) -> bool {
        self.peek(key).is_some()
    }

    /// Insert a bitmap, replacing any existing one for the same key
    ///
    /// The tier comes from the key's distance to `center_page`; a key for a
    /// document other than the centered one goes Cold. Inserting a tile drops
    /// a full-page bitmap of the same page and scale, and vice versa.
    pub fn put(&mut self, key: PageKey, result: RasterResult, center_page: u32) {
        let tier = match self.center {
            Some((doc, _)) if doc != key.doc => CacheTier::Cold,
            _ => self.policy.tier_for_distance(key.page_index.abs_diff(center_page)),
        };

        self.clock += 1;
        let now = self.clock;
        let slot_key = key.slot();
        let mut displaced = Vec::new();

        match self.slots.get_mut(&slot_key) {
            Some(slot) => {
                match key.tile {
                    None => {
                        displaced.extend(slot.tiles.drain().map(|(_, tile)| tile));
                        displaced.extend(slot.full.replace(result));
                    }
                    Some(coord) => {
                        displaced.extend(slot.full.take());
                        displaced.extend(slot.tiles.insert(coord, result));
                    }
                }
                slot.last_access = now;
                if slot.tier != tier {
                    self.move_slot(slot_key, tier);
                }
            }
            None => {
                let mut slot = Slot::new(tier, now);
                match key.tile {
                    None => slot.full = Some(result),
                    Some(coord) => {
                        slot.tiles.insert(coord, result);
                    }
                }
                self.slots.insert(slot_key, slot);
                self.tier_counts[tier.index()] += 1;
            }
        }

        for old in displaced {
            tracing::trace!(key = %old.key, "replacing cached bitmap");
            self.release(old);
        }

        self.enforce_capacities();
    }

    /// Release every entry of one page, across all scales and tiles
    pub fn invalidate(&mut self, doc: DocId, page_index: u32) -> usize {
        self.destroy_where(|slot| slot.doc == doc && slot.page_index == page_index)
    }

    /// Release every entry of a document
    pub fn invalidate_document(&mut self, doc: DocId) -> usize {
        let released = self.destroy_where(|slot| slot.doc == doc);
        if matches!(self.center, Some((center_doc, _)) if center_doc == doc) {
            self.center = None;
        }
        released
    }

    /// Release every entry rendered at a scale other than `scale`
    pub fn retain_scale(&mut self, scale: ScaleKey) -> usize {
        self.destroy_where(|slot| slot.scale != scale)
    }

    /// Re-tier all slots around a new center, then enforce capacities
    pub fn set_center_page(&mut self, doc: DocId, page_index: u32) {
        self.center = Some((doc, page_index));

        let moves: Vec<(SlotKey, CacheTier)> = self
            .slots
            .iter()
            .filter_map(|(key, slot)| {
                let tier = self.tier_around(doc, page_index, key.doc, key.page_index);
                (tier != slot.tier).then_some((*key, tier))
            })
            .collect();

        for (key, tier) in moves {
            self.move_slot(key, tier);
        }

        self.enforce_capacities();
    }

    /// Release everything
    pub fn clear(&mut self) -> usize {
        self.destroy_where(|_| true)
    }

    pub fn tier_of(&self, key: &PageKey) -> Option<CacheTier> {
        self.slots
            .get(&key.slot())
            .filter(|slot| slot.get(key.tile).is_some())
            .map(|slot| slot.tier)
    }

    /// Number of page slots in a tier
    pub fn tier_len(&self, tier: CacheTier) -> usize {
        self.tier_counts[tier.index()]
    }

    /// Number of bitmaps held
    pub fn len(&self) -> usize {
        self.slots.values().map(Slot::entry_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bitmaps held for one document
    pub fn document_entries(&self, doc: DocId) -> usize {
        self.slots
            .iter()
            .filter(|(key, _)| key.doc == doc)
            .map(|(_, slot)| slot.entry_count())
            .sum()
    }

    /// Keys of every held bitmap, in no particular order
    pub fn keys(&self) -> Vec<PageKey> {
        self.slots
            .iter()
            .flat_map(|(slot_key, slot)| {
                let full = slot
                    .full
                    .as_ref()
                    .map(|_| PageKey::full_page(slot_key.doc, slot_key.page_index, slot_key.scale));
                let tiles = slot.tiles.keys().map(move |coord| {
                    PageKey::tile(slot_key.doc, slot_key.page_index, slot_key.scale, *coord)
                });
                full.into_iter().chain(tiles)
            })
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hot_slots: self.tier_len(CacheTier::Hot),
            warm_slots: self.tier_len(CacheTier::Warm),
            cold_slots: self.tier_len(CacheTier::Cold),
            entries: self.len(),
            bytes: self.slots.values().map(Slot::byte_size).sum(),
            ..self.stats
        }
    }

    fn tier_around(&self, center_doc: DocId, center_page: u32, doc: DocId, page: u32) -> CacheTier {
        if doc == center_doc {
            self.policy.tier_for_distance(page.abs_diff(center_page))
        } else {
            CacheTier::Cold
        }
    }

    fn move_slot(&mut self, key: SlotKey, to: CacheTier) {
        if let Some(slot) = self.slots.get_mut(&key) {
            let from = slot.tier;
            slot.tier = to;
            self.tier_counts[from.index()] -= 1;
            self.tier_counts[to.index()] += 1;
        }
    }

    fn enforce_capacities(&mut self) {
        for tier in CacheTier::ALL {
            while self.tier_counts[tier.index()] > self.policy.capacity(tier) {
                let Some(victim) = self.lru_in(tier) else {
                    break;
                };

                match tier.colder() {
                    Some(colder) => {
                        tracing::trace!(
                            doc = %victim.doc,
                            page = victim.page_index,
                            from = ?tier,
                            to = ?colder,
                            "migrating cache slot"
                        );
                        self.move_slot(victim, colder);
                        self.stats.migrations += 1;
                    }
                    None => {
                        tracing::debug!(
                            doc = %victim.doc,
                            page = victim.page_index,
                            scale = %victim.scale,
                            "evicting cold cache slot"
                        );
                        self.destroy_slot(victim);
                        self.stats.evictions += 1;
                    }
                }
            }
        }
    }

    fn lru_in(&self, tier: CacheTier) -> Option<SlotKey> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.tier == tier)
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(key, _)| *key)
    }

    fn destroy_where(&mut self, predicate: impl Fn(&SlotKey) -> bool) -> usize {
        let doomed: Vec<SlotKey> =
            self.slots.keys().filter(|key| predicate(key)).copied().collect();
        doomed.into_iter().map(|key| self.destroy_slot(key)).sum()
    }

    fn destroy_slot(&mut self, key: SlotKey) -> usize {
        let Some(slot) = self.slots.remove(&key) else {
            return 0;
        };
        self.tier_counts[slot.tier.index()] -= 1;

        let mut released = 0;
        for result in slot.into_results() {
            self.release(result);
            released += 1;
        }
        released
    }

    fn release(&mut self, result: RasterResult) {
        self.stats.released_entries += 1;
        self.stats.released_bytes += result.byte_size() as u64;
        drop(result);
    }
}

impl Default for RasterCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}
