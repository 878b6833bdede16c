//! Identity keys for rendered artifacts
//!
//! Every cached bitmap is addressed by a [`PageKey`]: the document, the page,
//! the quantized render scale and, for tiled renders, the tile position.

use std::fmt;

/// Scale quantization step. Scales are stored in thousandths so that
/// micro-zoom float noise maps onto the same key.
pub const SCALE_QUANTUM: f32 = 1000.0;

/// Opaque handle for an open document
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocId(u64);

impl DocId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

/// Render scale quantized to [`SCALE_QUANTUM`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScaleKey(u32);

impl ScaleKey {
    /// Quantize a float scale. Non-finite or non-positive input clamps to the
    /// smallest representable scale.
    pub fn from_scale(scale: f32) -> Self {
        if !scale.is_finite() || scale <= 0.0 {
            return Self(1);
        }
        let quantized = (scale * SCALE_QUANTUM).round();
        Self((quantized.min(u32::MAX as f32) as u32).max(1))
    }

    /// Build from thousandths directly (1000 = 100%)
    pub fn from_millis(millis: u32) -> Self {
        Self(millis.max(1))
    }

    pub fn millis(self) -> u32 {
        self.0
    }

    pub fn as_f32(self) -> f32 {
        self.0 as f32 / SCALE_QUANTUM
    }
}

impl From<f32> for ScaleKey {
    fn from(scale: f32) -> Self {
        Self::from_scale(scale)
    }
}

impl fmt::Display for ScaleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.as_f32())
    }
}

/// Tile position within a page's tile grid. (0, 0) is the top-left tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileCoord {
    pub row: u32,
    pub col: u32,
}

impl TileCoord {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Manhattan distance between two tiles of the same grid
    pub fn manhattan(self, other: TileCoord) -> u32 {
        self.row.abs_diff(other.row) + self.col.abs_diff(other.col)
    }
}

/// Identity key for every cached artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub doc: DocId,
    pub page_index: u32,
    pub scale: ScaleKey,
    /// `None` for a full-page render
    pub tile: Option<TileCoord>,
}

impl PageKey {
    pub fn full_page(doc: DocId, page_index: u32, scale: ScaleKey) -> Self {
        Self { doc, page_index, scale, tile: None }
    }

    pub fn tile(doc: DocId, page_index: u32, scale: ScaleKey, coord: TileCoord) -> Self {
        Self { doc, page_index, scale, tile: Some(coord) }
    }

    pub fn is_tiled(&self) -> bool {
        self.tile.is_some()
    }

    /// The page-at-scale slot this key belongs to. All tiles of one page at
    /// one scale share a slot with the full-page render of that page.
    pub fn slot(&self) -> SlotKey {
        SlotKey { doc: self.doc, page_index: self.page_index, scale: self.scale }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tile {
            Some(tile) => write!(
                f,
                "{}/p{}@{} tile({},{})",
                self.doc, self.page_index, self.scale, tile.row, tile.col
            ),
            None => write!(f, "{}/p{}@{}", self.doc, self.page_index, self.scale),
        }
    }
}

/// A page rendered at one scale, regardless of partitioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub doc: DocId,
    pub page_index: u32,
    pub scale: ScaleKey,
}
