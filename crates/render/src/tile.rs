//! Tile sizing and page tiling
//!
//! Pages rendered above [`FULL_PAGE_MAX_SCALE`] are split into square tiles
//! whose edge grows with zoom, keeping per-tile raster cost roughly bounded.

use crate::key::{ScaleKey, TileCoord};
use crate::raster::PageSize;

/// Largest scale rendered as a single full-page bitmap
pub const FULL_PAGE_MAX_SCALE: f32 = 2.0;

/// Upper bound on tile edge length in pixels
pub const MAX_TILE_EDGE: u32 = 4096;

/// Optimal tile edge length for a render scale
///
/// Called on every render-decision pass; no allocation.
pub fn tile_edge(scale: f32) -> u32 {
    if scale <= 2.0 {
        512
    } else if scale <= 4.0 {
        1024
    } else if scale <= 8.0 {
        2048
    } else {
        MAX_TILE_EDGE
    }
}

/// Whether pages at this scale are rendered as tiles instead of one bitmap
pub fn uses_tiling(scale: ScaleKey) -> bool {
    scale.as_f32() > FULL_PAGE_MAX_SCALE
}

/// Pixel dimensions of a whole page rendered at `scale`
pub fn page_pixel_size(size: PageSize, scale: ScaleKey) -> (u32, u32) {
    let s = scale.as_f32();
    let width = (size.width_pt * s).round().max(1.0) as u32;
    let height = (size.height_pt * s).round().max(1.0) as u32;
    (width, height)
}

/// Pixel rectangle of one tile, in render-scale page coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRect {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Tile grid for one page at one scale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub edge: u32,
    pub rows: u32,
    pub cols: u32,
    pub page_width_px: u32,
    pub page_height_px: u32,
}

impl TileGrid {
    /// Lay out the grid for a page of `size` points rendered at `scale`
    pub fn for_page(size: PageSize, scale: ScaleKey) -> Self {
        let (page_width_px, page_height_px) = page_pixel_size(size, scale);
        let edge = tile_edge(scale.as_f32());

        Self {
            edge,
            rows: page_height_px.div_ceil(edge).max(1),
            cols: page_width_px.div_ceil(edge).max(1),
            page_width_px,
            page_height_px,
        }
    }

    pub fn tile_count(&self) -> u32 {
        self.rows * self.cols
    }

    pub fn contains(&self, coord: TileCoord) -> bool {
        coord.row < self.rows && coord.col < self.cols
    }

    /// Pixel rectangle for a tile; edge tiles are clipped to the page
    pub fn tile_rect(&self, coord: TileCoord) -> Option<TileRect> {
        if !self.contains(coord) {
            return None;
        }

        let x = coord.col * self.edge;
        let y = coord.row * self.edge;
        let width = self.edge.min(self.page_width_px.saturating_sub(x));
        let height = self.edge.min(self.page_height_px.saturating_sub(y));

        if width == 0 || height == 0 {
            return None;
        }

        Some(TileRect { x, y, width, height })
    }

    /// All tile coordinates, row-major
    pub fn coords(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (0..self.rows).flat_map(move |row| (0..self.cols).map(move |col| TileCoord::new(row, col)))
    }

    /// Tile under a point given as fractions of the page (0.0..=1.0)
    pub fn tile_at(&self, fx: f32, fy: f32) -> TileCoord {
        let fx = if fx.is_finite() { fx.clamp(0.0, 1.0) } else { 0.5 };
        let fy = if fy.is_finite() { fy.clamp(0.0, 1.0) } else { 0.5 };
        let px = (fx * self.page_width_px as f32) as u32;
        let py = (fy * self.page_height_px as f32) as u32;

        TileCoord::new(
            (py / self.edge).min(self.rows - 1),
            (px / self.edge).min(self.cols - 1),
        )
    }
}
