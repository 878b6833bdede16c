//! Rasterizer seam and rendered bitmaps
//!
//! The PDF rasterization primitive is external to this crate. Backends plug
//! in through [`RasterBackend`], which loads a private [`PageRasterizer`]
//! handle for each worker.

use crate::fonts::FontEnvironment;
use crate::key::PageKey;
use crate::tile::TileRect;
use image::{ImageBuffer, Rgba};

pub type RgbaImage = ImageBuffer<Rgba<u8>, Vec<u8>>;

/// Page dimensions in PDF points
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

impl PageSize {
    /// US Letter, used when a page carries no usable MediaBox
    pub const LETTER: PageSize = PageSize { width_pt: 612.0, height_pt: 792.0 };
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RasterError {
    #[error("failed to load document: {0}")]
    Load(String),
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("region {region:?} lies outside page {page}")]
    InvalidRegion { page: u32, region: TileRect },
    #[error("render failed: {0}")]
    Render(String),
    #[error(
        "bitmap is {actual_width}x{actual_height}, expected {expected_width}x{expected_height}"
    )]
    Malformed { expected_width: u32, expected_height: u32, actual_width: u32, actual_height: u32 },
    #[error("rasterizer panicked: {0}")]
    Panicked(String),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type RenderResult<T> = Result<T, RasterError>;

/// A rendered bitmap plus the key it was produced for
///
/// Once committed, the cache is the exclusive owner. Presentation code only
/// ever borrows it for the duration of a callback.
#[derive(Debug)]
pub struct RasterResult {
    pub key: PageKey,
    /// RGBA, 4 bytes per pixel
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Size of the whole page at this scale (equal to width/height for full-page renders)
    pub page_width_px: u32,
    pub page_height_px: u32,
    /// Render generation this bitmap was produced under
    pub produced_at_version: u64,
}

impl RasterResult {
    /// Wrap a rasterizer image, checking it has the dimensions that were asked for
    pub fn from_image(
        key: PageKey,
        image: RgbaImage,
        expected: (u32, u32),
        page_px: (u32, u32),
        produced_at_version: u64,
    ) -> RenderResult<Self> {
        let (width, height) = image.dimensions();
        let pixels = image.into_raw();

        if (width, height) != expected || pixels.len() != width as usize * height as usize * 4 {
            return Err(RasterError::Malformed {
                expected_width: expected.0,
                expected_height: expected.1,
                actual_width: width,
                actual_height: height,
            });
        }

        Ok(Self {
            key,
            pixels,
            width,
            height,
            page_width_px: page_px.0,
            page_height_px: page_px.1,
            produced_at_version,
        })
    }

    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_opaque(&self) -> bool {
        self.pixels.chunks_exact(4).all(|rgba| rgba[3] == 255)
    }

    /// Copy into an `image` buffer, e.g. for writing to disk
    pub fn to_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
    }
}

/// A loaded document inside one worker
///
/// Handles are private to the worker that created them and never cross
/// threads, so implementations need not be `Send`.
pub trait PageRasterizer {
    fn page_count(&self) -> u32;

    fn page_size(&self, page_index: u32) -> RenderResult<PageSize>;

    /// Render `page_index` at `scale`. With a `region`, only that pixel
    /// rectangle of the scaled page is produced.
    fn render(
        &mut self,
        page_index: u32,
        scale: f32,
        region: Option<TileRect>,
    ) -> RenderResult<RgbaImage>;

    /// All page sizes, in page order
    fn page_sizes(&self) -> RenderResult<Vec<PageSize>> {
        (0..self.page_count()).map(|index| self.page_size(index)).collect()
    }
}

/// Factory for per-worker document handles
pub trait RasterBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(
        &self,
        bytes: &[u8],
        fonts: &dyn FontEnvironment,
    ) -> RenderResult<Box<dyn PageRasterizer>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{DocId, ScaleKey};

    fn key() -> PageKey {
        PageKey::full_page(DocId::new(1), 0, ScaleKey::from_scale(1.0))
    }

    #[test]
    fn test_from_image_accepts_expected_size() {
        let image = RgbaImage::from_pixel(8, 4, Rgba([255, 255, 255, 255]));
        let result = RasterResult::from_image(key(), image, (8, 4), (8, 4), 3).unwrap();
        assert_eq!(result.byte_size(), 8 * 4 * 4);
        assert_eq!(result.produced_at_version, 3);
        assert!(result.is_opaque());
    }

    #[test]
    fn test_from_image_rejects_wrong_size() {
        let image = RgbaImage::from_pixel(8, 4, Rgba([255, 255, 255, 255]));
        let err = RasterResult::from_image(key(), image, (8, 5), (8, 5), 0).unwrap_err();
        assert!(matches!(err, RasterError::Malformed { expected_height: 5, actual_height: 4, .. }));
    }

    #[test]
    fn test_transparency_detected() {
        let mut image = RgbaImage::from_pixel(2, 2, Rgba([255, 255, 255, 255]));
        image.put_pixel(1, 1, Rgba([0, 0, 0, 10]));
        let result = RasterResult::from_image(key(), image, (2, 2), (2, 2), 0).unwrap();
        assert!(!result.is_opaque());
        assert_eq!(result.to_image().unwrap().get_pixel(1, 1)[3], 10);
    }
}
