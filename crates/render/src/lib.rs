//! Folio Render Library
//!
//! Page keys, tile sizing and the rasterizer seam. Rasterization itself is
//! provided by a [`RasterBackend`]; `lopdf` geometry is built in and PDFium is
//! available behind the `pdfium` feature.

pub mod fonts;
pub mod key;
pub mod lopdf_backend;
#[cfg(feature = "pdfium")]
pub mod pdfium_backend;
pub mod raster;
pub mod tile;

pub use fonts::{EmbeddedFontsOnly, FontEnvironment, SystemFonts};
pub use key::{DocId, PageKey, ScaleKey, SlotKey, TileCoord};
pub use lopdf_backend::{LopdfBackend, LopdfDocument};
#[cfg(feature = "pdfium")]
pub use pdfium_backend::PdfiumBackend;
pub use raster::{
    PageRasterizer, PageSize, RasterBackend, RasterError, RasterResult, RenderResult, RgbaImage,
};
pub use tile::{page_pixel_size, tile_edge, uses_tiling, TileGrid, TileRect, FULL_PAGE_MAX_SCALE};
