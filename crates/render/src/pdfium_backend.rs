//! PDFium-backed rasterizer (feature `pdfium`)

use crate::fonts::FontEnvironment;
use crate::key::ScaleKey;
use crate::raster::{PageRasterizer, PageSize, RasterBackend, RasterError, RenderResult, RgbaImage};
use crate::tile::{page_pixel_size, TileRect};
use pdfium_render::prelude::*;

pub struct PdfiumBackend {
    pdfium: &'static Pdfium,
}

impl PdfiumBackend {
    /// Bind to the PDFium library
    ///
    /// Search order:
    /// 1. Executable's directory (app bundles)
    /// 2. Current working directory
    /// 3. System library paths
    pub fn bind() -> RenderResult<Self> {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()));

        let bindings = exe_dir
            .and_then(|dir| {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir)).ok()
            })
            .map(Ok)
            .unwrap_or_else(|| {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                    .or_else(|_| Pdfium::bind_to_system_library())
            })
            .map_err(|e| RasterError::Backend(format!("failed to bind pdfium: {e}")))?;

        // Documents borrow the library for their whole life; it lives as long as the process.
        let pdfium: &'static Pdfium = Box::leak(Box::new(Pdfium::new(bindings)));

        Ok(Self { pdfium })
    }
}

impl RasterBackend for PdfiumBackend {
    fn name(&self) -> &'static str {
        "pdfium"
    }

    fn load(
        &self,
        bytes: &[u8],
        fonts: &dyn FontEnvironment,
    ) -> RenderResult<Box<dyn PageRasterizer>> {
        tracing::debug!(
            font_dirs = fonts.font_dirs().len(),
            fallback = fonts.fallback_family(),
            "loading document with pdfium"
        );

        let document = self
            .pdfium
            .load_pdf_from_byte_vec(bytes.to_vec(), None)
            .map_err(|e| RasterError::Load(e.to_string()))?;

        Ok(Box::new(PdfiumDocument { pdfium: self.pdfium, document }))
    }
}

struct PdfiumDocument {
    pdfium: &'static Pdfium,
    document: PdfDocument<'static>,
}

impl PdfiumDocument {
    fn page(&self, page_index: u32) -> RenderResult<PdfPage<'_>> {
        let page_count = self.page_count();
        u16::try_from(page_index)
            .ok()
            .and_then(|index| self.document.pages().get(index).ok())
            .ok_or(RasterError::PageOutOfRange { page: page_index, page_count })
    }
}

impl PageRasterizer for PdfiumDocument {
    fn page_count(&self) -> u32 {
        self.document.pages().len() as u32
    }

    fn page_size(&self, page_index: u32) -> RenderResult<PageSize> {
        let page = self.page(page_index)?;
        Ok(PageSize { width_pt: page.width().value, height_pt: page.height().value })
    }

    fn render(
        &mut self,
        page_index: u32,
        scale: f32,
        region: Option<TileRect>,
    ) -> RenderResult<RgbaImage> {
        let size = self.page_size(page_index)?;
        let (page_width, page_height) = page_pixel_size(size, ScaleKey::from_scale(scale));
        let page = self.page(page_index)?;

        // Page-to-pixel scaling comes from the full page target size either way
        let config = PdfRenderConfig::new()
            .set_target_width(page_width as i32)
            .set_target_height(page_height as i32)
            .render_form_data(true);

        let Some(region) = region else {
            let bitmap = page.render_with_config(&config).map_err(render_error)?;
            return into_image(page_width, page_height, bitmap.as_rgba_bytes());
        };

        if region.width == 0
            || region.height == 0
            || region.x + region.width > page_width
            || region.y + region.height > page_height
        {
            return Err(RasterError::InvalidRegion { page: page_index, region });
        }

        // Only the tile is allocated; PDFium clips drawing to the bitmap
        let (dx, dy) = tile_offset_pt(region, size, (page_width, page_height));
        let config = config
            .translate(PdfPoints::new(dx), PdfPoints::new(dy))
            .map_err(render_error)?
            .clip(0, 0, region.width as i32, region.height as i32);

        let mut bitmap = PdfBitmap::empty(
            region.width as i32,
            region.height as i32,
            PdfBitmapFormat::BGRA,
            self.pdfium.bindings(),
        )
        .map_err(render_error)?;
        page.render_into_bitmap_with_config(&mut bitmap, &config).map_err(render_error)?;

        into_image(region.width, region.height, bitmap.as_rgba_bytes())
    }
}

fn render_error(err: PdfiumError) -> RasterError {
    RasterError::Render(err.to_string())
}

fn into_image(width: u32, height: u32, pixels: Vec<u8>) -> RenderResult<RgbaImage> {
    RgbaImage::from_raw(width, height, pixels)
        .ok_or_else(|| RasterError::Render("pixel buffer size mismatch".to_owned()))
}

/// Page-space translation, in points, that moves the tile origin onto the
/// bitmap origin
fn tile_offset_pt(
    region: TileRect,
    size: PageSize,
    (page_width, page_height): (u32, u32),
) -> (f32, f32) {
    let x_scale = page_width as f32 / size.width_pt;
    let y_scale = page_height as f32 / size.height_pt;
    (-(region.x as f32) / x_scale, -(region.y as f32) / y_scale)
}
