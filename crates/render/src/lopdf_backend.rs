//! Default backend built on `lopdf`
//!
//! Reads page geometry from the document and produces paper-colored page
//! bitmaps with a hairline border. Content streams are not interpreted; swap
//! in the `pdfium` backend for real page content.

use crate::fonts::FontEnvironment;
use crate::raster::{PageRasterizer, PageSize, RasterBackend, RasterError, RenderResult, RgbaImage};
use crate::tile::{page_pixel_size, TileRect};
use crate::key::ScaleKey;
use image::Rgba;
use lopdf::{Dictionary, Document, Object};

const PAPER: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BORDER: Rgba<u8> = Rgba([220, 220, 220, 255]);

/// Guards against `Parent` cycles in malformed page trees
const MAX_TREE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct LopdfBackend;

impl LopdfBackend {
    pub fn new() -> Self {
        Self
    }

    /// Displayed size of every page, in document order
    pub fn parse_sizes(bytes: &[u8]) -> RenderResult<Vec<PageSize>> {
        let doc = Document::load_mem(bytes).map_err(|err| RasterError::Load(err.to_string()))?;
        if doc.is_encrypted() {
            return Err(RasterError::Load("encrypted PDFs are not supported".to_owned()));
        }

        let pages = doc.get_pages();
        if pages.is_empty() {
            return Err(RasterError::Load("document has no pages".to_owned()));
        }

        pages
            .values()
            .map(|&object_id| {
                let page = doc
                    .get_dictionary(object_id)
                    .map_err(|err| RasterError::Load(err.to_string()))?;
                Ok(displayed_size(&doc, page))
            })
            .collect()
    }
}

/// Size of the visible page area after `/Rotate`
///
/// The visible area is the CropBox clipped to the MediaBox. Both boxes and
/// the rotation may be inherited from any ancestor `Pages` node.
fn displayed_size(doc: &Document, page: &Dictionary) -> PageSize {
    let media = inherited(doc, page, b"MediaBox")
        .and_then(as_rect)
        .unwrap_or([0.0, 0.0, PageSize::LETTER.width_pt, PageSize::LETTER.height_pt]);
    let visible = inherited(doc, page, b"CropBox")
        .and_then(as_rect)
        .and_then(|crop| intersect(crop, media))
        .unwrap_or(media);

    let width_pt = visible[2] - visible[0];
    let height_pt = visible[3] - visible[1];
    let rotate = inherited(doc, page, b"Rotate").and_then(|obj| obj.as_i64().ok()).unwrap_or(0);

    if rotate.rem_euclid(180) == 90 {
        PageSize { width_pt: height_pt, height_pt: width_pt }
    } else {
        PageSize { width_pt, height_pt }
    }
}

/// Look up an inheritable page attribute, walking up the page tree
fn inherited<'a>(doc: &'a Document, page: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
    let mut node = page;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = node.get(key) {
            return doc.dereference(value).ok().map(|(_, object)| object);
        }
        let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

/// `[x0 y0 x1 y1]` normalized so that x0 <= x1 and y0 <= y1
fn as_rect(object: &Object) -> Option<[f32; 4]> {
    let array = object.as_array().ok()?;
    if array.len() != 4 {
        return None;
    }
    let mut values = [0.0f32; 4];
    for (value, item) in values.iter_mut().zip(array) {
        *value = item.as_float().ok()?;
    }
    let [x0, y0, x1, y1] = values;
    let rect = [x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)];
    (rect[2] > rect[0] && rect[3] > rect[1]).then_some(rect)
}

fn intersect(a: [f32; 4], b: [f32; 4]) -> Option<[f32; 4]> {
    let rect = [a[0].max(b[0]), a[1].max(b[1]), a[2].min(b[2]), a[3].min(b[3])];
    (rect[2] > rect[0] && rect[3] > rect[1]).then_some(rect)
}

impl RasterBackend for LopdfBackend {
    fn name(&self) -> &'static str {
        "lopdf"
    }

    fn load(
        &self,
        bytes: &[u8],
        _fonts: &dyn FontEnvironment,
    ) -> RenderResult<Box<dyn PageRasterizer>> {
        let page_sizes = Self::parse_sizes(bytes)?;
        tracing::debug!(pages = page_sizes.len(), "lopdf document loaded");
        Ok(Box::new(LopdfDocument { page_sizes }))
    }
}

/// Page geometry of one loaded document
#[derive(Debug, Clone)]
pub struct LopdfDocument {
    page_sizes: Vec<PageSize>,
}

impl PageRasterizer for LopdfDocument {
    fn page_count(&self) -> u32 {
        self.page_sizes.len() as u32
    }

    fn page_size(&self, page_index: u32) -> RenderResult<PageSize> {
        self.page_sizes.get(page_index as usize).copied().ok_or(RasterError::PageOutOfRange {
            page: page_index,
            page_count: self.page_count(),
        })
    }

    fn render(
        &mut self,
        page_index: u32,
        scale: f32,
        region: Option<TileRect>,
    ) -> RenderResult<RgbaImage> {
        let size = self.page_size(page_index)?;
        let (page_width, page_height) = page_pixel_size(size, ScaleKey::from_scale(scale));

        let region =
            region.unwrap_or(TileRect { x: 0, y: 0, width: page_width, height: page_height });
        if region.width == 0
            || region.height == 0
            || region.x + region.width > page_width
            || region.y + region.height > page_height
        {
            return Err(RasterError::InvalidRegion { page: page_index, region });
        }

        let mut image = RgbaImage::from_pixel(region.width, region.height, PAPER);

        if page_width >= 4 && page_height >= 4 {
            // Border pixels in page space, translated into the region
            for x in 0..region.width {
                if region.y == 0 {
                    image.put_pixel(x, 0, BORDER);
                }
                if region.y + region.height == page_height {
                    image.put_pixel(x, region.height - 1, BORDER);
                }
            }
            for y in 0..region.height {
                if region.x == 0 {
                    image.put_pixel(0, y, BORDER);
                }
                if region.x + region.width == page_width {
                    image.put_pixel(region.width - 1, y, BORDER);
                }
            }
        }

        Ok(image)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fonts::EmbeddedFontsOnly;
    use lopdf::dictionary;

    /// Build an in-memory PDF with one page per size
    pub(crate) fn pdf_with_pages(sizes: &[(i64, i64)]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let kids: Vec<Object> = sizes
            .iter()
            .map(|&(width, height)| {
                doc.add_object(dictionary! {
                    "Type" => "Page",
                    "Parent" => pages_id,
                    "MediaBox" => vec![0.into(), 0.into(), width.into(), height.into()],
                })
                .into()
            })
            .collect();

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => sizes.len() as i64,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).expect("in-memory save should succeed");
        bytes
    }

    #[test]
    fn test_loads_page_sizes() {
        let bytes = pdf_with_pages(&[(612, 792), (842, 595)]);
        let doc = LopdfBackend.load(&bytes, &EmbeddedFontsOnly).unwrap();

        assert_eq!(doc.page_count(), 2);
        assert_eq!(doc.page_size(1).unwrap(), PageSize { width_pt: 842.0, height_pt: 595.0 });
        assert!(matches!(
            doc.page_size(2),
            Err(RasterError::PageOutOfRange { page: 2, page_count: 2 })
        ));
    }

    /// One document whose `Pages` node carries `inherited` and whose pages
    /// carry `own` attributes
    fn pdf_with_tree(inherited: Dictionary, own: Vec<Dictionary>) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let count = own.len() as i64;

        let kids: Vec<Object> = own
            .into_iter()
            .map(|mut page| {
                page.set("Type", "Page");
                page.set("Parent", pages_id);
                doc.add_object(page).into()
            })
            .collect();

        let mut pages = inherited;
        pages.set("Type", "Pages");
        pages.set("Kids", kids);
        pages.set("Count", count);
        doc.objects.insert(pages_id, Object::Dictionary(pages));

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).expect("in-memory save should succeed");
        bytes
    }

    #[test]
    fn test_media_box_inherited_from_pages_node() {
        let bytes = pdf_with_tree(
            dictionary! { "MediaBox" => vec![0.into(), 0.into(), 842.into(), 595.into()] },
            vec![
                Dictionary::new(),
                dictionary! { "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()] },
            ],
        );

        let sizes = LopdfBackend::parse_sizes(&bytes).unwrap();
        assert_eq!(sizes[0], PageSize { width_pt: 842.0, height_pt: 595.0 });
        assert_eq!(sizes[1], PageSize::LETTER);
    }

    #[test]
    fn test_crop_box_clipped_to_media_box() {
        let bytes = pdf_with_tree(
            dictionary! { "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()] },
            vec![
                dictionary! { "CropBox" => vec![36.into(), 36.into(), 576.into(), 756.into()] },
                dictionary! { "CropBox" => vec![500.into(), 0.into(), 900.into(), 792.into()] },
            ],
        );

        let sizes = LopdfBackend::parse_sizes(&bytes).unwrap();
        assert_eq!(sizes[0], PageSize { width_pt: 540.0, height_pt: 720.0 });
        assert_eq!(sizes[1], PageSize { width_pt: 112.0, height_pt: 792.0 });
    }

    #[test]
    fn test_rotation_swaps_dimensions() {
        let bytes = pdf_with_tree(
            dictionary! {
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Rotate" => 90,
            },
            vec![
                Dictionary::new(),
                dictionary! { "Rotate" => 180 },
                dictionary! { "Rotate" => -90 },
            ],
        );

        let sizes = LopdfBackend::parse_sizes(&bytes).unwrap();
        assert_eq!(sizes[0], PageSize { width_pt: 792.0, height_pt: 612.0 });
        assert_eq!(sizes[1], PageSize::LETTER);
        assert_eq!(sizes[2], PageSize { width_pt: 792.0, height_pt: 612.0 });
    }

    #[test]
    fn test_missing_media_box_falls_back_to_letter() {
        let bytes = pdf_with_tree(Dictionary::new(), vec![Dictionary::new()]);
        assert_eq!(LopdfBackend::parse_sizes(&bytes).unwrap(), vec![PageSize::LETTER]);
    }

    #[test]
    fn test_garbage_fails_to_load() {
        let err = LopdfBackend.load(b"not a pdf", &EmbeddedFontsOnly).err().unwrap();
        assert!(matches!(err, RasterError::Load(_)));
    }

    #[test]
    fn test_full_page_render_dimensions() {
        let bytes = pdf_with_pages(&[(612, 792)]);
        let mut doc = LopdfBackend.load(&bytes, &EmbeddedFontsOnly).unwrap();

        let image = doc.render(0, 1.5, None).unwrap();
        assert_eq!(image.dimensions(), (918, 1188));
        assert_eq!(*image.get_pixel(0, 0), BORDER);
        assert_eq!(*image.get_pixel(400, 400), PAPER);
    }

    #[test]
    fn test_region_render_clips_to_tile() {
        let bytes = pdf_with_pages(&[(612, 792)]);
        let mut doc = LopdfBackend.load(&bytes, &EmbeddedFontsOnly).unwrap();

        let region = TileRect { x: 2048, y: 0, width: 1012, height: 2048 };
        let image = doc.render(0, 5.0, Some(region)).unwrap();
        assert_eq!(image.dimensions(), (1012, 2048));
        // Right page edge falls inside this tile
        assert_eq!(*image.get_pixel(1011, 100), BORDER);
        // Left edge of this tile is interior to the page
        assert_eq!(*image.get_pixel(0, 100), PAPER);
    }

    #[test]
    fn test_region_outside_page_is_rejected() {
        let bytes = pdf_with_pages(&[(612, 792)]);
        let mut doc = LopdfBackend.load(&bytes, &EmbeddedFontsOnly).unwrap();

        let region = TileRect { x: 600, y: 0, width: 512, height: 512 };
        assert!(matches!(
            doc.render(0, 1.0, Some(region)),
            Err(RasterError::InvalidRegion { page: 0, .. })
        ));
    }
}
