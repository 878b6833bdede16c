//! Presentation seam
//!
//! The coordinator lends each committed bitmap to a [`PresentationSink`] right
//! after it enters the cache. Sinks must copy anything they want to keep.

use folio_render::{PageKey, RasterResult};
use folio_scheduler::WorkerFailure;

pub trait PresentationSink {
    /// A full-page bitmap is ready
    fn on_page_ready(&mut self, bitmap: &RasterResult);

    /// One tile of a tiled page is ready
    fn on_tile_ready(&mut self, bitmap: &RasterResult);

    /// The key failed persistently; show a placeholder with a retry affordance
    fn on_render_failed(&mut self, key: PageKey, failure: &WorkerFailure) {
        let _ = (key, failure);
    }
}

/// Sink that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PresentationSink for NullSink {
    fn on_page_ready(&mut self, _bitmap: &RasterResult) {}

    fn on_tile_ready(&mut self, _bitmap: &RasterResult) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresentationEvent {
    PageReady { key: PageKey, width: u32, height: u32 },
    TileReady { key: PageKey, width: u32, height: u32 },
    Failed { key: PageKey, failure: WorkerFailure },
}

/// Sink that records what it was shown, in order
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub events: Vec<PresentationEvent>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pages_ready(&self) -> Vec<PageKey> {
        self.events
            .iter()
            .filter_map(|event| match event {
                PresentationEvent::PageReady { key, .. } => Some(*key),
                _ => None,
            })
            .collect()
    }

    pub fn tiles_ready(&self) -> Vec<PageKey> {
        self.events
            .iter()
            .filter_map(|event| match event {
                PresentationEvent::TileReady { key, .. } => Some(*key),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<PageKey> {
        self.events
            .iter()
            .filter_map(|event| match event {
                PresentationEvent::Failed { key, .. } => Some(*key),
                _ => None,
            })
            .collect()
    }
}

impl PresentationSink for RecordingSink {
    fn on_page_ready(&mut self, bitmap: &RasterResult) {
        self.events.push(PresentationEvent::PageReady {
            key: bitmap.key,
            width: bitmap.width,
            height: bitmap.height,
        });
    }

    fn on_tile_ready(&mut self, bitmap: &RasterResult) {
        self.events.push(PresentationEvent::TileReady {
            key: bitmap.key,
            width: bitmap.width,
            height: bitmap.height,
        });
    }

    fn on_render_failed(&mut self, key: PageKey, failure: &WorkerFailure) {
        self.events.push(PresentationEvent::Failed { key, failure: failure.clone() });
    }
}
