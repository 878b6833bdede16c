//! Folio Viewer Library
//!
//! Ties the raster cache, render queue, worker pool and viewport tracker
//! together behind [`PageRenderCoordinator`].
//!
//! ```no_run
//! use folio_render::{LopdfBackend, SystemFonts};
//! use folio_scheduler::RequestPriority;
//! use folio_viewer::{NullSink, PageRenderCoordinator, ViewerConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let bytes = std::fs::read("paper.pdf").unwrap();
//! let mut viewer = PageRenderCoordinator::new(
//!     Arc::new(LopdfBackend::new()),
//!     Arc::new(SystemFonts),
//!     ViewerConfig::load().unwrap(),
//!     NullSink,
//! )
//! .unwrap();
//!
//! viewer.open_document(bytes).unwrap();
//! viewer.request_page(0, RequestPriority::Visible).unwrap();
//! viewer.pump_until_idle(Duration::from_secs(5));
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod presentation;

pub use config::ViewerConfig;
pub use coordinator::{
    prefetch_pages, CoordinatorStats, PageRenderCoordinator, PageRenderState, ScrollMode,
};
pub use error::{ViewerError, ViewerResult};
pub use presentation::{NullSink, PresentationEvent, PresentationSink, RecordingSink};
