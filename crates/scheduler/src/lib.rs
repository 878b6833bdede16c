//! Folio Scheduler Library
//!
//! Render tasks, the distance-ordered render queue, the worker pool that
//! executes tasks off the coordinating thread, and the viewport tracker that
//! decides when pages become visible, centered and settled.
//!
//! # Example
//!
//! ```
//! use folio_render::{DocId, PageKey, ScaleKey};
//! use folio_scheduler::{RenderQueue, RenderTask, RequestPriority, ViewportCenter};
//!
//! let doc = DocId::new(1);
//! let mut queue = RenderQueue::new();
//!
//! for page in [9, 2, 5] {
//!     let key = PageKey::full_page(doc, page, ScaleKey::from_scale(1.0));
//!     let id = queue.next_id();
//!     queue.enqueue(RenderTask::new(id, key, RequestPriority::Prefetch, 0));
//! }
//!
//! // The closest page to the current center comes out first
//! let next = queue.dequeue_highest(&ViewportCenter::new(doc, 4), 0).unwrap();
//! assert_eq!(next.key.page_index, 5);
//! ```

mod cancel;
mod queue;
mod task;
mod viewport;
mod worker;

pub use cancel::CancellationToken;
pub use queue::{QueueStats, RenderQueue};
pub use task::{RenderTask, RequestPriority, TaskId, ViewportCenter, WorkerId};
pub use viewport::{
    PageVisibility, Rect, TrackerState, ViewportEvent, ViewportTracker, ViewportTrackerConfig,
};
pub use worker::{
    default_worker_count, DocumentInfo, WorkerCommand, WorkerFailure, WorkerOutcome, WorkerPool,
    WorkerPoolConfig, WorkerReply, MAX_WORKERS, MIN_WORKERS,
};
