//! Render tasks and their ordering keys

use crate::cancel::CancellationToken;
use folio_render::{DocId, PageKey, TileGrid};
use serde::Serialize;
use std::cmp::Reverse;

/// Unique task identifier; assigned in submission order
pub type TaskId = u64;

/// Index of a worker thread in the pool
pub type WorkerId = usize;

/// Why a page was requested
///
/// Only breaks ties between tasks at the same distance from the center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RequestPriority {
    /// Speculative render of a page near the viewport
    Prefetch = 0,

    /// Page intersects the viewport
    Visible = 1,

    /// Second attempt after a rasterizer failure
    Retry = 2,
}

/// Where the user is looking
///
/// `focus` is the point of interest on the center page as fractions of the
/// page width and height; tiles are ordered by their distance to the tile
/// under it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportCenter {
    pub doc: DocId,
    pub page: u32,
    pub focus: (f32, f32),
}

impl ViewportCenter {
    pub fn new(doc: DocId, page: u32) -> Self {
        Self { doc, page, focus: (0.5, 0.5) }
    }

    pub fn with_focus(mut self, fx: f32, fy: f32) -> Self {
        self.focus = (fx, fy);
        self
    }
}

/// One unit of rasterization work
#[derive(Debug, Clone)]
pub struct RenderTask {
    pub id: TaskId,
    pub key: PageKey,
    pub priority: RequestPriority,
    pub created_at_generation: u64,
    pub cancel: CancellationToken,
    /// Tile layout of the page, present for tiled keys
    pub grid: Option<TileGrid>,
    /// 1 for the first attempt
    pub attempt: u32,
    /// Worker that must not run this task (the one that failed it last)
    pub avoid_worker: Option<WorkerId>,
}

impl RenderTask {
    pub fn new(id: TaskId, key: PageKey, priority: RequestPriority, generation: u64) -> Self {
        Self {
            id,
            key,
            priority,
            created_at_generation: generation,
            cancel: CancellationToken::new(),
            grid: None,
            attempt: 1,
            avoid_worker: None,
        }
    }

    pub fn with_grid(mut self, grid: TileGrid) -> Self {
        self.grid = Some(grid);
        self
    }

    /// Turn a failed task into its retry: new id, fresh token, Retry
    /// priority, and a different worker
    pub fn retry(&self, id: TaskId, failed_on: WorkerId) -> Self {
        Self {
            id,
            key: self.key,
            priority: RequestPriority::Retry,
            created_at_generation: self.created_at_generation,
            cancel: CancellationToken::new(),
            grid: self.grid,
            attempt: self.attempt + 1,
            avoid_worker: Some(failed_on),
        }
    }

    pub fn is_stale(&self, generation: u64) -> bool {
        self.created_at_generation != generation
    }

    /// `(page distance, tile distance)` from the viewport center
    ///
    /// Tasks for any document other than the centered one sort last.
    pub fn distance_to(&self, center: &ViewportCenter) -> (u32, u32) {
        if self.key.doc != center.doc {
            return (u32::MAX, u32::MAX);
        }

        let page_distance = self.key.page_index.abs_diff(center.page);
        let tile_distance = match (self.key.tile, self.grid) {
            (Some(coord), Some(grid)) => {
                let (fx, fy) = center.focus;
                coord.manhattan(grid.tile_at(fx, fy))
            }
            _ => 0,
        };

        (page_distance, tile_distance)
    }

    /// Dequeue ordering key, smallest first
    pub(crate) fn order_key(
        &self,
        center: &ViewportCenter,
    ) -> ((u32, u32), Reverse<RequestPriority>, TaskId) {
        (self.distance_to(center), Reverse(self.priority), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_render::{PageSize, ScaleKey, TileCoord};

    fn doc() -> DocId {
        DocId::new(7)
    }

    #[test]
    fn test_priority_ordering() {
        assert!(RequestPriority::Retry > RequestPriority::Visible);
        assert!(RequestPriority::Visible > RequestPriority::Prefetch);
    }

    #[test]
    fn test_page_distance() {
        let key = PageKey::full_page(doc(), 3, ScaleKey::from_scale(1.0));
        let task = RenderTask::new(1, key, RequestPriority::Visible, 0);

        assert_eq!(task.distance_to(&ViewportCenter::new(doc(), 7)), (4, 0));
        assert_eq!(task.distance_to(&ViewportCenter::new(doc(), 3)), (0, 0));
        assert_eq!(task.distance_to(&ViewportCenter::new(DocId::new(8), 3)), (u32::MAX, u32::MAX));
    }

    #[test]
    fn test_tile_distance_from_focus() {
        let scale = ScaleKey::from_scale(5.0);
        let grid = TileGrid::for_page(PageSize::LETTER, scale);
        let key = PageKey::tile(doc(), 0, scale, TileCoord::new(1, 1));
        let task = RenderTask::new(1, key, RequestPriority::Visible, 0).with_grid(grid);

        let top_left = ViewportCenter::new(doc(), 0).with_focus(0.0, 0.0);
        let bottom_right = ViewportCenter::new(doc(), 0).with_focus(1.0, 1.0);
        assert_eq!(task.distance_to(&top_left), (0, 2));
        assert_eq!(task.distance_to(&bottom_right), (0, 0));
    }

    #[test]
    fn test_retry_moves_off_failed_worker() {
        let key = PageKey::full_page(doc(), 0, ScaleKey::from_scale(1.0));
        let task = RenderTask::new(1, key, RequestPriority::Prefetch, 4);
        let retry = task.retry(9, 2);

        assert_eq!(retry.id, 9);
        assert_eq!(retry.priority, RequestPriority::Retry);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.avoid_worker, Some(2));
        assert_eq!(retry.created_at_generation, 4);
        assert!(!retry.cancel.same_as(&task.cancel));
        assert!(!retry.is_stale(4));
        assert!(retry.is_stale(5));
    }
}
