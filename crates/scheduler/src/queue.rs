//! Distance-ordered render queue
//!
//! The queue stores tasks, not priorities. Each dequeue ranks what is queued
//! against the center supplied at that moment, so a scroll never requires
//! re-sorting or re-submitting anything.
//!
//! Ranking, first difference wins:
//! 1. page distance to the center page, then tile distance to the focus tile
//! 2. request priority (Retry > Visible > Prefetch)
//! 3. submission order

use crate::task::{RenderTask, RequestPriority, TaskId, ViewportCenter};
use folio_render::PageKey;
use serde::Serialize;

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub dispatched: u64,
    /// Dropped at dequeue because their generation had passed
    pub dropped_stale: u64,
    /// Removed by `cancel_all`
    pub cancelled: u64,
    /// Tasks currently queued
    pub queued: usize,
}

#[derive(Debug, Default)]
pub struct RenderQueue {
    tasks: Vec<RenderTask>,
    next_id: TaskId,
    stats: QueueStats,
}

impl RenderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next task id
    pub fn next_id(&mut self) -> TaskId {
        self.next_id += 1;
        self.next_id
    }

    /// Add a task. Re-enqueueing a previously dequeued task keeps its place
    /// in submission order.
    pub fn enqueue(&mut self, task: RenderTask) -> TaskId {
        let id = task.id;
        if id > self.next_id {
            self.next_id = id;
        }
        tracing::trace!(task = id, key = %task.key, priority = ?task.priority, "task queued");
        self.tasks.push(task);
        self.stats.submitted += 1;
        id
    }

    /// Put back a task that could not be dispatched right now
    pub fn requeue(&mut self, task: RenderTask) {
        self.tasks.push(task);
    }

    /// Remove and return the best task for `center`
    ///
    /// Tasks from an older generation are cancelled and dropped on the way.
    /// Returns `None` when nothing current is queued; never blocks.
    pub fn dequeue_highest(
        &mut self,
        center: &ViewportCenter,
        generation: u64,
    ) -> Option<RenderTask> {
        self.drop_stale(generation);

        let index = self
            .tasks
            .iter()
            .enumerate()
            .min_by_key(|(_, task)| task.order_key(center))
            .map(|(index, _)| index)?;

        let task = self.tasks.swap_remove(index);
        self.stats.dispatched += 1;
        Some(task)
    }

    /// Remove every queued task matching `predicate`, tripping its token
    pub fn cancel_all<F>(&mut self, predicate: F) -> Vec<RenderTask>
    where
        F: Fn(&RenderTask) -> bool,
    {
        let (cancelled, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.tasks).into_iter().partition(|task| predicate(task));
        self.tasks = kept;

        for task in &cancelled {
            task.cancel.cancel();
        }
        self.stats.cancelled += cancelled.len() as u64;
        cancelled
    }

    /// Raise the priority of a queued key. Returns whether a task was found.
    pub fn promote(&mut self, key: &PageKey, priority: RequestPriority) -> bool {
        match self.tasks.iter_mut().find(|task| task.key == *key) {
            Some(task) => {
                task.priority = task.priority.max(priority);
                true
            }
            None => false,
        }
    }

    pub fn contains_key(&self, key: &PageKey) -> bool {
        self.tasks.iter().any(|task| task.key == *key)
    }

    pub fn get(&self, key: &PageKey) -> Option<&RenderTask> {
        self.tasks.iter().find(|task| task.key == *key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenderTask> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats { queued: self.tasks.len(), ..self.stats }
    }

    fn drop_stale(&mut self, generation: u64) {
        let before = self.tasks.len();
        self.tasks.retain(|task| {
            if task.is_stale(generation) {
                tracing::debug!(
                    task = task.id,
                    key = %task.key,
                    task_generation = task.created_at_generation,
                    generation,
                    "dropping stale task"
                );
                task.cancel.cancel();
                false
            } else {
                true
            }
        });
        self.stats.dropped_stale += (before - self.tasks.len()) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_render::{DocId, PageSize, ScaleKey, TileCoord, TileGrid};
    use proptest::prelude::*;

    const DOC: DocId = DocId::new(1);

    fn page_task(
        queue: &mut RenderQueue,
        page: u32,
        priority: RequestPriority,
        generation: u64,
    ) -> RenderTask {
        let key = PageKey::full_page(DOC, page, ScaleKey::from_scale(1.0));
        RenderTask::new(queue.next_id(), key, priority, generation)
    }

    fn drain(queue: &mut RenderQueue, center: &ViewportCenter, generation: u64) -> Vec<u32> {
        std::iter::from_fn(|| queue.dequeue_highest(center, generation))
            .map(|task| task.key.page_index)
            .collect()
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = RenderQueue::new();
        assert!(queue.is_empty());
        assert!(queue.dequeue_highest(&ViewportCenter::new(DOC, 0), 0).is_none());
    }

    #[test]
    fn test_distance_order_regardless_of_enqueue_order() {
        let center = ViewportCenter::new(DOC, 5);
        for order in [[7u32, 3, 0], [0, 7, 3], [3, 0, 7]] {
            let mut queue = RenderQueue::new();
            // Pages at distance 0, 3 and 7 from page 5
            for distance in order {
                let task = page_task(&mut queue, 5 + distance, RequestPriority::Visible, 0);
                queue.enqueue(task);
            }
            assert_eq!(drain(&mut queue, &center, 0), vec![5, 8, 12]);
        }
    }

    #[test]
    fn test_priority_breaks_distance_ties() {
        let mut queue = RenderQueue::new();
        let prefetch = page_task(&mut queue, 4, RequestPriority::Prefetch, 0);
        let visible = page_task(&mut queue, 6, RequestPriority::Visible, 0);
        queue.enqueue(prefetch);
        queue.enqueue(visible);

        let first = queue.dequeue_highest(&ViewportCenter::new(DOC, 5), 0).unwrap();
        assert_eq!(first.key.page_index, 6);
    }

    #[test]
    fn test_retry_beats_visible_at_same_distance() {
        let mut queue = RenderQueue::new();
        let visible = page_task(&mut queue, 4, RequestPriority::Visible, 0);
        let failed = page_task(&mut queue, 6, RequestPriority::Visible, 0);
        let retry = failed.retry(queue.next_id(), 0);
        queue.enqueue(visible);
        queue.enqueue(retry);

        let first = queue.dequeue_highest(&ViewportCenter::new(DOC, 5), 0).unwrap();
        assert_eq!(first.key.page_index, 6);
        assert_eq!(first.priority, RequestPriority::Retry);
    }

    #[test]
    fn test_fifo_within_same_rank() {
        let mut queue = RenderQueue::new();
        let a = page_task(&mut queue, 4, RequestPriority::Visible, 0);
        let b = page_task(&mut queue, 6, RequestPriority::Visible, 0);
        let a_id = a.id;
        queue.enqueue(b);
        queue.enqueue(a);

        let first = queue.dequeue_highest(&ViewportCenter::new(DOC, 5), 0).unwrap();
        assert_eq!(first.id, a_id);
    }

    #[test]
    fn test_center_is_read_at_dequeue_time() {
        let mut queue = RenderQueue::new();
        for page in [0, 10] {
            let task = page_task(&mut queue, page, RequestPriority::Visible, 0);
            queue.enqueue(task);
        }

        let first = queue.dequeue_highest(&ViewportCenter::new(DOC, 9), 0).unwrap();
        assert_eq!(first.key.page_index, 10);
    }

    #[test]
    fn test_tiles_ordered_by_focus() {
        let scale = ScaleKey::from_scale(5.0);
        let grid = TileGrid::for_page(PageSize::LETTER, scale);
        let mut queue = RenderQueue::new();
        for coord in grid.coords() {
            let key = PageKey::tile(DOC, 0, scale, coord);
            let task =
                RenderTask::new(queue.next_id(), key, RequestPriority::Visible, 0).with_grid(grid);
            queue.enqueue(task);
        }

        let center = ViewportCenter::new(DOC, 0).with_focus(0.9, 0.9);
        let first = queue.dequeue_highest(&center, 0).unwrap();
        assert_eq!(first.key.tile, Some(TileCoord::new(1, 1)));
        let last = std::iter::from_fn(|| queue.dequeue_highest(&center, 0)).last().unwrap();
        assert_eq!(last.key.tile, Some(TileCoord::new(0, 0)));
    }

    #[test]
    fn test_stale_tasks_dropped_and_cancelled() {
        let mut queue = RenderQueue::new();
        let stale = page_task(&mut queue, 0, RequestPriority::Visible, 1);
        let token = stale.cancel.clone();
        queue.enqueue(stale);
        let current = page_task(&mut queue, 9, RequestPriority::Prefetch, 2);
        queue.enqueue(current);

        let task = queue.dequeue_highest(&ViewportCenter::new(DOC, 0), 2).unwrap();
        assert_eq!(task.key.page_index, 9);
        assert!(token.is_cancelled());
        assert!(queue.is_empty());
        assert_eq!(queue.stats().dropped_stale, 1);
    }

    #[test]
    fn test_cancel_all_by_predicate() {
        let mut queue = RenderQueue::new();
        for page in 0..6 {
            let task = page_task(&mut queue, page, RequestPriority::Visible, 0);
            queue.enqueue(task);
        }

        let cancelled = queue.cancel_all(|task| task.key.page_index % 2 == 0);
        assert_eq!(cancelled.len(), 3);
        assert!(cancelled.iter().all(|task| task.cancel.is_cancelled()));
        assert_eq!(queue.len(), 3);
        assert!(!queue.contains_key(&PageKey::full_page(DOC, 2, ScaleKey::from_scale(1.0))));
        assert_eq!(queue.stats().cancelled, 3);
    }

    #[test]
    fn test_promote() {
        let mut queue = RenderQueue::new();
        let task = page_task(&mut queue, 3, RequestPriority::Prefetch, 0);
        let key = task.key;
        queue.enqueue(task);

        assert!(queue.promote(&key, RequestPriority::Visible));
        assert_eq!(queue.get(&key).unwrap().priority, RequestPriority::Visible);
        // Never demotes
        assert!(queue.promote(&key, RequestPriority::Prefetch));
        assert_eq!(queue.get(&key).unwrap().priority, RequestPriority::Visible);
        assert!(!queue.promote(&PageKey::full_page(DOC, 4, key.scale), RequestPriority::Visible));
    }

    #[test]
    fn test_requeue_keeps_submission_order() {
        let mut queue = RenderQueue::new();
        let early = page_task(&mut queue, 4, RequestPriority::Visible, 0);
        let late = page_task(&mut queue, 6, RequestPriority::Visible, 0);
        queue.enqueue(early);
        queue.enqueue(late);

        let center = ViewportCenter::new(DOC, 5);
        let first = queue.dequeue_highest(&center, 0).unwrap();
        assert_eq!(first.key.page_index, 4);
        queue.requeue(first);

        assert_eq!(queue.dequeue_highest(&center, 0).unwrap().key.page_index, 4);
        assert_eq!(queue.stats().submitted, 2);
    }

    proptest! {
        #[test]
        fn prop_dequeue_distances_non_decreasing(
            pages in proptest::collection::vec(0u32..50, 1..40),
            center in 0u32..50,
        ) {
            let mut queue = RenderQueue::new();
            for page in pages {
                let task = page_task(&mut queue, page, RequestPriority::Visible, 0);
                queue.enqueue(task);
            }

            let center = ViewportCenter::new(DOC, center);
            let distances: Vec<u32> = std::iter::from_fn(|| queue.dequeue_highest(&center, 0))
                .map(|task| task.key.page_index.abs_diff(center.page))
                .collect();
            prop_assert!(distances.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }
}
