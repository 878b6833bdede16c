//! Page render coordinator
//!
//! Owns the raster cache, the render queue and every key's render state, all
//! on the calling thread. Workers only ever talk back through replies, which
//! are drained by [`PageRenderCoordinator::pump`].
//!
//! Each key moves through
//! `Unrequested -> Queued -> Rendering -> Cached`. A failed render is queued
//! again once on a different worker; the second failure is persistent and
//! the sink is told to show a placeholder.
//!
//! Zoom and scroll-mode changes start a new generation. Work from an older
//! generation is cancelled where it is still queued and discarded where it
//! comes back, so a bitmap from before the change can never be committed.

use crate::config::ViewerConfig;
use crate::error::{ViewerError, ViewerResult};
use crate::presentation::PresentationSink;
use folio_cache::{CacheStats, RasterCache};
use folio_render::{
    uses_tiling, DocId, FontEnvironment, PageKey, RasterBackend, RasterError, RasterResult,
    ScaleKey, TileGrid,
};
use folio_scheduler::{
    CancellationToken, DocumentInfo, QueueStats, RenderQueue, RenderTask, RequestPriority, TaskId,
    ViewportCenter, ViewportEvent, WorkerFailure, WorkerId, WorkerOutcome, WorkerPool, WorkerReply,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest single wait inside [`PageRenderCoordinator::pump_until_idle`]
const PUMP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScrollMode {
    Continuous,
    SinglePage,
}

/// Render state of one key, or aggregated over the keys of one page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageRenderState {
    Unrequested,
    Queued,
    Rendering,
    Cached,
    Failed { persistent: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub generation: u64,
    pub scale: f32,
    pub queued: usize,
    pub in_flight: usize,
    pub committed: u64,
    /// Replies dropped because their generation passed or their key was
    /// invalidated while they were rendering
    pub stale_discarded: u64,
    pub retries: u64,
    pub persistent_failures: u64,
    pub load_failovers: u64,
    pub open_handles: usize,
    pub queue: QueueStats,
    pub cache: CacheStats,
}

struct OpenDocument {
    bytes: Arc<[u8]>,
    info: DocumentInfo,
}

/// State of one key plus the task currently responsible for it
///
/// Replies from any other task are not allowed to change the key.
#[derive(Debug, Clone, Copy)]
struct KeyEntry {
    state: PageRenderState,
    task: Option<TaskId>,
}

struct InFlight {
    key: PageKey,
    worker: WorkerId,
    cancel: CancellationToken,
}

pub struct PageRenderCoordinator<S: PresentationSink> {
    config: ViewerConfig,
    pool: WorkerPool,
    cache: RasterCache,
    queue: RenderQueue,
    sink: S,
    documents: HashMap<DocId, OpenDocument>,
    active: Option<DocId>,
    next_doc: u64,
    generation: u64,
    scale: ScaleKey,
    scroll_mode: ScrollMode,
    center_page: u32,
    focus: (f32, f32),
    visible: Vec<u32>,
    keys: HashMap<PageKey, KeyEntry>,
    in_flight: HashMap<TaskId, InFlight>,
    committed: u64,
    stale_discarded: u64,
    retries: u64,
    persistent_failures: u64,
    load_failovers: u64,
    shut_down: bool,
}

impl<S: PresentationSink> PageRenderCoordinator<S> {
    pub fn new(
        backend: Arc<dyn RasterBackend>,
        fonts: Arc<dyn FontEnvironment>,
        config: ViewerConfig,
        sink: S,
    ) -> ViewerResult<Self> {
        config.validate()?;
        let pool = WorkerPool::new(backend, fonts, config.pool_config())?;
        let cache = RasterCache::new(&config.cache);
        let scale = ScaleKey::from_scale(config.initial_scale);

        tracing::debug!(workers = pool.num_workers(), %scale, "render coordinator started");

        Ok(Self {
            config,
            pool,
            cache,
            queue: RenderQueue::new(),
            sink,
            documents: HashMap::new(),
            active: None,
            next_doc: 0,
            generation: 0,
            scale,
            scroll_mode: ScrollMode::Continuous,
            center_page: 0,
            focus: (0.5, 0.5),
            visible: Vec::new(),
            keys: HashMap::new(),
            in_flight: HashMap::new(),
            committed: 0,
            stale_discarded: 0,
            retries: 0,
            persistent_failures: 0,
            load_failovers: 0,
            shut_down: false,
        })
    }

    /// Load a document on a worker and make it the active document
    ///
    /// A worker that fails to load the document is never asked again; the
    /// load moves on to the next worker until one succeeds or none is left.
    pub fn open_document(&mut self, bytes: impl Into<Arc<[u8]>>) -> ViewerResult<DocId> {
        self.ensure_running()?;
        let bytes = bytes.into();
        self.next_doc += 1;
        let doc = DocId::new(self.next_doc);
        let timeout = self.config.load_timeout();
        let mut last_failure = None;

        while let Some(worker) = self.idle_worker_for(doc, timeout)? {
            if !self.pool.load(worker, doc, bytes.clone()) {
                return Err(ViewerError::ShutDown);
            }

            match self.await_load(worker, doc, timeout)? {
                Ok(info) => {
                    tracing::info!(%doc, worker, pages = info.page_count, "document opened");
                    self.documents.insert(doc, OpenDocument { bytes, info });
                    self.activate(Some(doc));
                    return Ok(doc);
                }
                Err(failure) => {
                    self.load_failovers += 1;
                    tracing::warn!(
                        %doc,
                        worker,
                        %failure,
                        "document load failed, trying another worker"
                    );
                    last_failure = Some(failure);
                }
            }
        }

        // Forget the per-worker failure marks for an id that is never used again
        self.pool.unload_document(doc);
        let failure = last_failure.unwrap_or_else(|| WorkerFailure::DocumentLoadFailure {
            doc,
            error: RasterError::Load("no render worker available".to_owned()),
        });
        tracing::error!(%doc, %failure, "document unrenderable");
        Err(ViewerError::DocumentUnrenderable(failure))
    }

    /// Cancel everything for `doc`, release its bitmaps and close its handles
    /// on every worker
    pub fn close_document(&mut self, doc: DocId) -> ViewerResult<()> {
        if !self.documents.contains_key(&doc) {
            return Err(ViewerError::UnknownDocument(doc));
        }

        let cancelled = self.queue.cancel_all(|task| task.key.doc == doc).len();
        let aborted = self.abort_in_flight(|key| key.doc == doc);
        self.keys.retain(|key, _| key.doc != doc);
        let released = self.cache.invalidate_document(doc);
        self.pool.unload_document(doc);
        self.documents.remove(&doc);

        if self.active == Some(doc) {
            let next = self.documents.keys().max().copied();
            self.activate(next);
        }

        tracing::info!(%doc, cancelled, aborted, released, "document closed");
        Ok(())
    }

    /// Ask for a page of the active document at the current scale
    ///
    /// Idempotent: a page already queued keeps its one task (raised to
    /// `priority` if higher), one rendering or cached is left alone.
    pub fn request_page(
        &mut self,
        page_index: u32,
        priority: RequestPriority,
    ) -> ViewerResult<PageRenderState> {
        self.ensure_running()?;
        let doc = self.active_document_id()?;
        self.check_page(doc, page_index)?;

        self.enqueue_page(doc, page_index, priority);
        self.dispatch();
        Ok(self.page_state(page_index))
    }

    /// Clear a persistent failure and request the page again
    pub fn retry_page(&mut self, page_index: u32) -> ViewerResult<PageRenderState> {
        self.ensure_running()?;
        let doc = self.active_document_id()?;
        self.check_page(doc, page_index)?;

        for (key, _) in self.keys_for_page(doc, page_index) {
            if matches!(self.key_state(&key), PageRenderState::Failed { .. }) {
                self.keys.remove(&key);
            }
        }
        tracing::debug!(%doc, page = page_index, "retrying page");

        self.request_page(page_index, RequestPriority::Visible)
    }

    /// The page's content changed (rotation, transform): drop every bitmap of
    /// it and render again if it is on screen
    pub fn invalidate_page(&mut self, page_index: u32) -> ViewerResult<()> {
        self.ensure_running()?;
        let doc = self.active_document_id()?;
        self.check_page(doc, page_index)?;

        let on_page = |key: &PageKey| key.doc == doc && key.page_index == page_index;
        let cancelled = self.queue.cancel_all(|task| on_page(&task.key)).len();
        let aborted = self.abort_in_flight(on_page);
        self.keys.retain(|key, _| !on_page(key));
        let released = self.cache.invalidate(doc, page_index);

        tracing::debug!(%doc, page = page_index, cancelled, aborted, released, "page invalidated");

        if self.visible.contains(&page_index) || self.center_page == page_index {
            self.enqueue_page(doc, page_index, RequestPriority::Visible);
            self.dispatch();
        }
        Ok(())
    }

    /// Switch the render scale. Returns whether the quantized scale changed.
    ///
    /// Scales above `max_scale` are clamped to it. A change starts a new
    /// generation, cancels all queued work, releases every bitmap at another
    /// scale and requests the visible neighbourhood again at the new scale.
    pub fn on_zoom_changed(&mut self, new_scale: f32) -> ViewerResult<bool> {
        self.ensure_running()?;
        if !new_scale.is_finite() || new_scale <= 0.0 {
            return Err(ViewerError::InvalidScale(new_scale));
        }

        let max_scale = self.config.max_scale;
        if new_scale > max_scale {
            tracing::debug!(requested = new_scale, max_scale, "zoom clamped");
        }
        let scale = ScaleKey::from_scale(new_scale.min(max_scale));
        if scale == self.scale {
            return Ok(false);
        }

        let previous = self.scale;
        self.scale = scale;
        self.advance_generation();
        let released = self.cache.retain_scale(scale);
        self.keys.retain(|key, _| key.scale == scale);

        tracing::info!(
            from = %previous,
            to = %scale,
            generation = self.generation,
            released,
            tiled = uses_tiling(scale),
            "zoom changed"
        );

        self.refresh_view();
        Ok(true)
    }

    /// Switch between continuous and single-page scrolling. Cached bitmaps
    /// stay valid; queued work is replaced.
    pub fn on_scroll_mode_changed(&mut self, mode: ScrollMode) -> ViewerResult<bool> {
        self.ensure_running()?;
        if mode == self.scroll_mode {
            return Ok(false);
        }

        self.scroll_mode = mode;
        self.advance_generation();
        tracing::info!(?mode, generation = self.generation, "scroll mode changed");

        self.refresh_view();
        Ok(true)
    }

    /// Scrolling stopped on `center_page`: re-tier the cache around it and
    /// prefetch its neighbours
    pub fn on_scroll_settled(&mut self, center_page: u32) -> ViewerResult<()> {
        self.ensure_running()?;
        let doc = self.active_document_id()?;
        self.check_page(doc, center_page)?;

        self.center_page = center_page;
        self.cache.set_center_page(doc, center_page);
        self.forget_evicted();

        tracing::debug!(%doc, page = center_page, "scroll settled");
        self.refresh_view();
        Ok(())
    }

    /// Pages now intersecting the viewport; out-of-range pages are ignored
    pub fn on_visible_pages(&mut self, pages: &[u32]) -> ViewerResult<()> {
        self.ensure_running()?;
        let doc = self.active_document_id()?;
        let page_count = self.page_count().unwrap_or(0);

        self.visible = pages.iter().copied().filter(|&page| page < page_count).collect();
        for page in self.visible.clone() {
            self.enqueue_page(doc, page, RequestPriority::Visible);
        }
        self.dispatch();
        Ok(())
    }

    /// Apply one event from a [`folio_scheduler::ViewportTracker`]
    pub fn handle_viewport_event(&mut self, event: &ViewportEvent) -> ViewerResult<()> {
        match event {
            ViewportEvent::VisibilityChanged { visible, near } => {
                let pages: Vec<u32> = visible.iter().map(|visibility| visibility.page).collect();
                self.on_visible_pages(&pages)?;
                self.prefetch(near);
                self.dispatch();
                Ok(())
            }
            ViewportEvent::CenterPageChanged(page) => {
                self.ensure_running()?;
                let last = self.page_count().unwrap_or(1).saturating_sub(1);
                self.center_page = (*page).min(last);
                Ok(())
            }
            ViewportEvent::Settled { center_page } => self.on_scroll_settled(*center_page),
        }
    }

    /// Point of interest on the center page, as fractions of its size. Tiles
    /// nearest to it render first.
    pub fn set_focus(&mut self, fx: f32, fy: f32) {
        self.focus = (fx.clamp(0.0, 1.0), fy.clamp(0.0, 1.0));
    }

    /// Drain ready worker replies, commit results and hand queued work to
    /// idle workers. Never blocks. Returns the number of replies handled.
    pub fn pump(&mut self) -> usize {
        if self.shut_down {
            return 0;
        }

        let mut handled = 0;
        while let Some(reply) = self.pool.try_recv() {
            self.handle_reply(reply);
            handled += 1;
        }
        self.dispatch();
        handled
    }

    /// Pump until nothing is queued or rendering. Returns `false` on timeout.
    pub fn pump_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if self.is_idle() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if let Some(reply) = self.pool.recv_timeout((deadline - now).min(PUMP_INTERVAL)) {
                self.handle_reply(reply);
            }
        }
    }

    /// Cancel all work, release every bitmap and stop the workers. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }

        let cancelled = self.queue.cancel_all(|_| true).len();
        for flight in self.in_flight.values() {
            flight.cancel.cancel();
        }
        self.in_flight.clear();
        self.keys.clear();
        let released = self.cache.clear();
        self.pool.shutdown();
        self.documents.clear();
        self.active = None;
        self.shut_down = true;

        tracing::info!(cancelled, released, "render coordinator shut down");
    }

    /// State of one key
    pub fn key_state(&self, key: &PageKey) -> PageRenderState {
        match self.keys.get(key) {
            // Evicted since it was committed
            Some(entry) if entry.state == PageRenderState::Cached && !self.cache.contains(key) => {
                PageRenderState::Unrequested
            }
            Some(entry) => entry.state,
            None => PageRenderState::Unrequested,
        }
    }

    /// State of a page of the active document at the current scale, over
    /// all of its tiles when tiled
    pub fn page_state(&self, page_index: u32) -> PageRenderState {
        let Some(doc) = self.active else {
            return PageRenderState::Unrequested;
        };
        let states: Vec<PageRenderState> = self
            .keys_for_page(doc, page_index)
            .iter()
            .map(|(key, _)| self.key_state(key))
            .collect();
        aggregate_state(&states)
    }

    /// Keys making up a page of the active document at the current scale
    pub fn page_keys(&self, page_index: u32) -> Vec<PageKey> {
        match self.active {
            Some(doc) => {
                self.keys_for_page(doc, page_index).into_iter().map(|(key, _)| key).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            generation: self.generation,
            scale: self.scale.as_f32(),
            queued: self.queue.len(),
            in_flight: self.in_flight.len(),
            committed: self.committed,
            stale_discarded: self.stale_discarded,
            retries: self.retries,
            persistent_failures: self.persistent_failures,
            load_failovers: self.load_failovers,
            open_handles: self.pool.open_handles(),
            queue: self.queue.stats(),
            cache: self.cache.stats(),
        }
    }

    pub fn cache(&self) -> &RasterCache {
        &self.cache
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn scale(&self) -> ScaleKey {
        self.scale
    }

    pub fn scroll_mode(&self) -> ScrollMode {
        self.scroll_mode
    }

    pub fn active_document(&self) -> Option<DocId> {
        self.active
    }

    pub fn document_info(&self, doc: DocId) -> Option<&DocumentInfo> {
        self.documents.get(&doc).map(|document| &document.info)
    }

    /// Page count of the active document
    pub fn page_count(&self) -> Option<u32> {
        self.active.and_then(|doc| self.document_info(doc)).map(|info| info.page_count)
    }

    pub fn center_page(&self) -> u32 {
        self.center_page
    }

    /// Document handles open across all workers
    pub fn open_handles(&self) -> usize {
        self.pool.open_handles()
    }

    /// Nothing queued and nothing rendering
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    fn ensure_running(&self) -> ViewerResult<()> {
        if self.shut_down {
            Err(ViewerError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn active_document_id(&self) -> ViewerResult<DocId> {
        self.active.ok_or(ViewerError::NoActiveDocument)
    }

    fn check_page(&self, doc: DocId, page_index: u32) -> ViewerResult<()> {
        let page_count = self
            .document_info(doc)
            .map(|info| info.page_count)
            .ok_or(ViewerError::UnknownDocument(doc))?;
        if page_index >= page_count {
            return Err(ViewerError::PageOutOfRange { page: page_index, page_count });
        }
        Ok(())
    }

    fn activate(&mut self, doc: Option<DocId>) {
        self.active = doc;
        self.center_page = 0;
        self.visible.clear();
        if let Some(doc) = doc {
            self.cache.set_center_page(doc, 0);
        }
    }

    /// Full-page key, or one key per tile when the current scale is tiled
    fn keys_for_page(&self, doc: DocId, page_index: u32) -> Vec<(PageKey, Option<TileGrid>)> {
        let Some(size) = self
            .document_info(doc)
            .and_then(|info| info.page_sizes.get(page_index as usize).copied())
        else {
            return Vec::new();
        };

        let scale = self.scale;
        if uses_tiling(scale) {
            let grid = TileGrid::for_page(size, scale);
            grid.coords()
                .map(|coord| (PageKey::tile(doc, page_index, scale, coord), Some(grid)))
                .collect()
        } else {
            vec![(PageKey::full_page(doc, page_index, scale), None)]
        }
    }

    fn enqueue_page(&mut self, doc: DocId, page_index: u32, priority: RequestPriority) {
        for (key, grid) in self.keys_for_page(doc, page_index) {
            match self.key_state(&key) {
                PageRenderState::Cached => {
                    // Touch for LRU and promotion
                    let _ = self.cache.get(&key);
                }
                PageRenderState::Queued => {
                    self.queue.promote(&key, priority);
                }
                PageRenderState::Rendering | PageRenderState::Failed { persistent: true } => {}
                PageRenderState::Unrequested | PageRenderState::Failed { persistent: false } => {
                    self.submit(key, grid, priority);
                }
            }
        }
    }

    fn submit(&mut self, key: PageKey, grid: Option<TileGrid>, priority: RequestPriority) {
        let id = self.queue.next_id();
        let mut task = RenderTask::new(id, key, priority, self.generation);
        if let Some(grid) = grid {
            task = task.with_grid(grid);
        }

        self.keys.insert(key, KeyEntry { state: PageRenderState::Queued, task: Some(id) });
        self.queue.enqueue(task);
    }

    fn prefetch(&mut self, pages: &[u32]) {
        let Some(doc) = self.active else {
            return;
        };
        let page_count = self.page_count().unwrap_or(0);
        for &page in pages.iter().filter(|&&page| page < page_count) {
            self.enqueue_page(doc, page, RequestPriority::Prefetch);
        }
    }

    /// Request the visible pages and the center page, then prefetch around the
    /// center
    fn refresh_view(&mut self) {
        let Some(doc) = self.active else {
            return;
        };
        let page_count = self.page_count().unwrap_or(0);

        let mut visible = self.visible.clone();
        if !visible.contains(&self.center_page) {
            visible.push(self.center_page);
        }
        for &page in visible.iter().filter(|&&page| page < page_count) {
            self.enqueue_page(doc, page, RequestPriority::Visible);
        }

        let near: Vec<u32> =
            prefetch_pages(self.center_page, page_count, self.config.prefetch_radius)
                .into_iter()
                .filter(|page| !visible.contains(page))
                .collect();
        self.prefetch(&near);
        self.dispatch();
    }

    fn advance_generation(&mut self) {
        self.generation += 1;
        let generation = self.generation;

        let cancelled = self.queue.cancel_all(|task| task.is_stale(generation));
        for task in &cancelled {
            self.disown(task.key, task.id);
        }
        let aborted = self.abort_in_flight(|_| true);

        tracing::debug!(generation, cancelled = cancelled.len(), aborted, "generation advanced");
    }

    /// Trip the tokens of in-flight tasks whose key matches and detach them
    /// from their keys, so whatever they send back is discarded
    fn abort_in_flight<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&PageKey) -> bool,
    {
        let aborted: Vec<(PageKey, TaskId)> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| predicate(&flight.key))
            .map(|(&id, flight)| {
                flight.cancel.cancel();
                tracing::trace!(
                    worker = flight.worker,
                    key = %flight.key,
                    "in-flight task aborted"
                );
                (flight.key, id)
            })
            .collect();

        for &(key, id) in &aborted {
            self.disown(key, id);
        }
        aborted.len()
    }

    fn disown(&mut self, key: PageKey, id: TaskId) {
        if self.keys.get(&key).is_some_and(|entry| entry.task == Some(id)) {
            self.keys.remove(&key);
        }
    }

    fn owns(&self, task: &RenderTask) -> bool {
        !task.is_stale(self.generation)
            && self.documents.contains_key(&task.key.doc)
            && self.keys.get(&task.key).is_some_and(|entry| entry.task == Some(task.id))
    }

    fn set_state(&mut self, key: PageKey, state: PageRenderState, task: Option<TaskId>) {
        self.keys.insert(key, KeyEntry { state, task });
    }

    /// Drop `Cached` entries whose bitmaps the cache has since evicted
    fn forget_evicted(&mut self) {
        let cache = &self.cache;
        self.keys
            .retain(|key, entry| entry.state != PageRenderState::Cached || cache.contains(key));
    }

    fn viewport_center(&self) -> Option<ViewportCenter> {
        let (fx, fy) = self.focus;
        self.active.map(|doc| ViewportCenter::new(doc, self.center_page).with_focus(fx, fy))
    }

    /// Hand queued tasks to idle workers, best first, until either runs out
    fn dispatch(&mut self) {
        let Some(center) = self.viewport_center() else {
            return;
        };
        let mut deferred = Vec::new();

        while self.pool.idle_count() > 0 {
            let Some(task) = self.queue.dequeue_highest(&center, self.generation) else {
                break;
            };

            let doc = task.key.doc;
            let page_index = task.key.page_index;
            let Some(bytes) = self.documents.get(&doc).map(|document| document.bytes.clone())
            else {
                continue;
            };

            if !self.pool.has_capable_worker(doc, None) {
                let failure = WorkerFailure::DocumentLoadFailure {
                    doc,
                    error: RasterError::Load("no worker can load the document".to_owned()),
                };
                self.fail_persistently(task, failure);
                continue;
            }

            let mut worker = self.pool.pick_worker(doc, page_index, task.avoid_worker);
            if worker.is_none() && !self.pool.has_capable_worker(doc, task.avoid_worker) {
                // The worker to avoid is the only one left that can load it
                worker = self.pool.pick_worker(doc, page_index, None);
            }
            let Some(worker) = worker else {
                deferred.push(task);
                continue;
            };

            let id = task.id;
            let key = task.key;
            let cancel = task.cancel.clone();
            match self.pool.dispatch(worker, task, bytes) {
                Ok(()) => {
                    tracing::trace!(
                        worker,
                        doc = %key.doc,
                        page = key.page_index,
                        scale = %key.scale,
                        generation = self.generation,
                        "task dispatched"
                    );
                    self.in_flight.insert(id, InFlight { key, worker, cancel });
                    if self.keys.get(&key).is_some_and(|entry| entry.task == Some(id)) {
                        self.set_state(key, PageRenderState::Rendering, Some(id));
                    }
                }
                Err(task) => {
                    tracing::warn!(worker, "render worker unavailable");
                    deferred.push(task);
                    break;
                }
            }
        }

        for task in deferred {
            self.queue.requeue(task);
        }
    }

    fn handle_reply(&mut self, reply: WorkerReply) {
        self.handle_outcome(reply.worker, reply.outcome);
    }

    fn handle_outcome(&mut self, worker: WorkerId, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::Loaded { doc, .. } => {
                if !self.documents.contains_key(&doc) {
                    // Load finished after open_document gave up on it
                    tracing::debug!(%doc, worker, "late document load, unloading");
                    self.pool.unload_document(doc);
                }
            }
            WorkerOutcome::LoadFailed { doc, failure, task } => {
                let Some(task) = task else {
                    return;
                };
                self.in_flight.remove(&task.id);
                if !self.owns(&task) {
                    self.discard(&task, "load failure");
                    return;
                }

                if self.pool.has_capable_worker(doc, None) {
                    self.load_failovers += 1;
                    tracing::debug!(
                        %doc,
                        worker,
                        %failure,
                        "document load failed on worker, rerouting task"
                    );
                    self.set_state(task.key, PageRenderState::Queued, Some(task.id));
                    self.queue.requeue(task);
                } else {
                    self.fail_persistently(task, failure);
                }
            }
            WorkerOutcome::Rendered { task, result } => {
                self.in_flight.remove(&task.id);
                self.commit(task, result);
            }
            WorkerOutcome::Failed { task, failure } => {
                self.in_flight.remove(&task.id);
                self.handle_failure(worker, task, failure);
            }
            WorkerOutcome::Cancelled { task } => {
                self.in_flight.remove(&task.id);
                if self.owns(&task) {
                    self.keys.remove(&task.key);
                } else {
                    self.discard(&task, "cancelled");
                }
            }
        }
    }

    fn discard(&mut self, task: &RenderTask, reason: &'static str) {
        self.stale_discarded += 1;
        tracing::debug!(
            doc = %task.key.doc,
            page = task.key.page_index,
            scale = %task.key.scale,
            generation = task.created_at_generation,
            current = self.generation,
            reason,
            "stale result discarded"
        );
    }

    fn commit(&mut self, task: RenderTask, result: RasterResult) {
        if !self.owns(&task) {
            self.discard(&task, "rendered");
            return;
        }

        let key = task.key;
        self.cache.put(key, result, self.center_page);
        self.set_state(key, PageRenderState::Cached, None);
        self.committed += 1;

        if let Some(bitmap) = self.cache.peek(&key) {
            if key.is_tiled() {
                self.sink.on_tile_ready(bitmap);
            } else {
                self.sink.on_page_ready(bitmap);
            }
        }
    }

    fn handle_failure(&mut self, worker: WorkerId, task: RenderTask, failure: WorkerFailure) {
        if !self.owns(&task) {
            self.discard(&task, "failed");
            return;
        }

        if task.attempt < self.config.max_render_attempts {
            let retry = task.retry(self.queue.next_id(), worker);
            self.retries += 1;
            tracing::debug!(
                doc = %task.key.doc,
                page = task.key.page_index,
                worker,
                attempt = retry.attempt,
                %failure,
                "render failed, retrying on another worker"
            );
            self.set_state(retry.key, PageRenderState::Queued, Some(retry.id));
            self.queue.enqueue(retry);
        } else {
            self.fail_persistently(task, failure);
        }
    }

    fn fail_persistently(&mut self, task: RenderTask, failure: WorkerFailure) {
        self.persistent_failures += 1;
        tracing::warn!(
            doc = %task.key.doc,
            page = task.key.page_index,
            scale = %task.key.scale,
            attempt = task.attempt,
            %failure,
            "render failed persistently"
        );
        self.set_state(task.key, PageRenderState::Failed { persistent: true }, None);
        self.sink.on_render_failed(task.key, &failure);
    }

    fn idle_worker_for(&mut self, doc: DocId, timeout: Duration) -> ViewerResult<Option<WorkerId>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(worker) = self.pool.pick_worker(doc, 0, None) {
                return Ok(Some(worker));
            }
            if !self.pool.has_capable_worker(doc, None) {
                return Ok(None);
            }

            // Every capable worker is busy rendering
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(reply) = self.pool.recv_timeout(remaining) else {
                return Err(ViewerError::LoadTimeout(timeout));
            };
            self.handle_reply(reply);
        }
    }

    fn await_load(
        &mut self,
        worker: WorkerId,
        doc: DocId,
        timeout: Duration,
    ) -> ViewerResult<Result<DocumentInfo, WorkerFailure>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(reply) = self.pool.recv_timeout(remaining) else {
                return Err(ViewerError::LoadTimeout(timeout));
            };

            match reply.outcome {
                WorkerOutcome::Loaded { doc: loaded, info } if loaded == doc => return Ok(Ok(info)),
                WorkerOutcome::LoadFailed { doc: failed, failure, task: None }
                    if failed == doc && reply.worker == worker =>
                {
                    return Ok(Err(failure))
                }
                outcome => self.handle_outcome(reply.worker, outcome),
            }
        }
    }
}

/// Pages within `radius` of `center`, nearest first, lower before upper
pub fn prefetch_pages(center: u32, page_count: u32, radius: u32) -> Vec<u32> {
    if page_count == 0 {
        return Vec::new();
    }

    let max = page_count - 1;
    let mut pages = Vec::new();
    for offset in 1..=radius {
        if let Some(lower) = center.checked_sub(offset) {
            if lower <= max {
                pages.push(lower);
            }
        }
        let upper = center.saturating_add(offset);
        if upper <= max {
            pages.push(upper);
        }
    }
    pages
}

/// Failed beats Rendering beats Queued; Cached only when every key is
fn aggregate_state(states: &[PageRenderState]) -> PageRenderState {
    if states.is_empty() {
        return PageRenderState::Unrequested;
    }
    let failed = states.iter().find(|state| matches!(state, PageRenderState::Failed { .. }));
    if let Some(failed) = failed {
        return *failed;
    }
    if states.contains(&PageRenderState::Rendering) {
        return PageRenderState::Rendering;
    }
    if states.contains(&PageRenderState::Queued) {
        return PageRenderState::Queued;
    }
    if states.iter().all(|state| *state == PageRenderState::Cached) {
        return PageRenderState::Cached;
    }
    PageRenderState::Unrequested
}
