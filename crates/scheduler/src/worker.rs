//! Render worker pool
//!
//! Each worker is an OS thread with its own command channel and its own map of
//! loaded document handles. Handles never leave the thread that loaded them.
//! All workers reply on one shared channel that the coordinating thread
//! drains; the pool tracks which workers are busy so that each holds at most
//! one task at a time. A fully busy pool is backpressure: tasks simply stay
//! queued until a reply frees a worker.

use crate::task::{RenderTask, WorkerId};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use folio_render::{
    DocId, FontEnvironment, PageKey, PageRasterizer, PageSize, RasterBackend, RasterError,
    RasterResult, TileGrid,
};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Fewest workers a pool runs; a retry needs a second worker to move to
pub const MIN_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 8;

/// Configuration for the render worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads to spawn.
    /// Default: available parallelism, clamped to 2..=8.
    pub num_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { num_workers: default_worker_count() }
    }
}

impl WorkerPoolConfig {
    /// `num_workers` is clamped to `MIN_WORKERS..=MAX_WORKERS`
    pub fn new(num_workers: usize) -> Self {
        Self { num_workers: num_workers.clamp(MIN_WORKERS, MAX_WORKERS) }
    }
}

/// Page geometry reported after a successful load
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentInfo {
    pub page_count: u32,
    pub page_sizes: Vec<PageSize>,
}

impl DocumentInfo {
    fn from_rasterizer(rasterizer: &dyn PageRasterizer) -> Result<Self, RasterError> {
        let page_sizes = rasterizer.page_sizes()?;
        Ok(Self { page_count: rasterizer.page_count(), page_sizes })
    }
}

#[derive(Debug)]
pub enum WorkerCommand {
    Load { doc: DocId, bytes: Arc<[u8]> },
    Render { task: RenderTask, bytes: Arc<[u8]> },
    Unload { doc: DocId },
    Shutdown,
}

/// Failures a worker reports instead of panicking across the thread boundary
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkerFailure {
    #[error("rasterize failed for {key}: {error}")]
    RasterizeFailure { key: PageKey, error: RasterError },
    #[error("{doc} failed to load: {error}")]
    DocumentLoadFailure { doc: DocId, error: RasterError },
}

#[derive(Debug)]
pub enum WorkerOutcome {
    Loaded { doc: DocId, info: DocumentInfo },
    /// `task` is set when the load happened lazily for a render
    LoadFailed { doc: DocId, failure: WorkerFailure, task: Option<RenderTask> },
    Rendered { task: RenderTask, result: RasterResult },
    Failed { task: RenderTask, failure: WorkerFailure },
    Cancelled { task: RenderTask },
}

#[derive(Debug)]
pub struct WorkerReply {
    pub worker: WorkerId,
    pub outcome: WorkerOutcome,
}

struct WorkerHandle {
    commands: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
    busy: bool,
    /// Documents this worker failed to load; it is never asked again
    failed: HashSet<DocId>,
}

/// Render worker pool.
///
/// Owned by the coordinating thread; every method takes `&mut self` or `&self`
/// on that thread only.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    replies: Receiver<WorkerReply>,
    cursor: usize,
    affinity: HashMap<(DocId, u32), WorkerId>,
    open_handles: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `config.num_workers` worker threads.
    pub fn new(
        backend: Arc<dyn RasterBackend>,
        fonts: Arc<dyn FontEnvironment>,
        config: WorkerPoolConfig,
    ) -> io::Result<Self> {
        let (reply_tx, replies) = unbounded();
        let open_handles = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(config.num_workers);

        for id in 0..config.num_workers.clamp(MIN_WORKERS, MAX_WORKERS) {
            let (commands, command_rx) = unbounded();
            let replies = reply_tx.clone();
            let backend = backend.clone();
            let fonts = fonts.clone();
            let open_handles = open_handles.clone();

            // Document handles are not `Send`; the worker state is built on its own thread
            let thread = thread::Builder::new()
                .name(format!("folio-render-worker-{}", id))
                .spawn(move || {
                    Worker {
                        id,
                        commands: command_rx,
                        replies,
                        backend,
                        fonts,
                        open_handles,
                        documents: HashMap::new(),
                    }
                    .run()
                })?;

            workers.push(WorkerHandle {
                commands,
                thread: Some(thread),
                busy: false,
                failed: HashSet::new(),
            });
        }

        tracing::debug!(workers = workers.len(), backend = backend.name(), "worker pool started");

        Ok(Self { workers, replies, cursor: 0, affinity: HashMap::new(), open_handles })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn idle_count(&self) -> usize {
        self.workers.iter().filter(|worker| !worker.busy).count()
    }

    /// Workers currently holding a task or a load
    pub fn in_flight(&self) -> usize {
        self.workers.len() - self.idle_count()
    }

    /// Document handles currently open across all workers
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }

    /// Whether any worker (other than `exclude`) may still load `doc`
    pub fn has_capable_worker(&self, doc: DocId, exclude: Option<WorkerId>) -> bool {
        self.workers
            .iter()
            .enumerate()
            .any(|(id, worker)| Some(id) != exclude && !worker.failed.contains(&doc))
    }

    /// Choose an idle worker for a page of `doc`
    ///
    /// Prefers the worker that last rendered the same page, then round-robin.
    /// Workers that failed to load `doc` and `exclude` are skipped.
    pub fn pick_worker(
        &mut self,
        doc: DocId,
        page_index: u32,
        exclude: Option<WorkerId>,
    ) -> Option<WorkerId> {
        let usable = |id: WorkerId, worker: &WorkerHandle| {
            !worker.busy && Some(id) != exclude && !worker.failed.contains(&doc)
        };

        if let Some(&id) = self.affinity.get(&(doc, page_index)) {
            if self.workers.get(id).is_some_and(|worker| usable(id, worker)) {
                return Some(id);
            }
        }

        let count = self.workers.len();
        let picked = (0..count)
            .map(|offset| (self.cursor + offset) % count)
            .find(|&id| usable(id, &self.workers[id]))?;
        self.cursor = (picked + 1) % count;
        Some(picked)
    }

    /// Send a render task to an idle worker. Hands the task back if the worker
    /// is gone.
    pub fn dispatch(
        &mut self,
        worker: WorkerId,
        task: RenderTask,
        bytes: Arc<[u8]>,
    ) -> Result<(), RenderTask> {
        let Some(handle) = self.workers.get_mut(worker) else {
            return Err(task);
        };

        let slot = (task.key.doc, task.key.page_index);
        if handle.commands.send(WorkerCommand::Render { task: task.clone(), bytes }).is_err() {
            return Err(task);
        }
        handle.busy = true;
        self.affinity.insert(slot, worker);
        Ok(())
    }

    /// Ask an idle worker to load a document ahead of rendering
    pub fn load(&mut self, worker: WorkerId, doc: DocId, bytes: Arc<[u8]>) -> bool {
        let Some(handle) = self.workers.get_mut(worker) else {
            return false;
        };
        if handle.commands.send(WorkerCommand::Load { doc, bytes }).is_err() {
            return false;
        }
        handle.busy = true;
        true
    }

    /// Drop `doc` on every worker and forget everything known about it
    pub fn unload_document(&mut self, doc: DocId) {
        for handle in &mut self.workers {
            handle.failed.remove(&doc);
            let _ = handle.commands.send(WorkerCommand::Unload { doc });
        }
        self.affinity.retain(|(affinity_doc, _), _| *affinity_doc != doc);
    }

    /// Next reply, if one is ready
    pub fn try_recv(&mut self) -> Option<WorkerReply> {
        let reply = self.replies.try_recv().ok()?;
        self.observe(&reply);
        Some(reply)
    }

    /// Wait up to `timeout` for the next reply
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<WorkerReply> {
        match self.replies.recv_timeout(timeout) {
            Ok(reply) => {
                self.observe(&reply);
                Some(reply)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Stop every worker and wait for them to exit. Idempotent.
    pub fn shutdown(&mut self) {
        for handle in &self.workers {
            let _ = handle.commands.send(WorkerCommand::Shutdown);
        }
        for (id, handle) in self.workers.iter_mut().enumerate() {
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    tracing::warn!(worker = id, "render worker exited by panic");
                }
            }
            handle.busy = false;
        }
    }

    fn observe(&mut self, reply: &WorkerReply) {
        let Some(handle) = self.workers.get_mut(reply.worker) else {
            return;
        };
        handle.busy = false;

        if let WorkerOutcome::LoadFailed { doc, .. } = &reply.outcome {
            handle.failed.insert(*doc);
            self.affinity.retain(|_, worker| *worker != reply.worker);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Available parallelism, clamped to `MIN_WORKERS..=MAX_WORKERS`
pub fn default_worker_count() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4).clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Worker-thread state
struct Worker {
    id: WorkerId,
    commands: Receiver<WorkerCommand>,
    replies: Sender<WorkerReply>,
    backend: Arc<dyn RasterBackend>,
    fonts: Arc<dyn FontEnvironment>,
    open_handles: Arc<AtomicUsize>,
    documents: HashMap<DocId, Box<dyn PageRasterizer>>,
}

impl Worker {
    fn run(mut self) {
        while let Ok(command) = self.commands.recv() {
            let outcome = match command {
                WorkerCommand::Load { doc, bytes } => match self.ensure_loaded(doc, &bytes) {
                    Ok(rasterizer) => match DocumentInfo::from_rasterizer(&**rasterizer) {
                        Ok(info) => WorkerOutcome::Loaded { doc, info },
                        Err(error) => WorkerOutcome::LoadFailed {
                            doc,
                            failure: WorkerFailure::DocumentLoadFailure { doc, error },
                            task: None,
                        },
                    },
                    Err(error) => WorkerOutcome::LoadFailed {
                        doc,
                        failure: WorkerFailure::DocumentLoadFailure { doc, error },
                        task: None,
                    },
                },
                WorkerCommand::Render { task, bytes } => self.render(task, &bytes),
                WorkerCommand::Unload { doc } => {
                    self.close(doc);
                    continue;
                }
                WorkerCommand::Shutdown => break,
            };

            if self.replies.send(WorkerReply { worker: self.id, outcome }).is_err() {
                break;
            }
        }

        let open: Vec<DocId> = self.documents.keys().copied().collect();
        for doc in open {
            self.close(doc);
        }
        tracing::trace!(worker = self.id, "render worker stopped");
    }

    fn ensure_loaded(
        &mut self,
        doc: DocId,
        bytes: &[u8],
    ) -> Result<&mut Box<dyn PageRasterizer>, RasterError> {
        if !self.documents.contains_key(&doc) {
            let backend = &self.backend;
            let fonts = self.fonts.as_ref();
            let loaded = panic::catch_unwind(AssertUnwindSafe(|| backend.load(bytes, fonts)))
                .map_err(|payload| RasterError::Panicked(panic_message(payload)))??;

            tracing::debug!(worker = self.id, %doc, pages = loaded.page_count(), "document loaded");
            self.open_handles.fetch_add(1, Ordering::AcqRel);
            self.documents.insert(doc, loaded);
        }

        self.documents
            .get_mut(&doc)
            .ok_or_else(|| RasterError::Load(format!("{doc} not loaded")))
    }

    fn close(&mut self, doc: DocId) {
        if self.documents.remove(&doc).is_some() {
            self.open_handles.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(worker = self.id, %doc, "document unloaded");
        }
    }

    fn render(&mut self, task: RenderTask, bytes: &[u8]) -> WorkerOutcome {
        if task.cancel.is_cancelled() {
            return WorkerOutcome::Cancelled { task };
        }

        let key = task.key;
        let worker = self.id;
        let rasterizer = match self.ensure_loaded(key.doc, bytes) {
            Ok(rasterizer) => rasterizer,
            Err(error) => {
                return WorkerOutcome::LoadFailed {
                    doc: key.doc,
                    failure: WorkerFailure::DocumentLoadFailure { doc: key.doc, error },
                    task: Some(task),
                }
            }
        };

        if task.cancel.is_cancelled() {
            return WorkerOutcome::Cancelled { task };
        }

        let rendered = rasterize(rasterizer.as_mut(), &task);
        if matches!(rendered, Err(RasterError::Panicked(_))) {
            // Handle state is unknown after a panic; reload on next use
            self.close(key.doc);
        }

        if task.cancel.is_cancelled() {
            return WorkerOutcome::Cancelled { task };
        }

        match rendered {
            Ok(result) => {
                tracing::trace!(
                    worker,
                    doc = %key.doc,
                    page = key.page_index,
                    scale = %key.scale,
                    generation = task.created_at_generation,
                    "rendered"
                );
                WorkerOutcome::Rendered { task, result }
            }
            Err(error) => {
                tracing::warn!(
                    worker,
                    doc = %key.doc,
                    page = key.page_index,
                    scale = %key.scale,
                    attempt = task.attempt,
                    %error,
                    "render failed"
                );
                let failure = WorkerFailure::RasterizeFailure { key, error };
                WorkerOutcome::Failed { task, failure }
            }
        }
    }
}

/// Render one task's full page or tile, checking the output dimensions
fn rasterize(
    rasterizer: &mut dyn PageRasterizer,
    task: &RenderTask,
) -> Result<RasterResult, RasterError> {
    let key = task.key;
    let size = rasterizer.page_size(key.page_index)?;
    let grid = task.grid.unwrap_or_else(|| TileGrid::for_page(size, key.scale));
    let page_px = (grid.page_width_px, grid.page_height_px);

    let region = match key.tile {
        Some(coord) => Some(
            grid.tile_rect(coord)
                .ok_or_else(|| RasterError::Render(format!("tile {coord:?} outside page grid")))?,
        ),
        None => None,
    };
    let expected = region.map_or(page_px, |rect| (rect.width, rect.height));

    let image = panic::catch_unwind(AssertUnwindSafe(|| {
        rasterizer.render(key.page_index, key.scale.as_f32(), region)
    }))
    .map_err(|payload| RasterError::Panicked(panic_message(payload)))??;

    RasterResult::from_image(key, image, expected, page_px, task.created_at_generation)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RequestPriority;
    use folio_render::{EmbeddedFontsOnly, RenderResult, RgbaImage, ScaleKey, TileCoord, TileRect};
    use image::Rgba;
    use std::time::Instant;

    /// Backend whose documents have `pages` letter pages. Bytes starting with
    /// `b"bad"` fail to load, page 13 panics, page 7 returns the wrong size.
    struct TestBackend;

    struct TestDoc {
        pages: u32,
    }

    impl RasterBackend for TestBackend {
        fn name(&self) -> &'static str {
            "test"
        }

        fn load(
            &self,
            bytes: &[u8],
            _fonts: &dyn FontEnvironment,
        ) -> RenderResult<Box<dyn PageRasterizer>> {
            if bytes.starts_with(b"bad") {
                return Err(RasterError::Load("corrupt".to_owned()));
            }
            Ok(Box::new(TestDoc { pages: bytes.len() as u32 }))
        }
    }

    impl PageRasterizer for TestDoc {
        fn page_count(&self) -> u32 {
            self.pages
        }

        fn page_size(&self, page_index: u32) -> RenderResult<PageSize> {
            if page_index < self.pages {
                Ok(PageSize { width_pt: 100.0, height_pt: 200.0 })
            } else {
                Err(RasterError::PageOutOfRange { page: page_index, page_count: self.pages })
            }
        }

        fn render(
            &mut self,
            page_index: u32,
            scale: f32,
            region: Option<TileRect>,
        ) -> RenderResult<RgbaImage> {
            if page_index == 13 {
                panic!("rasterizer blew up");
            }
            let (w, h) = match region {
                Some(rect) => (rect.width, rect.height),
                None => ((100.0 * scale).round() as u32, (200.0 * scale).round() as u32),
            };
            let w = if page_index == 7 { w + 1 } else { w };
            Ok(RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255])))
        }
    }

    fn pool(workers: usize) -> WorkerPool {
        let config = WorkerPoolConfig::new(workers);
        WorkerPool::new(Arc::new(TestBackend), Arc::new(EmbeddedFontsOnly), config).unwrap()
    }

    fn doc_bytes(pages: usize) -> Arc<[u8]> {
        vec![b'x'; pages].into()
    }

    fn task(id: u64, page: u32, scale: f32) -> RenderTask {
        let key = PageKey::full_page(DocId::new(1), page, ScaleKey::from_scale(scale));
        RenderTask::new(id, key, RequestPriority::Visible, 0)
    }

    fn wait(pool: &mut WorkerPool) -> WorkerReply {
        pool.recv_timeout(Duration::from_secs(5)).expect("worker reply")
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert!((2..=8).contains(&config.num_workers));
        assert_eq!(WorkerPoolConfig::new(0).num_workers, 2);
        assert_eq!(WorkerPoolConfig::new(1).num_workers, 2);
        assert_eq!(WorkerPoolConfig::new(64).num_workers, 8);
    }

    #[test]
    fn test_worker_pool_creation() {
        let mut pool = pool(3);
        assert_eq!(pool.num_workers(), 3);
        assert_eq!(pool.idle_count(), 3);
        pool.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_load_reports_page_geometry() {
        let mut pool = pool(2);
        let worker = pool.pick_worker(DocId::new(1), 0, None).unwrap();
        assert!(pool.load(worker, DocId::new(1), doc_bytes(4)));
        assert_eq!(pool.idle_count(), 1);

        let reply = wait(&mut pool);
        assert_eq!(reply.worker, worker);
        match reply.outcome {
            WorkerOutcome::Loaded { info, .. } => {
                assert_eq!(info.page_count, 4);
                assert_eq!(info.page_sizes.len(), 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.open_handles(), 1);
    }

    #[test]
    fn test_load_failure_excludes_worker() {
        let mut pool = pool(2);
        let doc = DocId::new(1);
        let worker = pool.pick_worker(doc, 0, None).unwrap();
        pool.load(worker, doc, b"bad".to_vec().into());

        let reply = wait(&mut pool);
        assert!(matches!(reply.outcome, WorkerOutcome::LoadFailed { task: None, .. }));
        assert!(pool.has_capable_worker(doc, None));
        assert_ne!(pool.pick_worker(doc, 0, None), Some(worker));
        assert!(!pool.has_capable_worker(doc, Some(1 - worker)));
    }

    #[test]
    fn test_render_full_page() {
        let mut pool = pool(2);
        pool.dispatch(0, task(1, 0, 1.5), doc_bytes(3)).unwrap();
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.pick_worker(DocId::new(1), 1, None), Some(1));

        match wait(&mut pool).outcome {
            WorkerOutcome::Rendered { result, .. } => {
                assert_eq!((result.width, result.height), (150, 300));
                assert_eq!((result.page_width_px, result.page_height_px), (150, 300));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_render_tile_clips_to_grid() {
        let mut pool = pool(2);
        let scale = ScaleKey::from_scale(6.0);
        let grid = TileGrid::for_page(PageSize { width_pt: 100.0, height_pt: 200.0 }, scale);
        let key = PageKey::tile(DocId::new(1), 0, scale, TileCoord::new(0, 0));
        let task = RenderTask::new(1, key, RequestPriority::Visible, 0).with_grid(grid);
        pool.dispatch(0, task, doc_bytes(1)).unwrap();

        match wait(&mut pool).outcome {
            WorkerOutcome::Rendered { result, .. } => {
                // 600x1200 page with 2048 tiles: one tile covers it
                assert_eq!((result.width, result.height), (600, 1200));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_output_is_rasterize_failure() {
        let mut pool = pool(2);
        pool.dispatch(0, task(1, 7, 1.0), doc_bytes(10)).unwrap();

        match wait(&mut pool).outcome {
            WorkerOutcome::Failed {
                failure: WorkerFailure::RasterizeFailure { error, .. },
                ..
            } => {
                assert!(matches!(error, RasterError::Malformed { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_panic_is_contained() {
        let mut pool = pool(2);
        pool.dispatch(0, task(1, 13, 1.0), doc_bytes(20)).unwrap();

        match wait(&mut pool).outcome {
            WorkerOutcome::Failed {
                failure: WorkerFailure::RasterizeFailure { error, .. },
                ..
            } => {
                assert_eq!(error, RasterError::Panicked("rasterizer blew up".to_owned()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pool.open_handles(), 0);

        // Worker still serves requests
        pool.dispatch(0, task(2, 0, 1.0), doc_bytes(20)).unwrap();
        assert!(matches!(wait(&mut pool).outcome, WorkerOutcome::Rendered { .. }));
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut pool = pool(2);
        let task = task(1, 0, 1.0);
        task.cancel.cancel();
        pool.dispatch(0, task, doc_bytes(1)).unwrap();

        assert!(matches!(wait(&mut pool).outcome, WorkerOutcome::Cancelled { .. }));
        assert_eq!(pool.open_handles(), 0);
    }

    #[test]
    fn test_affinity_prefers_last_worker() {
        let mut pool = pool(3);
        let doc = DocId::new(1);
        let first = pool.pick_worker(doc, 5, None).unwrap();
        pool.dispatch(first, task(1, 5, 1.0), doc_bytes(6)).unwrap();
        wait(&mut pool);

        assert_eq!(pool.pick_worker(doc, 5, None), Some(first));
        assert_ne!(pool.pick_worker(doc, 5, Some(first)), Some(first));
    }

    #[test]
    fn test_unload_closes_handles() {
        let mut pool = pool(2);
        for worker in 0..2 {
            pool.dispatch(worker, task(worker as u64, 0, 1.0), doc_bytes(1)).unwrap();
        }
        wait(&mut pool);
        wait(&mut pool);
        assert_eq!(pool.open_handles(), 2);

        pool.unload_document(DocId::new(1));
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.open_handles() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.open_handles(), 0);
    }
}
