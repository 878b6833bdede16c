use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use folio_render::{
    DocId, LopdfBackend, PageKey, PageSize, RasterBackend, RasterResult, SystemFonts,
};
use folio_scheduler::{Rect, RequestPriority, ViewportTracker, WorkerFailure};
use folio_viewer::{
    CoordinatorStats, PageRenderCoordinator, PageRenderState, PresentationSink, RecordingSink,
    ViewerConfig,
};
use image::ImageFormat;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Vertical gap between pages in the simulated continuous layout
const PAGE_GAP: f32 = 8.0;

/// Spacing between simulated scroll samples
const SAMPLE_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, Parser)]
#[command(name = "folio")]
#[command(about = "Folio page render cache and scheduler")]
pub struct Cli {
    /// Config file; defaults to <config dir>/folio/config.toml
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Number of render worker threads
    #[arg(long, global = true)]
    workers: Option<usize>,
    /// Seconds to wait for rendering to finish
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print page count and page sizes as JSON.
    Info {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Render one page, or all of its tiles when zoomed in, to PNG files.
    Render {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 1.0)]
        scale: f32,
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Navigate to a page, let the viewport settle and print render states as JSON.
    Scroll {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        to: u32,
        #[arg(long, default_value_t = 1.0)]
        scale: f32,
    },
    /// Print the effective configuration as TOML.
    Config,
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    path: String,
    page_count: u32,
    pages: Vec<PageSizeOutput>,
}

#[derive(Debug, Serialize)]
struct PageSizeOutput {
    page: u32,
    width_pt: f32,
    height_pt: f32,
}

#[derive(Debug, Serialize)]
struct RenderOutput {
    path: String,
    page: u32,
    scale: f32,
    tiled: bool,
    files: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ScrollOutput {
    path: String,
    center_page: u32,
    pages: Vec<PageStateOutput>,
    stats: CoordinatorStats,
}

#[derive(Debug, Serialize)]
struct PageStateOutput {
    page: u32,
    state: PageRenderState,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let timeout = Duration::from_secs(cli.timeout);

    match cli.command {
        Commands::Info { file } => {
            let config = load_config(cli.config.as_deref(), cli.workers)?;
            run_info(&file, config)
        }
        Commands::Render { file, page, scale, output } => {
            let config = load_config(cli.config.as_deref(), cli.workers)?;
            run_render(&file, page, scale, output.as_deref(), config, timeout)
        }
        Commands::Scroll { file, to, scale } => {
            let config = load_config(cli.config.as_deref(), cli.workers)?;
            run_scroll(&file, to, scale, config, timeout)
        }
        Commands::Config => {
            let config = load_config(cli.config.as_deref(), cli.workers)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>, workers: Option<usize>) -> Result<ViewerConfig> {
    let mut config = match path {
        Some(path) => ViewerConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?
            .apply_env()?,
        None => ViewerConfig::load().context("failed to load configuration")?,
    };

    if let Some(workers) = workers {
        config.workers = Some(workers);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn default_backend() -> Arc<dyn RasterBackend> {
    #[cfg(feature = "pdfium")]
    {
        match folio_render::PdfiumBackend::bind() {
            Ok(backend) => return Arc::new(backend),
            Err(error) => {
                tracing::warn!(%error, "PDFium unavailable, using lopdf geometry backend")
            }
        }
    }

    Arc::new(LopdfBackend::new())
}

fn open<S: PresentationSink>(
    file: &Path,
    config: ViewerConfig,
    sink: S,
) -> Result<(PageRenderCoordinator<S>, DocId)> {
    ensure_pdf_exists(file)?;
    let bytes = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;

    let mut viewer =
        PageRenderCoordinator::new(default_backend(), Arc::new(SystemFonts), config, sink)
            .context("failed to start renderer")?;
    let doc = viewer.open_document(bytes).context("failed to open PDF")?;
    Ok((viewer, doc))
}

fn run_info(file: &Path, config: ViewerConfig) -> Result<()> {
    let (mut viewer, doc) = open(file, config, RecordingSink::new())?;
    let info = viewer.document_info(doc).context("document closed unexpectedly")?;

    let pages = info
        .page_sizes
        .iter()
        .zip(1..)
        .map(|(size, page)| PageSizeOutput {
            page,
            width_pt: size.width_pt,
            height_pt: size.height_pt,
        })
        .collect();
    let payload = InfoOutput {
        path: file.display().to_string(),
        page_count: info.page_count,
        pages,
    };

    println!("{}", serde_json::to_string_pretty(&payload)?);

    viewer.shutdown();
    Ok(())
}

fn run_render(
    file: &Path,
    page: u32,
    scale: f32,
    output: Option<&Path>,
    mut config: ViewerConfig,
    timeout: Duration,
) -> Result<()> {
    if page == 0 {
        anyhow::bail!("--page is 1-based and must be >= 1");
    }
    config.initial_scale = scale;
    config.validate().context("invalid --scale")?;

    let output = output.map(ToOwned::to_owned).unwrap_or_else(|| default_render_dir(file));
    fs::create_dir_all(&output)
        .with_context(|| format!("failed to create output directory {}", output.display()))?;

    let (mut viewer, _doc) = open(file, config, PngSink::new(output))?;
    let page_count = viewer.page_count().unwrap_or(0);
    if page > page_count {
        anyhow::bail!("page {page} out of range (document has {page_count} pages)");
    }

    let page_index = page - 1;
    viewer.request_page(page_index, RequestPriority::Visible)?;
    if !viewer.pump_until_idle(timeout) {
        anyhow::bail!("timed out after {timeout:?} waiting for page {page}");
    }
    if let Some(error) = viewer.sink_mut().error.take() {
        return Err(error);
    }

    match viewer.page_state(page_index) {
        PageRenderState::Cached => {}
        PageRenderState::Failed { .. } => anyhow::bail!("page {page} failed to render"),
        other => anyhow::bail!("page {page} did not finish rendering ({other:?})"),
    }

    let scale_key = viewer.scale();
    let mut files: Vec<String> =
        viewer.sink().written.iter().map(|path| path.display().to_string()).collect();
    files.sort();

    let payload = RenderOutput {
        path: file.display().to_string(),
        page,
        scale: scale_key.as_f32(),
        tiled: folio_render::uses_tiling(scale_key),
        files,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);

    viewer.shutdown();
    Ok(())
}

fn run_scroll(
    file: &Path,
    to: u32,
    scale: f32,
    mut config: ViewerConfig,
    timeout: Duration,
) -> Result<()> {
    if to == 0 {
        anyhow::bail!("--to is 1-based and must be >= 1");
    }
    config.initial_scale = scale;
    config.validate().context("invalid --scale")?;

    let (mut viewer, doc) = open(file, config, RecordingSink::new())?;
    let info = viewer.document_info(doc).cloned().context("document closed unexpectedly")?;
    if to > info.page_count {
        anyhow::bail!("page {to} out of range (document has {} pages)", info.page_count);
    }

    let layout = continuous_layout(&info.page_sizes, viewer.scale().as_f32());
    let target = to - 1;
    let viewport = layout[target as usize];
    let tracker_config = viewer.config().tracker_config();
    let mut tracker = ViewportTracker::new(tracker_config.clone());
    tracker.set_page_layout(layout);

    // A programmatic jump: the viewport lands on the target and stays put
    // until navigation completes, then settles
    let start = Instant::now();
    let mut now = start;
    let mut events = Vec::new();
    tracker.begin_navigation(target);
    for _ in 0..=tracker_config.stable_samples {
        events.extend(tracker.on_scroll(viewport, now));
        now += SAMPLE_INTERVAL;
    }
    events.extend(tracker.tick(now + tracker_config.settle_window));

    for event in &events {
        tracing::debug!(?event, "viewport event");
        viewer.handle_viewport_event(event)?;
    }

    if !viewer.pump_until_idle(timeout) {
        anyhow::bail!("timed out after {timeout:?} waiting for renders to finish");
    }

    let pages = (0..info.page_count)
        .map(|page| PageStateOutput { page: page + 1, state: viewer.page_state(page) })
        .collect();
    let payload = ScrollOutput {
        path: file.display().to_string(),
        center_page: viewer.center_page() + 1,
        pages,
        stats: viewer.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);

    viewer.shutdown();
    Ok(())
}

/// Pages stacked top to bottom at `scale`, left-aligned
fn continuous_layout(sizes: &[PageSize], scale: f32) -> Vec<Rect> {
    let mut y = 0.0;
    sizes
        .iter()
        .map(|size| {
            let rect = Rect::new(0.0, y, size.width_pt * scale, size.height_pt * scale);
            y += rect.height + PAGE_GAP;
            rect
        })
        .collect()
}

/// Writes every bitmap it is shown to a PNG file
struct PngSink {
    dir: PathBuf,
    written: Vec<PathBuf>,
    error: Option<anyhow::Error>,
}

impl PngSink {
    fn new(dir: PathBuf) -> Self {
        Self { dir, written: Vec::new(), error: None }
    }

    fn write(&mut self, bitmap: &RasterResult, name: String) {
        if self.error.is_some() {
            return;
        }

        let path = self.dir.join(name);
        let saved = bitmap
            .to_image()
            .context("bitmap has inconsistent dimensions")
            .and_then(|image| {
                image
                    .save_with_format(&path, ImageFormat::Png)
                    .with_context(|| format!("failed to write image to {}", path.display()))
            });

        match saved {
            Ok(()) => {
                tracing::debug!(path = %path.display(), key = %bitmap.key, "wrote bitmap");
                self.written.push(path);
            }
            Err(error) => self.error = Some(error),
        }
    }
}

impl PresentationSink for PngSink {
    fn on_page_ready(&mut self, bitmap: &RasterResult) {
        let key = bitmap.key;
        self.write(bitmap, format!("page-{}@{}.png", key.page_index + 1, key.scale));
    }

    fn on_tile_ready(&mut self, bitmap: &RasterResult) {
        let key = bitmap.key;
        let (row, col) = key.tile.map_or((0, 0), |tile| (tile.row, tile.col));
        self.write(bitmap, format!("page-{}@{}-r{row}-c{col}.png", key.page_index + 1, key.scale));
    }

    fn on_render_failed(&mut self, key: PageKey, failure: &WorkerFailure) {
        tracing::warn!(%key, %failure, "page could not be rendered");
    }
}

fn ensure_pdf_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn default_render_dir(file: &Path) -> PathBuf {
    let stem = file.file_stem().and_then(|name| name.to_str()).unwrap_or("document");

    file.with_file_name(format!("{stem}-pages"))
}
