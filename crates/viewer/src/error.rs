use folio_cache::ConfigError;
use folio_render::DocId;
use folio_scheduler::WorkerFailure;
use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    /// Every worker failed to load the document
    #[error("document cannot be rendered by any worker")]
    DocumentUnrenderable(#[source] WorkerFailure),
    #[error("no worker reported on document load within {0:?}")]
    LoadTimeout(Duration),
    #[error("unknown document {0}")]
    UnknownDocument(DocId),
    #[error("no document is open")]
    NoActiveDocument,
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("scale must be positive and finite, got {0}")]
    InvalidScale(f32),
    #[error("coordinator has been shut down")]
    ShutDown,
    #[error("failed to start render workers")]
    WorkerSpawn(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ViewerResult<T> = Result<T, ViewerError>;
