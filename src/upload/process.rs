use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::render::render;
use super::submit::{Publisher, SubmitError};
use super::types::{ArticleRecord, UploadJob, UploadOutcome};
use crate::telemetry;

/// Turns one job into an outcome. Implementations never fail the run: every
/// error becomes `UploadOutcome::Failure`.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, job: &UploadJob, ct: &CancellationToken) -> UploadOutcome;
}

/// Load → decode → render → submit for an article stored as a JSON file.
pub struct FileProcessor {
    publisher: Arc<dyn Publisher>,
}

impl FileProcessor {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self { Self { publisher } }

    async fn try_process(&self, job: &UploadJob, ct: &CancellationToken) -> Result<(), ItemError> {
        let log = telemetry::upload();
        let raw = tokio::fs::read(&job.item).await.map_err(ItemError::Load)?;
        let article: ArticleRecord = serde_json::from_slice(&raw).map_err(ItemError::Decode)?;
        let rendered = render(&article);
        log.debug_kv("rendered", [("bytes", rendered.html.len().to_string())]);
        self.publisher
            .publish(&rendered, job.collection, ct)
            .await
            .map_err(ItemError::Submit)
    }
}

#[async_trait]
impl ItemProcessor for FileProcessor {
    async fn process(&self, job: &UploadJob, ct: &CancellationToken) -> UploadOutcome {
        match self.try_process(job, ct).await {
            Ok(()) => UploadOutcome::Success,
            Err(err) => UploadOutcome::Failure { retryable: err.is_retryable(), reason: err.to_string() },
        }
    }
}

#[derive(Debug)]
pub enum ItemError {
    Load(std::io::Error),
    Decode(serde_json::Error),
    Submit(SubmitError),
}

impl ItemError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ItemError::Submit(err) => err.is_retryable(),
            ItemError::Load(_) | ItemError::Decode(_) => false,
        }
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemError::Load(err) => write!(f, "load: {err}"),
            ItemError::Decode(err) => write!(f, "decode: {err}"),
            ItemError::Submit(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ItemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ItemError::Load(err) => Some(err),
            ItemError::Decode(err) => Some(err),
            ItemError::Submit(err) => Some(err),
        }
    }
}
