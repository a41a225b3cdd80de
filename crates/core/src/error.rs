use crate::models::{Stage, StageStatus};
use std::time::Duration;
use thiserror::Error;

/// Failures of calls to the external language-model service.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("rate limit exceeded by model service")]
    RateLimited,

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("model service rejected the api key")]
    Unauthorized,

    #[error("invalid response from model service ({status}): {details}")]
    BackendResponse { status: u16, details: String },

    #[error("model output could not be used: {0}")]
    InvalidOutput(String),

    #[error("model service is not configured")]
    NotConfigured,

    #[error("model call queue is closed")]
    QueueClosed,

    #[error("queued model call was aborted before completing")]
    Aborted,
}

impl ModelError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::RateLimited | ModelError::Timeout(_) => true,
            ModelError::BackendResponse { status, .. } => *status >= 500,
            ModelError::Http(error) => error.is_timeout() || error.is_connect(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown bucket: {0}")]
    UnknownBucket(String),

    #[error("object not found: {bucket}/{path}")]
    NotFound { bucket: String, path: String },

    #[error("path escapes its bucket: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("storage unreachable: {0}")]
    Storage(#[from] StorageError),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("low quality text from {method} extraction (score {score:.2}): {reason}")]
    LowQuality {
        method: &'static str,
        score: f64,
        reason: String,
    },

    #[error("model OCR failed: {0}")]
    Ocr(#[from] ModelError),

    #[error("no usable text: {0}")]
    NoUsableText(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("vector store not available: {0}")]
    StoreUnavailable(String),
}

/// Illegal moves of the per-document state machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("document {0} is inactive")]
    Inactive(String),

    #[error("analysis requires completed extraction with non-empty text (document {0})")]
    ExtractionIncomplete(String),

    #[error("indexing requires completed analysis (document {0})")]
    AnalysisIncomplete(String),

    #[error("stage {stage} of document {document_id} is not processing")]
    NotProcessing { document_id: String, stage: Stage },

    #[error("extracted text is empty (document {0})")]
    EmptyText(String),

    #[error("stage {stage} of document {document_id} is already {status:?}; reset it first")]
    AlreadyStarted {
        document_id: String,
        stage: Stage,
        status: StageStatus,
    },

    #[error("stage {stage} of document {document_id} is still processing")]
    StageBusy { document_id: String, stage: Stage },
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document already exists: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} is not in flight")]
    UnknownJob(uuid::Uuid),

    #[error("job queue unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum AnswerError {
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] IndexError),

    #[error("answer generation failed: {0}")]
    Generation(#[from] ModelError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("classification failed: {0}")]
    Classification(ModelError),

    #[error("structured extraction failed: {0}")]
    StructuredExtraction(ModelError),

    #[error("indexing failed: {0}")]
    Indexing(#[from] IndexError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("documents did not settle within {0:?}")]
    Timeout(Duration),

    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert!(ModelError::RateLimited.is_retryable());
        assert!(ModelError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ModelError::BackendResponse {
            status: 503,
            details: "unavailable".to_string()
        }
        .is_retryable());
        assert!(!ModelError::BackendResponse {
            status: 400,
            details: "bad request".to_string()
        }
        .is_retryable());
        assert!(!ModelError::Unauthorized.is_retryable());
        assert!(!ModelError::InvalidOutput("x".to_string()).is_retryable());
    }
}
