use crate::analysis::RawAnalysis;
use crate::embeddings::SparseVector;
use crate::error::{IndexError, ModelError, QueueError, RepositoryError, StorageError};
use crate::model::ModelClassification;
use crate::models::{ChunkFilter, Document, DocumentType, Job, SearchHit, Stage, StoredChunk};
use crate::state::DocumentUpdate;
use async_trait::async_trait;

/// The external language-model service. Only ever called through
/// [`crate::serializer::CallSerializer`]; implementations must be safe to
/// retry.
#[async_trait]
pub trait ModelService: Send + Sync {
    async fn extract_text(&self, bytes: &[u8], mime_type: &str) -> Result<String, ModelError>;

    async fn classify(&self, preview: &str) -> Result<ModelClassification, ModelError>;

    async fn extract_structured(
        &self,
        text: &str,
        document_type: DocumentType,
    ) -> Result<RawAnalysis, ModelError>;

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String, ModelError>;
}

/// Read-only access to raw document bytes.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn fetch(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError>;
}

/// Document persistence. Every update is applied atomically: a status change
/// lands together with its error or its result, never partially.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn insert(&self, document: Document) -> Result<(), RepositoryError>;

    async fn get(&self, id: &str) -> Result<Option<Document>, RepositoryError>;

    async fn apply(&self, id: &str, update: DocumentUpdate) -> Result<Document, RepositoryError>;

    async fn list(&self) -> Result<Vec<Document>, RepositoryError>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;

    /// Waits until a job of `stage` is available and hands it to exactly one
    /// consumer.
    async fn consume(&self, stage: Stage) -> Result<Job, QueueError>;

    async fn ack(&self, job: &Job) -> Result<(), QueueError>;

    async fn nack(&self, job: &Job, error: &str) -> Result<(), QueueError>;
}

/// Storage and similarity search over document chunks.
///
/// Implementations must tolerate concurrent writers and readers.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Replaces every chunk of `document_id` with `chunks`.
    async fn upsert_many(&self, document_id: &str, chunks: Vec<StoredChunk>) -> Result<(), IndexError>;

    async fn remove_all(&self, document_id: &str) -> Result<usize, IndexError>;

    /// Ranked by descending cosine similarity; ties keep insertion order.
    async fn search(
        &self,
        query: &SparseVector,
        top_k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchHit>, IndexError>;

    async fn scan(
        &self,
        predicate: &(dyn for<'c> Fn(&'c StoredChunk) -> bool + Send + Sync),
    ) -> Result<Vec<StoredChunk>, IndexError>;
}
