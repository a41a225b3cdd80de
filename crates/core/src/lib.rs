pub mod analysis;
pub mod answer;
pub mod chunking;
pub mod classifier;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod model;
pub mod models;
pub mod orchestrator;
pub mod quality;
pub mod retrieval;
pub mod sanitize;
pub mod serializer;
pub mod state;
pub mod stores;
pub mod summary;
pub mod traits;
pub mod worker;

pub use analysis::{HeuristicExtractor, RawAnalysis, StructuredAnalyzer};
pub use answer::{AnswerSynthesizer, NO_INFORMATION_ANSWER};
pub use chunking::{chunk_tokens, normalize_whitespace, ChunkingConfig};
pub use classifier::{classification_preview, DocumentClassifier, PatternClassifier};
pub use config::{ModelConfig, ModelTimeouts, PipelineOptions, RetryPolicy};
pub use embeddings::{cosine_similarity, Embedder, SparseVector, TermFrequencyEmbedder};
pub use error::{
    AnswerError, ExtractionError, IndexError, ModelError, PipelineError, QueueError,
    RepositoryError, StorageError, TransitionError,
};
pub use extractor::{LopdfExtractor, PdfExtractor, SourceKind, TextExtractor};
pub use ingest::{discover_documents, mime_for_path, DiscoveredDocument};
pub use model::{ChatCompletionsClient, ModelClassification};
pub use models::{
    Answer, AnswerSource, ChunkFilter, Classification, ClassificationSource, Document,
    DocumentType, ExtractSource, ExtractedText, ExtractionMethod, IndexStats, Job, SearchHit,
    SearchQuery, Stage, StageStatus, StorageLocation, StructuredFields,
};
pub use orchestrator::{Pipeline, PipelineBuilder, StageOutcome};
pub use quality::{QualityReport, TextQualityValidator};
pub use retrieval::RetrievalEngine;
pub use sanitize::TextSanitizer;
pub use serializer::{CallSerializer, SerializerConfig};
pub use state::{DocumentUpdate, PipelineState};
pub use stores::{
    DeadLetter, InMemoryDocumentRepository, InMemoryJobQueue, InMemoryVectorStore,
    LocalObjectStorage,
};
pub use summary::{CaseInfo, CaseSummarizer, CaseSummary, SummarySource};
pub use traits::{DocumentRepository, JobQueue, ModelService, ObjectStorage, VectorStore};
pub use worker::{PipelineHandle, WorkerPool};
