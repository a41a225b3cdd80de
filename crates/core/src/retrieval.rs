//! Chunking, vectorization and similarity search over indexed documents.

use crate::chunking::{chunk_tokens, ChunkingConfig};
use crate::embeddings::{Embedder, TermFrequencyEmbedder};
use crate::error::IndexError;
use crate::models::{ChunkMetadata, Document, IndexStats, SearchHit, SearchQuery, StoredChunk};
use crate::traits::VectorStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub const CASE_ID_KEY: &str = "case_id";
pub const DOCUMENT_TYPE_KEY: &str = "document_type";
pub const FILENAME_KEY: &str = "filename";
pub const START_INDEX_KEY: &str = "start_index";
pub const END_INDEX_KEY: &str = "end_index";

#[derive(Clone)]
pub struct RetrievalEngine {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
    ) -> Result<Self, IndexError> {
        chunking.validate()?;
        Ok(Self {
            store,
            embedder,
            chunking,
        })
    }

    /// Term-frequency vectors and default chunk sizes.
    pub fn with_store(store: Arc<dyn VectorStore>) -> Self {
        Self {
            store,
            embedder: Arc::new(TermFrequencyEmbedder),
            chunking: ChunkingConfig::default(),
        }
    }

    pub fn chunking(&self) -> ChunkingConfig {
        self.chunking
    }

    /// Metadata every chunk of `document` is tagged with.
    pub fn document_metadata(document: &Document) -> ChunkMetadata {
        let mut metadata = ChunkMetadata::new();
        metadata.insert(FILENAME_KEY.to_string(), document.filename.clone());
        if let Some(case_id) = &document.case_id {
            metadata.insert(CASE_ID_KEY.to_string(), case_id.clone());
        }
        if let Some(document_type) = document.document_type {
            metadata.insert(DOCUMENT_TYPE_KEY.to_string(), document_type.to_string());
        }
        metadata
    }

    /// Replaces the chunks of `document_id` with fresh ones cut from `text`.
    /// Returns the number of chunks stored.
    pub async fn index_document(
        &self,
        document_id: &str,
        text: &str,
        metadata: &ChunkMetadata,
    ) -> Result<usize, IndexError> {
        let windows = chunk_tokens(text, self.chunking)?;
        if windows.is_empty() {
            self.store.remove_all(document_id).await?;
            return Ok(0);
        }

        let chunks = windows
            .into_iter()
            .map(|window| {
                let mut chunk_metadata = metadata.clone();
                chunk_metadata.insert(START_INDEX_KEY.to_string(), window.start_index.to_string());
                chunk_metadata.insert(END_INDEX_KEY.to_string(), window.end_index.to_string());
                StoredChunk {
                    document_id: document_id.to_string(),
                    start_index: window.start_index,
                    end_index: window.end_index,
                    vector: self.embedder.embed(&window.text),
                    text: window.text,
                    metadata: chunk_metadata,
                }
            })
            .collect::<Vec<_>>();

        let count = chunks.len();
        self.store.upsert_many(document_id, chunks).await?;
        debug!(document_id, chunks = count, "document indexed");
        Ok(count)
    }

    pub async fn remove_document(&self, document_id: &str) -> Result<usize, IndexError> {
        self.store.remove_all(document_id).await
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, IndexError> {
        if query.text.trim().is_empty() {
            return Err(IndexError::Request("search query is empty".to_string()));
        }
        let vector = self.embedder.embed(&query.text);
        self.store.search(&vector, query.top_k, &query.filter).await
    }

    pub async fn stats(&self) -> Result<IndexStats, IndexError> {
        let chunks = self.store.scan(&|_| true).await?;
        let documents = chunks
            .iter()
            .map(|chunk| chunk.document_id.as_str())
            .collect::<BTreeSet<_>>();
        Ok(IndexStats {
            total_chunks: chunks.len(),
            total_documents: documents.len(),
        })
    }
}
