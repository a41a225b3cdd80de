use crate::embeddings::{cosine_similarity, SparseVector};
use crate::error::IndexError;
use crate::models::{ChunkFilter, SearchHit, StoredChunk};
use crate::traits::VectorStore;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Linear-scan vector store. Chunks are kept in insertion order, which is
/// also the tie-break order for equal similarities.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    chunks: RwLock<Vec<StoredChunk>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<StoredChunk>>, IndexError> {
        self.chunks
            .read()
            .map_err(|_| IndexError::StoreUnavailable("vector store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<StoredChunk>>, IndexError> {
        self.chunks
            .write()
            .map_err(|_| IndexError::StoreUnavailable("vector store lock poisoned".to_string()))
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert_many(&self, document_id: &str, chunks: Vec<StoredChunk>) -> Result<(), IndexError> {
        if let Some(stray) = chunks.iter().find(|chunk| chunk.document_id != document_id) {
            return Err(IndexError::Request(format!(
                "chunk {} does not belong to document {document_id}",
                stray.chunk_id()
            )));
        }

        let mut stored = self.write()?;
        stored.retain(|chunk| chunk.document_id != document_id);
        stored.extend(chunks);
        Ok(())
    }

    async fn remove_all(&self, document_id: &str) -> Result<usize, IndexError> {
        let mut stored = self.write()?;
        let before = stored.len();
        stored.retain(|chunk| chunk.document_id != document_id);
        Ok(before - stored.len())
    }

    async fn search(
        &self,
        query: &SparseVector,
        top_k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let stored = self.read()?;
        let mut scored = stored
            .iter()
            .filter(|chunk| filter.matches(chunk))
            .map(|chunk| (cosine_similarity(query, &chunk.vector), chunk))
            .collect::<Vec<_>>();
        // `sort_by` is stable, so equal scores keep insertion order.
        scored.sort_by(|left, right| right.0.partial_cmp(&left.0).unwrap_or(Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(similarity, chunk)| SearchHit {
                chunk_id: chunk.chunk_id(),
                document_id: chunk.document_id.clone(),
                text: chunk.text.clone(),
                similarity,
                metadata: chunk.metadata.clone(),
            })
            .collect())
    }

    async fn scan(
        &self,
        predicate: &(dyn for<'c> Fn(&'c StoredChunk) -> bool + Send + Sync),
    ) -> Result<Vec<StoredChunk>, IndexError> {
        let stored = self.read()?;
        Ok(stored.iter().filter(|chunk| predicate(chunk)).cloned().collect())
    }
}
