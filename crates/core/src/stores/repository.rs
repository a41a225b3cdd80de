use crate::error::RepositoryError;
use crate::models::Document;
use crate::state::DocumentUpdate;
use crate::traits::DocumentRepository;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Document repository held in process memory. An update is validated and
/// written under one write lock.
#[derive(Debug, Default)]
pub struct InMemoryDocumentRepository {
    documents: RwLock<HashMap<String, Document>>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Document>>, RepositoryError> {
        self.documents
            .read()
            .map_err(|_| RepositoryError::Unavailable("repository lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Document>>, RepositoryError> {
        self.documents
            .write()
            .map_err(|_| RepositoryError::Unavailable("repository lock poisoned".to_string()))
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn insert(&self, document: Document) -> Result<(), RepositoryError> {
        let mut documents = self.write()?;
        if documents.contains_key(&document.id) {
            return Err(RepositoryError::Duplicate(document.id));
        }
        documents.insert(document.id.clone(), document);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Document>, RepositoryError> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn apply(&self, id: &str, update: DocumentUpdate) -> Result<Document, RepositoryError> {
        let mut documents = self.write()?;
        let document = documents
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        document.apply(update)?;
        Ok(document.clone())
    }

    async fn list(&self) -> Result<Vec<Document>, RepositoryError> {
        let mut documents = self.read()?.values().cloned().collect::<Vec<_>>();
        documents.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(documents)
    }
}
