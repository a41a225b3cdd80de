use crate::error::AnswerError;
use crate::models::{Answer, AnswerSource, ChunkFilter, SearchHit, SearchQuery};
use crate::retrieval::RetrievalEngine;
use crate::serializer::CallSerializer;
use crate::traits::ModelService;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const NO_INFORMATION_ANSWER: &str =
    "Não encontrei informações relevantes nos documentos indexados.";
pub const ANSWER_TOP_K: usize = 5;
pub const PREVIEW_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "Você é um assistente jurídico especializado em análise de documentos.
Use apenas as informações fornecidas no contexto para responder.
Se não houver informação suficiente, diga isso claramente.
Cite as fontes pelos números dos trechos: [1], [2], etc.";

const EXTRACTIVE_HEADER: &str = "Trechos mais relevantes encontrados nos documentos:";

/// Answers questions from indexed chunks, citing the passages used.
pub struct AnswerSynthesizer {
    retrieval: RetrievalEngine,
    model: Option<Arc<dyn ModelService>>,
    serializer: CallSerializer,
    timeout: Duration,
    top_k: usize,
}

impl AnswerSynthesizer {
    pub fn new(
        retrieval: RetrievalEngine,
        model: Option<Arc<dyn ModelService>>,
        serializer: CallSerializer,
        timeout: Duration,
    ) -> Self {
        Self {
            retrieval,
            model,
            serializer,
            timeout,
            top_k: ANSWER_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub async fn answer(&self, question: &str, scope: &ChunkFilter) -> Result<Answer, AnswerError> {
        let query = SearchQuery::new(question, self.top_k).with_filter(scope.clone());
        let hits = self
            .retrieval
            .search(&query)
            .await?
            .into_iter()
            .filter(|hit| hit.similarity > 0.0)
            .collect::<Vec<_>>();

        let Some(top) = hits.first() else {
            debug!("no relevant chunks for question");
            return Ok(Answer {
                answer: NO_INFORMATION_ANSWER.to_string(),
                confidence: 0.0,
                sources: Vec::new(),
            });
        };
        let confidence = top.similarity;
        let context = context_blocks(&hits);

        let answer = match self.model.clone() {
            Some(model) => {
                let user_prompt = format!("Contexto dos documentos:\n{context}\n\nPergunta: {question}");
                self.serializer
                    .submit_with_timeout(self.timeout, move || async move {
                        model.generate(SYSTEM_PROMPT, &user_prompt).await
                    })
                    .await?
            }
            None => format!("{EXTRACTIVE_HEADER}\n\n{context}"),
        };

        info!(sources = hits.len(), confidence, "answer synthesized");
        Ok(Answer {
            answer,
            confidence,
            sources: hits.iter().map(source_of).collect(),
        })
    }
}

fn context_blocks(hits: &[SearchHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(index, hit)| format!("[{}] {}", index + 1, hit.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn source_of(hit: &SearchHit) -> AnswerSource {
    let preview = hit.text.chars().take(PREVIEW_CHARS).collect::<String>();
    AnswerSource {
        chunk_id: hit.chunk_id.clone(),
        document_id: hit.document_id.clone(),
        preview: format!("{preview}..."),
        similarity: hit.similarity,
    }
}
