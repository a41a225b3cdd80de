//! Short executive summaries of a whole case, built from the per-document
//! analysis results.

use crate::models::{Document, DocumentType, Party};
use crate::serializer::CallSerializer;
use crate::traits::ModelService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Characters of extracted text used for a document without a summary.
pub const TEXT_EXCERPT_CHARS: usize = 800;

const SYSTEM_PROMPT: &str = "Você é um assistente que gera resumos curtos e objetivos de casos \
jurídicos. Responda APENAS com o resumo, sem introduções.";

const INSTRUCTIONS: &str = "IMPORTANTE:
- Máximo 2-3 frases curtas
- Estilo objetivo e direto
- Mencione apenas: tipo de ação, partes principais e objeto principal

Retorne APENAS o resumo, sem introduções ou seções.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseInfo {
    /// Restricts the summary to documents of this case. `None` takes every
    /// active document.
    pub case_id: Option<String>,
    pub title: Option<String>,
    /// Area of law, e.g. `civil` or `trabalhista`.
    pub legal_area: Option<String>,
}

impl CaseInfo {
    pub fn includes(&self, document: &Document) -> bool {
        document.active
            && self
                .case_id
                .as_deref()
                .map_or(true, |case_id| document.case_id.as_deref() == Some(case_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySource {
    Model,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSummary {
    pub text: String,
    pub source: SummarySource,
    pub documents: usize,
}

pub struct CaseSummarizer {
    model: Option<Arc<dyn ModelService>>,
    serializer: CallSerializer,
    timeout: Duration,
}

impl CaseSummarizer {
    pub fn new(
        model: Option<Arc<dyn ModelService>>,
        serializer: CallSerializer,
        timeout: Duration,
    ) -> Self {
        Self {
            model,
            serializer,
            timeout,
        }
    }

    /// Never fails: without a model, with no documents, or when the model
    /// call fails, the summary is assembled from the structured fields.
    pub async fn summarize(&self, documents: &[Document], case: &CaseInfo) -> CaseSummary {
        let fallback = || CaseSummary {
            text: fallback_summary(documents, case),
            source: SummarySource::Fallback,
            documents: documents.len(),
        };
        let Some(model) = self.model.clone() else {
            debug!("model service not configured; case summary from structured fields");
            return fallback();
        };
        if documents.is_empty() {
            return fallback();
        }

        let user_prompt = case_prompt(documents, case);
        let generated = self
            .serializer
            .submit_with_timeout(self.timeout, move || async move {
                model.generate(SYSTEM_PROMPT, &user_prompt).await
            })
            .await;
        match generated {
            Ok(text) if !text.trim().is_empty() => {
                info!(documents = documents.len(), "case summary generated");
                CaseSummary {
                    text: text.trim().to_string(),
                    source: SummarySource::Model,
                    documents: documents.len(),
                }
            }
            Ok(_) => {
                warn!("model returned an empty case summary; using structured fields");
                fallback()
            }
            Err(error) => {
                warn!(%error, "case summary generation failed; using structured fields");
                fallback()
            }
        }
    }
}

fn case_prompt(documents: &[Document], case: &CaseInfo) -> String {
    let case_json = serde_json::to_string_pretty(case).unwrap_or_default();
    let documents_text = documents
        .iter()
        .map(|document| {
            let document_type = document.document_type.unwrap_or(DocumentType::Other);
            let body = match &document.summary {
                Some(summary) => summary.clone(),
                None => document
                    .extracted_text
                    .as_deref()
                    .unwrap_or_default()
                    .chars()
                    .take(TEXT_EXCERPT_CHARS)
                    .collect(),
            };
            format!("[{document_type}]\n{body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    format!(
        "Gere um resumo SIMPLES e CURTO (máximo 2-3 frases) do seguinte caso jurídico:\n\n\
         Informações do Caso:\n{case_json}\n\nDocumentos:\n{documents_text}\n\n{INSTRUCTIONS}"
    )
}

fn fallback_summary(documents: &[Document], case: &CaseInfo) -> String {
    let mut summary = format!("Caso {}", case.title.as_deref().unwrap_or("sem título"));

    if let Some(area) = case.legal_area.as_deref() {
        summary.push_str(&format!(" na área de {}", area_label(area)));
    }

    let parties = distinct_parties(documents);
    let named = |role: fn(&str) -> bool| {
        parties
            .iter()
            .find(|party| role(party.role.to_lowercase().as_str()))
            .map(|party| party.name.as_str())
    };
    let plaintiff = named(|role| role.contains("autor"));
    let defendant = named(|role| role.contains("réu") || role.contains("reu"));
    match (plaintiff, defendant, parties.first()) {
        (Some(plaintiff), Some(defendant), _) => {
            summary.push_str(&format!(", envolvendo {plaintiff} e {defendant}"));
        }
        (_, _, Some(first)) => summary.push_str(&format!(", envolvendo {}", first.name)),
        _ => {}
    }

    summary.push_str(&format!(". Composto por {} documento(s)", documents.len()));

    let mut types = Vec::new();
    for document_type in documents.iter().filter_map(|document| document.document_type) {
        if !types.contains(&document_type) {
            types.push(document_type);
        }
    }
    if !types.is_empty() {
        let labels = types
            .iter()
            .take(3)
            .map(|document_type| type_label(*document_type))
            .collect::<Vec<_>>()
            .join(", ");
        summary.push_str(&format!(" incluindo {labels}"));
    }

    summary.push('.');
    summary
}

fn distinct_parties(documents: &[Document]) -> Vec<&Party> {
    let mut parties: Vec<&Party> = Vec::new();
    for party in documents
        .iter()
        .flat_map(|document| &document.structured_fields.parties)
    {
        if !party.name.trim().is_empty() && parties.iter().all(|seen| seen.name != party.name) {
            parties.push(party);
        }
    }
    parties
}

fn area_label(area: &str) -> &str {
    match area {
        "civil" => "Cível",
        "trabalhista" => "Trabalhista",
        "penal" => "Penal",
        "tributario" => "Tributário",
        "familia" => "Família",
        "consumidor" => "Consumidor",
        other => other,
    }
}

fn type_label(document_type: DocumentType) -> &'static str {
    match document_type {
        DocumentType::InitialPetition => "petição inicial",
        DocumentType::Defense => "contestação",
        DocumentType::Judgment => "sentença",
        DocumentType::AppellateDecision => "acórdão",
        DocumentType::CourtOrder => "despacho",
        DocumentType::LegalOpinion => "parecer",
        DocumentType::Contract => "contrato",
        DocumentType::PowerOfAttorney => "procuração",
        DocumentType::PersonalDocument => "documento pessoal",
        DocumentType::Other => "outro",
    }
}
