use crate::embeddings::SparseVector;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Legal document categories recognised by the classifier.
///
/// Serialized with the labels used by the persistence layer (`"sentenca"`,
/// `"peticao_inicial"`, ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocumentType {
    #[serde(rename = "peticao_inicial")]
    InitialPetition,
    #[serde(rename = "contestacao")]
    Defense,
    #[serde(rename = "sentenca")]
    Judgment,
    #[serde(rename = "acordao")]
    AppellateDecision,
    #[serde(rename = "despacho")]
    CourtOrder,
    #[serde(rename = "parecer")]
    LegalOpinion,
    #[serde(rename = "contrato")]
    Contract,
    #[serde(rename = "procuracao")]
    PowerOfAttorney,
    #[serde(rename = "documento_pessoal")]
    PersonalDocument,
    #[serde(rename = "outro")]
    Other,
}

impl DocumentType {
    /// Every specific type, in scoring order. `Other` is not scored.
    pub const SCORED: [DocumentType; 9] = [
        DocumentType::InitialPetition,
        DocumentType::Defense,
        DocumentType::Judgment,
        DocumentType::AppellateDecision,
        DocumentType::CourtOrder,
        DocumentType::LegalOpinion,
        DocumentType::Contract,
        DocumentType::PowerOfAttorney,
        DocumentType::PersonalDocument,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::InitialPetition => "peticao_inicial",
            DocumentType::Defense => "contestacao",
            DocumentType::Judgment => "sentenca",
            DocumentType::AppellateDecision => "acordao",
            DocumentType::CourtOrder => "despacho",
            DocumentType::LegalOpinion => "parecer",
            DocumentType::Contract => "contrato",
            DocumentType::PowerOfAttorney => "procuracao",
            DocumentType::PersonalDocument => "documento_pessoal",
            DocumentType::Other => "outro",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        DocumentType::SCORED
            .iter()
            .copied()
            .chain(std::iter::once(DocumentType::Other))
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown document type: {value}"))
    }
}

/// Status of a single pipeline stage on a document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Analyze,
    Index,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Extract, Stage::Analyze, Stage::Index];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Analyze => "analyze",
            Stage::Index => "index",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the raw bytes of a document live in object storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StorageLocation {
    pub bucket: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Native,
    ModelOcr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedText {
    pub text: String,
    pub method: ExtractionMethod,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Patterns,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub document_type: DocumentType,
    pub confidence: f64,
    pub reasoning: String,
    pub source: ClassificationSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Party {
    pub role: String,
    pub name: String,
    pub tax_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Lawyer {
    pub name: Option<String>,
    pub bar_registration: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateMention {
    pub kind: String,
    pub date: NaiveDate,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonetaryAmount {
    pub kind: String,
    pub value: f64,
    pub currency: String,
}

/// Structured information pulled out of a legal document. Every field is
/// optional; an empty value means "not present in the text".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StructuredFields {
    pub parties: Vec<Party>,
    pub lawyers: Vec<Lawyer>,
    pub process_number: Option<String>,
    pub dates: Vec<DateMention>,
    pub amounts: Vec<MonetaryAmount>,
    pub subject: Option<String>,
    pub requests: Vec<String>,
    pub legal_grounds: Vec<String>,
    pub court_division: Option<String>,
    pub district: Option<String>,
    pub tribunal: Option<String>,
}

impl StructuredFields {
    pub fn is_empty(&self) -> bool {
        *self == StructuredFields::default()
    }
}

/// Result of the structured-extraction step of the analyze stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AnalysisOutcome {
    pub fields: StructuredFields,
    pub summary: Option<String>,
    pub key_points: Vec<String>,
}

/// A document as seen by the pipeline. Persistence is a collaborator concern;
/// stages only mutate it through [`crate::state::DocumentUpdate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub case_id: Option<String>,
    pub location: StorageLocation,
    pub mime_type: String,
    pub active: bool,

    pub extraction_status: StageStatus,
    pub extracted_text: Option<String>,
    pub extraction_method: Option<ExtractionMethod>,
    pub extraction_error: Option<String>,

    pub analysis_status: StageStatus,
    pub analysis_error: Option<String>,
    pub document_type: Option<DocumentType>,
    pub classification_confidence: Option<f64>,
    pub structured_fields: StructuredFields,
    pub summary: Option<String>,
    pub key_points: Vec<String>,

    pub index_status: StageStatus,
    pub index_error: Option<String>,
    pub indexed: bool,
    pub indexed_chunks: usize,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        filename: impl Into<String>,
        location: StorageLocation,
        mime_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            filename: filename.into(),
            case_id: None,
            location,
            mime_type: mime_type.into(),
            active: true,
            extraction_status: StageStatus::Pending,
            extracted_text: None,
            extraction_method: None,
            extraction_error: None,
            analysis_status: StageStatus::Pending,
            analysis_error: None,
            document_type: None,
            classification_confidence: None,
            structured_fields: StructuredFields::default(),
            summary: None,
            key_points: Vec::new(),
            index_status: StageStatus::Pending,
            index_error: None,
            indexed: false,
            indexed_chunks: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    pub fn status_of(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Extract => self.extraction_status,
            Stage::Analyze => self.analysis_status,
            Stage::Index => self.index_status,
        }
    }
}

/// A token window produced by the chunker. Indices are token offsets,
/// `end_index` exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub start_index: usize,
    pub end_index: usize,
}

pub type ChunkMetadata = BTreeMap<String, String>;

/// A chunk held by a vector store, keyed by `(document_id, start_index)`.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub document_id: String,
    pub start_index: usize,
    pub end_index: usize,
    pub text: String,
    pub vector: SparseVector,
    pub metadata: ChunkMetadata,
}

impl StoredChunk {
    pub fn chunk_id(&self) -> String {
        format!("{}_{}", self.document_id, self.start_index)
    }
}

/// Scope restriction for similarity search: optional document id plus exact
/// metadata matches (e.g. `case_id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChunkFilter {
    pub document_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ChunkFilter {
    pub fn for_document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: Some(document_id.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn for_case(case_id: impl Into<String>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(crate::retrieval::CASE_ID_KEY.to_string(), case_id.into());
        Self {
            document_id: None,
            metadata,
        }
    }

    pub fn matches(&self, chunk: &StoredChunk) -> bool {
        if let Some(document_id) = &self.document_id {
            if &chunk.document_id != document_id {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(key, expected)| chunk.metadata.get(key) == Some(expected))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
    pub filter: ChunkFilter,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            filter: ChunkFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: ChunkFilter) -> Self {
        self.filter = filter;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub similarity: f64,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IndexStats {
    pub total_chunks: usize,
    pub total_documents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerSource {
    pub chunk_id: String,
    pub document_id: String,
    pub preview: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub confidence: f64,
    pub sources: Vec<AnswerSource>,
}

/// Payload carried by extract jobs; analyze and index jobs re-read the
/// persisted document instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractSource {
    pub location: StorageLocation,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub stage: Stage,
    pub document_id: String,
    pub source: Option<ExtractSource>,
    pub deliveries: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn extract(document_id: impl Into<String>, source: ExtractSource) -> Self {
        Self::build(Stage::Extract, document_id.into(), Some(source))
    }

    pub fn analyze(document_id: impl Into<String>) -> Self {
        Self::build(Stage::Analyze, document_id.into(), None)
    }

    pub fn index(document_id: impl Into<String>) -> Self {
        Self::build(Stage::Index, document_id.into(), None)
    }

    fn build(stage: Stage, document_id: String, source: Option<ExtractSource>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage,
            document_id,
            source,
            deliveries: 0,
            enqueued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_type_labels_round_trip_through_from_str() {
        for kind in DocumentType::SCORED {
            assert_eq!(kind.as_str().parse::<DocumentType>(), Ok(kind));
        }
        assert_eq!(" Outro ".parse::<DocumentType>(), Ok(DocumentType::Other));
        assert!("memorando".parse::<DocumentType>().is_err());
    }

    #[test]
    fn document_type_serializes_with_persistence_labels() {
        let json = serde_json::to_string(&DocumentType::Judgment).unwrap();
        assert_eq!(json, "\"sentenca\"");
    }

    #[test]
    fn new_document_starts_pending_everywhere() {
        let document = Document::new(
            "doc-1",
            "inicial.pdf",
            StorageLocation {
                bucket: "documents".to_string(),
                path: "a/inicial.pdf".to_string(),
            },
            "application/pdf",
        );
        for stage in Stage::ALL {
            assert_eq!(document.status_of(stage), StageStatus::Pending);
        }
        assert!(!document.indexed);
        assert!(document.active);
    }

    #[test]
    fn filter_matches_on_document_and_metadata() {
        let mut metadata = ChunkMetadata::new();
        metadata.insert("case_id".to_string(), "case-7".to_string());
        let chunk = StoredChunk {
            document_id: "doc-1".to_string(),
            start_index: 0,
            end_index: 3,
            text: "a b c".to_string(),
            vector: SparseVector::default(),
            metadata,
        };

        assert!(ChunkFilter::default().matches(&chunk));
        assert!(ChunkFilter::for_document("doc-1").matches(&chunk));
        assert!(!ChunkFilter::for_document("doc-2").matches(&chunk));
        assert!(ChunkFilter::for_case("case-7").matches(&chunk));
        assert!(!ChunkFilter::for_case("case-8").matches(&chunk));
        assert_eq!(chunk.chunk_id(), "doc-1_0");
    }
}
