//! The three chained pipeline stages and the operations that drive them.
//!
//! A stage handler returns `Ok` whenever the job has been dealt with, which
//! includes stage failures recorded on the document; the job is then acked.
//! `Err` means the repository or queue misbehaved and the job is nacked for
//! redelivery.

use crate::analysis::{HeuristicExtractor, StructuredAnalyzer};
use crate::answer::AnswerSynthesizer;
use crate::classifier::{DocumentClassifier, PatternClassifier};
use crate::config::PipelineOptions;
use crate::embeddings::TermFrequencyEmbedder;
use crate::error::{PipelineError, RepositoryError, Result};
use crate::extractor::{PdfExtractor, TextExtractor};
use crate::models::{Document, ExtractSource, Job, Stage, StageStatus};
use crate::retrieval::RetrievalEngine;
use crate::sanitize::TextSanitizer;
use crate::serializer::CallSerializer;
use crate::state::{DocumentUpdate, PipelineState};
use crate::stores::{InMemoryDocumentRepository, InMemoryJobQueue, InMemoryVectorStore};
use crate::summary::{CaseInfo, CaseSummarizer, CaseSummary};
use crate::traits::{DocumentRepository, JobQueue, ModelService, ObjectStorage, VectorStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a consumed job ended. Every variant leads to an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    /// The stage failed and the error is recorded on the document.
    Failed,
    /// Inactive, missing, or no longer eligible for this stage.
    Skipped,
}

pub struct PipelineBuilder {
    storage: Arc<dyn ObjectStorage>,
    repository: Option<Arc<dyn DocumentRepository>>,
    queue: Option<Arc<dyn JobQueue>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    model: Option<Arc<dyn ModelService>>,
    pdf: Option<Arc<dyn PdfExtractor>>,
    options: PipelineOptions,
}

impl PipelineBuilder {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            storage,
            repository: None,
            queue: None,
            vector_store: None,
            model: None,
            pdf: None,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn DocumentRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    /// `None` runs every stage in its model-free fallback mode.
    pub fn with_model(mut self, model: Option<Arc<dyn ModelService>>) -> Self {
        self.model = model;
        self
    }

    pub fn with_pdf_extractor(mut self, pdf: Arc<dyn PdfExtractor>) -> Self {
        self.pdf = Some(pdf);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Must be called inside a Tokio runtime: the shared call serializer
    /// starts its consumer task here.
    pub fn build(self) -> Result<Pipeline> {
        let options = self.options;
        let serializer = CallSerializer::new(options.serializer());

        let repository: Arc<dyn DocumentRepository> = match self.repository {
            Some(repository) => repository,
            None => Arc::new(InMemoryDocumentRepository::new()),
        };
        let queue: Arc<dyn JobQueue> = match self.queue {
            Some(queue) => queue,
            None => Arc::new(InMemoryJobQueue::new(options.max_deliveries)),
        };
        let vector_store: Arc<dyn VectorStore> = match self.vector_store {
            Some(store) => store,
            None => Arc::new(InMemoryVectorStore::new()),
        };

        let retrieval = RetrievalEngine::new(
            vector_store,
            Arc::new(TermFrequencyEmbedder),
            options.chunking,
        )?;

        let mut extractor = TextExtractor::new(
            self.storage,
            self.model.clone(),
            serializer.clone(),
            TextSanitizer::new()?,
            options.timeouts.ocr,
        );
        if let Some(pdf) = self.pdf {
            extractor = extractor.with_pdf_extractor(pdf);
        }

        let classifier = DocumentClassifier::new(
            PatternClassifier::with_default_rules()?,
            self.model.clone(),
            serializer.clone(),
            options.timeouts.classification,
        );
        let analyzer = StructuredAnalyzer::new(
            self.model.clone(),
            serializer.clone(),
            HeuristicExtractor::new()?,
            options.timeouts.structured,
            options.retry,
        );

        info!(
            model_configured = self.model.is_some(),
            min_call_interval_ms = options.min_call_interval.as_millis() as u64,
            chunk_tokens = options.chunking.size_tokens,
            "pipeline assembled"
        );

        Ok(Pipeline {
            repository,
            queue,
            extractor,
            classifier,
            analyzer,
            retrieval,
            model: self.model,
            serializer,
            options,
        })
    }
}

pub struct Pipeline {
    repository: Arc<dyn DocumentRepository>,
    queue: Arc<dyn JobQueue>,
    extractor: TextExtractor,
    classifier: DocumentClassifier,
    analyzer: StructuredAnalyzer,
    retrieval: RetrievalEngine,
    model: Option<Arc<dyn ModelService>>,
    serializer: CallSerializer,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn builder(storage: Arc<dyn ObjectStorage>) -> PipelineBuilder {
        PipelineBuilder::new(storage)
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        Arc::clone(&self.queue)
    }

    pub fn retrieval(&self) -> &RetrievalEngine {
        &self.retrieval
    }

    pub fn extractor(&self) -> &TextExtractor {
        &self.extractor
    }

    pub fn classifier(&self) -> &DocumentClassifier {
        &self.classifier
    }

    /// An answer synthesizer over this pipeline's index, sharing its call
    /// serializer.
    pub fn answerer(&self) -> AnswerSynthesizer {
        AnswerSynthesizer::new(
            self.retrieval.clone(),
            self.model.clone(),
            self.serializer.clone(),
            self.options.timeouts.generation,
        )
        .with_top_k(self.options.top_k)
    }

    pub fn summarizer(&self) -> CaseSummarizer {
        CaseSummarizer::new(
            self.model.clone(),
            self.serializer.clone(),
            self.options.timeouts.generation,
        )
    }

    /// Summarizes the active documents of `case` that finished analysis.
    pub async fn case_summary(&self, case: &CaseInfo) -> Result<CaseSummary> {
        let documents = self
            .repository
            .list()
            .await?
            .into_iter()
            .filter(|document| {
                case.includes(document) && document.analysis_status == StageStatus::Completed
            })
            .collect::<Vec<_>>();
        Ok(self.summarizer().summarize(&documents, case).await)
    }

    /// Registers a new document and queues its extraction.
    pub async fn submit(&self, document: Document) -> Result<String> {
        if !document.active {
            return Err(PipelineError::InvalidRequest(format!(
                "document {} is inactive",
                document.id
            )));
        }
        let id = document.id.clone();
        let job = Job::extract(id.clone(), extract_source(&document));
        self.repository.insert(document).await?;
        self.queue.enqueue(job).await?;
        info!(document_id = %id, "document submitted");
        Ok(id)
    }

    /// Puts `stage` and every later stage back to pending, drops the
    /// document's chunks and queues `stage` again. The reset is refused while
    /// `stage` or a later one is processing, or before the previous stage
    /// has completed.
    pub async fn reprocess(&self, id: &str, stage: Stage) -> Result<()> {
        let document = self
            .repository
            .apply(id, DocumentUpdate::StageReset(stage))
            .await?;
        let removed = self.retrieval.remove_document(id).await?;

        let job = match stage {
            Stage::Extract => Job::extract(id, extract_source(&document)),
            Stage::Analyze => Job::analyze(id),
            Stage::Index => Job::index(id),
        };
        self.queue.enqueue(job).await?;
        info!(document_id = %id, %stage, removed_chunks = removed, "document queued for reprocessing");
        Ok(())
    }

    /// Marks the document inactive and removes its chunks. Returns the number
    /// of chunks removed. A stage still running on the document cannot
    /// complete afterwards.
    pub async fn retire(&self, id: &str) -> Result<usize> {
        self.repository.apply(id, DocumentUpdate::Deactivated).await?;
        let removed = self.retrieval.remove_document(id).await?;
        info!(document_id = %id, removed_chunks = removed, "document retired");
        Ok(removed)
    }

    pub async fn document(&self, id: &str) -> Result<Document> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()).into())
    }

    pub async fn state(&self, id: &str) -> Result<PipelineState> {
        Ok(PipelineState::from(&self.document(id).await?))
    }

    /// Polls until every document is indexed, failed at some stage, or
    /// inactive.
    pub async fn wait_until_settled(&self, ids: &[String], timeout: Duration) -> Result<Vec<Document>> {
        let poll = async {
            loop {
                let mut settled = Vec::with_capacity(ids.len());
                for id in ids {
                    let document = self.document(id).await?;
                    if document.active && !PipelineState::from(&document).is_settled() {
                        break;
                    }
                    settled.push(document);
                }
                if settled.len() == ids.len() {
                    return Ok::<_, PipelineError>(settled);
                }
                tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| PipelineError::Timeout(timeout))?
    }

    /// Runs the stage named by `job`.
    pub async fn handle(&self, job: &Job) -> Result<StageOutcome> {
        let started = Instant::now();
        let outcome = match job.stage {
            Stage::Extract => self.run_extract(job).await,
            Stage::Analyze => self.run_analyze(&job.document_id).await,
            Stage::Index => self.run_index(&job.document_id).await,
        }?;
        info!(
            job_id = %job.id,
            stage = %job.stage,
            document_id = %job.document_id,
            deliveries = job.deliveries,
            ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job handled"
        );
        Ok(outcome)
    }

    /// Applies a `*Started` update. `None` means the document cannot enter
    /// the stage and the job should be skipped.
    async fn start(&self, id: &str, update: DocumentUpdate) -> Result<Option<Document>> {
        let Some(document) = self.repository.get(id).await? else {
            warn!(document_id = %id, "job for unknown document skipped");
            return Ok(None);
        };
        if !document.active {
            debug!(document_id = %id, "inactive document skipped");
            return Ok(None);
        }

        let name = update.name();
        match self.repository.apply(id, update).await {
            Ok(document) => Ok(Some(document)),
            Err(RepositoryError::Transition(error)) => {
                warn!(document_id = %id, update = name, %error, "stale job skipped");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Applies a `*Completed` update. A rejected completion, for example on a
    /// document retired mid-stage, is recorded as the stage's failure and
    /// `false` is returned.
    async fn complete(&self, id: &str, stage: Stage, update: DocumentUpdate) -> Result<bool> {
        let error = match self.repository.apply(id, update).await {
            Ok(_) => return Ok(true),
            Err(RepositoryError::Transition(error)) => error,
            Err(error) => return Err(error.into()),
        };
        warn!(document_id = %id, %stage, %error, "stage result rejected");
        match self
            .repository
            .apply(id, DocumentUpdate::failed(stage, error.to_string()))
            .await
        {
            Ok(_) | Err(RepositoryError::Transition(_)) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn run_extract(&self, job: &Job) -> Result<StageOutcome> {
        let Some(document) = self.start(&job.document_id, DocumentUpdate::ExtractionStarted).await? else {
            return Ok(StageOutcome::Skipped);
        };
        let source = job.source.clone().unwrap_or_else(|| extract_source(&document));

        match self.extractor.extract(&source).await {
            Ok(extracted) => {
                info!(
                    document_id = %document.id,
                    method = ?extracted.method,
                    chars = extracted.text.chars().count(),
                    "text extracted"
                );
                let completed = DocumentUpdate::ExtractionCompleted {
                    text: extracted.text,
                    method: extracted.method,
                };
                if !self.complete(&document.id, Stage::Extract, completed).await? {
                    return Ok(StageOutcome::Failed);
                }
                self.queue.enqueue(Job::analyze(document.id.as_str())).await?;
                Ok(StageOutcome::Completed)
            }
            Err(error) => {
                warn!(document_id = %document.id, %error, "extraction failed");
                self.repository
                    .apply(
                        &document.id,
                        DocumentUpdate::ExtractionFailed {
                            error: error.to_string(),
                        },
                    )
                    .await?;
                Ok(StageOutcome::Failed)
            }
        }
    }

    async fn run_analyze(&self, id: &str) -> Result<StageOutcome> {
        let Some(document) = self.start(id, DocumentUpdate::AnalysisStarted).await? else {
            return Ok(StageOutcome::Skipped);
        };
        let text = document.extracted_text.as_deref().unwrap_or_default();

        let classification = self.classifier.classify(text).await;
        let outcome = self.analyzer.analyze(text, classification.document_type).await;
        info!(
            document_id = %id,
            document_type = %classification.document_type,
            confidence = classification.confidence,
            source = ?classification.source,
            key_points = outcome.key_points.len(),
            "document analyzed"
        );

        let completed = DocumentUpdate::AnalysisCompleted {
            classification,
            outcome,
        };
        if !self.complete(id, Stage::Analyze, completed).await? {
            return Ok(StageOutcome::Failed);
        }

        self.queue.enqueue(Job::index(id)).await?;
        Ok(StageOutcome::Completed)
    }

    async fn run_index(&self, id: &str) -> Result<StageOutcome> {
        let Some(document) = self.start(id, DocumentUpdate::IndexingStarted).await? else {
            return Ok(StageOutcome::Skipped);
        };
        let text = document.extracted_text.as_deref().unwrap_or_default();
        let metadata = RetrievalEngine::document_metadata(&document);

        match self.retrieval.index_document(id, text, &metadata).await {
            Ok(chunks) => {
                if self
                    .complete(id, Stage::Index, DocumentUpdate::IndexingCompleted { chunks })
                    .await?
                {
                    info!(document_id = %id, chunks, "document indexed");
                    return Ok(StageOutcome::Completed);
                }
                let removed = self.retrieval.remove_document(id).await?;
                warn!(document_id = %id, removed_chunks = removed, "chunks of rejected indexing removed");
                Ok(StageOutcome::Failed)
            }
            Err(error) => {
                warn!(document_id = %id, %error, "indexing failed");
                self.repository
                    .apply(id, DocumentUpdate::failed(Stage::Index, error.to_string()))
                    .await?;
                Ok(StageOutcome::Failed)
            }
        }
    }
}

fn extract_source(document: &Document) -> ExtractSource {
    ExtractSource {
        location: document.location.clone(),
        mime_type: document.mime_type.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::SparseVector;
    use crate::error::{IndexError, TransitionError};
    use crate::models::{
        ChunkFilter, DocumentType, SearchHit, SearchQuery, StorageLocation, StoredChunk,
    };
    use crate::stores::LocalObjectStorage;
    use async_trait::async_trait;

    const CONTRACT: &str = "CONTRATO DE LOCAÇÃO RESIDENCIAL\n\n\
        Pelo presente instrumento particular, o LOCADOR e o LOCATÁRIO têm entre si justo e \
        contratado o seguinte. Cláusula primeira: o imóvel destina-se exclusivamente a fins \
        residenciais. Cláusula segunda: o aluguel mensal será pago até o quinto dia útil de \
        cada mês, sob pena de multa contratual. Cláusula terceira: o prazo da locação é de \
        trinta meses.";

    struct Fixture {
        _root: tempfile::TempDir,
        pipeline: Pipeline,
        queue: Arc<InMemoryJobQueue>,
    }

    fn fixture_with_store(store: Arc<dyn VectorStore>) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("contrato.txt"), CONTRACT).unwrap();
        std::fs::write(root.path().join("vazio.txt"), "  ").unwrap();

        let storage = LocalObjectStorage::new().with_bucket("documents", root.path());
        let queue = Arc::new(InMemoryJobQueue::default());
        let pipeline = Pipeline::builder(Arc::new(storage))
            .with_queue(queue.clone())
            .with_vector_store(store)
            .with_options(PipelineOptions {
                min_call_interval: Duration::ZERO,
                ..PipelineOptions::default()
            })
            .build()
            .unwrap();
        Fixture {
            _root: root,
            pipeline,
            queue,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(Arc::new(InMemoryVectorStore::new()))
    }

    fn text_document(id: &str, path: &str) -> Document {
        Document::new(
            id,
            path,
            StorageLocation {
                bucket: "documents".to_string(),
                path: path.to_string(),
            },
            "text/plain",
        )
        .with_case("case-1")
    }

    /// Consumes and handles queued jobs until the queue is drained.
    async fn drain(fixture: &Fixture) -> Vec<StageOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let stage = Stage::ALL
                .into_iter()
                .find(|stage| fixture.queue.pending(*stage) > 0);
            let Some(stage) = stage else {
                return outcomes;
            };
            outcomes.push(run_next(fixture, stage).await);
        }
    }

    async fn run_next(fixture: &Fixture, stage: Stage) -> StageOutcome {
        let job = fixture.queue.consume(stage).await.unwrap();
        let outcome = fixture.pipeline.handle(&job).await.unwrap();
        fixture.queue.ack(&job).await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn document_flows_through_all_stages() {
        let fixture = fixture();
        fixture
            .pipeline
            .submit(text_document("doc-1", "contrato.txt"))
            .await
            .unwrap();
        assert_eq!(fixture.pipeline.state("doc-1").await.unwrap(), PipelineState::Pending);

        let outcomes = drain(&fixture).await;
        assert_eq!(outcomes, vec![StageOutcome::Completed; 3]);

        let document = fixture.pipeline.document("doc-1").await.unwrap();
        assert_eq!(PipelineState::from(&document), PipelineState::Indexed);
        assert_eq!(document.document_type, Some(DocumentType::Contract));
        assert!(document.summary.is_some());
        assert_eq!(document.indexed_chunks, 1);

        let hits = fixture
            .pipeline
            .retrieval()
            .search(&SearchQuery::new("aluguel mensal", 5).with_filter(ChunkFilter::for_case("case-1")))
            .await
            .unwrap();
        assert_eq!(hits[0].document_id, "doc-1");
    }

    #[tokio::test]
    async fn extraction_failure_is_recorded_and_stops_the_chain() {
        let fixture = fixture();
        fixture
            .pipeline
            .submit(text_document("doc-1", "vazio.txt"))
            .await
            .unwrap();

        assert_eq!(drain(&fixture).await, vec![StageOutcome::Failed]);
        let document = fixture.pipeline.document("doc-1").await.unwrap();
        assert_eq!(PipelineState::from(&document), PipelineState::Failed(Stage::Extract));
        assert!(document.extraction_error.is_some());
        assert_eq!(document.analysis_status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn missing_file_fails_extraction() {
        let fixture = fixture();
        fixture
            .pipeline
            .submit(text_document("doc-1", "sumiu.txt"))
            .await
            .unwrap();

        drain(&fixture).await;
        let document = fixture.pipeline.document("doc-1").await.unwrap();
        assert!(document
            .extraction_error
            .as_deref()
            .is_some_and(|error| error.contains("sumiu.txt")));
    }

    #[tokio::test]
    async fn reprocessing_a_stage_supersedes_its_chunks() {
        let fixture = fixture();
        fixture
            .pipeline
            .submit(text_document("doc-1", "contrato.txt"))
            .await
            .unwrap();
        drain(&fixture).await;

        fixture.pipeline.reprocess("doc-1", Stage::Analyze).await.unwrap();
        let document = fixture.pipeline.document("doc-1").await.unwrap();
        assert_eq!(document.analysis_status, StageStatus::Pending);
        assert!(!document.indexed);
        assert_eq!(fixture.pipeline.retrieval().stats().await.unwrap().total_chunks, 0);
        assert_eq!(fixture.queue.pending(Stage::Analyze), 1);

        assert_eq!(drain(&fixture).await, vec![StageOutcome::Completed; 2]);
        assert_eq!(fixture.pipeline.state("doc-1").await.unwrap(), PipelineState::Indexed);
        assert_eq!(fixture.pipeline.retrieval().stats().await.unwrap().total_chunks, 1);
    }

    #[tokio::test]
    async fn reprocess_requires_completed_prerequisite() {
        let fixture = fixture();
        fixture
            .pipeline
            .submit(text_document("doc-1", "contrato.txt"))
            .await
            .unwrap();

        let error = fixture
            .pipeline
            .reprocess("doc-1", Stage::Index)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            PipelineError::Repository(RepositoryError::Transition(TransitionError::AnalysisIncomplete(_)))
        ));
        assert_eq!(fixture.queue.pending(Stage::Index), 0);
        assert!(matches!(
            fixture.pipeline.reprocess("nope", Stage::Extract).await,
            Err(PipelineError::Repository(RepositoryError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn retired_documents_are_skipped_and_unindexed() {
        let fixture = fixture();
        fixture
            .pipeline
            .submit(text_document("doc-1", "contrato.txt"))
            .await
            .unwrap();
        drain(&fixture).await;

        assert_eq!(fixture.pipeline.retire("doc-1").await.unwrap(), 1);
        assert!(matches!(
            fixture.pipeline.reprocess("doc-1", Stage::Extract).await,
            Err(PipelineError::Repository(RepositoryError::Transition(TransitionError::Inactive(_))))
        ));

        fixture.queue.enqueue(Job::index("doc-1")).await.unwrap();
        assert_eq!(drain(&fixture).await, vec![StageOutcome::Skipped]);
        assert_eq!(fixture.pipeline.retrieval().stats().await.unwrap().total_chunks, 0);
    }

    #[tokio::test]
    async fn reprocess_is_refused_while_a_later_stage_runs() {
        let fixture = fixture();
        fixture
            .pipeline
            .submit(text_document("doc-1", "contrato.txt"))
            .await
            .unwrap();
        run_next(&fixture, Stage::Extract).await;
        run_next(&fixture, Stage::Analyze).await;
        fixture
            .pipeline
            .start("doc-1", DocumentUpdate::IndexingStarted)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            fixture.pipeline.reprocess("doc-1", Stage::Analyze).await,
            Err(PipelineError::Repository(RepositoryError::Transition(
                TransitionError::StageBusy {
                    stage: Stage::Index,
                    ..
                }
            )))
        ));
        let document = fixture.pipeline.document("doc-1").await.unwrap();
        assert_eq!(document.analysis_status, StageStatus::Completed);
        assert_eq!(document.index_status, StageStatus::Processing);
        assert_eq!(fixture.queue.pending(Stage::Analyze), 0);
    }

    #[tokio::test]
    async fn case_summary_covers_analyzed_documents_of_the_case() {
        let fixture = fixture();
        for (id, path) in [("doc-1", "contrato.txt"), ("doc-2", "vazio.txt")] {
            fixture.pipeline.submit(text_document(id, path)).await.unwrap();
        }
        drain(&fixture).await;

        let case = CaseInfo {
            case_id: Some("case-1".to_string()),
            title: Some("Locação residencial".to_string()),
            legal_area: None,
        };
        let summary = fixture.pipeline.case_summary(&case).await.unwrap();
        assert_eq!(summary.source, crate::summary::SummarySource::Fallback);
        assert_eq!(summary.documents, 1);
        assert!(summary.text.starts_with("Caso Locação residencial"));
        assert!(summary.text.ends_with("Composto por 1 documento(s) incluindo contrato."));

        fixture.pipeline.retire("doc-1").await.unwrap();
        let summary = fixture.pipeline.case_summary(&case).await.unwrap();
        assert_eq!(summary.documents, 0);
    }

    /// Holds every upsert until the gate opens.
    #[derive(Default)]
    struct GatedStore {
        inner: InMemoryVectorStore,
        entered: tokio::sync::Notify,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl VectorStore for GatedStore {
        async fn upsert_many(&self, document_id: &str, chunks: Vec<StoredChunk>) -> std::result::Result<(), IndexError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.upsert_many(document_id, chunks).await
        }

        async fn remove_all(&self, document_id: &str) -> std::result::Result<usize, IndexError> {
            self.inner.remove_all(document_id).await
        }

        async fn search(
            &self,
            query: &SparseVector,
            top_k: usize,
            filter: &ChunkFilter,
        ) -> std::result::Result<Vec<SearchHit>, IndexError> {
            self.inner.search(query, top_k, filter).await
        }

        async fn scan(
            &self,
            predicate: &(dyn for<'c> Fn(&'c StoredChunk) -> bool + Send + Sync),
        ) -> std::result::Result<Vec<StoredChunk>, IndexError> {
            self.inner.scan(predicate).await
        }
    }

    #[tokio::test]
    async fn retiring_during_indexing_leaves_nothing_searchable() {
        let store = Arc::new(GatedStore::default());
        let fixture = fixture_with_store(store.clone());
        fixture
            .pipeline
            .submit(text_document("doc-1", "contrato.txt"))
            .await
            .unwrap();
        run_next(&fixture, Stage::Extract).await;
        run_next(&fixture, Stage::Analyze).await;

        let index = run_next(&fixture, Stage::Index);
        let retire = async {
            store.entered.notified().await;
            let removed = fixture.pipeline.retire("doc-1").await.unwrap();
            store.gate.notify_one();
            removed
        };
        let (outcome, removed) = tokio::join!(index, retire);

        assert_eq!(outcome, StageOutcome::Failed);
        assert_eq!(removed, 0);
        let document = fixture.pipeline.document("doc-1").await.unwrap();
        assert!(!document.active);
        assert!(!document.indexed);
        assert_eq!(document.index_status, StageStatus::Failed);
        assert_eq!(fixture.pipeline.retrieval().stats().await.unwrap().total_chunks, 0);
        let hits = fixture
            .pipeline
            .retrieval()
            .search(&SearchQuery::new("aluguel mensal", 5))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl VectorStore for BrokenStore {
        async fn upsert_many(&self, _document_id: &str, _chunks: Vec<StoredChunk>) -> std::result::Result<(), IndexError> {
            Err(IndexError::StoreUnavailable("disk full".to_string()))
        }

        async fn remove_all(&self, _document_id: &str) -> std::result::Result<usize, IndexError> {
            Ok(0)
        }

        async fn search(
            &self,
            _query: &SparseVector,
            _top_k: usize,
            _filter: &ChunkFilter,
        ) -> std::result::Result<Vec<SearchHit>, IndexError> {
            Ok(Vec::new())
        }

        async fn scan(
            &self,
            _predicate: &(dyn for<'c> Fn(&'c StoredChunk) -> bool + Send + Sync),
        ) -> std::result::Result<Vec<StoredChunk>, IndexError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn indexing_failure_keeps_analysis() {
        let fixture = fixture_with_store(Arc::new(BrokenStore));
        fixture
            .pipeline
            .submit(text_document("doc-1", "contrato.txt"))
            .await
            .unwrap();

        let outcomes = drain(&fixture).await;
        assert_eq!(
            outcomes,
            vec![StageOutcome::Completed, StageOutcome::Completed, StageOutcome::Failed]
        );
        let document = fixture.pipeline.document("doc-1").await.unwrap();
        assert_eq!(document.analysis_status, StageStatus::Completed);
        assert!(!document.indexed);
        assert!(document
            .index_error
            .as_deref()
            .is_some_and(|error| error.contains("disk full")));
    }

    #[tokio::test]
    async fn wait_until_settled_times_out_for_pending_documents() {
        let fixture = fixture();
        fixture
            .pipeline
            .submit(text_document("doc-1", "contrato.txt"))
            .await
            .unwrap();

        let error = fixture
            .pipeline
            .wait_until_settled(&["doc-1".to_string()], Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(matches!(error, PipelineError::Timeout(_)));

        drain(&fixture).await;
        let settled = fixture
            .pipeline
            .wait_until_settled(&["doc-1".to_string()], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(settled[0].indexed);
    }

    #[tokio::test]
    async fn duplicate_and_inactive_submissions_are_rejected() {
        let fixture = fixture();
        fixture
            .pipeline
            .submit(text_document("doc-1", "contrato.txt"))
            .await
            .unwrap();
        assert!(matches!(
            fixture.pipeline.submit(text_document("doc-1", "contrato.txt")).await,
            Err(PipelineError::Repository(RepositoryError::Duplicate(_)))
        ));

        let mut inactive = text_document("doc-2", "contrato.txt");
        inactive.active = false;
        assert!(matches!(
            fixture.pipeline.submit(inactive).await,
            Err(PipelineError::InvalidRequest(_))
        ));
    }
}
