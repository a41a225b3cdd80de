use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use docket_core::config::{
    DEFAULT_CHAT_MODEL, DEFAULT_OCR_MODEL, DEFAULT_TOP_K, ENV_API_KEY, ENV_CHAT_MODEL,
    ENV_ENDPOINT, ENV_OCR_MODEL,
};
use docket_core::{
    discover_documents, mime_for_path, CaseInfo, ChatCompletionsClient, ChunkFilter, ChunkingConfig,
    LocalObjectStorage, ModelConfig, ModelService, Pipeline, PipelineOptions, PipelineState,
    SearchQuery, SourceKind, StageStatus, WorkerPool,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const BUCKET: &str = "documents";

#[derive(Parser)]
#[command(name = "docket", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Base URL of the chat-completions model service.
    #[arg(long, env = ENV_ENDPOINT)]
    model_url: Option<String>,

    /// API key of the model service. Without one every stage runs model-free.
    #[arg(long, env = ENV_API_KEY, hide_env_values = true)]
    model_api_key: Option<String>,

    /// Model used for classification, structuring and answers.
    #[arg(long, env = ENV_CHAT_MODEL, default_value = DEFAULT_CHAT_MODEL)]
    chat_model: String,

    /// Vision model used for OCR.
    #[arg(long, env = ENV_OCR_MODEL, default_value = DEFAULT_OCR_MODEL)]
    ocr_model: String,

    /// Minimum seconds between the starts of two model calls.
    #[arg(long, env = "DOCKET_MIN_CALL_INTERVAL_SECS", default_value = "6")]
    min_call_interval_secs: u64,

    /// Chunk size in tokens.
    #[arg(long, env = "DOCKET_CHUNK_SIZE", default_value = "500")]
    chunk_size: usize,

    /// Tokens shared by consecutive chunks.
    #[arg(long, env = "DOCKET_CHUNK_OVERLAP", default_value = "50")]
    chunk_overlap: usize,

    /// Workers per pipeline stage.
    #[arg(long, env = "DOCKET_WORKERS", default_value = "2")]
    workers: usize,

    /// Deliveries of a job before it is dead-lettered.
    #[arg(long, env = "DOCKET_MAX_DELIVERIES", default_value = "3")]
    max_deliveries: u32,
}

#[derive(Args)]
struct FolderArgs {
    /// Folder scanned recursively for documents.
    #[arg(long)]
    folder: PathBuf,

    /// Case id attached to every discovered document.
    #[arg(long)]
    case_id: Option<String>,

    /// Seconds to wait for every document to settle.
    #[arg(long, default_value = "900")]
    wait_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Run every document of a folder through extraction, analysis and indexing.
    Ingest {
        #[command(flatten)]
        folder: FolderArgs,
    },
    /// Extract and classify a single file.
    Classify {
        #[arg(long)]
        file: PathBuf,
    },
    /// Ingest a folder, then run a similarity search over its passages.
    Search {
        #[command(flatten)]
        folder: FolderArgs,
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
    },
    /// Ingest a folder, then answer a question from its passages.
    Ask {
        #[command(flatten)]
        folder: FolderArgs,
        #[arg(long)]
        question: String,
    },
    /// Ingest a folder, then write a short summary of the whole case.
    Summarize {
        #[command(flatten)]
        folder: FolderArgs,
        #[arg(long)]
        title: Option<String>,
        /// Area of law, e.g. civil or trabalhista.
        #[arg(long)]
        area: Option<String>,
    },
}

impl Cli {
    fn options(&self) -> anyhow::Result<PipelineOptions> {
        Ok(PipelineOptions {
            chunking: ChunkingConfig::new(self.chunk_size, self.chunk_overlap)?,
            min_call_interval: Duration::from_secs(self.min_call_interval_secs),
            workers_per_stage: self.workers,
            max_deliveries: self.max_deliveries,
            ..PipelineOptions::default()
        })
    }

    fn model(&self, options: &PipelineOptions) -> anyhow::Result<Option<Arc<dyn ModelService>>> {
        let Some(config) = ModelConfig::from_parts(self.model_url.clone(), self.model_api_key.clone())
        else {
            warn!("model service not configured; running pattern and native extraction only");
            return Ok(None);
        };
        let config = config.with_models(&self.chat_model, &self.ocr_model);
        info!(endpoint = %config.endpoint, chat_model = %config.chat_model, "model service configured");
        let client = ChatCompletionsClient::new(&config, options.timeouts)?;
        Ok(Some(Arc::new(client)))
    }

    fn pipeline(&self, root: &Path) -> anyhow::Result<Pipeline> {
        let options = self.options()?;
        let model = self.model(&options)?;
        let storage = LocalObjectStorage::new().with_bucket(BUCKET, root);
        Ok(Pipeline::builder(Arc::new(storage))
            .with_model(model)
            .with_options(options)
            .build()?)
    }
}

/// Submits every document under the folder and waits for all of them to
/// settle.
async fn ingest(pipeline: Arc<Pipeline>, args: &FolderArgs) -> anyhow::Result<()> {
    let discovered = discover_documents(&args.folder);
    if discovered.is_empty() {
        anyhow::bail!("no documents found in {}", args.folder.display());
    }
    info!(folder = %args.folder.display(), documents = discovered.len(), "ingesting folder");

    let handle = WorkerPool::new(Arc::clone(&pipeline)).start();
    let mut ids = Vec::with_capacity(discovered.len());
    for document in discovered {
        let id = pipeline
            .submit(document.into_document(BUCKET, args.case_id.as_deref()))
            .await?;
        ids.push(id);
    }

    let settled = pipeline
        .wait_until_settled(&ids, Duration::from_secs(args.wait_secs))
        .await;
    handle.shutdown().await;

    for document in settled? {
        let state = PipelineState::from(&document);
        let document_type = document
            .document_type
            .map(|document_type| document_type.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} state={} type={} confidence={:.2} chunks={}",
            document.filename,
            state,
            document_type,
            document.classification_confidence.unwrap_or_default(),
            document.indexed_chunks
        );
        let error = [
            (document.extraction_status, &document.extraction_error),
            (document.analysis_status, &document.analysis_error),
            (document.index_status, &document.index_error),
        ]
        .into_iter()
        .find(|(status, _)| *status == StageStatus::Failed)
        .and_then(|(_, error)| error.clone());
        if let Some(error) = error {
            println!("  error: {error}");
        }
        if let Some(summary) = &document.summary {
            println!("  summary: {summary}");
        }
    }
    Ok(())
}

fn scope(args: &FolderArgs) -> ChunkFilter {
    match &args.case_id {
        Some(case_id) => ChunkFilter::for_case(case_id.clone()),
        None => ChunkFilter::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "docket boot"
    );

    match &cli.command {
        Command::Ingest { folder } => {
            let pipeline = Arc::new(cli.pipeline(&folder.folder)?);
            ingest(pipeline, folder).await?;
        }
        Command::Classify { file } => {
            let mime_type = mime_for_path(file)
                .with_context(|| format!("unsupported file type: {}", file.display()))?;
            let root = file.parent().unwrap_or_else(|| Path::new("."));
            let pipeline = cli.pipeline(root)?;

            let bytes = tokio::fs::read(file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let extracted = pipeline
                .extractor()
                .extract_bytes(bytes, SourceKind::from_mime(mime_type)?, mime_type)
                .await?;
            let classification = pipeline.classifier().classify(&extracted.text).await;

            println!(
                "type={} confidence={:.2} source={:?} extraction={:?}",
                classification.document_type,
                classification.confidence,
                classification.source,
                extracted.method
            );
            println!("reasoning: {}", classification.reasoning);
        }
        Command::Search {
            folder,
            query,
            top_k,
        } => {
            let pipeline = Arc::new(cli.pipeline(&folder.folder)?);
            ingest(Arc::clone(&pipeline), folder).await?;

            let hits = pipeline
                .retrieval()
                .search(&SearchQuery::new(query.clone(), *top_k).with_filter(scope(folder)))
                .await?;
            println!("query: {query}");
            for hit in hits {
                println!(
                    "[{:.4}] chunk={} document_id={}",
                    hit.similarity, hit.chunk_id, hit.document_id
                );
                println!("  {}", hit.text);
            }
        }
        Command::Ask { folder, question } => {
            let pipeline = Arc::new(cli.pipeline(&folder.folder)?);
            ingest(Arc::clone(&pipeline), folder).await?;

            let answer = pipeline.answerer().answer(question, &scope(folder)).await?;
            println!("{}", answer.answer);
            println!("confidence={:.2}", answer.confidence);
            for (index, source) in answer.sources.iter().enumerate() {
                println!(
                    "[{}] similarity={:.4} chunk={} {}",
                    index + 1,
                    source.similarity,
                    source.chunk_id,
                    source.preview
                );
            }
        }
        Command::Summarize {
            folder,
            title,
            area,
        } => {
            let pipeline = Arc::new(cli.pipeline(&folder.folder)?);
            ingest(Arc::clone(&pipeline), folder).await?;

            let case = CaseInfo {
                case_id: folder.case_id.clone(),
                title: title.clone(),
                legal_area: area.clone(),
            };
            let summary = pipeline.case_summary(&case).await?;
            println!("{}", summary.text);
            println!("source={:?} documents={}", summary.source, summary.documents);
        }
    }

    Ok(())
}
