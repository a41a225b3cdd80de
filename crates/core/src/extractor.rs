use crate::error::{ExtractionError, ModelError};
use crate::models::{ExtractSource, ExtractedText, ExtractionMethod};
use crate::quality::TextQualityValidator;
use crate::sanitize::TextSanitizer;
use crate::serializer::CallSerializer;
use crate::traits::{ModelService, ObjectStorage};
use lopdf::Document;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Native text must be longer than this (trimmed) to be considered at all.
pub const MIN_NATIVE_CHARS: usize = 100;
pub const NATIVE_CONFIDENCE: f32 = 0.95;
pub const OCR_CONFIDENCE: f32 = 0.85;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor: Send + Sync {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<PageText>, ExtractionError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<PageText>, ExtractionError> {
        let document =
            Document::load_mem(bytes).map_err(|error| ExtractionError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| ExtractionError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(ExtractionError::PdfParse(
                "pdf had no readable page text".to_string(),
            ));
        }

        Ok(pages)
    }
}

/// How a MIME type is handled by the extract stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    PlainText,
    Image,
}

impl SourceKind {
    pub fn from_mime(mime_type: &str) -> Result<Self, ExtractionError> {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/pdf" => Ok(SourceKind::Pdf),
            "text/plain" | "text/markdown" => Ok(SourceKind::PlainText),
            "image/png" | "image/jpeg" | "image/jpg" | "image/webp" | "image/tiff" => {
                Ok(SourceKind::Image)
            }
            _ => Err(ExtractionError::UnsupportedFormat(mime_type.to_string())),
        }
    }

    pub fn has_native_text(self) -> bool {
        !matches!(self, SourceKind::Image)
    }
}

/// Extract stage logic: native text first, model OCR as fallback, both gated
/// by sanitization and quality validation.
pub struct TextExtractor {
    storage: Arc<dyn ObjectStorage>,
    pdf: Arc<dyn PdfExtractor>,
    model: Option<Arc<dyn ModelService>>,
    serializer: CallSerializer,
    sanitizer: TextSanitizer,
    validator: TextQualityValidator,
    ocr_timeout: Duration,
}

impl TextExtractor {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        model: Option<Arc<dyn ModelService>>,
        serializer: CallSerializer,
        sanitizer: TextSanitizer,
        ocr_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            pdf: Arc::new(LopdfExtractor),
            model,
            serializer,
            sanitizer,
            validator: TextQualityValidator::default(),
            ocr_timeout,
        }
    }

    pub fn with_pdf_extractor(mut self, pdf: Arc<dyn PdfExtractor>) -> Self {
        self.pdf = pdf;
        self
    }

    pub async fn extract(&self, source: &ExtractSource) -> Result<ExtractedText, ExtractionError> {
        let kind = SourceKind::from_mime(&source.mime_type)?;
        let bytes = self
            .storage
            .fetch(&source.location.bucket, &source.location.path)
            .await?;
        debug!(
            bucket = %source.location.bucket,
            path = %source.location.path,
            bytes = bytes.len(),
            "fetched document bytes"
        );
        self.extract_bytes(bytes, kind, &source.mime_type).await
    }

    pub async fn extract_bytes(
        &self,
        bytes: Vec<u8>,
        kind: SourceKind,
        mime_type: &str,
    ) -> Result<ExtractedText, ExtractionError> {
        let bytes: Arc<[u8]> = Arc::from(bytes);

        let native_failure = if kind.has_native_text() {
            match self.try_native(Arc::clone(&bytes), kind).await {
                Ok(text) => {
                    info!(chars = text.chars().count(), "native extraction accepted");
                    return Ok(ExtractedText {
                        text,
                        method: ExtractionMethod::Native,
                        confidence: NATIVE_CONFIDENCE,
                    });
                }
                Err(error) => {
                    warn!(%error, "native extraction rejected; trying model OCR");
                    error.to_string()
                }
            }
        } else {
            "image has no native text layer".to_string()
        };

        match self.try_ocr(bytes, mime_type).await {
            Ok(text) => {
                info!(chars = text.chars().count(), "model OCR accepted");
                Ok(ExtractedText {
                    text,
                    method: ExtractionMethod::ModelOcr,
                    confidence: OCR_CONFIDENCE,
                })
            }
            Err(ocr_error) => Err(ExtractionError::NoUsableText(format!(
                "{native_failure}; model OCR fallback failed: {ocr_error}"
            ))),
        }
    }

    async fn try_native(&self, bytes: Arc<[u8]>, kind: SourceKind) -> Result<String, ExtractionError> {
        let raw = match kind {
            SourceKind::Pdf => {
                let pdf = Arc::clone(&self.pdf);
                let pages = tokio::task::spawn_blocking(move || pdf.extract_pages(&bytes))
                    .await
                    .map_err(|error| ExtractionError::PdfParse(error.to_string()))??;
                pages
                    .into_iter()
                    .map(|page| page.text)
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
            SourceKind::PlainText => String::from_utf8_lossy(&bytes).into_owned(),
            SourceKind::Image => {
                return Err(ExtractionError::UnsupportedFormat(
                    "image has no native text layer".to_string(),
                ))
            }
        };

        let text = self.sanitizer.sanitize(&raw);
        if text.trim().chars().count() <= MIN_NATIVE_CHARS {
            return Err(ExtractionError::LowQuality {
                method: "native",
                score: 0.0,
                reason: format!("only {} characters of text", text.trim().chars().count()),
            });
        }
        self.accept(text, "native")
    }

    async fn try_ocr(&self, bytes: Arc<[u8]>, mime_type: &str) -> Result<String, ExtractionError> {
        let model = self
            .model
            .clone()
            .ok_or(ExtractionError::Ocr(ModelError::NotConfigured))?;
        let mime_type = mime_type.to_string();

        let raw = self
            .serializer
            .submit_with_timeout(self.ocr_timeout, move || async move {
                model.extract_text(&bytes, &mime_type).await
            })
            .await?;

        let text = self.sanitizer.sanitize(&raw);
        self.accept(text, "model OCR")
    }

    fn accept(&self, text: String, method: &'static str) -> Result<String, ExtractionError> {
        let report = self.validator.validate(&text);
        if report.valid {
            Ok(text)
        } else {
            Err(ExtractionError::LowQuality {
                method,
                score: report.score,
                reason: report.reason,
            })
        }
    }
}
