//! The per-document pipeline state machine.
//!
//! Stages only change a [`Document`] through [`DocumentUpdate`]s. Each update
//! is checked before anything is written, so an illegal move leaves the
//! document untouched.

use crate::error::TransitionError;
use crate::models::{
    AnalysisOutcome, Classification, Document, ExtractionMethod, Stage, StageStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentUpdate {
    ExtractionStarted,
    ExtractionCompleted {
        text: String,
        method: ExtractionMethod,
    },
    ExtractionFailed {
        error: String,
    },
    AnalysisStarted,
    AnalysisCompleted {
        classification: Classification,
        outcome: AnalysisOutcome,
    },
    AnalysisFailed {
        error: String,
    },
    IndexingStarted,
    IndexingCompleted {
        chunks: usize,
    },
    IndexingFailed {
        error: String,
    },
    /// Puts a stage, and every stage after it, back to pending.
    StageReset(Stage),
    Deactivated,
}

impl DocumentUpdate {
    /// The `*Failed` update of `stage`.
    pub fn failed(stage: Stage, error: impl Into<String>) -> Self {
        let error = error.into();
        match stage {
            Stage::Extract => DocumentUpdate::ExtractionFailed { error },
            Stage::Analyze => DocumentUpdate::AnalysisFailed { error },
            Stage::Index => DocumentUpdate::IndexingFailed { error },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DocumentUpdate::ExtractionStarted => "extraction_started",
            DocumentUpdate::ExtractionCompleted { .. } => "extraction_completed",
            DocumentUpdate::ExtractionFailed { .. } => "extraction_failed",
            DocumentUpdate::AnalysisStarted => "analysis_started",
            DocumentUpdate::AnalysisCompleted { .. } => "analysis_completed",
            DocumentUpdate::AnalysisFailed { .. } => "analysis_failed",
            DocumentUpdate::IndexingStarted => "indexing_started",
            DocumentUpdate::IndexingCompleted { .. } => "indexing_completed",
            DocumentUpdate::IndexingFailed { .. } => "indexing_failed",
            DocumentUpdate::StageReset(_) => "stage_reset",
            DocumentUpdate::Deactivated => "deactivated",
        }
    }
}

impl Document {
    fn extraction_ready(&self) -> bool {
        self.extraction_status == StageStatus::Completed
            && self
                .extracted_text
                .as_deref()
                .is_some_and(|text| !text.trim().is_empty())
    }

    fn require_active(&self) -> Result<(), TransitionError> {
        if self.active {
            Ok(())
        } else {
            Err(TransitionError::Inactive(self.id.clone()))
        }
    }

    fn require_processing(&self, stage: Stage) -> Result<(), TransitionError> {
        if self.status_of(stage) == StageStatus::Processing {
            Ok(())
        } else {
            Err(TransitionError::NotProcessing {
                document_id: self.id.clone(),
                stage,
            })
        }
    }

    /// A stage starts from pending or failed. Completed work is only redone
    /// through a [`DocumentUpdate::StageReset`].
    fn require_startable(&self, stage: Stage) -> Result<(), TransitionError> {
        self.require_active()?;
        match self.status_of(stage) {
            StageStatus::Pending | StageStatus::Failed => Ok(()),
            status => Err(TransitionError::AlreadyStarted {
                document_id: self.id.clone(),
                stage,
                status,
            }),
        }
    }

    fn require_idle_from(&self, stage: Stage) -> Result<(), TransitionError> {
        match Stage::ALL
            .into_iter()
            .filter(|candidate| *candidate >= stage)
            .find(|candidate| self.status_of(*candidate) == StageStatus::Processing)
        {
            Some(busy) => Err(TransitionError::StageBusy {
                document_id: self.id.clone(),
                stage: busy,
            }),
            None => Ok(()),
        }
    }

    fn require_prerequisite(&self, stage: Stage) -> Result<(), TransitionError> {
        match stage {
            Stage::Extract => Ok(()),
            Stage::Analyze if !self.extraction_ready() => {
                Err(TransitionError::ExtractionIncomplete(self.id.clone()))
            }
            Stage::Index if self.analysis_status != StageStatus::Completed => {
                Err(TransitionError::AnalysisIncomplete(self.id.clone()))
            }
            _ => Ok(()),
        }
    }

    fn check(&self, update: &DocumentUpdate) -> Result<(), TransitionError> {
        match update {
            DocumentUpdate::ExtractionStarted => self.require_startable(Stage::Extract),
            DocumentUpdate::ExtractionCompleted { text, .. } => {
                self.require_active()?;
                self.require_processing(Stage::Extract)?;
                if text.trim().is_empty() {
                    return Err(TransitionError::EmptyText(self.id.clone()));
                }
                Ok(())
            }
            DocumentUpdate::ExtractionFailed { .. } => self.require_processing(Stage::Extract),
            DocumentUpdate::AnalysisStarted => {
                self.require_startable(Stage::Analyze)?;
                self.require_prerequisite(Stage::Analyze)
            }
            DocumentUpdate::AnalysisCompleted { .. } => {
                self.require_active()?;
                self.require_processing(Stage::Analyze)?;
                self.require_prerequisite(Stage::Analyze)
            }
            DocumentUpdate::AnalysisFailed { .. } => self.require_processing(Stage::Analyze),
            DocumentUpdate::IndexingStarted => {
                self.require_startable(Stage::Index)?;
                self.require_prerequisite(Stage::Index)
            }
            DocumentUpdate::IndexingCompleted { .. } => {
                self.require_active()?;
                self.require_processing(Stage::Index)?;
                self.require_prerequisite(Stage::Index)
            }
            DocumentUpdate::IndexingFailed { .. } => self.require_processing(Stage::Index),
            DocumentUpdate::StageReset(stage) => {
                self.require_active()?;
                self.require_idle_from(*stage)?;
                self.require_prerequisite(*stage)
            }
            DocumentUpdate::Deactivated => Ok(()),
        }
    }

    /// Applies `update` if it is a legal move from the current state.
    pub fn apply(&mut self, update: DocumentUpdate) -> Result<(), TransitionError> {
        self.check(&update)?;

        match update {
            DocumentUpdate::ExtractionStarted => {
                self.extraction_status = StageStatus::Processing;
                self.extraction_error = None;
            }
            DocumentUpdate::ExtractionCompleted { text, method } => {
                self.extraction_status = StageStatus::Completed;
                self.extracted_text = Some(text);
                self.extraction_method = Some(method);
                self.extraction_error = None;
            }
            DocumentUpdate::ExtractionFailed { error } => {
                self.extraction_status = StageStatus::Failed;
                self.extraction_error = Some(error);
            }
            DocumentUpdate::AnalysisStarted => {
                self.analysis_status = StageStatus::Processing;
                self.analysis_error = None;
            }
            DocumentUpdate::AnalysisCompleted {
                classification,
                outcome,
            } => {
                self.analysis_status = StageStatus::Completed;
                self.analysis_error = None;
                self.document_type = Some(classification.document_type);
                self.classification_confidence = Some(classification.confidence);
                self.structured_fields = outcome.fields;
                self.summary = outcome.summary;
                self.key_points = outcome.key_points;
            }
            DocumentUpdate::AnalysisFailed { error } => {
                self.analysis_status = StageStatus::Failed;
                self.analysis_error = Some(error);
            }
            DocumentUpdate::IndexingStarted => {
                self.index_status = StageStatus::Processing;
                self.index_error = None;
                self.indexed = false;
            }
            DocumentUpdate::IndexingCompleted { chunks } => {
                self.index_status = StageStatus::Completed;
                self.indexed = true;
                self.indexed_chunks = chunks;
            }
            DocumentUpdate::IndexingFailed { error } => {
                self.index_status = StageStatus::Failed;
                self.index_error = Some(error);
                self.indexed = false;
                self.indexed_chunks = 0;
            }
            DocumentUpdate::StageReset(stage) => self.reset_from(stage),
            DocumentUpdate::Deactivated => self.active = false,
        }

        self.updated_at = Utc::now();
        Ok(())
    }

    fn reset_from(&mut self, stage: Stage) {
        if stage == Stage::Extract {
            self.extraction_status = StageStatus::Pending;
            self.extracted_text = None;
            self.extraction_method = None;
            self.extraction_error = None;
        }
        if matches!(stage, Stage::Extract | Stage::Analyze) {
            self.analysis_status = StageStatus::Pending;
            self.analysis_error = None;
        }
        self.index_status = StageStatus::Pending;
        self.index_error = None;
        self.indexed = false;
        self.indexed_chunks = 0;
    }
}

/// Where a document stands in the pipeline, derived from its stage statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Extracting,
    Extracted,
    Analyzing,
    Analyzed,
    Indexing,
    Indexed,
    Failed(Stage),
}

impl PipelineState {
    /// No further stage will run without an explicit reprocess.
    pub fn is_settled(self) -> bool {
        matches!(self, PipelineState::Indexed | PipelineState::Failed(_))
    }
}

impl From<&Document> for PipelineState {
    fn from(document: &Document) -> Self {
        match document.index_status {
            StageStatus::Completed if document.indexed => return PipelineState::Indexed,
            StageStatus::Processing => return PipelineState::Indexing,
            StageStatus::Failed => return PipelineState::Failed(Stage::Index),
            _ => {}
        }
        match document.analysis_status {
            StageStatus::Completed => return PipelineState::Analyzed,
            StageStatus::Processing => return PipelineState::Analyzing,
            StageStatus::Failed => return PipelineState::Failed(Stage::Analyze),
            StageStatus::Pending => {}
        }
        match document.extraction_status {
            StageStatus::Completed => PipelineState::Extracted,
            StageStatus::Processing => PipelineState::Extracting,
            StageStatus::Failed => PipelineState::Failed(Stage::Extract),
            StageStatus::Pending => PipelineState::Pending,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Pending => f.write_str("pending"),
            PipelineState::Extracting => f.write_str("extracting"),
            PipelineState::Extracted => f.write_str("extracted"),
            PipelineState::Analyzing => f.write_str("analyzing"),
            PipelineState::Analyzed => f.write_str("analyzed"),
            PipelineState::Indexing => f.write_str("indexing"),
            PipelineState::Indexed => f.write_str("indexed"),
            PipelineState::Failed(stage) => write!(f, "failed ({stage})"),
        }
    }
}
