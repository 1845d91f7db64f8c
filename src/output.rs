//! Output types: OCR results, per-document outcomes and the batch summary.

use crate::error::StageError;
use crate::fields::ExtractedFields;
use serde::Serialize;
use std::path::PathBuf;

// ── OCR ──────────────────────────────────────────────────────────────────

/// Text recognised on one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageSpan {
    /// 0-based page index, matching [`crate::pipeline::render::PageImage::index`].
    pub index: usize,
    pub text: String,
}

/// The OCR stage's result for one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcrResult {
    /// Page texts joined by a single `\n`, in page order.
    pub text: String,
    pub pages: Vec<PageSpan>,
    /// Opaque provider payload passed through unchanged (the template OCR
    /// service stores its structured result here).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl OcrResult {
    /// Assemble a result from ordered page spans.
    pub fn from_pages(pages: Vec<PageSpan>, metadata: Option<serde_json::Value>) -> Self {
        let text = pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            text,
            pages,
            metadata,
        }
    }

    /// Join per-page results in order. Array metadata is flattened so the
    /// template entries stay one per page.
    pub fn concat(parts: Vec<OcrResult>) -> Self {
        let mut pages = Vec::new();
        let mut templates = Vec::new();
        for part in parts {
            pages.extend(part.pages);
            match part.metadata {
                Some(serde_json::Value::Array(items)) => templates.extend(items),
                Some(other) => templates.push(other),
                None => {}
            }
        }
        let metadata = (!templates.is_empty()).then(|| serde_json::Value::Array(templates));
        Self::from_pages(pages, metadata)
    }

    /// True when no page produced any non-whitespace text.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

// ── Per-document state ───────────────────────────────────────────────────

/// The stage a failed document stopped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStage {
    Normalize,
    Ocr,
    Extraction,
    Rename,
}

/// Where a document is in its run.
///
/// ```text
/// Discovered ─┬─ Skipped
///             └─ Normalizing → OcrPending → ExtractionPending → Renaming → Done
///                    (any of these) ─────────────────────────────────────→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Discovered,
    Skipped,
    Normalizing,
    OcrPending,
    ExtractionPending,
    Renaming,
    Done,
    Failed(FailedStage),
}

impl DocumentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentState::Skipped | DocumentState::Done | DocumentState::Failed(_)
        )
    }
}

/// Terminal result for one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Succeeded {
        fields: ExtractedFields,
        /// Where the source now lives (or was copied to). `None` when
        /// renaming is disabled.
        renamed_to: Option<PathBuf>,
    },
    SkippedExisting,
    /// Normalisation or OCR failed; no artifacts were written.
    FailedOcr { reason: StageError },
    /// OCR succeeded (its text artifact exists) but fields could not be read.
    FailedExtraction { reason: StageError },
    /// Both artifacts exist; the source keeps its original name.
    FailedRename { reason: StageError },
}

impl ProcessingOutcome {
    /// Short machine-friendly label, also used by the CLI.
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingOutcome::Succeeded { .. } => "succeeded",
            ProcessingOutcome::SkippedExisting => "skipped",
            ProcessingOutcome::FailedOcr { .. } => "failed_ocr",
            ProcessingOutcome::FailedExtraction { .. } => "failed_extraction",
            ProcessingOutcome::FailedRename { .. } => "failed_rename",
        }
    }

    pub fn is_failure(&self) -> bool {
        self.reason().is_some()
    }

    /// The error behind a failed outcome.
    pub fn reason(&self) -> Option<&StageError> {
        match self {
            ProcessingOutcome::FailedOcr { reason }
            | ProcessingOutcome::FailedExtraction { reason }
            | ProcessingOutcome::FailedRename { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn fields(&self) -> Option<&ExtractedFields> {
        match self {
            ProcessingOutcome::Succeeded { fields, .. } => Some(fields),
            _ => None,
        }
    }
}

/// Everything the orchestrator learned about one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentReport {
    /// The document's path as discovered.
    pub path: PathBuf,
    pub outcome: ProcessingOutcome,
    /// Stage the document stopped in, for failed outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<FailedStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_artifact: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields_artifact: Option<PathBuf>,
    /// Provider calls made by the OCR stage, retries included.
    pub ocr_attempts: u32,
    /// Provider calls made by the extraction stage, retries included.
    pub extraction_attempts: u32,
    pub duration_ms: u64,
}

impl DocumentReport {
    pub(crate) fn new(path: PathBuf, outcome: ProcessingOutcome) -> Self {
        Self {
            path,
            outcome,
            failed_stage: None,
            ocr_artifact: None,
            fields_artifact: None,
            ocr_attempts: 0,
            extraction_attempts: 0,
            duration_ms: 0,
        }
    }
}

/// The filename resolver's decision for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameDecision {
    /// Name built from the fields, before any collision suffix.
    pub proposed_name: String,
    /// Collision suffix (0 = none).
    pub suffix: u32,
    pub original: PathBuf,
    pub target: PathBuf,
}

// ── Batch ────────────────────────────────────────────────────────────────

/// How many succeeded documents lack each core field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MissingFieldStats {
    pub date: usize,
    pub place: usize,
    pub amount: usize,
    pub currency: usize,
}

impl MissingFieldStats {
    pub fn record(&mut self, fields: &ExtractedFields) {
        for name in fields.missing_fields() {
            match name {
                "date" => self.date += 1,
                "place" => self.place += 1,
                "amount" => self.amount += 1,
                "currency" => self.currency += 1,
                _ => {}
            }
        }
    }

    pub fn any(&self) -> bool {
        self.date + self.place + self.amount + self.currency > 0
    }
}

/// Aggregate result of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed_ocr: usize,
    pub failed_extraction: usize,
    pub failed_rename: usize,
    /// Documents never started because the batch was stopped.
    pub not_started: usize,
    /// Reports for every started document, in discovery order.
    pub reports: Vec<DocumentReport>,
    /// Why the batch halted early on a configuration-level error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    /// Set when a [`crate::process::StopHandle`] stopped the batch.
    pub cancelled: bool,
    pub missing: MissingFieldStats,
    pub duration_ms: u64,
}

impl BatchSummary {
    /// Count a finished document.
    pub fn record(&mut self, report: DocumentReport) {
        match &report.outcome {
            ProcessingOutcome::Succeeded { fields, .. } => {
                self.succeeded += 1;
                self.missing.record(fields);
            }
            ProcessingOutcome::SkippedExisting => self.skipped += 1,
            ProcessingOutcome::FailedOcr { .. } => self.failed_ocr += 1,
            ProcessingOutcome::FailedExtraction { .. } => self.failed_extraction += 1,
            ProcessingOutcome::FailedRename { .. } => self.failed_rename += 1,
        }
        self.reports.push(report);
    }

    pub fn failed(&self) -> usize {
        self.failed_ocr + self.failed_extraction + self.failed_rename
    }

    /// Documents discovered for this batch, started or not.
    pub fn total(&self) -> usize {
        self.reports.len() + self.not_started
    }

    /// No failures and no early stop.
    pub fn is_clean(&self) -> bool {
        self.failed() == 0 && self.halted.is_none() && !self.cancelled
    }
}
