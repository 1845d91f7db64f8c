//! Batch orchestration: drive each document through the pipeline.
//!
//! ## State machine
//!
//! ```text
//! Discovered ─┬─ Skipped                       (both artifacts already exist)
//!             └─ Normalizing → OcrPending → ExtractionPending → Renaming → Done
//! ```
//!
//! Any stage can end in `Failed(stage)`. The OCR text is written as soon as
//! OCR succeeds, so a document that fails extraction still leaves its text
//! behind; the JSON fields follow once extraction succeeds; the rename runs
//! last and never touches the artifacts' content.
//!
//! ## Batches
//!
//! Documents run concurrently up to `concurrency`. A document-level failure
//! is recorded and the batch moves on. An error that would fail every
//! remaining document the same way ([`StageError::is_config_level`]) stops
//! the batch instead: documents already in flight finish, the rest are
//! counted as not started. A [`StopHandle`] does the same on request.

use crate::config::{ExtractorKind, OcrProvider, PipelineConfig, RenameAction};
use crate::error::{ReceiptError, StageError};
use crate::fields::CurrencyCode;
use crate::output::{
    BatchSummary, DocumentReport, DocumentState, FailedStage, OcrResult, ProcessingOutcome,
};
use crate::pipeline::artifacts::{self, ArtifactPaths};
use crate::pipeline::currency::{self, RateLookup};
use crate::pipeline::extract::{FieldExtractor, LlmFieldExtractor, TemplateFieldExtractor};
use crate::pipeline::input::{self, SourceDocument};
use crate::pipeline::ocr::{self, ClovaOcrGateway, OcrGateway, VisionOcrGateway};
use crate::pipeline::render::{self, PageImage, PdfBackend, PdfiumBackend};
use crate::pipeline::retry::{with_retry, CooldownGate, RetryOutcome};
use crate::pipeline::{llm, rename};
use crate::progress::BatchProgressCallback;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// ── Stop handle ──────────────────────────────────────────────────────────

/// Stops a running batch before its next document starts.
///
/// Cheap to clone; every clone controls the same pipeline.
#[derive(Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

#[derive(Default)]
struct StopState {
    cancelled: AtomicBool,
    halted: Mutex<Option<String>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop (e.g. on Ctrl-C). In-flight documents finish.
    pub fn stop(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Stop because of a configuration-level error. The first reason wins.
    pub fn halt(&self, reason: impl Into<String>) {
        if let Ok(mut halted) = self.inner.halted.lock() {
            if halted.is_none() {
                *halted = Some(reason.into());
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.inner.halted.lock().ok().and_then(|h| h.clone())
    }

    pub fn is_stopped(&self) -> bool {
        self.is_cancelled() || self.halt_reason().is_some()
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("cancelled", &self.is_cancelled())
            .field("halted", &self.halt_reason())
            .finish()
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// A configured pipeline: providers, renderer, gates and stop state.
pub struct Pipeline {
    config: PipelineConfig,
    ocr: Arc<dyn OcrGateway>,
    extractor: Arc<dyn FieldExtractor>,
    pdf: Arc<dyn PdfBackend>,
    rates: Option<Arc<dyn RateLookup>>,
    ocr_gate: Arc<CooldownGate>,
    extract_gate: Arc<CooldownGate>,
    stop: StopHandle,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("ocr", &self.ocr.name())
            .field("extractor", &self.extractor.name())
            .field("rates", &self.rates.is_some())
            .field("stop", &self.stop)
            .finish()
    }
}

impl Pipeline {
    /// Build a pipeline around explicit providers.
    ///
    /// When the OCR gateway and the extractor report the same provider name
    /// they share one cool-down gate, since they share one credential.
    pub fn new(
        config: PipelineConfig,
        ocr: Arc<dyn OcrGateway>,
        extractor: Arc<dyn FieldExtractor>,
    ) -> Self {
        let ocr_gate = Arc::new(CooldownGate::new(ocr.name(), config.max_in_flight));
        let extract_gate = if extractor.name() == ocr.name() {
            Arc::clone(&ocr_gate)
        } else {
            Arc::new(CooldownGate::new(extractor.name(), config.max_in_flight))
        };
        Self {
            config,
            ocr,
            extractor,
            pdf: Arc::new(PdfiumBackend::new()),
            rates: None,
            ocr_gate,
            extract_gate,
            stop: StopHandle::new(),
        }
    }

    /// Build the providers named by `config.ocr_provider` and
    /// `config.extractor` from the environment.
    pub fn from_config(config: PipelineConfig) -> Result<Self, ReceiptError> {
        let timeout = Duration::from_secs(config.api_timeout_secs);

        let ocr: Arc<dyn OcrGateway> = match config.ocr_provider {
            OcrProvider::Clova => Arc::new(ClovaOcrGateway::from_env(timeout)?),
            OcrProvider::Vision => {
                Arc::new(VisionOcrGateway::new(llm::resolve_provider(&config)?, &config))
            }
        };
        let extractor: Arc<dyn FieldExtractor> = match config.extractor {
            ExtractorKind::Llm => {
                Arc::new(LlmFieldExtractor::new(llm::resolve_provider(&config)?, &config))
            }
            ExtractorKind::Template => Arc::new(TemplateFieldExtractor::new()),
        };
        info!(
            "Pipeline: ocr={} extractor={} mode={}",
            ocr.name(),
            extractor.name(),
            config.mode
        );
        Ok(Self::new(config, ocr, extractor))
    }

    /// Replace the PDF renderer (tests plug in an in-memory one).
    pub fn with_pdf_backend(mut self, backend: Arc<dyn PdfBackend>) -> Self {
        self.pdf = backend;
        self
    }

    /// Enable conversion into `config.local_currency` using `rates`.
    pub fn with_rates(mut self, rates: Arc<dyn RateLookup>) -> Self {
        self.rates = Some(rates);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn notify(&self, f: impl FnOnce(&dyn BatchProgressCallback)) {
        if let Some(ref cb) = self.config.progress_callback {
            f(cb.as_ref());
        }
    }

    fn enter(&self, path: &Path, state: DocumentState) {
        debug!("{}: {:?}", path.display(), state);
        self.notify(|cb| cb.on_state(path, state));
    }

    // ── Entry points ─────────────────────────────────────────────────────

    /// Process every supported file in `dir` (non-recursive).
    pub async fn process_directory(&self, dir: &Path) -> Result<BatchSummary, ReceiptError> {
        let docs = input::discover_documents(dir)?;
        Ok(self.process_batch(&docs).await)
    }

    /// Process `paths` as one batch. Reports come back in input order.
    pub async fn process_batch(&self, paths: &[PathBuf]) -> BatchSummary {
        let start = Instant::now();
        let total = paths.len();
        info!("Processing {} documents (concurrency {})", total, self.config.concurrency);
        self.notify(|cb| cb.on_batch_start(total));

        let mut results: Vec<(usize, Option<DocumentReport>)> =
            stream::iter(paths.iter().enumerate().map(|(i, path)| async move {
                if self.stop.is_stopped() {
                    debug!("Not starting {}: batch stopped", path.display());
                    return (i, None);
                }
                let report = self.process_document(path, i + 1, total).await;
                if let Some(reason) = report.outcome.reason().filter(|r| r.is_config_level()) {
                    error!("Halting batch: {}", reason);
                    self.stop.halt(reason.to_string());
                }
                (i, Some(report))
            }))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(i, _)| *i);

        let mut summary = BatchSummary::default();
        for (_, report) in results {
            match report {
                Some(r) => summary.record(r),
                None => summary.not_started += 1,
            }
        }
        summary.halted = self.stop.halt_reason();
        summary.cancelled = self.stop.is_cancelled();
        summary.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Batch done in {}ms: {} succeeded, {} skipped, {} failed, {} not started",
            summary.duration_ms,
            summary.succeeded,
            summary.skipped,
            summary.failed(),
            summary.not_started
        );
        self.notify(|cb| cb.on_batch_complete(&summary));
        summary
    }

    /// Run one document to its terminal state. Never fails: every problem
    /// ends up in the report's outcome.
    ///
    /// `index` is 1-based and only used for progress reporting.
    pub async fn process_document(&self, path: &Path, index: usize, total: usize) -> DocumentReport {
        let start = Instant::now();
        self.notify(|cb| cb.on_document_start(path, index, total));

        let mut report = self.run_document(path).await;
        report.duration_ms = start.elapsed().as_millis() as u64;

        let state = match report.failed_stage {
            Some(stage) => DocumentState::Failed(stage),
            None if report.outcome == ProcessingOutcome::SkippedExisting => DocumentState::Skipped,
            None => DocumentState::Done,
        };
        self.enter(path, state);
        match report.outcome.reason() {
            Some(reason) => warn!("{}: {} ({})", path.display(), report.outcome.label(), reason),
            None => info!(
                "{}: {} in {}ms",
                path.display(),
                report.outcome.label(),
                report.duration_ms
            ),
        }
        self.notify(|cb| cb.on_document_complete(path, &report.outcome));
        report
    }

    async fn run_document(&self, path: &Path) -> DocumentReport {
        let config = &self.config;
        if artifacts::should_skip(path, config) {
            info!("Skipping {}: artifacts already exist", path.display());
            return DocumentReport::new(path.to_path_buf(), ProcessingOutcome::SkippedExisting);
        }

        // ── Normalize ────────────────────────────────────────────────────
        self.enter(path, DocumentState::Normalizing);
        let pages = match self.normalize(path).await {
            Ok(pages) => pages,
            Err(reason) => {
                return failed(path, FailedStage::Normalize, ProcessingOutcome::FailedOcr { reason })
            }
        };
        let doc_path = pages
            .first()
            .map(|p| p.source.clone())
            .unwrap_or_else(|| path.to_path_buf());
        let label = doc_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        // ── OCR ──────────────────────────────────────────────────────────
        self.enter(path, DocumentState::OcrPending);
        let page_slice = pages.as_slice();
        let RetryOutcome { result, attempts } = self.recognise(&label, page_slice).await;
        let ocr_attempts = attempts;
        let ocr_result = match result {
            Ok(r) => r,
            Err(reason) => {
                let mut r = failed(path, FailedStage::Ocr, ProcessingOutcome::FailedOcr { reason });
                r.ocr_attempts = ocr_attempts;
                return r;
            }
        };

        let mut paths = ArtifactPaths::for_document(&doc_path, config);
        if let Err(reason) = artifacts::write_atomic(&paths.ocr_text, &ocr_result.text).await {
            let mut r = failed(path, FailedStage::Ocr, ProcessingOutcome::FailedOcr { reason });
            r.ocr_attempts = ocr_attempts;
            return r;
        }

        // ── Extract ──────────────────────────────────────────────────────
        self.enter(path, DocumentState::ExtractionPending);
        let extraction = self.extract(&label, &ocr_result, page_slice).await;
        let extraction_attempts = extraction.attempts;
        let with_counts = |mut r: DocumentReport, paths: &ArtifactPaths, json: bool| {
            r.ocr_artifact = Some(paths.ocr_text.clone());
            if json {
                r.fields_artifact = Some(paths.fields_json.clone());
            }
            r.ocr_attempts = ocr_attempts;
            r.extraction_attempts = extraction_attempts;
            r
        };

        let fields = match extraction.result {
            Ok(f) => f,
            Err(reason) => {
                let r = failed(
                    path,
                    FailedStage::Extraction,
                    ProcessingOutcome::FailedExtraction { reason },
                );
                return with_counts(r, &paths, false);
            }
        };

        let json = match fields.to_artifact_json() {
            Ok(json) => json,
            Err(e) => {
                let reason = StageError::SchemaViolation {
                    detail: format!("serialising fields: {e}"),
                };
                let r = failed(
                    path,
                    FailedStage::Extraction,
                    ProcessingOutcome::FailedExtraction { reason },
                );
                return with_counts(r, &paths, false);
            }
        };
        if let Err(reason) = artifacts::write_atomic(&paths.fields_json, &json).await {
            let r = failed(
                path,
                FailedStage::Extraction,
                ProcessingOutcome::FailedExtraction { reason },
            );
            return with_counts(r, &paths, false);
        }

        // ── Rename ───────────────────────────────────────────────────────
        self.enter(path, DocumentState::Renaming);
        let renamed_to = match self.rename(&doc_path, &fields).await {
            Ok(target) => target,
            Err(reason) => {
                let r = failed(path, FailedStage::Rename, ProcessingOutcome::FailedRename { reason });
                return with_counts(r, &paths, true);
            }
        };
        if let (RenameAction::InPlace, Some(target)) = (&config.rename, &renamed_to) {
            paths = paths.follow_rename(target, config).await;
        }

        let outcome = ProcessingOutcome::Succeeded { fields, renamed_to };
        with_counts(DocumentReport::new(path.to_path_buf(), outcome), &paths, true)
    }

    /// OCR page by page, each page retried on its own. A failure on a later
    /// page never re-sends pages that were already recognised.
    async fn recognise(&self, label: &str, pages: &[PageImage]) -> RetryOutcome<OcrResult> {
        let gateway = self.ocr.as_ref();
        let mode = self.config.mode;
        if pages.is_empty() {
            return RetryOutcome {
                result: ocr::submit(gateway, pages, mode).await,
                attempts: 0,
            };
        }

        let mut parts = Vec::with_capacity(pages.len());
        let mut attempts = 0;
        for page in pages {
            let outcome = with_retry(
                &self.config.retry,
                &self.ocr_gate,
                &format!("{label} ocr p{}", page.index + 1),
                |_| ocr::submit(gateway, std::slice::from_ref(page), mode),
            )
            .await;
            attempts += outcome.attempts;
            match outcome.result {
                Ok(part) => parts.push(part),
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts,
                    }
                }
            }
        }
        RetryOutcome {
            result: Ok(OcrResult::concat(parts)),
            attempts,
        }
    }

    async fn normalize(&self, path: &Path) -> Result<Vec<PageImage>, StageError> {
        let doc = SourceDocument::open(path, self.pdf.as_ref()).await?;
        render::normalize(&doc, &self.config, self.pdf.as_ref()).await
    }

    /// Extraction with retry, then default currency and optional conversion.
    async fn extract(
        &self,
        label: &str,
        ocr_result: &OcrResult,
        pages: &[PageImage],
    ) -> RetryOutcome<crate::fields::ExtractedFields> {
        let extractor = self.extractor.as_ref();
        let mode = self.config.mode;
        let mut outcome = with_retry(
            &self.config.retry,
            &self.extract_gate,
            &format!("{label} extraction"),
            move |_| extractor.extract_fields(ocr_result, pages, mode),
        )
        .await;

        if let Ok(fields) = outcome.result.as_mut() {
            fields.apply_default_currency(self.config.default_currency.as_deref());
            let local = self
                .config
                .local_currency
                .as_deref()
                .and_then(CurrencyCode::parse);
            if let (Some(rates), Some(local)) = (self.rates.as_deref(), local.as_ref()) {
                *fields = currency::convert_to_local(fields, rates, local);
            }
        }
        outcome
    }

    /// Returns where the document ended up, or `None` when it was left alone.
    async fn rename(
        &self,
        doc_path: &Path,
        fields: &crate::fields::ExtractedFields,
    ) -> Result<Option<PathBuf>, StageError> {
        let target_dir = match &self.config.rename {
            RenameAction::Skip => return Ok(None),
            RenameAction::InPlace => doc_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            RenameAction::CopyTo(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| StageError::io(dir, &e))?;
                dir.clone()
            }
        };
        if !rename::has_name_fields(fields, self.config.mode) {
            warn!(
                "{}: no date, place or amount found; keeping the original name",
                doc_path.display()
            );
            return Ok(None);
        }

        let decision = rename::resolve(fields, doc_path, self.config.mode, &target_dir)?;
        let done = rename::apply(&decision, &self.config.rename).await?;
        Ok(Some(done.target))
    }
}

fn failed(path: &Path, stage: FailedStage, outcome: ProcessingOutcome) -> DocumentReport {
    let mut report = DocumentReport::new(path.to_path_buf(), outcome);
    report.failed_stage = Some(stage);
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_handle_clones_share_state() {
        let a = StopHandle::new();
        let b = a.clone();
        assert!(!b.is_stopped());
        a.stop();
        assert!(b.is_cancelled());
        assert!(b.is_stopped());
        assert!(b.halt_reason().is_none());
    }

    #[test]
    fn first_halt_reason_wins() {
        let h = StopHandle::new();
        h.halt("credential rejected");
        h.halt("renderer missing");
        assert_eq!(h.halt_reason().as_deref(), Some("credential rejected"));
        assert!(h.is_stopped());
        assert!(!h.is_cancelled());
    }
}
