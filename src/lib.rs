//! # edgequake-receipt
//!
//! Read payment receipts (and business cards) with OCR, pull out the date,
//! merchant, amount and currency, and rename each file after what it says.
//!
//! ## Pipeline Overview
//!
//! ```text
//! scans/
//!  │
//!  ├─ 1. Discover   pdf, jpg, jpeg, png, tif, tiff (non-recursive)
//!  ├─ 2. Normalize  first PDF page rasterised via pdfium (spawn_blocking)
//!  ├─ 3. OCR        template OCR service or vision LLM, with retry/backoff
//!  ├─ 4. Extract    LLM or template mapping → ExtractedFields
//!  ├─ 5. Persist    <stem>_ocr_output.txt + <stem>_extracted_info.json
//!  └─ 6. Rename     240415_STARBUCKS_5000_KRW.jpg (collision-safe)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_receipt::{Pipeline, PipelineConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // OCR endpoints from CLOVA_OCR_URL / CLOVA_OCR_SECRET,
//!     // the extractor from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY.
//!     let config = PipelineConfig::builder().default_currency("KRW").build()?;
//!     let pipeline = Pipeline::from_config(config)?;
//!     let summary = pipeline.process_directory(Path::new("scans")).await?;
//!     eprintln!(
//!         "{} renamed, {} skipped, {} failed",
//!         summary.succeeded,
//!         summary.skipped,
//!         summary.failed()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `receipt2name` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-receipt = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod fields;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ArtifactNaming, ExtractionMode, ExtractorKind, OcrProvider, PageSelection, PipelineConfig,
    PipelineConfigBuilder, RenameAction, RetryPolicy,
};
pub use error::{ReceiptError, StageError};
pub use fields::{CurrencyCode, CurrencyConversion, ExtractedFields};
pub use output::{
    BatchSummary, DocumentReport, DocumentState, FailedStage, OcrResult, ProcessingOutcome,
    RenameDecision,
};
pub use process::{Pipeline, StopHandle};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
