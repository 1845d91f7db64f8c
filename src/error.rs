//! Error types for the edgequake-receipt library.
//!
//! Two distinct error types reflect two distinct failure scopes:
//!
//! * [`ReceiptError`] is **fatal**: the run cannot proceed at all (input
//!   directory missing, invalid configuration, no provider configured).
//!   Returned as `Err(ReceiptError)` from the top-level pipeline entry points.
//!
//! * [`StageError`] is **per-document**: one stage failed for one document
//!   (unsupported file, throttled provider, unparseable model output). It is
//!   recorded in that document's [`crate::output::ProcessingOutcome`] and the
//!   batch moves on to the next file.
//!
//! `StageError` also carries the retry taxonomy: [`StageError::is_retryable`]
//! is what the retry controller consults, and [`StageError::is_config_level`]
//! is what the orchestrator consults before halting a batch.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All fatal errors returned by the edgequake-receipt library.
///
/// Document-level failures use [`StageError`] and are stored in
/// [`crate::output::DocumentReport`] rather than propagated here.
#[derive(Debug, Error)]
pub enum ReceiptError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file or directory was not found at the given path.
    #[error("Input not found: '{path}'\nCheck the path exists and is readable.")]
    InputNotFound { path: PathBuf },

    /// Process does not have read permission on the input.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    // ── Provider errors ───────────────────────────────────────────────────
    /// An OCR or LLM provider is not initialised (missing API key etc.).
    #[error("Provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output directory or file.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
If the auto-download failed, you can:\n\
  • Check your internet connection and try again.\n\
  • Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failure of one pipeline stage for one document.
///
/// Cloneable and serialisable so it can travel inside outcome reports and
/// the JSON summary printed by the CLI.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageError {
    // ── Normalisation (pre-flight, never retried) ─────────────────────────
    /// The file extension is not one of pdf, jpg, jpeg, png, tif, tiff.
    #[error("Unsupported format '{extension}' for '{path}'")]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// The file could not be decoded or rasterised.
    #[error("Document '{path}' is corrupt: {detail}")]
    CorruptDocument { path: PathBuf, detail: String },

    /// The PDF engine could not be loaded; every PDF would fail the same way.
    #[error("PDF renderer unavailable: {detail}")]
    RendererUnavailable { detail: String },

    /// A page payload exceeds the provider limit; no request was sent.
    #[error("Page {page} is {bytes} bytes, over the {limit}-byte provider limit")]
    PayloadTooLarge { page: usize, bytes: usize, limit: usize },

    // ── Provider responses ────────────────────────────────────────────────
    /// The provider signalled throttling (HTTP 429 or equivalent).
    #[error("Rate limited by '{provider}'{}", fmt_hint(.retry_after))]
    RateLimited {
        provider: String,
        #[serde(with = "opt_millis")]
        retry_after: Option<Duration>,
    },

    /// Network failure, timeout or 5xx.
    #[error("Transient failure from '{provider}': {detail}")]
    Transient { provider: String, detail: String },

    /// The response body did not parse as expected.
    #[error("Malformed response from '{provider}': {detail}")]
    MalformedResponse { provider: String, detail: String },

    /// The credential was rejected (invalid, expired, suspended).
    #[error("Credential rejected by '{provider}': {detail}")]
    AuthRejected { provider: String, detail: String },

    /// The requested mode is not enabled for the configured credential.
    #[error("Domain not enabled on '{provider}': {detail}")]
    DomainInvalid { provider: String, detail: String },

    // ── Extraction ────────────────────────────────────────────────────────
    /// Structured output could not be coerced into the field schema.
    #[error("Response does not match the field schema: {detail}")]
    SchemaViolation { detail: String },

    // ── Retry ─────────────────────────────────────────────────────────────
    /// Every attempt failed with a retryable error.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<StageError> },

    // ── Rename / artifacts ────────────────────────────────────────────────
    /// No free collision suffix was found for the target name.
    #[error("No free name for '{target}' after {attempts} candidates")]
    RenameConflict { target: PathBuf, attempts: u32 },

    /// Filesystem failure while writing artifacts or renaming.
    #[error("I/O error on '{path}': {detail}")]
    Io { path: PathBuf, detail: String },
}

impl StageError {
    /// Whether the retry controller may attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::RateLimited { .. }
                | StageError::Transient { .. }
                | StageError::MalformedResponse { .. }
        )
    }

    /// Errors that will fail every remaining document the same way.
    ///
    /// The orchestrator halts the batch when it sees one of these.
    pub fn is_config_level(&self) -> bool {
        matches!(
            self,
            StageError::AuthRejected { .. }
                | StageError::DomainInvalid { .. }
                | StageError::RendererUnavailable { .. }
        )
    }

    /// The provider's suggested wait, if it gave one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StageError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            detail: err.to_string(),
        }
    }
}

fn fmt_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

mod opt_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_u64(d.as_millis() as u64),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display_with_hint() {
        let e = StageError::RateLimited {
            provider: "clova".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        let msg = e.to_string();
        assert!(msg.contains("clova"), "got: {msg}");
        assert!(msg.contains("2000ms"), "got: {msg}");
    }

    #[test]
    fn rate_limited_display_without_hint() {
        let e = StageError::RateLimited {
            provider: "openai".into(),
            retry_after: None,
        };
        assert_eq!(e.to_string(), "Rate limited by 'openai'");
    }

    #[test]
    fn retry_classification() {
        let transient = StageError::Transient {
            provider: "p".into(),
            detail: "503".into(),
        };
        let auth = StageError::AuthRejected {
            provider: "p".into(),
            detail: "bad key".into(),
        };
        let schema = StageError::SchemaViolation {
            detail: "array".into(),
        };
        assert!(transient.is_retryable());
        assert!(!transient.is_config_level());
        assert!(!auth.is_retryable());
        assert!(auth.is_config_level());
        assert!(!schema.is_retryable());
        assert!(!schema.is_config_level());
    }

    #[test]
    fn domain_invalid_is_not_rate_limited() {
        let e = StageError::DomainInvalid {
            provider: "clova".into(),
            detail: "receipt domain".into(),
        };
        assert!(e.is_config_level());
        assert!(!e.is_retryable());
        assert_eq!(e.retry_after(), None);
    }

    #[test]
    fn retries_exhausted_display_includes_last_error() {
        let e = StageError::RetriesExhausted {
            attempts: 3,
            last: Box::new(StageError::Transient {
                provider: "clova".into(),
                detail: "HTTP 502".into(),
            }),
        };
        let msg = e.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("HTTP 502"));
    }

    #[test]
    fn stage_error_serialises_with_kind_tag() {
        let e = StageError::PayloadTooLarge {
            page: 1,
            bytes: 60,
            limit: 50,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["kind"], "payload_too_large");
        assert_eq!(v["limit"], 50);
    }

    #[test]
    fn invalid_config_display() {
        let e = ReceiptError::InvalidConfig("concurrency must be ≥ 1".into());
        assert!(e.to_string().contains("concurrency"));
    }
}
