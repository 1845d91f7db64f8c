//! Progress-callback trait for per-document pipeline events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline walks each document through its state machine.
//!
//! # Example
//!
//! ```rust
//! use edgequake_receipt::{BatchProgressCallback, PipelineConfig, ProcessingOutcome};
//! use std::path::Path;
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_document_complete(&self, path: &Path, outcome: &ProcessingOutcome) {
//!         self.done.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{} → {}", path.display(), outcome.label());
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::{BatchSummary, DocumentState, ProcessingOutcome};
use std::path::Path;
use std::sync::Arc;

/// Called by the orchestrator as it processes each document.
///
/// Implementations must be `Send + Sync`: with `concurrency > 1` events for
/// different documents arrive from different tasks. All methods have default
/// no-op implementations so callers only override what they care about.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once after discovery, before any document is opened.
    fn on_batch_start(&self, total_documents: usize) {
        let _ = total_documents;
    }

    /// Called when a document leaves the `Discovered` state.
    ///
    /// `index` is 1-based in discovery order.
    fn on_document_start(&self, path: &Path, index: usize, total: usize) {
        let _ = (path, index, total);
    }

    /// Called on every state transition of a document.
    fn on_state(&self, path: &Path, state: DocumentState) {
        let _ = (path, state);
    }

    /// Called once per document with its terminal outcome.
    fn on_document_complete(&self, path: &Path, outcome: &ProcessingOutcome) {
        let _ = (path, outcome);
    }

    /// Called once after every started document has finished.
    fn on_batch_complete(&self, summary: &BatchSummary) {
        let _ = summary;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        transitions: AtomicUsize,
        completes: AtomicUsize,
        batch_total: AtomicUsize,
    }

    impl BatchProgressCallback for TrackingCallback {
        fn on_batch_start(&self, total_documents: usize) {
            self.batch_total.store(total_documents, Ordering::SeqCst);
        }

        fn on_document_start(&self, _path: &Path, _index: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_state(&self, _path: &Path, _state: DocumentState) {
            self.transitions.fetch_add(1, Ordering::SeqCst);
        }

        fn on_document_complete(&self, _path: &Path, _outcome: &ProcessingOutcome) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        let p = PathBuf::from("a.jpg");
        cb.on_batch_start(1);
        cb.on_document_start(&p, 1, 1);
        cb.on_state(&p, DocumentState::Normalizing);
        cb.on_document_complete(&p, &ProcessingOutcome::SkippedExisting);
        cb.on_batch_complete(&BatchSummary::default());
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        let p = PathBuf::from("r.png");

        tracker.on_batch_start(2);
        tracker.on_document_start(&p, 1, 2);
        tracker.on_state(&p, DocumentState::OcrPending);
        tracker.on_state(&p, DocumentState::ExtractionPending);
        tracker.on_document_complete(&p, &ProcessingOutcome::SkippedExisting);

        assert_eq!(tracker.batch_total.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.transitions.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10);
    }
}
