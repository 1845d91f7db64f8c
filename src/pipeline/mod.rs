//! Pipeline stages for receipt extraction and renaming.
//!
//! Each submodule implements one step. The orchestrator in
//! [`crate::process`] drives a document through them in order and owns the
//! state machine; the stages themselves never decide whether a batch goes on.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ ocr ──▶ extract ──▶ currency ──▶ rename
//! (discover) (pdfium)  (base64)  (HTTP)   (LLM/tmpl)   (optional)   (fs)
//!                                  │          │
//!                                  └─ retry ──┘   artifacts: .txt + .json
//! ```
//!
//! 1. [`input`]     discover supported files and read format and page count
//! 2. [`render`]    rasterise PDF pages in `spawn_blocking`; images pass through
//! 3. [`encode`]    base64 pages and check provider payload limits
//! 4. [`ocr`]       template OCR service or vision LLM transcription
//! 5. [`extract`]   read payment fields from the OCR result
//! 6. [`currency`]  convert foreign amounts when a local currency is set
//! 7. [`artifacts`] atomic writes of the OCR text and JSON fields
//! 8. [`rename`]    build the target name and move the file collision-free
//!
//! [`retry`] wraps every provider call; [`llm`] holds the chat plumbing and
//! error classification shared by the vision OCR and LLM extractor, and
//! [`postprocess`] cleans model transcriptions.

pub mod artifacts;
pub mod currency;
pub mod encode;
pub mod extract;
pub mod input;
pub mod llm;
pub mod ocr;
pub mod postprocess;
pub mod render;
pub mod rename;
pub mod retry;
