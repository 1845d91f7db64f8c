//! Input discovery: find receipt documents and describe each one.
//!
//! A [`SourceDocument`] is read once, up front, so later stages can branch
//! on format and page count without touching the file again. Format is
//! decided by extension alone; decoding problems surface later as
//! [`StageError::CorruptDocument`] from the normaliser, where the bytes are
//! actually read.

use crate::error::{ReceiptError, StageError};
use crate::pipeline::render::PdfBackend;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Extensions accepted by the pipeline (compared case-insensitively).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "jpg", "jpeg", "png", "tif", "tiff"];

/// Raster sub-format of an image document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Jpeg,
    Png,
    Tiff,
}

impl ImageKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
            ImageKind::Tiff => "image/tiff",
        }
    }

    /// The format name the OCR gateway expects in its request body.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
            ImageKind::Tiff => "tiff",
        }
    }
}

/// Container format of a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Image(ImageKind),
    Pdf,
}

impl DocumentFormat {
    /// Classify a path by its extension.
    pub fn from_path(path: &Path) -> Result<Self, StageError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(DocumentFormat::Pdf),
            "jpg" | "jpeg" => Ok(DocumentFormat::Image(ImageKind::Jpeg)),
            "png" => Ok(DocumentFormat::Image(ImageKind::Png)),
            "tif" | "tiff" => Ok(DocumentFormat::Image(ImageKind::Tiff)),
            _ => Err(StageError::UnsupportedFormat {
                path: path.to_path_buf(),
                extension: ext,
            }),
        }
    }
}

/// A document discovered for processing. Immutable once opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDocument {
    /// Absolute path; the document's identity.
    pub path: PathBuf,
    pub format: DocumentFormat,
    pub page_count: usize,
    pub byte_size: u64,
}

impl SourceDocument {
    /// Read format, size and page count for `path`.
    ///
    /// The PDF backend is only consulted for PDFs.
    pub async fn open(path: &Path, backend: &dyn PdfBackend) -> Result<Self, StageError> {
        let format = DocumentFormat::from_path(path)?;
        let abs = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| StageError::io(path, &e))?;
        let meta = tokio::fs::metadata(&abs)
            .await
            .map_err(|e| StageError::io(&abs, &e))?;

        let page_count = match format {
            DocumentFormat::Image(_) => 1,
            DocumentFormat::Pdf => backend.page_count(&abs).await?,
        };

        debug!(
            "Opened {} ({:?}, {} pages, {} bytes)",
            abs.display(),
            format,
            page_count,
            meta.len()
        );

        Ok(SourceDocument {
            path: abs,
            format,
            page_count,
            byte_size: meta.len(),
        })
    }

    /// File name without extension, used to name artifacts.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string())
    }

    /// Original extension, preserved verbatim by the renamer.
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Whether `path` has one of the [`SUPPORTED_EXTENSIONS`].
pub fn is_supported(path: &Path) -> bool {
    DocumentFormat::from_path(path).is_ok()
}

/// List the supported documents directly inside `dir`, sorted by path.
///
/// Hidden files and subdirectories are skipped.
pub fn discover_documents(dir: &Path) -> Result<Vec<PathBuf>, ReceiptError> {
    let entries = std::fs::read_dir(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ReceiptError::InputNotFound {
            path: dir.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => ReceiptError::PermissionDenied {
            path: dir.to_path_buf(),
        },
        _ => ReceiptError::Internal(format!("reading {}: {e}", dir.display())),
    })?;

    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            !p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
        })
        .filter(|p| is_supported(p))
        .collect();
    found.sort();

    info!("Found {} documents in {}", found.len(), dir.display());
    Ok(found)
}
