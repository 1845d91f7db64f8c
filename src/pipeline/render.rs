//! Document normalisation: turn a source document into ordered page images.
//!
//! ## Threading
//!
//! pdfium is CPU-bound and not safe to call from async contexts, so every
//! pdfium call runs inside `tokio::task::spawn_blocking`.
//!
//! ## Backends
//!
//! pdfium is a native library downloaded on first use. It sits behind
//! [`PdfBackend`]; integration tests plug in a backend that fabricates pages
//! in memory.
//!
//! Rasterised pages are JPEG-encoded straight into memory. Nothing is written
//! to a scratch directory.

use crate::config::PipelineConfig;
use crate::error::{ReceiptError, StageError};
use crate::pipeline::input::{DocumentFormat, ImageKind, SourceDocument};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One page ready for OCR submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// 0-based page index within the source document.
    pub index: usize,
    /// Encoded pixels (the original bytes for image inputs).
    pub bytes: Vec<u8>,
    pub kind: ImageKind,
    pub width: u32,
    pub height: u32,
    /// The document this page came from.
    pub source: PathBuf,
}

/// Rasterisation backend for PDF documents.
#[async_trait]
pub trait PdfBackend: Send + Sync {
    /// Number of pages in the PDF at `path`.
    async fn page_count(&self, path: &Path) -> Result<usize, StageError>;

    /// Render the 0-based `indices` at `dpi`, longest edge capped at `max_pixels`.
    async fn render(
        &self,
        path: &Path,
        indices: &[usize],
        dpi: u32,
        max_pixels: u32,
    ) -> Result<Vec<(usize, DynamicImage)>, StageError>;
}

/// pdfium-backed renderer.
///
/// `Pdfium` is neither `Send` nor `Sync`, so the library is bound inside each
/// blocking task rather than stored on the backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumBackend;

impl PdfiumBackend {
    pub fn new() -> Self {
        Self
    }

    /// Bind pdfium now (downloading it if needed) instead of on the first PDF.
    pub fn preload(&self) -> Result<(), ReceiptError> {
        bind()
            .map(drop)
            .map_err(|e| ReceiptError::PdfiumBindingFailed(e.to_string()))
    }
}

fn bind() -> Result<Pdfium, StageError> {
    pdfium_auto::bind_pdfium_silent().map_err(|e| StageError::RendererUnavailable {
        detail: e.to_string(),
    })
}

fn open_document<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, StageError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| StageError::CorruptDocument {
            path: path.to_path_buf(),
            detail: format!("{:?}", e),
        })
}

#[async_trait]
impl PdfBackend for PdfiumBackend {
    async fn page_count(&self, path: &Path) -> Result<usize, StageError> {
        let path = path.to_path_buf();
        let task_path = path.clone();
        tokio::task::spawn_blocking(move || {
            let pdfium = bind()?;
            let document = open_document(&pdfium, &task_path)?;
            let count = document.pages().len() as usize;
            Ok(count)
        })
        .await
        .map_err(|e| StageError::CorruptDocument {
            path,
            detail: format!("page-count task panicked: {e}"),
        })?
    }

    async fn render(
        &self,
        path: &Path,
        indices: &[usize],
        dpi: u32,
        max_pixels: u32,
    ) -> Result<Vec<(usize, DynamicImage)>, StageError> {
        let path = path.to_path_buf();
        let indices = indices.to_vec();
        let task_path = path.clone();
        tokio::task::spawn_blocking(move || {
            let pdfium = bind()?;
            render_blocking(&pdfium, &task_path, &indices, dpi, max_pixels)
        })
        .await
        .map_err(|e| StageError::CorruptDocument {
            path,
            detail: format!("render task panicked: {e}"),
        })?
    }
}

/// Blocking implementation of page rendering.
fn render_blocking(
    pdfium: &Pdfium,
    path: &Path,
    indices: &[usize],
    dpi: u32,
    max_pixels: u32,
) -> Result<Vec<(usize, DynamicImage)>, StageError> {
    let document = open_document(pdfium, path)?;
    let pages = document.pages();
    let total = pages.len() as usize;

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(indices.len());
    for &idx in indices {
        if idx >= total {
            return Err(StageError::CorruptDocument {
                path: path.to_path_buf(),
                detail: format!("page {} out of range (document has {total})", idx + 1),
            });
        }
        let page = pages
            .get(idx as u16)
            .map_err(|e| StageError::CorruptDocument {
                path: path.to_path_buf(),
                detail: format!("page {}: {:?}", idx + 1, e),
            })?;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| StageError::CorruptDocument {
                path: path.to_path_buf(),
                detail: format!("rasterising page {}: {:?}", idx + 1, e),
            })?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        results.push((idx, image));
    }
    Ok(results)
}

/// Produce the ordered page images for `doc`.
///
/// Images become a single page carrying their original bytes. PDFs are
/// rasterised for the configured page selection (first page only unless
/// `all_pages` or an explicit selection says otherwise) and JPEG-encoded.
pub async fn normalize(
    doc: &SourceDocument,
    config: &PipelineConfig,
    backend: &dyn PdfBackend,
) -> Result<Vec<PageImage>, StageError> {
    match doc.format {
        DocumentFormat::Image(kind) => {
            let bytes = tokio::fs::read(&doc.path)
                .await
                .map_err(|e| StageError::io(&doc.path, &e))?;
            let (width, height) = probe_dimensions(&bytes).map_err(|detail| {
                StageError::CorruptDocument {
                    path: doc.path.clone(),
                    detail,
                }
            })?;
            Ok(vec![PageImage {
                index: 0,
                bytes,
                kind,
                width,
                height,
                source: doc.path.clone(),
            }])
        }
        DocumentFormat::Pdf => {
            let indices = config.page_selection().to_indices(doc.page_count);
            if indices.is_empty() {
                return Err(StageError::CorruptDocument {
                    path: doc.path.clone(),
                    detail: format!("no pages selected (document has {})", doc.page_count),
                });
            }
            let rendered = backend
                .render(&doc.path, &indices, config.dpi, config.max_rendered_pixels)
                .await?;
            info!(
                "Rasterised {}/{} pages of {}",
                rendered.len(),
                doc.page_count,
                doc.path.display()
            );

            let mut pages = Vec::with_capacity(rendered.len());
            for (index, image) in rendered {
                let bytes = encode_jpeg(&image).map_err(|e| StageError::CorruptDocument {
                    path: doc.path.clone(),
                    detail: format!("encoding page {}: {e}", index + 1),
                })?;
                pages.push(PageImage {
                    index,
                    bytes,
                    kind: ImageKind::Jpeg,
                    width: image.width(),
                    height: image.height(),
                    source: doc.path.clone(),
                });
            }
            pages.sort_by_key(|p| p.index);
            Ok(pages)
        }
    }
}

/// Read image dimensions from the header without a full decode.
fn probe_dimensions(bytes: &[u8]) -> Result<(u32, u32), String> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| e.to_string())?
        .into_dimensions()
        .map_err(|e| e.to_string())
}

/// JPEG-encode a rendered page. JPEG has no alpha channel, so flatten to RGB first.
pub(crate) fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
    Ok(buf)
}
