//! Payload encoding: page bytes → base64 for provider request bodies.
//!
//! Both gateways send pages as base64. The template OCR service takes the
//! original JPEG/PNG/TIFF bytes; vision LLM APIs do not accept TIFF, so
//! [`to_image_data`] re-encodes TIFF pages as PNG before wrapping them.
//! Attachments carry `detail: "high"` so the model sees the full-resolution
//! page.

use crate::error::StageError;
use crate::pipeline::input::ImageKind;
use crate::pipeline::render::PageImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::io::Cursor;
use tracing::debug;

/// Base64 of the page bytes exactly as they will be sent.
pub fn to_base64(page: &PageImage) -> String {
    STANDARD.encode(&page.bytes)
}

/// Wrap a page as a vision-model image attachment.
///
/// `limit` is checked against the base64 that is actually attached, so a
/// TIFF page is measured after its PNG re-encode.
pub fn to_image_data(page: &PageImage, limit: usize) -> Result<ImageData, StageError> {
    let (bytes, mime) = match page.kind {
        ImageKind::Tiff => (tiff_to_png(page)?, "image/png"),
        kind => (page.bytes.clone(), kind.mime_type()),
    };
    let b64 = STANDARD.encode(&bytes);
    if b64.len() > limit {
        return Err(StageError::PayloadTooLarge {
            page: page.index + 1,
            bytes: b64.len(),
            limit,
        });
    }
    debug!("Encoded page {} → {} bytes base64", page.index + 1, b64.len());
    Ok(ImageData::new(b64, mime).with_detail("high"))
}

fn tiff_to_png(page: &PageImage) -> Result<Vec<u8>, StageError> {
    let corrupt = |e: image::ImageError| StageError::CorruptDocument {
        path: page.source.clone(),
        detail: format!("re-encoding TIFF page {}: {e}", page.index + 1),
    };
    let img = image::load_from_memory_with_format(&page.bytes, image::ImageFormat::Tiff)
        .map_err(corrupt)?;
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(corrupt)?;
    Ok(buf)
}

/// Reject the batch of pages before any network call if one is over `limit`.
///
/// The limit applies to the base64 payload, which is what providers meter.
pub fn check_payload(pages: &[PageImage], limit: usize) -> Result<(), StageError> {
    for page in pages {
        let bytes = base64_len(page.bytes.len());
        if bytes > limit {
            return Err(StageError::PayloadTooLarge {
                page: page.index + 1,
                bytes,
                limit,
            });
        }
    }
    Ok(())
}

fn base64_len(raw: usize) -> usize {
    raw.div_ceil(3) * 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::path::PathBuf;

    fn page(kind: ImageKind, bytes: Vec<u8>) -> PageImage {
        PageImage {
            index: 0,
            bytes,
            kind,
            width: 4,
            height: 4,
            source: PathBuf::from("r"),
        }
    }

    #[test]
    fn jpeg_passes_through() {
        let p = page(ImageKind::Jpeg, vec![0xFF, 0xD8, 0xFF]);
        let data = to_image_data(&p, usize::MAX).unwrap();
        assert_eq!(data.mime_type, "image/jpeg");
        assert_eq!(STANDARD.decode(&data.data).unwrap(), p.bytes);
        assert_eq!(to_base64(&p), data.data);
    }

    #[test]
    fn tiff_is_reencoded_as_png() {
        let mut tiff = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])))
            .write_to(&mut Cursor::new(&mut tiff), image::ImageFormat::Tiff)
            .unwrap();
        let data = to_image_data(&page(ImageKind::Tiff, tiff), usize::MAX).unwrap();
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).unwrap();
        assert_eq!(&decoded[1..4], b"PNG");
    }

    #[test]
    fn reencoded_tiff_is_measured_against_the_limit() {
        let mut tiff = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])))
            .write_to(&mut Cursor::new(&mut tiff), image::ImageFormat::Tiff)
            .unwrap();
        let p = page(ImageKind::Tiff, tiff);
        let sent = to_image_data(&p, usize::MAX).unwrap().data.len();

        assert!(to_image_data(&p, sent).is_ok());
        let err = to_image_data(&p, sent - 1).unwrap_err();
        assert_eq!(
            err,
            StageError::PayloadTooLarge {
                page: 1,
                bytes: sent,
                limit: sent - 1
            }
        );
    }

    #[test]
    fn payload_limit_is_checked_on_base64_size() {
        let p = page(ImageKind::Png, vec![0u8; 30]);
        assert!(check_payload(std::slice::from_ref(&p), 40).is_ok());
        let err = check_payload(&[p], 39).unwrap_err();
        assert_eq!(
            err,
            StageError::PayloadTooLarge {
                page: 1,
                bytes: 40,
                limit: 39
            }
        );
    }
}
