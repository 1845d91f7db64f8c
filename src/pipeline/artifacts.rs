//! The two durable artifacts per document and the skip-existing guard.
//!
//! Every document gets an OCR text file and a JSON fields file, written
//! atomically: the body goes to a temp file in the target directory, which is
//! then persisted over the final name. A crash mid-write leaves either the old
//! artifact or none, never a truncated one, so the skip guard can trust any
//! non-empty file it finds.

use crate::config::{ArtifactNaming, PipelineConfig};
use crate::error::StageError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where a document's artifacts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub ocr_text: PathBuf,
    pub fields_json: PathBuf,
}

impl ArtifactPaths {
    /// Artifact paths for the document at `path`: in `output_dir` when set,
    /// otherwise next to the document.
    pub fn for_document(path: &Path, config: &PipelineConfig) -> Self {
        let dir = config
            .output_dir
            .clone()
            .or_else(|| path.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let (txt, json) = match config.artifact_naming {
            ArtifactNaming::Suffixed => (
                format!("{stem}_ocr_output.txt"),
                format!("{stem}_extracted_info.json"),
            ),
            ArtifactNaming::Plain => (format!("{stem}.txt"), format!("{stem}.json")),
        };
        Self {
            ocr_text: dir.join(txt),
            fields_json: dir.join(json),
        }
    }

    /// Both artifacts exist and are non-empty.
    pub fn complete(&self) -> bool {
        is_nonempty_file(&self.ocr_text) && is_nonempty_file(&self.fields_json)
    }

    /// Move existing artifacts to follow a renamed document, so a later
    /// skip-existing run recognises it under its new name.
    pub async fn follow_rename(&self, renamed: &Path, config: &PipelineConfig) -> ArtifactPaths {
        let next = ArtifactPaths::for_document(renamed, config);
        for (from, to) in [(&self.ocr_text, &next.ocr_text), (&self.fields_json, &next.fields_json)] {
            if from == to || !from.exists() {
                continue;
            }
            if to.exists() {
                warn!("Not moving {}: {} already exists", from.display(), to.display());
                continue;
            }
            if let Err(e) = tokio::fs::rename(from, to).await {
                warn!("Could not move {} → {}: {}", from.display(), to.display(), e);
            }
        }
        next
    }
}

fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Skip guard: with `skip_existing` on, true iff both artifacts for `path`
/// exist and are non-empty. Touches only the filesystem.
pub fn should_skip(path: &Path, config: &PipelineConfig) -> bool {
    config.skip_existing && ArtifactPaths::for_document(path, config).complete()
}

/// Write `contents` to `path` atomically, creating the parent directory.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), StageError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| StageError::io(&dir, &e))?;

    let target = path.to_path_buf();
    let body = contents.to_owned();
    tokio::task::spawn_blocking(move || {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| StageError::io(&dir, &e))?;
        let tmp_path = tmp.path().to_path_buf();
        tmp.write_all(body.as_bytes())
            .map_err(|e| StageError::io(&tmp_path, &e))?;
        tmp.flush().map_err(|e| StageError::io(&tmp_path, &e))?;
        tmp.persist(&target)
            .map_err(|e| StageError::io(&target, &e.error))?;
        debug!("Wrote {} ({} bytes)", target.display(), body.len());
        Ok(())
    })
    .await
    .map_err(|e| StageError::Io {
        path: path.to_path_buf(),
        detail: format!("write task panicked: {e}"),
    })?
}
