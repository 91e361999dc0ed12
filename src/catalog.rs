//! Boundary toward the document catalog.
//!
//! The catalog owns documents (bytes, mime types, canonical text); this
//! service only consumes bytes and reports fused text back. The trait keeps
//! the scheduler independent of whichever catalog implementation is wired in.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::RecognitionError;

#[async_trait]
pub trait DocumentCatalog: Send + Sync {
    /// Raw bytes of the document.
    async fn document_bytes(&self, document_id: &str) -> Result<Vec<u8>, RecognitionError>;

    /// Mime type of the document.
    async fn mime_type(&self, document_id: &str) -> Result<String, RecognitionError>;

    /// Called for fused completions only. The stored text is replaced
    /// monotonically: only when the new text is longer than what the catalog
    /// holds, unless `force` is set.
    async fn recognition_available(
        &self,
        document_id: &str,
        text: &str,
        force: bool,
    ) -> Result<(), RecognitionError>;
}

/// Directory-backed catalog: each document is a file named by its id, the
/// recognized text lives alongside it as `<id>.txt`.
pub struct FsCatalog {
    root: PathBuf,
}

impl FsCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn document_path(&self, document_id: &str) -> Result<PathBuf, RecognitionError> {
        // Ids are plain file names; anything path-like is rejected.
        if document_id.contains(['/', '\\']) || document_id.contains("..") {
            return Err(RecognitionError::InvalidRequest(format!(
                "invalid document id: {}",
                document_id
            )));
        }
        Ok(self.root.join(document_id))
    }

    fn text_path(&self, document_id: &str) -> Result<PathBuf, RecognitionError> {
        self.document_path(document_id)
            .map(|p| p.with_extension(match p.extension() {
                Some(ext) => format!("{}.txt", ext.to_string_lossy()),
                None => "txt".to_string(),
            }))
    }
}

/// Mime type from file extension; the pipeline falls back to magic-byte
/// sniffing for mislabeled PDFs.
pub fn mime_from_extension(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl DocumentCatalog for FsCatalog {
    async fn document_bytes(&self, document_id: &str) -> Result<Vec<u8>, RecognitionError> {
        let path = self.document_path(document_id)?;
        tokio::fs::read(&path).await.map_err(|e| {
            RecognitionError::Catalog(format!("failed to read {}: {}", path.display(), e))
        })
    }

    async fn mime_type(&self, document_id: &str) -> Result<String, RecognitionError> {
        let path = self.document_path(document_id)?;
        if !path.exists() {
            return Err(RecognitionError::Catalog(format!(
                "document {} not found",
                document_id
            )));
        }
        Ok(mime_from_extension(&path).to_string())
    }

    async fn recognition_available(
        &self,
        document_id: &str,
        text: &str,
        force: bool,
    ) -> Result<(), RecognitionError> {
        let path = self.text_path(document_id)?;

        if !force {
            if let Ok(existing) = tokio::fs::read_to_string(&path).await {
                if existing.len() >= text.len() {
                    tracing::debug!(
                        document_id,
                        "keeping existing text ({} chars >= {} chars)",
                        existing.len(),
                        text.len()
                    );
                    return Ok(());
                }
            }
        }

        tokio::fs::write(&path, text).await.map_err(|e| {
            RecognitionError::Catalog(format!("failed to write {}: {}", path.display(), e))
        })
    }
}
