//! Fast engine: traditional pattern-based recognition via Tesseract.
//!
//! Uses the tesseract-static crate for static linking (no system
//! dependencies). Training data is downloaded and cached per language on
//! first use. Stronger than the learned-model engine on noisy or low-quality
//! scans.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tesseract_static::tesseract::Tesseract;

use crate::engine::{EngineOutput, RecognitionEngine};
use crate::error::RecognitionError;
use crate::model::{EngineKind, PageRecognition, RecognitionConfig, SegmentationMode};
use crate::pipeline::NormalizedDocument;

struct FastInner {
    tessdata_dir: PathBuf,
    /// Tesseract instances are cheap, but the underlying model data is not;
    /// recognition runs hold this to respect the configured memory ceiling.
    model_access: Mutex<()>,
}

/// Tesseract-backed recognition engine.
pub struct FastEngine {
    inner: Arc<FastInner>,
}

impl FastEngine {
    pub fn new() -> Result<Self, RecognitionError> {
        let tessdata_dir = tessdata_cache_dir()?;
        Ok(Self {
            inner: Arc::new(FastInner {
                tessdata_dir,
                model_access: Mutex::new(()),
            }),
        })
    }
}

#[async_trait]
impl RecognitionEngine for FastEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Fast
    }

    fn description(&self) -> &'static str {
        "Tesseract pattern-based engine - better for noisy or low-quality scans"
    }

    async fn recognize(
        &self,
        document: &NormalizedDocument,
        config: &RecognitionConfig,
    ) -> Result<EngineOutput, RecognitionError> {
        // Documents with an embedded text layer skip raster recognition.
        if let Some(text) = &document.embedded_text {
            return Ok(embedded_text_output(text));
        }

        let inner = Arc::clone(&self.inner);
        let pages: Vec<(u32, image::DynamicImage)> = document
            .pages
            .iter()
            .map(|p| (p.number, p.image.clone()))
            .collect();
        let language = config.primary_language().to_string();
        let segmentation = config.segmentation_mode;
        let batch_size = config.batch_size.max(1);

        let page_results = tokio::task::spawn_blocking(move || {
            recognize_pages(&inner, &pages, &language, segmentation, batch_size)
        })
        .await
        .map_err(|e| RecognitionError::Internal(format!("fast engine task failed: {}", e)))??;

        Ok(EngineOutput::from_pages(
            page_results,
            serde_json::json!({ "engine": "tesseract", "language": config.primary_language() }),
        ))
    }

    fn supported_languages(&self) -> Vec<String> {
        // Tesseract supports many languages; these cover the common packs.
        vec![
            "eng", "deu", "fra", "spa", "ita", "por", "nld", "jpn", "chi_sim", "chi_tra", "kor",
            "ara", "rus",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

fn recognize_pages(
    inner: &FastInner,
    pages: &[(u32, image::DynamicImage)],
    language: &str,
    segmentation: SegmentationMode,
    batch_size: usize,
) -> Result<Vec<PageRecognition>, RecognitionError> {
    let tessdata = ensure_traineddata(&inner.tessdata_dir, language)?;

    let _model_guard = inner
        .model_access
        .lock()
        .map_err(|_| RecognitionError::EngineFailure("model lock poisoned".to_string()))?;

    let mut results = Vec::with_capacity(pages.len());
    for batch in pages.chunks(batch_size) {
        for (number, image) in batch {
            results.push(recognize_page(&tessdata, language, segmentation, *number, image)?);
        }
    }
    Ok(results)
}

fn recognize_page(
    tessdata: &str,
    language: &str,
    segmentation: SegmentationMode,
    number: u32,
    image: &image::DynamicImage,
) -> Result<PageRecognition, RecognitionError> {
    // BMP is always supported by leptonica, so hand the page over as BMP.
    let rgb = image.to_rgb8();
    let mut bmp_data = Vec::new();
    rgb.write_to(
        &mut std::io::Cursor::new(&mut bmp_data),
        image::ImageFormat::Bmp,
    )
    .map_err(|e| RecognitionError::EngineFailure(format!("Failed to convert to BMP: {}", e)))?;

    let mut tess = Tesseract::new(Some(tessdata), Some(language))
        .map_err(|e| RecognitionError::EngineFailure(format!("Failed to create Tesseract: {}", e)))?;

    tess = tess
        .set_variable("tessedit_pageseg_mode", segmentation_value(segmentation))
        .map_err(|e| RecognitionError::EngineFailure(format!("Failed to set segmentation: {}", e)))?;

    tess = tess.set_image_from_mem(&bmp_data).map_err(|e| {
        RecognitionError::EngineFailure(format!(
            "Failed to set page {} image ({} bytes): {}",
            number,
            bmp_data.len(),
            e
        ))
    })?;

    tess = tess
        .recognize()
        .map_err(|e| RecognitionError::EngineFailure(format!("Failed to recognize text: {}", e)))?;

    let text = tess
        .get_text()
        .map_err(|e| RecognitionError::EngineFailure(format!("Failed to get text: {}", e)))?;
    let text = text.trim().to_string();

    let word_count = text.split_whitespace().count() as u32;
    // mean_text_conf is 0-100; an empty page contributes zero confidence
    let confidence = if word_count == 0 {
        0.0
    } else {
        tess.mean_text_conf() as f32 / 100.0
    };

    Ok(PageRecognition {
        page_number: number,
        text,
        confidence,
        word_count,
    })
}

fn segmentation_value(mode: SegmentationMode) -> &'static str {
    match mode {
        SegmentationMode::Auto => "3",
        SegmentationMode::SingleColumn => "4",
        SegmentationMode::SingleBlock => "6",
        SegmentationMode::SingleLine => "7",
    }
}

fn embedded_text_output(text: &str) -> EngineOutput {
    let page = PageRecognition {
        page_number: 1,
        text: text.to_string(),
        // Direct text extraction is near-certain
        confidence: 0.95,
        word_count: text.split_whitespace().count() as u32,
    };
    EngineOutput::from_pages(
        vec![page],
        serde_json::json!({ "engine": "tesseract", "source": "embedded_text" }),
    )
}

// ============================================================================
// Tessdata download helpers
// ============================================================================

fn tessdata_cache_dir() -> Result<PathBuf, RecognitionError> {
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hybrid-ocr")
        .join("tessdata");

    std::fs::create_dir_all(&cache_dir).map_err(|e| {
        RecognitionError::Initialization(format!("Failed to create tessdata directory: {}", e))
    })?;

    Ok(cache_dir)
}

/// Ensure training data for a language is cached, returning the directory
/// path Tesseract expects.
fn ensure_traineddata(cache_dir: &Path, language: &str) -> Result<String, RecognitionError> {
    let traineddata_path = cache_dir.join(format!("{}.traineddata", language));

    if !traineddata_path.exists() {
        let url = traineddata_url(language);
        tracing::info!(
            "Downloading tessdata for '{}' (this may take a moment)...",
            language
        );
        download_file(&url, &traineddata_path)?;
        tracing::info!("Downloaded tessdata to {:?}", traineddata_path);
    }

    cache_dir
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| RecognitionError::Initialization("Invalid tessdata path".to_string()))
}

/// tessdata_fast keeps downloads small
fn traineddata_url(language: &str) -> String {
    format!(
        "https://github.com/tesseract-ocr/tessdata_fast/raw/main/{}.traineddata",
        language
    )
}

fn download_file(url: &str, path: &Path) -> Result<(), RecognitionError> {
    let response = ureq::get(url).call().map_err(|e| {
        RecognitionError::Initialization(format!("Failed to download tessdata: {}", e))
    })?;

    let buffer = response.into_body().read_to_vec().map_err(|e| {
        RecognitionError::Initialization(format!("Failed to read tessdata response: {}", e))
    })?;

    std::fs::write(path, &buffer).map_err(|e| {
        RecognitionError::Initialization(format!("Failed to write tessdata file: {}", e))
    })?;

    Ok(())
}
