//! Accurate engine: learned-model recognition via the ocrs library.
//!
//! Pure Rust, no system dependencies. Neural network models are downloaded
//! on first use and held behind a per-process handle that is initialized
//! lazily and reused across jobs.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::DynamicImage;
use ocrs::{DecodeMethod, ImageSource, OcrEngine, OcrEngineParams};
use rten::Model;

use crate::engine::{EngineOutput, RecognitionEngine};
use crate::error::RecognitionError;
use crate::model::{EngineKind, PageRecognition, RecognitionConfig};
use crate::pipeline::NormalizedDocument;

/// Models are published under the ocrs project bucket.
const MODEL_BASE_URL: &str = "https://ocrs-models.s3-accelerate.amazonaws.com/";

struct AccurateInner {
    /// Lazily-initialized model handle, shared by every job in the process.
    handle: Mutex<Option<Arc<OcrEngine>>>,
}

/// ocrs-backed recognition engine.
pub struct AccurateEngine {
    inner: Arc<AccurateInner>,
}

impl AccurateEngine {
    pub fn new() -> Result<Self, RecognitionError> {
        Ok(Self {
            inner: Arc::new(AccurateInner {
                handle: Mutex::new(None),
            }),
        })
    }
}

#[async_trait]
impl RecognitionEngine for AccurateEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Accurate
    }

    fn description(&self) -> &'static str {
        "Pure Rust learned-model engine - best accuracy on clean scans"
    }

    async fn recognize(
        &self,
        document: &NormalizedDocument,
        config: &RecognitionConfig,
    ) -> Result<EngineOutput, RecognitionError> {
        if let Some(text) = &document.embedded_text {
            return Ok(embedded_text_output(text));
        }

        let inner = Arc::clone(&self.inner);
        let pages: Vec<(u32, DynamicImage)> = document
            .pages
            .iter()
            .map(|p| (p.number, p.image.clone()))
            .collect();
        let detection_model = config.detection_model.clone();
        let recognition_model = config.recognition_model.clone();
        let batch_size = config.batch_size.max(1);

        let page_results = tokio::task::spawn_blocking(move || {
            let engine = engine_handle(&inner, &detection_model, &recognition_model)?;
            let mut results = Vec::with_capacity(pages.len());
            for batch in pages.chunks(batch_size) {
                for (number, image) in batch {
                    results.push(recognize_page(&engine, *number, image)?);
                }
            }
            Ok::<_, RecognitionError>(results)
        })
        .await
        .map_err(|e| RecognitionError::Internal(format!("accurate engine task failed: {}", e)))??;

        Ok(EngineOutput::from_pages(
            page_results,
            serde_json::json!({ "engine": "ocrs", "decode": "greedy" }),
        ))
    }

    fn supported_languages(&self) -> Vec<String> {
        // ocrs currently recognizes English/Latin text only
        vec!["eng".to_string()]
    }
}

/// Get the shared engine handle, loading models on first use.
fn engine_handle(
    inner: &AccurateInner,
    detection_model: &str,
    recognition_model: &str,
) -> Result<Arc<OcrEngine>, RecognitionError> {
    let mut slot = inner
        .handle
        .lock()
        .map_err(|_| RecognitionError::EngineFailure("model handle lock poisoned".to_string()))?;

    if let Some(engine) = slot.as_ref() {
        return Ok(Arc::clone(engine));
    }

    let detection_path = ensure_model_downloaded(detection_model)?;
    let recognition_path = ensure_model_downloaded(recognition_model)?;

    let detection = Model::load_file(&detection_path).map_err(|e| {
        RecognitionError::Initialization(format!("Failed to load detection model: {}", e))
    })?;
    let recognition = Model::load_file(&recognition_path).map_err(|e| {
        RecognitionError::Initialization(format!("Failed to load recognition model: {}", e))
    })?;

    let engine = OcrEngine::new(OcrEngineParams {
        detection_model: Some(detection),
        recognition_model: Some(recognition),
        decode_method: DecodeMethod::Greedy,
        ..Default::default()
    })
    .map_err(|e| {
        RecognitionError::Initialization(format!("Failed to create recognition engine: {}", e))
    })?;

    tracing::info!("accurate engine models loaded");

    let engine = Arc::new(engine);
    *slot = Some(Arc::clone(&engine));
    Ok(engine)
}

fn recognize_page(
    engine: &OcrEngine,
    number: u32,
    image: &DynamicImage,
) -> Result<PageRecognition, RecognitionError> {
    let rgb = image.to_rgb8();
    let dimensions = rgb.dimensions();

    let source = ImageSource::from_bytes(rgb.as_raw(), dimensions).map_err(|e| {
        RecognitionError::EngineFailure(format!("Failed to create image source: {}", e))
    })?;

    let input = engine
        .prepare_input(source)
        .map_err(|e| RecognitionError::EngineFailure(format!("Failed to prepare input: {}", e)))?;

    let word_rects = engine
        .detect_words(&input)
        .map_err(|e| RecognitionError::EngineFailure(format!("Failed to detect words: {}", e)))?;

    let line_rects = engine.find_text_lines(&input, &word_rects);

    let line_texts = engine
        .recognize_text(&input, &line_rects)
        .map_err(|e| RecognitionError::EngineFailure(format!("Failed to recognize text: {}", e)))?;

    let text: String = line_texts
        .iter()
        .filter_map(|line| line.as_ref())
        .map(|line| {
            line.words()
                .map(|word| word.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n");

    let word_count = text.split_whitespace().count() as u32;
    let confidence = if word_count == 0 {
        0.0
    } else {
        estimate_confidence(&text)
    };

    Ok(PageRecognition {
        page_number: number,
        text,
        confidence,
        word_count,
    })
}

fn embedded_text_output(text: &str) -> EngineOutput {
    let page = PageRecognition {
        page_number: 1,
        text: text.to_string(),
        confidence: 0.95,
        word_count: text.split_whitespace().count() as u32,
    };
    EngineOutput::from_pages(
        vec![page],
        serde_json::json!({ "engine": "ocrs", "source": "embedded_text" }),
    )
}

// ============================================================================
// Confidence estimation heuristics
// ============================================================================

/// Estimate recognition confidence from text quality.
///
/// ocrs exposes no per-character scores, so the page text itself is analyzed
/// for patterns that betray garbled recognition.
fn estimate_confidence(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }
    if text.len() < 5 {
        return 0.5; // Too short to judge
    }

    let char_score = char_frequency_score(text);
    let word_score = word_length_score(text);
    let whitespace_score = whitespace_score(text);
    let repetition_score = repetition_score(text);

    let confidence =
        0.40 * char_score + 0.30 * word_score + 0.15 * whitespace_score + 0.15 * repetition_score;

    confidence.clamp(0.0, 1.0)
}

/// Penalize heavy special-character content and low letter ratios.
fn char_frequency_score(text: &str) -> f32 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }

    let letters = text.chars().filter(|c| c.is_alphabetic()).count();
    let special = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace() && !c.is_ascii_punctuation())
        .count();

    let special_ratio = special as f32 / total as f32;
    let special_penalty = 1.0 - (special_ratio * 10.0).min(1.0);

    let letter_ratio = letters as f32 / total as f32;
    let letter_score = (letter_ratio * 1.5).min(1.0);

    special_penalty * 0.6 + letter_score * 0.4
}

/// Garbled recognition yields single-character "words" or absurdly long runs.
fn word_length_score(text: &str) -> f32 {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return 0.5;
    }

    let total_len: usize = words.iter().map(|w| w.len()).sum();
    let avg_len = total_len as f32 / words.len() as f32;

    // Typical prose averages 4-8 chars per word
    let avg_score = match avg_len as usize {
        0..=1 => 0.3,
        2..=3 => 0.7,
        4..=8 => 1.0,
        9..=12 => 0.8,
        _ => 0.4,
    };

    let single_count = words.iter().filter(|w| w.len() == 1).count();
    let single_ratio = single_count as f32 / words.len() as f32;
    let single_penalty = 1.0 - (single_ratio * 1.5).min(0.5);

    avg_score * single_penalty
}

/// Normal text is ~10-25% whitespace.
fn whitespace_score(text: &str) -> f32 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }

    let whitespace = text.chars().filter(|c| c.is_whitespace()).count();
    let ratio = (whitespace as f32 / total as f32) * 100.0;

    match ratio as usize {
        0..=5 => 0.5,
        6..=10 => 0.8,
        11..=25 => 1.0,
        26..=40 => 0.7,
        _ => 0.3,
    }
}

/// Runs like "aaaa" or "####" usually mean the recognizer got confused.
fn repetition_score(text: &str) -> f32 {
    let mut max_run = 1;
    let mut current = 1;
    let mut prev: Option<char> = None;

    for c in text.chars() {
        if Some(c) == prev && !c.is_whitespace() {
            current += 1;
            max_run = max_run.max(current);
        } else {
            current = 1;
        }
        prev = Some(c);
    }

    match max_run {
        1..=3 => 1.0,
        4..=5 => 0.8,
        6..=10 => 0.5,
        _ => 0.2,
    }
}

// ============================================================================
// Model download helpers
// ============================================================================

/// Ensure a model artifact is cached locally and return its path.
fn ensure_model_downloaded(model_name: &str) -> Result<std::path::PathBuf, RecognitionError> {
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hybrid-ocr")
        .join("models");

    std::fs::create_dir_all(&cache_dir).map_err(|e| {
        RecognitionError::Initialization(format!("Failed to create model cache: {}", e))
    })?;

    let model_path = cache_dir.join(model_name);

    if !model_path.exists() {
        let url = format!("{}{}", MODEL_BASE_URL, model_name);
        tracing::info!("Downloading {} (this may take a moment)...", model_name);
        download_file(&url, &model_path)?;
        tracing::info!("Downloaded {} to {:?}", model_name, model_path);
    }

    Ok(model_path)
}

fn download_file(url: &str, path: &Path) -> Result<(), RecognitionError> {
    let response = ureq::get(url).call().map_err(|e| {
        RecognitionError::Initialization(format!("Failed to download model: {}", e))
    })?;

    let buffer = response.into_body().read_to_vec().map_err(|e| {
        RecognitionError::Initialization(format!("Failed to read model response: {}", e))
    })?;

    std::fs::write(path, &buffer).map_err(|e| {
        RecognitionError::Initialization(format!("Failed to write model file: {}", e))
    })?;

    Ok(())
}
