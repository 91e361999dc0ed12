use async_trait::async_trait;

use crate::error::RecognitionError;
use crate::model::{EngineKind, PageRecognition, RecognitionConfig};
use crate::pipeline::NormalizedDocument;

/// Output of a single engine run over a normalized document.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub text: String,
    /// Mean of per-page confidences; a page with zero detected tokens
    /// contributes 0, not an excluded sample.
    pub confidence: f32,
    pub pages: Vec<PageRecognition>,
    /// Engine-specific diagnostics.
    pub metadata: serde_json::Value,
}

impl EngineOutput {
    /// Assemble a whole-document output from per-page results, joining page
    /// texts in order.
    pub fn from_pages(pages: Vec<PageRecognition>, metadata: serde_json::Value) -> Self {
        let text = pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let confidence = if pages.is_empty() {
            0.0
        } else {
            pages.iter().map(|p| p.confidence).sum::<f32>() / pages.len() as f32
        };
        Self {
            text,
            confidence,
            pages,
            metadata,
        }
    }
}

/// Trait that all recognition engines implement. The concrete set is closed:
/// fast (traditional pattern matcher) and accurate (learned model), selected
/// by [`EngineKind`].
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// Which engine slot this implementation fills.
    fn kind(&self) -> EngineKind;

    /// Human-readable description of the engine.
    fn description(&self) -> &'static str;

    /// Recognize text on every page of a normalized document. Engine-internal
    /// errors must be normalized to [`RecognitionError::EngineFailure`].
    async fn recognize(
        &self,
        document: &NormalizedDocument,
        config: &RecognitionConfig,
    ) -> Result<EngineOutput, RecognitionError>;

    /// Supported languages, as ISO 639-2 codes.
    fn supported_languages(&self) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: u32, text: &str, confidence: f32) -> PageRecognition {
        PageRecognition {
            page_number: n,
            text: text.to_string(),
            confidence,
            word_count: text.split_whitespace().count() as u32,
        }
    }

    #[test]
    fn output_confidence_is_page_mean() {
        let out = EngineOutput::from_pages(
            vec![page(1, "alpha", 0.8), page(2, "beta", 0.4)],
            serde_json::Value::Null,
        );
        assert!((out.confidence - 0.6).abs() < 1e-6);
        assert_eq!(out.text, "alpha\n\nbeta");
    }

    #[test]
    fn empty_page_counts_as_zero() {
        let out = EngineOutput::from_pages(
            vec![page(1, "alpha beta", 0.9), page(2, "", 0.0)],
            serde_json::Value::Null,
        );
        assert!((out.confidence - 0.45).abs() < 1e-6);
    }

    #[test]
    fn no_pages_yields_zero_confidence() {
        let out = EngineOutput::from_pages(vec![], serde_json::Value::Null);
        assert_eq!(out.confidence, 0.0);
        assert!(out.text.is_empty());
    }
}
