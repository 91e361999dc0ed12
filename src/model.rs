//! Persisted data model: recognition configurations, per-engine results and
//! queue items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of recognition engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Fast,
    Accurate,
    Fused,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Accurate => "accurate",
            Self::Fused => "fused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(Self::Fast),
            "accurate" => Some(Self::Accurate),
            "fused" => Some(Self::Fused),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority. Ordinal: low < normal < high < urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Lifecycle of a per-engine recognition result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Lifecycle of a queue item. Completed, failed and cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Recognition output for a single page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageRecognition {
    pub page_number: u32,
    pub text: String,
    pub confidence: f32,
    pub word_count: u32,
}

/// One recognition result per (document, engine). Writes are upserts keyed on
/// that pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub document_id: String,
    pub engine: EngineKind,
    pub text: String,
    /// [0,1], or None while the run has not produced a score yet.
    pub confidence: Option<f32>,
    pub duration_ms: u64,
    /// Engine-specific diagnostics, free-form.
    pub metadata: serde_json::Value,
    pub pages: Vec<PageRecognition>,
    pub status: ResultStatus,
    pub error: Option<String>,
    /// Id of the RecognitionConfig this run used, retained for audit even
    /// after that config is deactivated.
    pub config_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecognitionResult {
    /// A fresh pending result, created when a job starts.
    pub fn pending(document_id: &str, engine: EngineKind, config_id: &str) -> Self {
        let now = Utc::now();
        Self {
            document_id: document_id.to_string(),
            engine,
            text: String::new(),
            confidence: None,
            duration_ms: 0,
            metadata: serde_json::Value::Null,
            pages: Vec::new(),
            status: ResultStatus::Pending,
            error: None,
            config_id: config_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One recognition processing request and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub document_id: String,
    /// Requested engine set, subset of {fast, accurate, fused}.
    pub engines: Vec<EngineKind>,
    pub priority: JobPriority,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// None means system-triggered (ingestion), Some(name) an explicit re-run.
    pub requested_by: Option<String>,
    /// Handles of the engine jobs launched for this item.
    pub job_handles: Vec<String>,
    /// Overrides the monotonic text-replacement guard on propagation.
    pub force: bool,
    pub error: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(
        document_id: &str,
        engines: Vec<EngineKind>,
        priority: JobPriority,
        requested_by: Option<String>,
        force: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.to_string(),
            engines,
            priority,
            status: QueueStatus::Queued,
            retry_count: 0,
            max_retries: 3,
            requested_by,
            job_handles: Vec::new(),
            force,
            error: None,
            scheduled_for: now,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Engines whose recognition must actually run, i.e. the requested set
    /// with `fused` expanded to its two prerequisites.
    pub fn engine_jobs(&self) -> Vec<EngineKind> {
        let mut jobs: Vec<EngineKind> = Vec::new();
        for engine in &self.engines {
            match engine {
                EngineKind::Fused => {
                    for dep in [EngineKind::Fast, EngineKind::Accurate] {
                        if !jobs.contains(&dep) {
                            jobs.push(dep);
                        }
                    }
                }
                other => {
                    if !jobs.contains(other) {
                        jobs.push(*other);
                    }
                }
            }
        }
        jobs
    }

    pub fn wants_fusion(&self) -> bool {
        self.engines.contains(&EngineKind::Fused)
    }
}

/// Flags controlling the optional enhancement steps of the image pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnhancementFlags {
    pub resize: bool,
    pub grayscale: bool,
    pub contrast: bool,
    pub denoise: bool,
    pub binarize: bool,
}

impl Default for EnhancementFlags {
    fn default() -> Self {
        Self {
            resize: true,
            grayscale: true,
            contrast: true,
            denoise: false,
            binarize: false,
        }
    }
}

/// Named, versioned recognition parameter set. At most one config is active
/// at any time; activating one deactivates all others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub active: bool,
    /// Languages in priority order, e.g. ["eng", "deu"].
    pub languages: Vec<String>,
    /// Page segmentation mode passed through to the fast engine.
    pub segmentation_mode: SegmentationMode,
    /// Model identifier for the accurate engine's text detector.
    pub detection_model: String,
    /// Model identifier for the accurate engine's text recognizer.
    pub recognition_model: String,
    /// Target render resolution for paginated documents.
    pub dpi: u32,
    /// Longest edge of a normalized page, in pixels.
    pub max_image_size: u32,
    pub enhancements: EnhancementFlags,
    /// Pages recognized per engine-model acquisition.
    pub batch_size: usize,
    pub max_memory_mb: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Page segmentation hint for the fast engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMode {
    #[default]
    Auto,
    SingleColumn,
    SingleBlock,
    SingleLine,
}

impl SegmentationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::SingleColumn => "single_column",
            Self::SingleBlock => "single_block",
            Self::SingleLine => "single_line",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "single_column" => Some(Self::SingleColumn),
            "single_block" => Some(Self::SingleBlock),
            "single_line" => Some(Self::SingleLine),
            _ => None,
        }
    }
}

impl RecognitionConfig {
    /// Baseline English configuration, created on first start when the config
    /// store is empty.
    pub fn baseline() -> Self {
        let now = Utc::now();
        Self {
            id: "default-eng".to_string(),
            name: "Default (English)".to_string(),
            version: 1,
            active: true,
            languages: vec!["eng".to_string()],
            segmentation_mode: SegmentationMode::Auto,
            detection_model: "text-detection.rten".to_string(),
            recognition_model: "text-recognition.rten".to_string(),
            dpi: 300,
            max_image_size: 4000,
            enhancements: EnhancementFlags::default(),
            batch_size: 4,
            max_memory_mb: 2048,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn primary_language(&self) -> &str {
        self.languages.first().map(String::as_str).unwrap_or("eng")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_ordinal() {
        assert!(JobPriority::Low < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::High);
        assert!(JobPriority::High < JobPriority::Urgent);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!QueueStatus::Queued.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert!(QueueStatus::Cancelled.is_terminal());
    }

    #[test]
    fn fused_request_expands_to_both_engines() {
        let item = QueueItem::new(
            "doc-1",
            vec![EngineKind::Fused],
            JobPriority::Normal,
            None,
            false,
        );
        assert_eq!(
            item.engine_jobs(),
            vec![EngineKind::Fast, EngineKind::Accurate]
        );
        assert!(item.wants_fusion());
    }

    #[test]
    fn engine_jobs_deduplicate() {
        let item = QueueItem::new(
            "doc-1",
            vec![EngineKind::Fast, EngineKind::Fused],
            JobPriority::Normal,
            None,
            false,
        );
        assert_eq!(
            item.engine_jobs(),
            vec![EngineKind::Fast, EngineKind::Accurate]
        );
    }

    #[test]
    fn engine_kind_round_trips() {
        for kind in [EngineKind::Fast, EngineKind::Accurate, EngineKind::Fused] {
            assert_eq!(EngineKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EngineKind::parse("ocr"), None);
    }
}
