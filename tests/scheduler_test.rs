//! Scheduler lifecycle tests.
//!
//! Run against stub engines and the in-memory store with paused tokio time,
//! so retry delays and the fusion wait loop elapse instantly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use hybrid_ocr::catalog::DocumentCatalog;
use hybrid_ocr::engine::{EngineOutput, RecognitionEngine};
use hybrid_ocr::engines::EngineRegistry;
use hybrid_ocr::error::RecognitionError;
use hybrid_ocr::model::{
    EngineKind, JobPriority, PageRecognition, QueueItem, QueueStatus, RecognitionConfig,
    ResultStatus,
};
use hybrid_ocr::pipeline::NormalizedDocument;
use hybrid_ocr::scheduler::{Scheduler, SchedulerSettings};
use hybrid_ocr::store::{ConfigStore, MemoryStore, QueueStore, ResultStore};

// ============================================================================
// Stubs
// ============================================================================

enum Behavior {
    /// Return the given text and confidence.
    Succeed { text: String, confidence: f32 },
    /// Return "run N" where N counts invocations.
    Counting,
    /// Always fail with a retryable engine error.
    Fail,
    /// Never complete (until cancelled or the test ends).
    Hang,
}

struct StubEngine {
    kind: EngineKind,
    behavior: Behavior,
    calls: Arc<AtomicU32>,
}

impl StubEngine {
    fn new(kind: EngineKind, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            kind,
            behavior,
            calls: Arc::new(AtomicU32::new(0)),
        })
    }

    fn succeeding(kind: EngineKind, text: &str, confidence: f32) -> Arc<Self> {
        Self::new(
            kind,
            Behavior::Succeed {
                text: text.to_string(),
                confidence,
            },
        )
    }
}

#[async_trait]
impl RecognitionEngine for StubEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn description(&self) -> &'static str {
        "stub engine"
    }

    async fn recognize(
        &self,
        _document: &NormalizedDocument,
        _config: &RecognitionConfig,
    ) -> Result<EngineOutput, RecognitionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.behavior {
            Behavior::Succeed { text, confidence } => Ok(output(text, *confidence)),
            Behavior::Counting => Ok(output(&format!("run {}", call), 0.8)),
            Behavior::Fail => Err(RecognitionError::EngineFailure(
                "stub engine always fails".to_string(),
            )),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(1_000_000)).await;
                Err(RecognitionError::EngineFailure("woke up".to_string()))
            }
        }
    }

    fn supported_languages(&self) -> Vec<String> {
        vec!["eng".to_string()]
    }
}

fn output(text: &str, confidence: f32) -> EngineOutput {
    EngineOutput::from_pages(
        vec![PageRecognition {
            page_number: 1,
            text: text.to_string(),
            confidence,
            word_count: text.split_whitespace().count() as u32,
        }],
        serde_json::Value::Null,
    )
}

struct MockCatalog {
    png: Vec<u8>,
    /// Document ids in the order engine jobs fetched them.
    fetched: Mutex<Vec<String>>,
    propagated: Mutex<Vec<(String, String, bool)>>,
}

impl MockCatalog {
    fn new() -> Arc<Self> {
        let img = image::RgbImage::from_pixel(12, 12, image::Rgb([230, 230, 230]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        Arc::new(Self {
            png,
            fetched: Mutex::new(Vec::new()),
            propagated: Mutex::new(Vec::new()),
        })
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    fn propagated(&self) -> Vec<(String, String, bool)> {
        self.propagated.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentCatalog for MockCatalog {
    async fn document_bytes(&self, document_id: &str) -> Result<Vec<u8>, RecognitionError> {
        self.fetched.lock().unwrap().push(document_id.to_string());
        Ok(self.png.clone())
    }

    async fn mime_type(&self, _document_id: &str) -> Result<String, RecognitionError> {
        Ok("image/png".to_string())
    }

    async fn recognition_available(
        &self,
        document_id: &str,
        text: &str,
        force: bool,
    ) -> Result<(), RecognitionError> {
        self.propagated
            .lock()
            .unwrap()
            .push((document_id.to_string(), text.to_string(), force));
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    scheduler: Scheduler,
    store: Arc<MemoryStore>,
    catalog: Arc<MockCatalog>,
}

fn harness_with_settings(engines: Vec<Arc<StubEngine>>, settings: SchedulerSettings) -> Harness {
    let store = Arc::new(MemoryStore::new());
    ConfigStore::insert(store.as_ref(), &RecognitionConfig::baseline()).unwrap();

    let catalog = MockCatalog::new();

    let registry = Arc::new(EngineRegistry::with_engines(
        engines
            .into_iter()
            .map(|e| e as Arc<dyn RecognitionEngine>)
            .collect(),
    ));

    let scheduler = Scheduler::new(
        store.clone(),
        store.clone(),
        store.clone(),
        catalog.clone(),
        registry,
        settings,
    );

    Harness {
        scheduler,
        store,
        catalog,
    }
}

fn harness(engines: Vec<Arc<StubEngine>>) -> Harness {
    harness_with_settings(engines, SchedulerSettings::default())
}

async fn wait_for_terminal(store: &MemoryStore, id: uuid::Uuid) -> QueueItem {
    for _ in 0..20_000 {
        let item = QueueStore::get(store, id).unwrap().unwrap();
        if item.status.is_terminal() {
            return item;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("queue item {} never reached a terminal status", id);
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn happy_path_fuses_and_propagates() {
    let fast = StubEngine::succeeding(EngineKind::Fast, "fast engine text", 0.6);
    let accurate = StubEngine::succeeding(
        EngineKind::Accurate,
        "accurate engine text which is longer",
        0.9,
    );
    let h = harness(vec![fast, accurate]);

    let item = h
        .scheduler
        .enqueue("doc-1", vec![EngineKind::Fused], JobPriority::Normal, None, false)
        .unwrap();
    assert_eq!(h.scheduler.tick().unwrap(), 1);

    let done = wait_for_terminal(&h.store, item.id).await;
    assert_eq!(done.status, QueueStatus::Completed);

    let fused = ResultStore::get(h.store.as_ref(), "doc-1", EngineKind::Fused)
        .unwrap()
        .expect("fused result should exist");
    assert_eq!(fused.status, ResultStatus::Completed);
    assert!(fused.confidence.is_some());
    assert!(!fused.text.is_empty());

    // Fused completions propagate to the catalog exactly once.
    let propagated = h.catalog.propagated();
    assert_eq!(propagated.len(), 1);
    assert_eq!(propagated[0].0, "doc-1");
    assert_eq!(propagated[0].1, fused.text);
}

#[tokio::test(start_paused = true)]
async fn dispatch_follows_priority_then_creation_order() {
    let fast = StubEngine::succeeding(EngineKind::Fast, "text", 0.8);
    let h = harness_with_settings(
        vec![fast],
        SchedulerSettings {
            dispatch_batch: 1,
            ..SchedulerSettings::default()
        },
    );

    let priorities = [
        JobPriority::Normal,
        JobPriority::Urgent,
        JobPriority::Low,
        JobPriority::Urgent,
    ];
    let mut ids = Vec::new();
    for (i, priority) in priorities.iter().enumerate() {
        let item = h
            .scheduler
            .enqueue(&format!("doc-{}", i), vec![EngineKind::Fast], *priority, None, false)
            .unwrap();
        ids.push(item.id);
    }

    // One item per tick; drain each before claiming the next so the fetch
    // order observed by the catalog equals the claim order.
    for round in 0..4 {
        assert_eq!(h.scheduler.tick().unwrap(), 1, "tick {} claimed nothing", round);
        let claimed: Vec<uuid::Uuid> = ids
            .iter()
            .copied()
            .filter(|id| {
                let item = QueueStore::get(h.store.as_ref(), *id).unwrap().unwrap();
                item.status != QueueStatus::Queued
            })
            .collect();
        for id in claimed {
            wait_for_terminal(&h.store, id).await;
        }
    }

    assert_eq!(
        h.catalog.fetched(),
        vec![
            "doc-1".to_string(),
            "doc-3".to_string(),
            "doc-0".to_string(),
            "doc-2".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failing_engine_exhausts_exactly_three_attempts() {
    let fast = StubEngine::new(EngineKind::Fast, Behavior::Fail);
    let calls = fast.calls.clone();
    let h = harness(vec![fast]);

    let item = h
        .scheduler
        .enqueue("doc-1", vec![EngineKind::Fast], JobPriority::Normal, None, false)
        .unwrap();
    h.scheduler.tick().unwrap();

    let done = wait_for_terminal(&h.store, item.id).await;
    assert_eq!(done.status, QueueStatus::Failed);

    // max_retries = 2, so exactly 3 attempts, never more.
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let result = ResultStore::get(h.store.as_ref(), "doc-1", EngineKind::Fast)
        .unwrap()
        .unwrap();
    assert_eq!(result.status, ResultStatus::Failed);
    assert!(result.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn fusion_times_out_when_one_engine_never_completes() {
    let fast = StubEngine::succeeding(EngineKind::Fast, "fast text", 0.8);
    let accurate = StubEngine::new(EngineKind::Accurate, Behavior::Hang);
    let h = harness(vec![fast, accurate]);

    let item = h
        .scheduler
        .enqueue("doc-1", vec![EngineKind::Fused], JobPriority::Normal, None, false)
        .unwrap();
    h.scheduler.tick().unwrap();

    let done = wait_for_terminal(&h.store, item.id).await;
    assert_eq!(done.status, QueueStatus::Failed);
    assert!(
        done.error.as_deref().unwrap_or("").contains("Timed out"),
        "expected a fusion timeout error, got {:?}",
        done.error
    );

    // The completed fast result is untouched, and no fused result exists.
    let fast_result = ResultStore::get(h.store.as_ref(), "doc-1", EngineKind::Fast)
        .unwrap()
        .unwrap();
    assert_eq!(fast_result.status, ResultStatus::Completed);
    assert_eq!(fast_result.text, "fast text");
    assert!(ResultStore::get(h.store.as_ref(), "doc-1", EngineKind::Fused)
        .unwrap()
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_processing_item_is_immediate_and_final() {
    let fast = StubEngine::new(EngineKind::Fast, Behavior::Hang);
    let h = harness(vec![fast]);

    let item = h
        .scheduler
        .enqueue("doc-1", vec![EngineKind::Fast], JobPriority::Normal, None, false)
        .unwrap();
    h.scheduler.tick().unwrap();

    // Let the engine job start.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let processing = QueueStore::get(h.store.as_ref(), item.id).unwrap().unwrap();
    assert_eq!(processing.status, QueueStatus::Processing);

    let cancelled = h.scheduler.cancel(item.id).unwrap();
    assert_eq!(cancelled.status, QueueStatus::Cancelled);

    // The status sticks: later queries never show processing or completed.
    tokio::time::sleep(Duration::from_secs(2_000)).await;
    let settled = QueueStore::get(h.store.as_ref(), item.id).unwrap().unwrap();
    assert_eq!(settled.status, QueueStatus::Cancelled);

    // Cancelling again is a state-machine violation.
    let err = h.scheduler.cancel(item.id).unwrap_err();
    assert!(matches!(err, RecognitionError::NotCancellable { .. }));
}

#[tokio::test(start_paused = true)]
async fn rerunning_an_engine_upserts_one_row() {
    let fast = StubEngine::new(EngineKind::Fast, Behavior::Counting);
    let h = harness(vec![fast]);

    for _ in 0..2 {
        let item = h
            .scheduler
            .enqueue("doc-1", vec![EngineKind::Fast], JobPriority::Normal, None, false)
            .unwrap();
        h.scheduler.tick().unwrap();
        wait_for_terminal(&h.store, item.id).await;
    }

    let results = ResultStore::for_document(h.store.as_ref(), "doc-1").unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].text, "run 2");
    assert_eq!(results[0].status, ResultStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn urgent_items_dispatch_without_a_tick() {
    let fast = StubEngine::succeeding(EngineKind::Fast, "urgent text", 0.9);
    let h = harness(vec![fast]);

    let item = h
        .scheduler
        .enqueue("doc-1", vec![EngineKind::Fast], JobPriority::Urgent, None, false)
        .unwrap();
    assert!(h.scheduler.dispatch_now(item.id).unwrap());

    let done = wait_for_terminal(&h.store, item.id).await;
    assert_eq!(done.status, QueueStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn enqueue_without_active_config_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let catalog = MockCatalog::new();
    let registry = Arc::new(EngineRegistry::with_engines(vec![]));
    let scheduler = Scheduler::new(
        store.clone(),
        store.clone(),
        store.clone(),
        catalog,
        registry,
        SchedulerSettings::default(),
    );

    let err = scheduler
        .enqueue("doc-1", vec![EngineKind::Fast], JobPriority::Normal, None, false)
        .unwrap_err();
    assert!(matches!(err, RecognitionError::NoActiveConfiguration));

    // No job was created.
    assert!(QueueStore::for_document(store.as_ref(), "doc-1")
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn config_switch_keeps_historical_references() {
    let fast = StubEngine::succeeding(EngineKind::Fast, "some text", 0.8);
    let h = harness(vec![fast]);

    let item = h
        .scheduler
        .enqueue("doc-1", vec![EngineKind::Fast], JobPriority::Normal, None, false)
        .unwrap();
    h.scheduler.tick().unwrap();
    wait_for_terminal(&h.store, item.id).await;

    // Activate a second configuration.
    let mut other = RecognitionConfig::baseline();
    other.id = "exp-deu".to_string();
    other.name = "Experimental (German)".to_string();
    other.active = false;
    ConfigStore::insert(h.store.as_ref(), &other).unwrap();
    ConfigStore::activate(h.store.as_ref(), "exp-deu").unwrap();

    let item2 = h
        .scheduler
        .enqueue("doc-2", vec![EngineKind::Fast], JobPriority::Normal, None, false)
        .unwrap();
    h.scheduler.tick().unwrap();
    wait_for_terminal(&h.store, item2.id).await;

    // Exactly one active config, and earlier results still reference the
    // config they ran under.
    let actives: Vec<String> = ConfigStore::list(h.store.as_ref())
        .unwrap()
        .into_iter()
        .filter(|c| c.active)
        .map(|c| c.id)
        .collect();
    assert_eq!(actives, vec!["exp-deu".to_string()]);

    let first = ResultStore::get(h.store.as_ref(), "doc-1", EngineKind::Fast)
        .unwrap()
        .unwrap();
    let second = ResultStore::get(h.store.as_ref(), "doc-2", EngineKind::Fast)
        .unwrap()
        .unwrap();
    assert_eq!(first.config_id, "default-eng");
    assert_eq!(second.config_id, "exp-deu");
}

#[tokio::test(start_paused = true)]
async fn engine_failure_does_not_abort_sibling() {
    let fast = StubEngine::new(EngineKind::Fast, Behavior::Fail);
    let accurate = StubEngine::succeeding(EngineKind::Accurate, "accurate text", 0.9);
    let h = harness(vec![fast, accurate]);

    let item = h
        .scheduler
        .enqueue(
            "doc-1",
            vec![EngineKind::Fast, EngineKind::Accurate],
            JobPriority::Normal,
            None,
            false,
        )
        .unwrap();
    h.scheduler.tick().unwrap();

    let done = wait_for_terminal(&h.store, item.id).await;
    // A required engine failed, so the item fails...
    assert_eq!(done.status, QueueStatus::Failed);

    // ...but the sibling result completed independently.
    let accurate_result = ResultStore::get(h.store.as_ref(), "doc-1", EngineKind::Accurate)
        .unwrap()
        .unwrap();
    assert_eq!(accurate_result.status, ResultStatus::Completed);
    assert_eq!(accurate_result.text, "accurate text");
}

#[tokio::test(start_paused = true)]
async fn status_aggregates_queue_and_results() {
    let fast = StubEngine::succeeding(EngineKind::Fast, "text", 0.8);
    let h = harness(vec![fast]);

    // Nothing known about the document yet.
    let status = h.scheduler.document_status("doc-1").unwrap();
    assert!(status.results.is_empty());
    assert!(status.queue_items.is_empty());

    let item = h
        .scheduler
        .enqueue("doc-1", vec![EngineKind::Fast], JobPriority::Normal, None, false)
        .unwrap();

    let status = h.scheduler.document_status("doc-1").unwrap();
    assert_eq!(status.queue_items.len(), 1);

    h.scheduler.tick().unwrap();
    wait_for_terminal(&h.store, item.id).await;

    let status = h.scheduler.document_status("doc-1").unwrap();
    assert!(status.queue_items.is_empty());
    assert_eq!(status.results.len(), 1);
    assert_eq!(status.results[0].engine, EngineKind::Fast);
    assert_eq!(status.results[0].status, ResultStatus::Completed);
}
