//! Priority job scheduler.
//!
//! Pulls queued recognition requests in (priority desc, created asc) order,
//! launches one asynchronous job per requested engine, waits on both engine
//! results before fusing, retries failed jobs per job-type policy and
//! supports cooperative cancellation. Jobs snapshot the active configuration
//! at dispatch time; a later config change never affects an in-flight item.

pub mod retry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::DocumentCatalog;
use crate::engine::EngineOutput;
use crate::engines::EngineRegistry;
use crate::error::RecognitionError;
use crate::fusion;
use crate::model::{
    EngineKind, JobPriority, QueueItem, QueueStatus, RecognitionConfig, RecognitionResult,
    ResultStatus,
};
use crate::pipeline::ImagePipeline;
use crate::store::{ConfigStore, QueueStore, ResultStore};
use self::retry::RetryPolicy;

/// Tunables for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How often the dispatch loop polls the queue.
    pub tick_interval: Duration,
    /// Maximum items claimed per tick.
    pub dispatch_batch: usize,
    /// Poll interval of the fusion wait loop.
    pub fusion_poll_interval: Duration,
    /// Deadline for both engine results to complete before fusion gives up.
    pub fusion_timeout: Duration,
    /// How often terminal records are swept.
    pub sweep_interval: Duration,
    /// Age past which terminal queue items and failed results are removed.
    pub retention_days: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            dispatch_batch: 10,
            fusion_poll_interval: Duration::from_secs(10),
            fusion_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(3600),
            retention_days: 90,
        }
    }
}

struct SchedulerInner {
    results: Arc<dyn ResultStore>,
    queue: Arc<dyn QueueStore>,
    configs: Arc<dyn ConfigStore>,
    catalog: Arc<dyn DocumentCatalog>,
    engines: Arc<EngineRegistry>,
    settings: SchedulerSettings,
    /// Cancellation tokens of in-flight items.
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl SchedulerInner {
    fn active_jobs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>>, RecognitionError> {
        self.active
            .lock()
            .map_err(|_| RecognitionError::Internal("active job map lock poisoned".to_string()))
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        results: Arc<dyn ResultStore>,
        queue: Arc<dyn QueueStore>,
        configs: Arc<dyn ConfigStore>,
        catalog: Arc<dyn DocumentCatalog>,
        engines: Arc<EngineRegistry>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                results,
                queue,
                configs,
                catalog,
                engines,
                settings,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a queue item for a recognition request.
    ///
    /// Surfaces `NoActiveConfiguration` immediately; no item is created when
    /// dispatch would be impossible.
    pub fn enqueue(
        &self,
        document_id: &str,
        engines: Vec<EngineKind>,
        priority: JobPriority,
        requested_by: Option<String>,
        force: bool,
    ) -> Result<QueueItem, RecognitionError> {
        if engines.is_empty() {
            return Err(RecognitionError::InvalidRequest(
                "at least one engine must be requested".to_string(),
            ));
        }
        if self.inner.configs.active()?.is_none() {
            return Err(RecognitionError::NoActiveConfiguration);
        }

        let item = QueueItem::new(document_id, engines, priority, requested_by, force);
        self.inner.queue.insert(&item)?;
        tracing::info!(
            item = %item.id,
            document = document_id,
            priority = priority.as_str(),
            "enqueued recognition request"
        );
        Ok(item)
    }

    /// Claim and dispatch up to one batch of due items. Returns how many
    /// were dispatched.
    pub fn tick(&self) -> Result<usize, RecognitionError> {
        let claimed = self
            .inner
            .queue
            .claim_batch(self.inner.settings.dispatch_batch, Utc::now())?;
        let dispatched = claimed.len();
        for item in claimed {
            self.spawn_item(item);
        }
        Ok(dispatched)
    }

    /// Claim one specific item and dispatch it right away, bypassing the next
    /// tick. Used for urgent requests. Returns false if the item was no
    /// longer queued.
    pub fn dispatch_now(&self, id: Uuid) -> Result<bool, RecognitionError> {
        match self.inner.queue.claim(id, Utc::now())? {
            Some(item) => {
                self.spawn_item(item);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel a queued or processing item. In-flight jobs are signalled to
    /// stop (best effort); the item is marked cancelled immediately either
    /// way.
    pub fn cancel(&self, id: Uuid) -> Result<QueueItem, RecognitionError> {
        let mut item = self
            .inner
            .queue
            .get(id)?
            .ok_or_else(|| RecognitionError::NotFound(format!("queue item {}", id)))?;

        if item.status.is_terminal() {
            return Err(RecognitionError::NotCancellable {
                id: id.to_string(),
                status: item.status.as_str().to_string(),
            });
        }

        item.status = QueueStatus::Cancelled;
        item.completed_at = Some(Utc::now());
        self.inner.queue.update(&item)?;

        if let Some(token) = self.inner.active_jobs()?.remove(&id) {
            token.cancel();
        }
        tracing::info!(item = %id, "queue item cancelled");
        Ok(item)
    }

    /// Remove terminal queue items and failed results past the retention
    /// horizon.
    pub fn sweep(&self) -> Result<(usize, usize), RecognitionError> {
        let cutoff = Utc::now() - chrono::Duration::days(self.inner.settings.retention_days);
        let items = self.inner.queue.sweep_terminal_before(cutoff)?;
        let results = self.inner.results.sweep_failed_before(cutoff)?;
        if items > 0 || results > 0 {
            tracing::info!(items, results, "retention sweep removed expired records");
        }
        Ok((items, results))
    }

    /// Aggregated per-document status.
    pub fn document_status(&self, document_id: &str) -> Result<DocumentStatus, RecognitionError> {
        let items = self.inner.queue.for_document(document_id)?;
        let results = self.inner.results.for_document(document_id)?;

        let overall = if items.iter().any(|i| i.status == QueueStatus::Processing) {
            OverallStatus::Processing
        } else if items.iter().any(|i| i.status == QueueStatus::Queued) {
            OverallStatus::Queued
        } else {
            match results.iter().max_by_key(|r| r.updated_at) {
                None => OverallStatus::Unknown,
                Some(latest) => match latest.status {
                    ResultStatus::Completed => OverallStatus::Completed,
                    ResultStatus::Failed => OverallStatus::Failed,
                    ResultStatus::Pending | ResultStatus::Processing => OverallStatus::Processing,
                },
            }
        };

        Ok(DocumentStatus {
            document_id: document_id.to_string(),
            overall,
            results: results.iter().map(ResultSummary::from).collect(),
            queue_items: items.into_iter().filter(|i| !i.status.is_terminal()).collect(),
        })
    }

    /// Run the dispatch and sweep loops until the task is dropped.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.inner.settings.tick_interval);
        let mut sweeper = tokio::time::interval(self.inner.settings.sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        tracing::error!("dispatch tick failed: {}", e);
                    }
                }
                _ = sweeper.tick() => {
                    if let Err(e) = self.sweep() {
                        tracing::error!("retention sweep failed: {}", e);
                    }
                }
            }
        }
    }

    /// Spawn the run loop on the current runtime.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    fn spawn_item(&self, item: QueueItem) {
        let token = CancellationToken::new();
        match self.inner.active_jobs() {
            Ok(mut active) => {
                active.insert(item.id, token.clone());
            }
            Err(e) => {
                tracing::error!("failed to register job token: {}", e);
                return;
            }
        }

        let inner = Arc::clone(&self.inner);
        let id = item.id;
        tokio::spawn(async move {
            run_item(Arc::clone(&inner), item, token).await;
            if let Ok(mut active) = inner.active_jobs() {
                active.remove(&id);
            }
        });
    }
}

/// Overall status of a document, computed from its queue items and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultSummary {
    pub engine: EngineKind,
    pub status: ResultStatus,
    pub confidence: Option<f32>,
    pub duration_ms: u64,
    pub text_length: usize,
    pub page_count: usize,
    pub error: Option<String>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<&RecognitionResult> for ResultSummary {
    fn from(result: &RecognitionResult) -> Self {
        Self {
            engine: result.engine,
            status: result.status,
            confidence: result.confidence,
            duration_ms: result.duration_ms,
            text_length: result.text.chars().count(),
            page_count: result.pages.len(),
            error: result.error.clone(),
            updated_at: result.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatus {
    pub document_id: String,
    pub overall: OverallStatus,
    pub results: Vec<ResultSummary>,
    pub queue_items: Vec<QueueItem>,
}

// ============================================================================
// Item orchestration
// ============================================================================

async fn run_item(inner: Arc<SchedulerInner>, mut item: QueueItem, token: CancellationToken) {
    tracing::info!(item = %item.id, document = %item.document_id, "dispatching queue item");

    // Snapshot the active config; every job of this item uses this copy.
    let config = match inner.configs.active() {
        Ok(Some(config)) => config,
        Ok(None) => {
            finalize(
                &inner,
                &item,
                QueueStatus::Failed,
                Some(RecognitionError::NoActiveConfiguration.to_string()),
            );
            return;
        }
        Err(e) => {
            finalize(&inner, &item, QueueStatus::Failed, Some(e.to_string()));
            return;
        }
    };

    let policy = RetryPolicy::orchestration();
    let mut attempt = 0u32;
    loop {
        match orchestrate(&inner, &item, &config, &token).await {
            Ok((status, error)) => {
                finalize(&inner, &item, status, error);
                return;
            }
            Err(e) => {
                let max_retries = item.max_retries.min(policy.max_retries());
                if attempt < max_retries && e.is_retryable() && !token.is_cancelled() {
                    tracing::warn!(
                        item = %item.id,
                        attempt,
                        "orchestration failed, retrying: {}",
                        e
                    );
                    item.retry_count = attempt + 1;
                    if let Err(update_err) = inner.queue.update(&item) {
                        tracing::error!("failed to record retry count: {}", update_err);
                    }
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(policy.delay(attempt)) => {}
                    }
                    attempt += 1;
                } else {
                    finalize(&inner, &item, QueueStatus::Failed, Some(e.to_string()));
                    return;
                }
            }
        }
    }
}

/// One orchestration attempt: engine jobs, then the fusion wait if requested.
/// Engine-level failures are reflected in the returned item status; `Err` is
/// reserved for infrastructure faults eligible for the orchestration retry.
async fn orchestrate(
    inner: &Arc<SchedulerInner>,
    item: &QueueItem,
    config: &RecognitionConfig,
    token: &CancellationToken,
) -> Result<(QueueStatus, Option<String>), RecognitionError> {
    let jobs = item.engine_jobs();

    {
        let mut updated = item.clone();
        updated.job_handles = jobs.iter().map(|k| format!("{}:{}", item.id, k)).collect();
        inner.queue.update(&updated)?;
    }

    if item.wants_fusion() {
        // Engine jobs run detached; the fusion job's bounded poll loop is
        // the synchronization point, so a hung engine cannot stall the item
        // past the fusion deadline.
        for kind in jobs {
            let inner = Arc::clone(inner);
            let document_id = item.document_id.clone();
            let config = config.clone();
            let token = token.clone();
            tokio::spawn(async move {
                run_engine_job(&inner, &document_id, kind, &config, &token).await;
            });
        }
        if let Err(e) = run_fusion_job(inner, item, config, token).await {
            return Ok((QueueStatus::Failed, Some(e.to_string())));
        }
    } else {
        join_all(
            jobs.into_iter()
                .map(|kind| run_engine_job(inner, &item.document_id, kind, config, token)),
        )
        .await;
    }

    if token.is_cancelled() {
        return Ok((QueueStatus::Cancelled, None));
    }

    compute_outcome(inner, item)
}

/// Item status from the stored results of every requested engine.
fn compute_outcome(
    inner: &SchedulerInner,
    item: &QueueItem,
) -> Result<(QueueStatus, Option<String>), RecognitionError> {
    for engine in &item.engines {
        match inner.results.get(&item.document_id, *engine)? {
            Some(result) if result.status == ResultStatus::Completed => continue,
            Some(result) => {
                let error = result
                    .error
                    .unwrap_or_else(|| format!("{} engine did not complete", engine));
                return Ok((QueueStatus::Failed, Some(error)));
            }
            None => {
                return Ok((
                    QueueStatus::Failed,
                    Some(format!("no result recorded for {} engine", engine)),
                ));
            }
        }
    }
    Ok((QueueStatus::Completed, None))
}

fn finalize(inner: &SchedulerInner, item: &QueueItem, status: QueueStatus, error: Option<String>) {
    let mut done = item.clone();
    done.status = status;
    done.error = error.clone();
    done.completed_at = Some(Utc::now());
    if let Err(e) = inner.queue.update(&done) {
        tracing::error!(item = %item.id, "failed to finalize queue item: {}", e);
        return;
    }
    match status {
        QueueStatus::Completed => {
            tracing::info!(item = %item.id, document = %item.document_id, "queue item completed")
        }
        _ => tracing::warn!(
            item = %item.id,
            document = %item.document_id,
            status = status.as_str(),
            error = error.as_deref().unwrap_or(""),
            "queue item finished without completing"
        ),
    }
}

// ============================================================================
// Engine jobs
// ============================================================================

async fn run_engine_job(
    inner: &SchedulerInner,
    document_id: &str,
    kind: EngineKind,
    config: &RecognitionConfig,
    token: &CancellationToken,
) {
    let policy = match kind {
        EngineKind::Fast => RetryPolicy::fast_engine(),
        EngineKind::Accurate => RetryPolicy::accurate_engine(),
        // Fusion runs as its own dependent job, never through here.
        EngineKind::Fused => return,
    };

    let mut record = RecognitionResult::pending(document_id, kind, &config.id);
    if let Err(e) = inner.results.upsert(&record) {
        tracing::error!(engine = %kind, document = document_id, "failed to create result: {}", e);
        return;
    }

    let started = std::time::Instant::now();
    for attempt in 0..policy.attempts() {
        if token.is_cancelled() {
            return;
        }

        record.status = ResultStatus::Processing;
        if let Err(e) = inner.results.upsert(&record) {
            tracing::error!(engine = %kind, document = document_id, "result upsert failed: {}", e);
        }

        let recognized = tokio::select! {
            _ = token.cancelled() => return,
            output = attempt_recognition(inner, document_id, kind, config) => output,
        };

        match recognized {
            Ok(output) => {
                record.text = output.text;
                record.confidence = Some(output.confidence);
                record.pages = output.pages;
                record.metadata = output.metadata;
                record.status = ResultStatus::Completed;
                record.error = None;
                record.duration_ms = started.elapsed().as_millis() as u64;
                if let Err(e) = inner.results.upsert(&record) {
                    tracing::error!(engine = %kind, document = document_id, "result upsert failed: {}", e);
                    return;
                }
                tracing::info!(
                    engine = %kind,
                    document = document_id,
                    confidence = record.confidence.unwrap_or(0.0),
                    duration_ms = record.duration_ms,
                    "engine job completed"
                );
                return;
            }
            Err(e) => {
                record.error = Some(e.to_string());
                let out_of_attempts = attempt + 1 >= policy.attempts();
                if out_of_attempts || !e.is_retryable() {
                    record.status = ResultStatus::Failed;
                    record.duration_ms = started.elapsed().as_millis() as u64;
                    if let Err(upsert_err) = inner.results.upsert(&record) {
                        tracing::error!(
                            engine = %kind,
                            document = document_id,
                            "result upsert failed: {}",
                            upsert_err
                        );
                    }
                    tracing::warn!(
                        engine = %kind,
                        document = document_id,
                        attempts = attempt + 1,
                        "engine job failed terminally: {}",
                        e
                    );
                    return;
                }

                tracing::warn!(
                    engine = %kind,
                    document = document_id,
                    attempt,
                    "engine job failed, will retry: {}",
                    e
                );
                if let Err(upsert_err) = inner.results.upsert(&record) {
                    tracing::error!(engine = %kind, "result upsert failed: {}", upsert_err);
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(policy.delay(attempt)) => {}
                }
            }
        }
    }
}

async fn attempt_recognition(
    inner: &SchedulerInner,
    document_id: &str,
    kind: EngineKind,
    config: &RecognitionConfig,
) -> Result<EngineOutput, RecognitionError> {
    let engine = inner.engines.get(kind).ok_or_else(|| {
        RecognitionError::EngineFailure(format!("{} engine is not available", kind))
    })?;

    let bytes = inner.catalog.document_bytes(document_id).await?;
    let mime = inner.catalog.mime_type(document_id).await?;

    let pipeline_config = config.clone();
    let normalized = tokio::task::spawn_blocking(move || {
        ImagePipeline::new().normalize(&bytes, &mime, &pipeline_config)
    })
    .await
    .map_err(|e| RecognitionError::Internal(format!("normalization task failed: {}", e)))??;

    engine.recognize(&normalized, config).await
}

// ============================================================================
// Fusion job
// ============================================================================

/// Wait (bounded poll) for both engine results, then fuse and persist.
async fn run_fusion_job(
    inner: &Arc<SchedulerInner>,
    item: &QueueItem,
    config: &RecognitionConfig,
    token: &CancellationToken,
) -> Result<(), RecognitionError> {
    let document_id = &item.document_id;
    let poll = inner.settings.fusion_poll_interval;
    let deadline = inner.settings.fusion_timeout;
    let mut waited = Duration::ZERO;

    let (fast, accurate) = loop {
        if token.is_cancelled() {
            return Err(RecognitionError::Internal("fusion job cancelled".to_string()));
        }

        let fast = inner.results.get(document_id, EngineKind::Fast)?;
        let accurate = inner.results.get(document_id, EngineKind::Accurate)?;

        let failed = |r: &Option<RecognitionResult>| {
            matches!(r, Some(r) if r.status == ResultStatus::Failed)
        };
        if failed(&fast) || failed(&accurate) {
            // A required predecessor already failed terminally; waiting out
            // the deadline would change nothing.
            return Err(RecognitionError::EngineFailure(format!(
                "required engine result failed for document {}",
                document_id
            )));
        }

        if let (Some(f), Some(a)) = (&fast, &accurate) {
            if f.status == ResultStatus::Completed && a.status == ResultStatus::Completed {
                break (f.clone(), a.clone());
            }
        }

        if waited >= deadline {
            tracing::warn!(document = document_id, "fusion wait deadline exceeded");
            return Err(RecognitionError::FusionTimeout {
                document_id: document_id.clone(),
                waited_secs: waited.as_secs(),
            });
        }

        tokio::select! {
            _ = token.cancelled() => {
                return Err(RecognitionError::Internal("fusion job cancelled".to_string()));
            }
            _ = tokio::time::sleep(poll) => waited += poll,
        }
    };

    let started = std::time::Instant::now();
    let outcome = fusion::fuse(&fast, &accurate)?;

    let mut fused = RecognitionResult::pending(document_id, EngineKind::Fused, &config.id);
    fused.text = outcome.text.clone();
    fused.confidence = Some(outcome.confidence);
    fused.pages = outcome.pages.clone();
    fused.metadata = serde_json::json!({
        "strategy": outcome.strategy.as_str(),
        "similarity": outcome.similarity,
        "quality_score": outcome.quality_score,
    });
    fused.status = ResultStatus::Completed;
    fused.duration_ms = started.elapsed().as_millis() as u64;
    inner.results.upsert(&fused)?;

    tracing::info!(
        document = document_id,
        strategy = outcome.strategy.as_str(),
        confidence = outcome.confidence,
        "fusion completed"
    );

    // Propagate fused text to the catalog; its monotonic guard decides
    // whether the stored text is replaced.
    if let Err(e) = inner
        .catalog
        .recognition_available(document_id, &outcome.text, item.force)
        .await
    {
        tracing::warn!(document = document_id, "failed to propagate fused text: {}", e);
    }

    Ok(())
}
