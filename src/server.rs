use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::catalog::FsCatalog;
use crate::config::Config;
use crate::engines::EngineRegistry;
use crate::error::RecognitionError;
use crate::model::{EngineKind, JobPriority, QueueItem, RecognitionConfig};
use crate::scheduler::{DocumentStatus, Scheduler, SchedulerSettings};
use crate::store::{ConfigStore, MemoryStore, QueueStore, ResultStore, SqliteStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub configs: Arc<dyn ConfigStore>,
    pub engines: Arc<EngineRegistry>,
}

/// Recognition request body
#[derive(Debug, Deserialize)]
pub struct RecognizeRequest {
    pub document_id: String,
    /// Engine set to run; empty means the full hybrid run.
    #[serde(default)]
    pub engines: Vec<EngineKind>,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub force: bool,
    pub requested_by: Option<String>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Server info response
#[derive(Serialize)]
pub struct InfoResponse {
    pub version: String,
    pub available_engines: Vec<crate::engines::EngineInfo>,
}

/// Run the HTTP server
pub async fn run(config: Config) -> anyhow::Result<()> {
    let (results, queue, configs) = open_stores(&config)?;

    // Seed a baseline configuration so first-start dispatch can work.
    if configs.list()?.is_empty() {
        tracing::info!("Config store empty, seeding baseline configuration");
        configs.insert(&RecognitionConfig::baseline())?;
    }

    let engines = Arc::new(EngineRegistry::from_enabled_features()?);
    tracing::info!(
        "Available engines: {:?}",
        engines.kinds().iter().map(|k| k.as_str()).collect::<Vec<_>>()
    );

    let catalog = Arc::new(FsCatalog::new(&config.documents_dir));
    let scheduler = Scheduler::new(
        results,
        queue,
        Arc::clone(&configs),
        catalog,
        Arc::clone(&engines),
        SchedulerSettings {
            retention_days: config.retention_days,
            ..SchedulerSettings::default()
        },
    );
    scheduler.spawn();

    let state = AppState {
        scheduler,
        configs,
        engines,
    };

    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/recognize", post(handle_recognize))
        .route("/status/:document_id", get(handle_status))
        .route("/cancel/:queue_item_id", post(handle_cancel))
        .route("/configurations", get(handle_list_configurations))
        .route("/configurations/:id/activate", post(handle_activate))
        .route("/health", get(handle_health))
        .route("/info", get(handle_info))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn open_stores(
    config: &Config,
) -> Result<
    (
        Arc<dyn ResultStore>,
        Arc<dyn QueueStore>,
        Arc<dyn ConfigStore>,
    ),
    RecognitionError,
> {
    match &config.database {
        Some(path) => {
            tracing::info!("Opening result database at {}", path.display());
            let store = Arc::new(SqliteStore::open(path)?);
            Ok((store.clone(), store.clone(), store))
        }
        None => {
            tracing::warn!("No database path configured, state will not survive restarts");
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store.clone(), store))
        }
    }
}

/// Handle recognition requests
async fn handle_recognize(
    State(state): State<AppState>,
    Json(request): Json<RecognizeRequest>,
) -> Result<Json<QueueItem>, RecognitionError> {
    if request.document_id.is_empty() {
        return Err(RecognitionError::InvalidRequest(
            "document_id must not be empty".to_string(),
        ));
    }

    let engines = if request.engines.is_empty() {
        vec![EngineKind::Fast, EngineKind::Accurate, EngineKind::Fused]
    } else {
        request.engines
    };

    let item = state.scheduler.enqueue(
        &request.document_id,
        engines,
        request.priority,
        request.requested_by,
        request.force,
    )?;

    // Urgent requests start immediately instead of waiting for the next tick.
    if request.priority == JobPriority::Urgent {
        state.scheduler.dispatch_now(item.id)?;
    }

    Ok(Json(item))
}

/// Aggregated per-document status
async fn handle_status(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<DocumentStatus>, RecognitionError> {
    Ok(Json(state.scheduler.document_status(&document_id)?))
}

/// Cancel a queued or processing item
async fn handle_cancel(
    State(state): State<AppState>,
    Path(queue_item_id): Path<String>,
) -> Result<Json<QueueItem>, RecognitionError> {
    let id = Uuid::parse_str(&queue_item_id).map_err(|_| {
        RecognitionError::InvalidRequest(format!("invalid queue item id: {}", queue_item_id))
    })?;
    Ok(Json(state.scheduler.cancel(id)?))
}

/// List recognition configurations
async fn handle_list_configurations(
    State(state): State<AppState>,
) -> Result<Json<Vec<RecognitionConfig>>, RecognitionError> {
    Ok(Json(state.configs.list()?))
}

/// Activate one configuration, deactivating all others
async fn handle_activate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RecognitionConfig>, RecognitionError> {
    Ok(Json(state.configs.activate(&id)?))
}

/// Handle health check requests
async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Handle info requests
async fn handle_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        available_engines: state.engines.info(),
    })
}
