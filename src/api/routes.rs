//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bus::Topic;
use crate::config::Config;
use crate::context::{Catalog, PlaceholderProvider, ScheduleProvider};
use crate::datasource::SqliteDataSources;
use crate::llm::{Completer, OpenRouterClient, RetryPolicy};
use crate::orchestrator::{Orchestrator, Providers, TaskRequest, TaskStatusView};
use crate::progress::ProgressEvent;
use crate::store::{create_task_store, TaskRun, TaskStore};
use crate::task::{TaskId, TaskStatus};
use crate::tools::{BuiltinTools, JsonChartRenderer, ToolInfo, ToolRegistry};

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub orchestrator: Orchestrator,
    /// Where runs and their event logs are recorded
    pub store: Arc<dyn TaskStore>,
}

/// Wire the orchestrator, its providers and the task store from `config`.
///
/// Must be called from within a tokio runtime.
pub async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let llm = Arc::new(
        OpenRouterClient::new(config.api_key.clone())
            .with_retry_policy(RetryPolicy::within(config.orchestrator.stall_threshold)),
    );
    let completer = Completer::new(llm, config.default_model.clone());

    let catalog = match &config.catalog_path {
        Some(path) => {
            let catalog = Catalog::load(path)?;
            tracing::info!(
                "Loaded catalog from {}: {} templates, {} schedules, {} data sources",
                path.display(),
                catalog.templates.len(),
                catalog.schedules.len(),
                catalog.data_sources.len()
            );
            Some(Arc::new(catalog))
        }
        None => {
            tracing::info!("No catalog configured; requests must carry placeholders inline");
            None
        }
    };

    let sources = Arc::new(SqliteDataSources::from_entries(
        catalog
            .as_ref()
            .map(|c| c.data_sources.as_slice())
            .unwrap_or(&[]),
    ));

    let registry = ToolRegistry::with_builtins(BuiltinTools {
        completer: completer.clone(),
        queries: sources.clone(),
        charts: Arc::new(JsonChartRenderer::new(config.chart_output_dir.clone())),
        max_result_rows: config.max_result_rows,
    });

    let providers = Providers {
        schema: sources,
        placeholder: catalog
            .clone()
            .map(|c| c as Arc<dyn PlaceholderProvider>),
        schedule: catalog.map(|c| c as Arc<dyn ScheduleProvider>),
    };

    let store = create_task_store(&config.task_store, config.data_dir.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open task store: {}", e))?;
    tracing::info!(
        backend = %config.task_store,
        persistent = store.is_persistent(),
        "Task store ready"
    );

    let orchestrator = Orchestrator::new(
        config.orchestrator.clone(),
        completer,
        registry,
        providers,
    )
    .with_store(Arc::clone(&store));

    orchestrator.bus().subscribe_with(Topic::All, |event| async move {
        tracing::debug!(
            task_id = %event.task_id,
            sequence = event.sequence,
            status = %event.status,
            stage = %event.stage,
            progress = event.progress_percent,
            "{}",
            event.message
        );
    });

    Ok(Arc::new(AppState {
        config,
        orchestrator,
        store,
    }))
}

/// The router, without binding a listener.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/tasks/:id/events", get(stream_task))
        .route("/api/events", get(stream_all))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/:id/events", get(get_run_events))
        .route("/api/tools", get(list_tools))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = build_state(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    Ok(())
}

/// Wait for a shutdown signal and cancel every task still running.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, cancelling running tasks...");

    let running: Vec<TaskId> = state
        .orchestrator
        .list_tasks()
        .into_iter()
        .filter(|t| !t.status.is_terminal())
        .map(|t| t.task_id)
        .collect();
    if running.is_empty() {
        tracing::info!("No running tasks to cancel");
    } else {
        for id in &running {
            state.orchestrator.cancel(*id);
        }
        tracing::info!("Cancelled {} tasks: {:?}", running.len(), running);
    }

    tracing::info!("Graceful shutdown complete");
}

fn parse_task_id(raw: &str) -> Result<TaskId, (StatusCode, String)> {
    raw.parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid task id {}: {}", raw, e)))
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.config.default_model.clone(),
        worker_count: state.orchestrator.config().worker_count,
        persistent_store: state.store.is_persistent(),
    })
}

/// Submit a task; it starts asynchronously.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskRequest>,
) -> Result<Json<CreateTaskResponse>, (StatusCode, String)> {
    let task_id = state
        .orchestrator
        .submit_task(req)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(CreateTaskResponse {
        task_id,
        status: TaskStatus::Pending,
    }))
}

/// List tasks known to this process, oldest first.
async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskStatusView>> {
    Json(state.orchestrator.list_tasks())
}

/// Get task status and decision.
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusView>, (StatusCode, String)> {
    let task_id = parse_task_id(&id)?;
    state
        .orchestrator
        .get_status(task_id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Task {} not found", task_id)))
}

/// Cancel a task. Repeating the call gives the same answer.
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    let task_id = parse_task_id(&id)?;
    let Some(view) = state.orchestrator.get_status(task_id).await else {
        return Err((StatusCode::NOT_FOUND, format!("Task {} not found", task_id)));
    };
    // An evicted task is only known to the store; its recorded status answers.
    let cancelled = state.orchestrator.cancel(task_id) || view.status == TaskStatus::Cancelled;
    Ok(Json(CancelResponse { task_id, cancelled }))
}

fn sse_event(event: &ProgressEvent) -> Option<Event> {
    match Event::default()
        .event(event.status.as_str())
        .id(event.sequence.to_string())
        .json_data(event)
    {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::warn!(task_id = %event.task_id, "Failed to encode SSE event: {}", e);
            None
        }
    }
}

/// Stream one task's progress via SSE: the log so far, then live events
/// until the terminal one.
async fn stream_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let task_id = parse_task_id(&id)?;
    if state.orchestrator.get_status(task_id).await.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Task {} not found", task_id)));
    }

    // Subscribe before reading the log so nothing falls between the two.
    let mut subscription = state.orchestrator.subscribe(Topic::Task(task_id));
    let mut backlog = state.orchestrator.events(task_id);
    if backlog.is_empty() {
        backlog = state
            .store
            .events(task_id)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;
    }

    let stream = async_stream::stream! {
        let mut last_sequence = 0;
        for event in &backlog {
            last_sequence = event.sequence;
            if let Some(sse) = sse_event(event) {
                yield Ok(sse);
            }
            if event.status.is_terminal() {
                return;
            }
        }

        while let Some(event) = subscription.recv().await {
            if event.sequence <= last_sequence {
                continue;
            }
            last_sequence = event.sequence;
            if let Some(sse) = sse_event(&event) {
                yield Ok(sse);
            }
            if event.status.is_terminal() {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default().text("keepalive")))
}

/// Stream every task's progress via SSE.
async fn stream_all(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.orchestrator.subscribe(Topic::All);
    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            if let Some(sse) = sse_event(&event) {
                yield Ok(sse);
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default().text("keepalive"))
}

/// List recorded runs, most recent first.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListRunsQuery>,
) -> Result<Json<Vec<TaskRun>>, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(20).min(200);
    let offset = params.offset.unwrap_or(0);
    state
        .store
        .list_runs(limit, offset)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

/// Recorded event log of one run.
async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ProgressEvent>>, (StatusCode, String)> {
    let task_id = parse_task_id(&id)?;
    let run = state
        .store
        .get_run(task_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;
    if run.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Run {} not found", task_id)));
    }
    state
        .store
        .events(task_id)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

/// List registered tools.
async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Vec<ToolInfo>> {
    Json(state.orchestrator.registry().list_tools())
}
