// src/server.rs — producer-facing JSON transport
//
// Thin HTTP binding of the core API: every endpoint is one call into the
// scheduler, no logic lives here. The daemon keeps running until /shutdown,
// which optionally drains both queues first.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::info;

use crate::config::Config;
use crate::sched::Scheduler;
use crate::task::Task;

#[derive(Clone)]
struct AppState {
    scheduler: Arc<Scheduler>,
    shutdown: Arc<Notify>,
}

/// Runs the transport until a shutdown request arrives.
pub async fn serve(scheduler: Arc<Scheduler>, config: &Config) -> crate::error::Result<()> {
    let shutdown = Arc::new(Notify::new());
    let state = AppState {
        scheduler,
        shutdown: shutdown.clone(),
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/put", post(queue_put))
        .route("/cancel", post(queue_cancel))
        .route("/resubmit", post(resubmit))
        .route("/queue_inspect", get(queue_inspect))
        .route("/get_task_status", get(get_task_status))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/reset", post(reset))
        .route("/restart", post(restart))
        .route("/shutdown", post(shutdown_server))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "transport listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
        })
        .await?;
    Ok(())
}

async fn index() -> &'static str {
    "labsched server up."
}

async fn queue_put(State(state): State<AppState>, Json(payload): Json<Value>) -> Json<Value> {
    let task: Task = match serde_json::from_value(payload) {
        Ok(task) => task,
        Err(e) => {
            return Json(json!({ "response": format!("Error, no valid task received: {e}.") }))
        }
    };
    match state.scheduler.queue_put(task) {
        Ok((task_id, sample_number, response)) => Json(json!({
            "task_id": task_id,
            "sample_number": sample_number,
            "response": response,
        })),
        Err(e) => Json(json!({ "response": e.to_string() })),
    }
}

#[derive(Deserialize)]
struct CancelRequest {
    task_id: uuid::Uuid,
    #[serde(default)]
    include_active_queue: bool,
    #[serde(default)]
    drop_material: bool,
}

async fn queue_cancel(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> Json<Value> {
    match state.scheduler.queue_cancel(
        request.task_id,
        request.include_active_queue,
        request.drop_material,
    ) {
        Ok(Some(task)) => Json(json!({ "task": task, "response": "Task cancelled." })),
        Ok(None) => Json(json!({ "task": Value::Null, "response": "Task not found." })),
        Err(e) => Json(json!({ "response": e.to_string() })),
    }
}

#[derive(Deserialize)]
struct ResubmitRequest {
    task_id: uuid::Uuid,
    #[serde(default)]
    task: Option<Task>,
}

async fn resubmit(
    State(state): State<AppState>,
    Json(request): Json<ResubmitRequest>,
) -> Json<Value> {
    match state.scheduler.resubmit(request.task_id, request.task) {
        Ok((task_id, sample_number, response)) => Json(json!({
            "task_id": task_id,
            "sample_number": sample_number,
            "response": response,
        })),
        Err(e) => Json(json!({ "response": e.to_string() })),
    }
}

async fn queue_inspect(State(state): State<AppState>) -> Json<Value> {
    match state.scheduler.queue_inspect() {
        Ok(tasks) => {
            let mut out = serde_json::Map::new();
            for (index, task) in tasks.iter().enumerate() {
                out.insert(
                    format!("task_{index}"),
                    serde_json::to_value(task).unwrap_or(Value::Null),
                );
            }
            Json(Value::Object(out))
        }
        Err(e) => Json(json!({ "response": e.to_string() })),
    }
}

#[derive(Deserialize)]
struct StatusQuery {
    task_id: uuid::Uuid,
}

async fn get_task_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Json<Value> {
    match state.scheduler.task_status(query.task_id) {
        Ok(Some(report)) => Json(serde_json::to_value(&report).unwrap_or(Value::Null)),
        Ok(None) => Json(json!({ "response": "Task not found." })),
        Err(e) => Json(json!({ "response": e.to_string() })),
    }
}

async fn pause(State(state): State<AppState>) -> Json<Value> {
    state.scheduler.pause();
    Json(json!({ "response": "Dispatch paused." }))
}

async fn resume(State(state): State<AppState>) -> Json<Value> {
    state.scheduler.resume();
    Json(json!({ "response": "Dispatch resumed." }))
}

async fn reset(State(state): State<AppState>) -> Json<Value> {
    match state.scheduler.reset() {
        Ok(()) => Json(json!({ "response": "Scheduler reset." })),
        Err(e) => Json(json!({ "response": e.to_string() })),
    }
}

async fn restart(State(state): State<AppState>) -> Json<Value> {
    match state.scheduler.restart() {
        Ok(()) => Json(json!({ "response": "Scheduler restarted." })),
        Err(e) => Json(json!({ "response": e.to_string() })),
    }
}

#[derive(Deserialize, Default)]
struct ShutdownRequest {
    #[serde(default)]
    wait_for_queue_to_empty: bool,
}

async fn shutdown_server(
    State(state): State<AppState>,
    payload: Option<Json<ShutdownRequest>>,
) -> Json<Value> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();

    if request.wait_for_queue_to_empty {
        info!("shutdown requested, draining queues");
        let scheduler = state.scheduler.clone();
        let drained = tokio::task::spawn_blocking(move || loop {
            match scheduler.drained() {
                Ok(true) => break Ok(()),
                Ok(false) => std::thread::sleep(std::time::Duration::from_millis(200)),
                Err(e) => break Err(e),
            }
        })
        .await;
        if let Ok(Err(e)) = drained {
            return Json(json!({ "response": e.to_string() }));
        }
    }

    state.shutdown.notify_one();
    Json(json!({ "response": "Server shut down." }))
}
