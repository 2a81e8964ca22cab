//! HTTP surface: start runs and follow them over SSE.
//!
//! ```text
//! POST /run               {task, headless?} -> {runId}
//! GET  /run/{id}/stream   SSE: `step` events, then one `done` event
//! GET  /run/{id}          run summary
//! GET  /healthz           {ok: true}
//! ```

use crate::perception::PerceptionLoop;
use crate::registry::{RegistryError, RunId, Step};
use async_stream::stream;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<PerceptionLoop>,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub task: String,
    pub headless: Option<bool>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Registry(RegistryError::UnknownRun(_)) => StatusCode::NOT_FOUND,
            ApiError::Registry(RegistryError::AlreadyEnded(_)) => StatusCode::CONFLICT,
            ApiError::Registry(RegistryError::NotTerminal(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(start_run))
        .route("/run/{run_id}", get(run_summary))
        .route("/run/{run_id}/stream", get(stream_run))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = req.task.trim();
    if task.is_empty() {
        return Err(ApiError::BadRequest("task must not be empty".into()));
    }
    let run_id = state.runs.start(task.to_string(), req.headless);
    info!(run = %run_id, %task, "run accepted");
    Ok(Json(json!({ "runId": run_id })))
}

async fn run_summary(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state.runs.registry().status(&RunId::from(run_id))?;
    Ok(Json(summary))
}

async fn stream_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let run_id = RunId::from(run_id);
    let mut sub = state.runs.registry().subscribe(&run_id)?;
    debug!(run = %run_id, "watcher attached");

    let events = stream! {
        while let Some(step) = sub.next().await {
            yield to_event(&step);
        }
        debug!(run = %sub.run_id(), "watcher stream finished");
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// `step` carries `{msg, kind, ...detail}`; the terminal step becomes `done`
/// with `ok: true` and the run's final state.
fn to_event(step: &Step) -> Result<Event, axum::Error> {
    let mut body = serde_json::Map::new();
    body.insert("msg".into(), Value::String(step.payload.msg.clone()));
    body.extend(step.payload.detail.clone());
    let name = if step.is_terminal() {
        body.insert("ok".into(), Value::Bool(true));
        "done"
    } else {
        body.insert("kind".into(), serde_json::to_value(step.kind).unwrap_or(Value::Null));
        "step"
    };
    Event::default()
        .event(name)
        .id(step.seq.to_string())
        .json_data(Value::Object(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fakes::{FakeDriver, FakePage};
    use crate::perception::LoopConfig;
    use crate::registry::RunRegistry;
    use crate::vision::fakes::FakePerception;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<RunRegistry>) {
        let registry = Arc::new(RunRegistry::default());
        let runs = PerceptionLoop::new(
            Arc::clone(&registry),
            Arc::new(FakeDriver::new(FakePage::default())),
            Arc::new(FakePerception::Answer("a page".into())),
            LoopConfig::default(),
        );
        (router(AppState { runs: Arc::new(runs) }), registry)
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_run(body: Value) -> Request<Body> {
        Request::post("/run")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (app, _) = app();
        let resp = app.oneshot(Request::get("/healthz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn empty_task_is_rejected() {
        let (app, registry) = app();
        let resp = app.oneshot(post_run(json!({ "task": "   " }))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_run_is_404() {
        let (app, _) = app();
        let resp = app
            .clone()
            .oneshot(Request::get("/run/nope/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("nope"));

        let resp = app.oneshot(Request::get("/run/nope").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stream_replays_steps_then_done() {
        let (app, _) = app();
        let resp = app
            .clone()
            .oneshot(post_run(json!({ "task": "go to https://example.org", "headless": true })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let run_id = body_json(resp).await["runId"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(Request::get(format!("/run/{run_id}/stream")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        let step_at = text.find("event: step").unwrap();
        let done_at = text.find("event: done").unwrap();
        assert!(step_at < done_at);
        assert!(text.contains("navigated to https://example.org"));
        assert!(text.contains("\"ok\":true"));
        assert!(text.contains("\"state\":\"completed\""));

        let resp = app
            .oneshot(Request::get(format!("/run/{run_id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let summary = body_json(resp).await;
        assert_eq!(summary["runId"], run_id.as_str());
        assert_eq!(summary["state"], "completed");
        assert_eq!(summary["steps"], 2);
    }
}
