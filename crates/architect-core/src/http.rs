//! The operator HTTP/JSON surface, per `SPEC_FULL.md` §6. Wires the CSRF
//! double-submit middleware in front of the task queue API; every
//! state-changing route passes through [`csrf_layer`] before reaching its
//! handler.

use std::sync::{Arc, Mutex};

use architect_events::EventLog;
use architect_types::CoreError;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::csrf::{self, CsrfStore};
use crate::queue::{Queue, SubmitRequest};

/// Shared handler state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<Mutex<Queue>>,
    pub events: Arc<Mutex<EventLog>>,
    pub csrf: Arc<Mutex<CsrfStore>>,
}

/// Build the operator router: CSRF-protected mutating routes plus the
/// exempt health/login/webhook-ingress surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/bulk/create", post(bulk_create))
        .route("/api/tasks/bulk/update-status", post(bulk_update_status))
        .route("/api/tasks/bulk/prioritize", post(bulk_prioritize))
        .route("/api/tasks/bulk/retry", post(bulk_retry))
        .layer(middleware::from_fn_with_state(state.clone(), csrf_layer))
        .with_state(state)
}

/// Body size cap for the in-middleware CSRF buffering below (1 MiB).
const CSRF_BODY_LIMIT: usize = 1024 * 1024;

async fn csrf_layer(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();

    if !csrf::requires_csrf(&method, &path) {
        return next.run(request).await;
    }

    let session_id = headers
        .get("X-Session-Id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();
    let header_token = headers.get(csrf::HEADER_NAME).and_then(|v| v.to_str().ok()).map(str::to_string);

    // Header alone covers the common case; only buffer the body to look
    // for a form/JSON field when the header didn't carry a token.
    let (request, body_token) = if header_token.is_some() {
        (request, None)
    } else {
        let content_type = headers.get(axum::http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
        let (parts, body) = request.into_parts();
        let bytes = match axum::body::to_bytes(body, CSRF_BODY_LIMIT).await {
            Ok(bytes) => bytes,
            Err(_) => return csrf_invalid_response("CSRF token missing"),
        };

        let token = if content_type.starts_with("application/x-www-form-urlencoded") {
            serde_urlencoded::from_bytes::<Vec<(String, String)>>(&bytes)
                .ok()
                .and_then(|pairs| pairs.into_iter().find(|(k, _)| k == csrf::FORM_FIELD).map(|(_, v)| v))
        } else if content_type.starts_with("application/json") {
            serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|v| v.get(csrf::FORM_FIELD).and_then(|t| t.as_str()).map(str::to_string))
        } else {
            None
        };

        (axum::extract::Request::from_parts(parts, axum::body::Body::from(bytes)), token)
    };

    let token = csrf::extract_token(header_token.as_deref(), body_token.as_deref(), None).map(str::to_string);

    let validation = {
        let store = state.csrf.lock().expect("csrf store poisoned");
        store.validate(&session_id, token.as_deref())
    };

    match validation {
        Ok(()) => next.run(request).await,
        Err(CoreError::Security(message)) => csrf_invalid_response(&message),
        Err(e) => csrf_invalid_response(&e.to_string()),
    }
}

fn csrf_invalid_response(message: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "error": "CSRF validation failed",
            "code": "CSRF_INVALID",
            "message": message,
        })),
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({"success": true, "status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct SubmitTaskBody {
    task_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    priority: i32,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_timeout")]
    timeout_seconds: i64,
    parent_id: Option<i64>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout() -> i64 {
    300
}

async fn submit_task(State(state): State<AppState>, Json(body): Json<SubmitTaskBody>) -> Response {
    let req = SubmitRequest {
        task_type: body.task_type,
        payload: body.payload,
        priority: body.priority,
        max_retries: body.max_retries,
        timeout_seconds: body.timeout_seconds,
        parent_id: body.parent_id,
        ..Default::default()
    };

    let queue = state.queue.lock().expect("queue poisoned");
    let mut events = state.events.lock().expect("events poisoned");
    match queue.submit(req, &mut events) {
        Ok(task) => (StatusCode::CREATED, Json(json!({"success": true, "id": task.id}))).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let queue = state.queue.lock().expect("queue poisoned");
    match queue.storage().get_task(id) {
        Ok(task) => Json(json!({"success": true, "task": task})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct BulkCreateBody {
    tasks: Vec<SubmitTaskBody>,
}

async fn bulk_create(State(state): State<AppState>, Json(body): Json<BulkCreateBody>) -> Response {
    if body.tasks.len() > 100 {
        return error_response(&CoreError::Validation("at most 100 tasks per bulk request".into()));
    }
    let requests = body
        .tasks
        .into_iter()
        .map(|b| SubmitRequest {
            task_type: b.task_type,
            payload: b.payload,
            priority: b.priority,
            max_retries: b.max_retries,
            timeout_seconds: b.timeout_seconds,
            parent_id: b.parent_id,
            ..Default::default()
        })
        .collect();

    let queue = state.queue.lock().expect("queue poisoned");
    let mut events = state.events.lock().expect("events poisoned");
    match queue.submit_bulk(requests, &mut events) {
        Ok(outcomes) => Json(json!({"success": true, "results": outcomes})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct BulkUpdateStatusBody {
    task_ids: Vec<i64>,
    status: String,
    error: Option<String>,
}

async fn bulk_update_status(State(state): State<AppState>, Json(body): Json<BulkUpdateStatusBody>) -> Response {
    let mut queue = state.queue.lock().expect("queue poisoned");
    let mut events = state.events.lock().expect("events poisoned");
    let mut results = Vec::with_capacity(body.task_ids.len());

    for id in body.task_ids {
        let outcome = match body.status.as_str() {
            "completed" => queue.complete(id, &mut events).map(|_| ()),
            "failed" => queue.fail(id, body.error.as_deref().unwrap_or(""), &mut events).map(|_| ()),
            "cancelled" => queue.cancel(id, &mut events).map(|_| ()),
            other => Err(CoreError::Validation(format!("unsupported status: {other}"))),
        };
        results.push(match outcome {
            Ok(()) => json!({"id": id, "success": true}),
            Err(e) => json!({"id": id, "success": false, "error": e.to_string()}),
        });
    }

    Json(json!({"success": true, "results": results})).into_response()
}

#[derive(Debug, Deserialize)]
struct BulkPrioritizeBody {
    task_ids: Vec<i64>,
    value: i32,
    #[serde(default)]
    increment: bool,
}

async fn bulk_prioritize(State(state): State<AppState>, Json(body): Json<BulkPrioritizeBody>) -> Response {
    let queue = state.queue.lock().expect("queue poisoned");
    let mut events = state.events.lock().expect("events poisoned");
    let mut results = Vec::with_capacity(body.task_ids.len());

    for id in body.task_ids {
        let target = if body.increment {
            match queue.storage().get_task(id) {
                Ok(task) => task.priority as i32 + body.value,
                Err(e) => {
                    results.push(json!({"id": id, "success": false, "error": e.to_string()}));
                    continue;
                }
            }
        } else {
            body.value
        };

        match queue.update_priority(id, target, &mut events) {
            Ok(task) => results.push(json!({"id": id, "success": true, "priority": task.priority})),
            Err(e) => results.push(json!({"id": id, "success": false, "error": e.to_string()})),
        }
    }

    Json(json!({"success": true, "results": results})).into_response()
}

#[derive(Debug, Deserialize)]
struct BulkRetryBody {
    task_ids: Option<Vec<i64>>,
    #[serde(default)]
    reset_retries: bool,
}

async fn bulk_retry(State(state): State<AppState>, Json(body): Json<BulkRetryBody>) -> Response {
    let queue = state.queue.lock().expect("queue poisoned");
    let mut events = state.events.lock().expect("events poisoned");

    let result = queue.retry_failed(body.task_ids.as_deref(), body.reset_retries, &mut events);
    match result {
        Ok(retried) => Json(json!({"success": true, "retried": retried})).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &CoreError) -> Response {
    let status = match err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::StateConflict(_) => StatusCode::CONFLICT,
        CoreError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::QueueEmpty => StatusCode::NO_CONTENT,
        CoreError::Transport(_) => StatusCode::BAD_GATEWAY,
        CoreError::Security(_) => StatusCode::FORBIDDEN,
    };
    (
        status,
        Json(json!({"error": err.to_string(), "code": err.code(), "message": err.to_string()})),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: String,
    code: &'static str,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            queue: Arc::new(Mutex::new(Queue::new(StorageEngine::open_in_memory().unwrap()))),
            events: Arc::new(Mutex::new(EventLog::new())),
            csrf: Arc::new(Mutex::new(CsrfStore::new())),
        }
    }

    #[tokio::test]
    async fn health_check_is_exempt_from_csrf() {
        let app = router(test_state());
        let response = app
            .oneshot(axum::http::Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_tasks_without_csrf_token_is_forbidden() {
        let app = router(test_state());
        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/tasks")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(r#"{"task_type": "build"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn post_tasks_with_valid_csrf_token_succeeds() {
        let state = test_state();
        let token = state.csrf.lock().unwrap().issue("anonymous", false);
        let app = router(state);

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/tasks")
            .header("content-type", "application/json")
            .header(csrf::HEADER_NAME, token)
            .body(axum::body::Body::from(r#"{"task_type": "build"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
}
