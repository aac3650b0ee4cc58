//! HTTP front-end: routes, error mapping and middleware.

pub mod lifecycle;
pub mod schema;

use std::any::Any;
use std::path::PathBuf;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use self::lifecycle::ServerHandle;
use self::schema::{ChatReply, ChatRequest, IndexQuery};
use crate::bridge::{ExecutionBridge, Question};
use crate::error::EngineError;

#[derive(Clone)]
pub struct AppState {
    pub bridge: ExecutionBridge,
}

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub static_dir: PathBuf,
    pub cors: bool,
}

pub fn router(state: AppState, options: &HttpOptions) -> Router {
    let routes = Router::new()
        .route("/", get(index))
        .route("/chat", post(chat))
        .nest_service("/static", ServeDir::new(&options.static_dir))
        .with_state(state);
    with_layers(routes, options.cors)
}

fn with_layers(router: Router, cors: bool) -> Router {
    let mut router = router.layer(CatchPanicLayer::custom(handle_panic));
    if cors {
        router = router.layer(CorsLayer::permissive());
    }
    router.layer(TraceLayer::new_for_http())
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn index(Query(_query): Query<IndexQuery>) -> Json<serde_json::Value> {
    Json(json!({ "hello": "world" }))
}

async fn chat(State(state): State<AppState>, payload: Result<Json<ChatRequest>, JsonRejection>) -> Response {
    let question = match payload {
        Ok(Json(request)) => Question::parse(request.question),
        Err(rejection) => Err(EngineError::Validation(rejection.body_text())),
    };
    let question = match question {
        Ok(q) => q,
        Err(e) => return error_reply(&e),
    };

    match state.bridge.answer(&question).await {
        Ok(answer) => (StatusCode::OK, Json(ChatReply::answer(answer.into_text()))).into_response(),
        Err(e) => error_reply(&e),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────

pub fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::WorkerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        EngineError::NoWorkers | EngineError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Inference(_)
        | EngineError::WorkerDied { .. }
        | EngineError::WorkerSpawn(_)
        | EngineError::Protocol(_)
        | EngineError::Io(_)
        | EngineError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(error: &EngineError) -> Response {
    let status = status_for(error);
    if status.is_server_error() {
        tracing::error!(code = error.code(), status = status.as_u16(), "Chat request failed: {}", error);
    } else {
        tracing::warn!(code = error.code(), status = status.as_u16(), "Chat request rejected: {}", error);
    }
    (status, Json(ChatReply::error(error.to_string(), status.as_u16()))).into_response()
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!("Request handler panicked: {}", detail);

    let status = StatusCode::INTERNAL_SERVER_ERROR;
    let body = ChatReply::error(format!("Internal server error: {detail}"), status.as_u16());
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn error_kinds_map_to_distinct_statuses() {
        assert_eq!(status_for(&EngineError::Validation("x".into())), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(&EngineError::Inference("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            status_for(&EngineError::WorkerDied { slot: 0, detail: "x".into() }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&EngineError::WorkerTimeout { slot: 0, elapsed_ms: 5 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(&EngineError::NoWorkers), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&EngineError::PoolClosed), StatusCode::SERVICE_UNAVAILABLE);
    }

    async fn explode() -> &'static str {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn panicking_handler_becomes_structured_500() {
        let app = with_layers(Router::new().route("/explode", get(explode)), true);

        let response = app
            .oneshot(Request::builder().uri("/explode").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], 500);
        assert!(body["error"].as_str().unwrap().contains("kaboom"));
        assert!(body.get("answer").is_none());
    }
}
