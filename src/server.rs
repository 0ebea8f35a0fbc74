//! HTTP front door.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/submit_query` | Ask the assistant; `{query, user_id?}` → `{response, context}` |
//! | `GET`  | `/health` | Independent availability of every dependency |
//! | `POST` | `/hooks/interventions` | Intervention lifecycle events, applied in the background |
//!
//! # Error Contract
//!
//! Requests rejected before reaching the pipeline get:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Pipeline outcomes (timeout 504, broker unavailable 503, failure 500)
//! keep the normal `{response, context}` body with a user-facing message.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::{HealthReport, PipelineContext};
use crate::gateway::Gateway;
use crate::indexer::{Indexer, Intervention};
use crate::worker::{spawn_workers, Worker};

/// Shared state for all route handlers.
#[derive(Clone)]
struct AppState {
    ctx: PipelineContext,
    gateway: Gateway,
    indexer: Arc<Indexer>,
}

/// Build the router. Exposed for tests and embedding.
pub fn router(ctx: PipelineContext) -> Router {
    let state = AppState {
        gateway: Gateway::new(ctx.clone()),
        indexer: Arc::new(Indexer::new(&ctx)),
        ctx,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/submit_query", post(handle_submit))
        .route("/health", get(handle_health))
        .route("/hooks/interventions", post(handle_intervention_hook))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until Ctrl-C, optionally running `workers` in-process consumer
/// loops against the same broker.
pub async fn run_server(ctx: PipelineContext, workers: usize) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();

    // Dropped on return, which stops the in-process workers.
    let _workers = (workers > 0).then(|| {
        let worker = Worker::new(ctx.clone());
        spawn_workers(&worker, &ctx.config.broker.worker_id(), workers)
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, workers, "gateway listening");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

// ============ POST /submit_query ============

#[derive(Deserialize)]
struct SubmitRequest {
    query: String,
    #[serde(default)]
    user_id: Option<String>,
}

async fn handle_submit(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(req) = payload.map_err(|e| bad_request(e.body_text()))?;

    let outcome = state
        .gateway
        .submit(&req.query, req.user_id.as_deref())
        .await
        .map_err(|e| bad_request(e.to_string()))?;

    let status = StatusCode::from_u16(outcome.status.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(outcome.reply)).into_response())
}

// ============ GET /health ============

async fn handle_health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.ctx.health().await)
}

// ============ POST /hooks/interventions ============

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InterventionEvent {
    Created { intervention: Intervention },
    Updated { intervention: Intervention },
    Deleted { reference: String, pk: i64 },
}

#[derive(Serialize)]
struct Accepted {
    status: &'static str,
}

/// Accept the event and apply it in the background; the caller never
/// waits on embedding.
async fn handle_intervention_hook(
    State(state): State<AppState>,
    payload: Result<Json<InterventionEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let Json(event) = payload.map_err(|e| bad_request(e.body_text()))?;

    match event {
        InterventionEvent::Created { intervention } => {
            state.indexer.spawn_created(intervention);
        }
        InterventionEvent::Updated { intervention } => {
            state.indexer.spawn_updated(intervention);
        }
        InterventionEvent::Deleted { reference, pk } => {
            state.indexer.spawn_deleted(reference, pk);
        }
    }

    Ok((StatusCode::ACCEPTED, Json(Accepted { status: "accepted" })))
}
