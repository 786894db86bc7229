//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/rag/answer` | Written answer with citations |
//! | `POST` | `/api/trainer/respond` | Spoken answer with sources |
//! | `POST` | `/api/trainer/respond/stream` | Streamed conversational answer (SSE) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Error responses share one schema:
//!
//! ```json
//! { "error": { "code": "validation_error", "message": "...", "fields": { "question": ["..."] } } }
//! ```
//!
//! Error codes: `validation_error` (400), `upstream_error` (500),
//! `timeout` (504). `fields` is present only for validation errors.
//!
//! The streaming endpoint validates before opening the stream, so a bad body
//! gets the JSON error above rather than an event stream. Once the stream is
//! open, failures arrive as an `error` event (see [`crate::events`]).

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::embedding::AzureOpenAiEmbedder;
use crate::error::{UpstreamError, ValidationErrors};
use crate::generation::AzureOpenAiGenerator;
use crate::ledger::{ConversationStore, LedgerPolicy};
use crate::orchestrator::{AnswerResponse, Orchestrator, Settings, SpokenResponse};
use crate::request::{parse_query, parse_spoken, parse_stream};
use crate::search::AzureSearchRetriever;

/// Largest accepted request body.
pub const BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Pipeline shared by every handler; cheap to clone.
    orchestrator: Orchestrator,
    /// `topK` used when a request omits it.
    default_top_k: usize,
}

impl AppState {
    /// Wrap an orchestrator for the router.
    pub fn new(orchestrator: Orchestrator, default_top_k: usize) -> Self {
        Self {
            orchestrator,
            default_top_k,
        }
    }
}

/// Build the Azure-backed orchestrator described by `config`.
pub fn orchestrator_from_config(config: &Config) -> anyhow::Result<Orchestrator> {
    let policy = LedgerPolicy::from(&config.conversation);
    if !policy.is_unbounded() {
        info!(
            max_conversations = ?policy.max_conversations,
            max_turns = ?policy.max_turns,
            idle_ttl = ?policy.idle_ttl,
            "conversation ledger bounds enabled"
        );
    }

    Ok(Orchestrator::new(
        Arc::new(AzureOpenAiEmbedder::new(&config.openai)?),
        Arc::new(AzureSearchRetriever::new(&config.search)?),
        Arc::new(AzureOpenAiGenerator::new(&config.openai)?),
        Arc::new(ConversationStore::new(policy)),
        Settings::from(config),
    ))
}

/// Starts the HTTP server with the Azure collaborators from `config`.
///
/// Runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let orchestrator = orchestrator_from_config(config)?;
    run_server_with(config, orchestrator).await
}

/// Starts the HTTP server around an existing orchestrator.
pub async fn run_server_with(config: &Config, orchestrator: Orchestrator) -> anyhow::Result<()> {
    let state = AppState::new(orchestrator, config.retrieval.default_top_k);
    let app = router(state, &config.server.cors_origin)?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(addr = %listener.local_addr()?, "trainer server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}

/// Routes, CORS, body limit and request tracing.
pub fn router(state: AppState, cors_origin: &str) -> anyhow::Result<Router> {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    let cors = if cors_origin == "*" {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(HeaderValue::from_str(cors_origin)?)
    };

    Ok(Router::new()
        .route("/health", get(handle_health))
        .route("/api/rag/answer", post(handle_answer))
        .route("/api/trainer/respond", post(handle_respond))
        .route("/api/trainer/respond/stream", post(handle_stream))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

// ============ Error response ============

/// JSON envelope for every error response: `{"error": {...}}`.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// The error itself.
#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable code: `validation_error`, `upstream_error` or `timeout`.
    code: &'static str,
    /// Human-readable description.
    message: String,
    /// Per-field messages; present only for validation errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<ValidationErrors>,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    fields: Option<ValidationErrors>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                fields: self.fields,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ValidationErrors> for AppError {
    fn from(errs: ValidationErrors) -> Self {
        AppError {
            status: StatusCode::BAD_REQUEST,
            code: "validation_error",
            message: errs.to_string(),
            fields: Some(errs),
        }
    }
}

impl From<UpstreamError> for AppError {
    fn from(err: UpstreamError) -> Self {
        let (status, code) = match err {
            UpstreamError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "upstream_error"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
            fields: None,
        }
    }
}

/// Unwrap a JSON body, reporting malformed input against the `body` field.
fn json_body(payload: Result<Json<Value>, JsonRejection>) -> Result<Value, AppError> {
    match payload {
        Ok(Json(v)) => Ok(v),
        Err(rejection) => {
            let mut errs = ValidationErrors::default();
            errs.add("body", rejection.body_text());
            let mut err = AppError::from(errs);
            // Keeps 413 for oversized bodies and 415 for a wrong content type.
            err.status = rejection.status();
            Err(err)
        }
    }
}

// ============ GET /health ============

/// Response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    /// Always `true` while the process is serving.
    ok: bool,
    /// Crate version.
    version: &'static str,
}

/// Liveness check; touches no upstream service.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /api/rag/answer ============

/// Written answer with numbered citations.
///
/// Stateless: the conversation ledger is not read or written.
async fn handle_answer(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<AnswerResponse>, AppError> {
    let body = json_body(payload)?;
    let query = parse_query(&body, state.default_top_k)?;
    let answer = state.orchestrator.answer(&query).await?;
    Ok(Json(answer))
}

// ============ POST /api/trainer/respond ============

/// Spoken answer in the requested persona, with its sources.
///
/// Returns 504 with code `timeout` when the request deadline elapses.
async fn handle_respond(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<SpokenResponse>, AppError> {
    let body = json_body(payload)?;
    let request = parse_spoken(&body, state.default_top_k)?;
    let response = state.orchestrator.respond(&request).await?;
    Ok(Json(response))
}

// ============ POST /api/trainer/respond/stream ============

/// Streams `meta`, `token`… and `done`/`error` events.
///
/// The cancellation token is tied to the response body: when the client
/// disconnects, axum drops the stream, the drop guard fires and the
/// orchestrator abandons the request.
async fn handle_stream(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let body = json_body(payload)?;
    let request = parse_stream(&body, state.default_top_k)?;

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let (_, events) = state.orchestrator.stream(request, cancel);

    let stream = events.map(move |event| {
        let _held = &guard;
        Ok::<_, Infallible>(event.to_sse())
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
