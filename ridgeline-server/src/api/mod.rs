//! HTTP API endpoints

use crate::protocol::{ingest, BatchOutcome};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use ridgeline_core::query::{ApiEndpoint, ReadOperation};
use ridgeline_core::storage::{Database, DebugReport};
use ridgeline_core::RidgeError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Bytes per streamed response chunk
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the reader thread and the response
const CHUNKS_IN_FLIGHT: usize = 4;

/// Application state
pub type AppState = Arc<Database>;

/// Create the API router
pub fn create_router(db: Arc<Database>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/write", post(write))
        .route("/api/query", post(query))
        .route("/api/stats", get(stats))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(db)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    #[serde(default = "default_endpoint")]
    endpoint: ApiEndpoint,
}

fn default_endpoint() -> ApiEndpoint {
    ApiEndpoint::Query
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn status_of(e: &RidgeError) -> StatusCode {
    match e {
        RidgeError::SeriesNotFound(_) => StatusCode::NOT_FOUND,
        RidgeError::Query(_) | RidgeError::InvalidSeriesName(_) | RidgeError::InvalidFormat(_) => {
            StatusCode::BAD_REQUEST
        }
        e if e.is_backpressure() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: ridgeline_core::VERSION.to_string(),
    })
}

/// Ingest protocol lines. Lines that fail are listed in the response; the
/// others are written.
async fn write(
    State(db): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<BatchOutcome>), ApiError> {
    let outcome = tokio::task::spawn_blocking(move || {
        let mut session = db.create_session();
        let outcome = ingest(&mut session, &body);
        if outcome.backpressure {
            db.request_checkpoint();
        }
        outcome
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    let status = if outcome.backpressure {
        StatusCode::SERVICE_UNAVAILABLE
    } else if !outcome.is_ok() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

/// Run a query. The body is a JSON query descriptor; the response is
/// streamed as the operation produces it.
async fn query(
    State(db): State<AppState>,
    Query(params): Query<QueryParams>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let processor = db.query_processor();
    let op = tokio::task::spawn_blocking(move || -> Result<ReadOperation, RidgeError> {
        let mut op = processor.create(params.endpoint);
        op.append(&body)?;
        op.start()?;
        Ok(op)
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?
    .map_err(|e| api_error(status_of(&e), e))?;

    if let Some(e) = op.get_error() {
        return Err(api_error(status_of(e), e));
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CHUNKS_IN_FLIGHT);
    tokio::task::spawn_blocking(move || stream_operation(op, tx));

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Pump a read operation into the response channel. A full channel blocks
/// the reader, a closed one cancels the operation.
fn stream_operation(mut op: ReadOperation, tx: mpsc::Sender<Result<Bytes, std::io::Error>>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let chunk: Result<(), std::io::Error> = match op.read_some(&mut buf) {
            Ok((n, done)) => {
                if n > 0 && tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    debug!("Query client went away");
                    break;
                }
                if !done {
                    continue;
                }
                match op.get_error() {
                    Some(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
                    None => break,
                }
            }
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
        };
        if let Err(e) = chunk {
            warn!("Query failed while streaming: {}", e);
            let _ = tx.blocking_send(Err(e));
            break;
        }
    }
    op.close();
}

async fn stats(State(db): State<AppState>) -> Result<Json<DebugReport>, ApiError> {
    tokio::task::spawn_blocking(move || db.debug_report())
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
}
