//! HTTP API Server
//!
//! The wire protocol of an instance: producers POST to `/write`, consumers
//! and the replication clients of other instances GET `/read`, `/ack` and
//! `/listChunks`. Errors are returned as plain text, chunk listings as JSON.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::Error;
use crate::protocol::Chunk;
use crate::storage::Manager;

/// Shared application state
pub struct AppState {
    pub manager: Arc<Manager>,
}

/// Create the router serving the wire protocol
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/write", post(handle_write))
        .route("/read", get(handle_read))
        .route("/ack", get(handle_ack))
        .route("/listChunks", get(handle_list_chunks))
        .fallback(handle_unknown)
        .with_state(state)
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_invalid_argument() {
            StatusCode::BAD_REQUEST
        } else if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            tracing::error!("request failed: {}", self.0);
            StatusCode::INTERNAL_SERVER_ERROR
        };

        (status, self.0.to_string()).into_response()
    }
}

// ============ Request Parameters ============

#[derive(Deserialize)]
struct WriteParams {
    category: String,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct ReadParams {
    category: String,
    chunk: String,
    off: u64,
    #[serde(rename = "maxSize")]
    max_size: u64,
    /// Accepted for wire compatibility, currently unused
    from_replication: Option<String>,
}

#[derive(Deserialize)]
struct AckParams {
    category: String,
    chunk: String,
    size: u64,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct ListChunksParams {
    category: String,
    /// Accepted for wire compatibility, currently unused
    from_replication: Option<String>,
}

// ============ Handlers ============

async fn handle_write(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WriteParams>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let storage = state.manager.get(&params.category).await?;
    storage.write(&body).await?;
    Ok(StatusCode::OK)
}

async fn handle_read(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ReadParams>,
) -> Result<Response, ApiError> {
    let storage = state.manager.get(&params.category).await?;

    let mut out = Vec::new();
    storage
        .read(&params.chunk, params.off, params.max_size, &mut out)
        .await?;

    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], out).into_response())
}

async fn handle_ack(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AckParams>,
) -> Result<StatusCode, ApiError> {
    let storage = state.manager.get(&params.category).await?;
    storage.ack(&params.chunk, params.size).await?;
    Ok(StatusCode::OK)
}

async fn handle_list_chunks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListChunksParams>,
) -> Result<Json<Vec<Chunk>>, ApiError> {
    let storage = state.manager.get(&params.category).await?;
    Ok(Json(storage.list_chunks().await?))
}

async fn handle_unknown() -> impl IntoResponse {
    concat!("chukcha ", env!("CARGO_PKG_VERSION"), "\n")
}
