use crate::client_trait::ChainClient;
use crate::database::Store;
use crate::error::IndexerResult;
use crate::models::{strip_0x_prefix, PublicKeyIndexer, PublicKeyStatus};
use crate::scanner::GapCell;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub client: Arc<dyn ChainClient>,
    pub gap: GapCell,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/key/:id", get(get_key).options(key_preflight))
        .route("/status", get(get_status))
        .with_state(state)
}

pub async fn serve(state: ApiState, port: u16, cancel: CancellationToken) -> IndexerResult<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Serving on port {}", port);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(
            "Accept, Content-Type, Content-Length, Accept-Encoding, Authorization,X-CSRF-Token",
        ),
    );
    response
}

async fn get_key(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let public_key = strip_0x_prefix(&id).to_lowercase();
    let response = match state.store.get_accounts_by_public_key(&public_key) {
        Ok(rows) if !rows.is_empty() => (
            StatusCode::OK,
            Json(serde_json::json!(PublicKeyIndexer::from_rows(public_key, rows))),
        ),
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "public key not found" })),
        ),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    };
    with_cors(response.into_response())
}

/// Never returns a server error: any field that cannot be resolved is
/// reported as -1.
async fn get_status(State(state): State<ApiState>) -> Response {
    let (count, loaded) = match state.store.get_public_key_stats() {
        Ok((count, loaded)) => (count, loaded as i64),
        Err(e) => {
            error!("Could not read public key stats: {}", e);
            (-1, -1)
        }
    };
    let current_block = match state.client.get_latest_block_header().await {
        Ok(header) => header.height as i64,
        Err(e) => {
            error!("Could not get current block height: {}", e);
            -1
        }
    };
    let status = PublicKeyStatus {
        count,
        current_block,
        loaded_to_block: loaded,
        gap: *state.gap.read().unwrap(),
    };
    with_cors((StatusCode::OK, Json(status)).into_response())
}

async fn key_preflight() -> Response {
    with_cors(StatusCode::NO_CONTENT.into_response())
}
