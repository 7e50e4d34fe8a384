use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{
        HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use pressroom_api_types::{HealthResponse, PoolStatsView};
use tracing::error;

use crate::{
    application::{error::HttpError, orchestrator::RenderService},
    infra::artifacts::{ArtifactError, ArtifactStore},
};

use super::RouterState;

#[derive(Clone)]
pub struct HttpState {
    pub service: RenderService,
    pub artifacts: Arc<ArtifactStore>,
}

pub fn build_public_router(state: RouterState) -> Router<RouterState> {
    let artifact_route = format!("/{}/{{file}}", state.http.artifacts.serving_prefix());

    Router::new()
        .route("/_health", get(health))
        .route(&artifact_route, get(serve_artifact))
}

async fn serve_artifact(State(state): State<HttpState>, Path(file): Path<String>) -> Response {
    const SOURCE: &str = "infra::http::public::serve_artifact";

    match state.artifacts.read(&file).await {
        Ok(bytes) => build_artifact_response(bytes),
        Err(ArtifactError::InvalidName(_)) => HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "File not found",
            "The requested file is not available",
        )
        .into_response(),
        Err(err) if err.is_not_found() => HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "File not found",
            "The requested file is not available",
        )
        .into_response(),
        Err(err) => {
            error!(
                target = SOURCE,
                file = %file,
                error = %err,
                "failed to read stored artifact"
            );
            HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read file",
                &err,
            )
            .into_response()
        }
    }
}

fn build_artifact_response(bytes: Bytes) -> Response {
    let length = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/pdf"));
    if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
    // Artifacts disappear when their serving window closes.
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

    response
}

async fn health(State(state): State<HttpState>) -> Response {
    let stats = state.service.pool_stats();
    let status = if stats.shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = HealthResponse {
        status: if stats.shutting_down {
            "shutting_down".to_string()
        } else {
            "ok".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        pool: PoolStatsView {
            instances: stats.instances,
            healthy_instances: stats.healthy_instances,
            open_contexts: stats.open_contexts,
            capacity: stats.capacity,
            shutting_down: stats.shutting_down,
        },
    };

    (status, Json(body)).into_response()
}
