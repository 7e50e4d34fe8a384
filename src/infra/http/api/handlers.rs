use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pressroom_api_types::{JobStatus, RenderCompletedResponse, SubmitRenderRequest};

use crate::application::orchestrator::{CompletedJob, SubmitRenderJob};

use super::error::{ApiError, codes};
use super::state::ApiState;

pub async fn submit_render(
    State(state): State<ApiState>,
    payload: Result<Json<SubmitRenderRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload.map_err(|rejection| {
        ApiError::new(
            rejection.status(),
            codes::BAD_REQUEST,
            "Request body is invalid",
            Some(rejection.body_text()),
        )
    })?;

    let job = SubmitRenderJob {
        html: payload.html_content,
        record_id: payload.record_id,
        label: payload.label,
    };

    let completed = state.service.submit(job).await?;
    Ok((StatusCode::OK, Json(completed_response(completed))).into_response())
}

fn completed_response(completed: CompletedJob) -> RenderCompletedResponse {
    let CompletedJob { job_id, artifact } = completed;
    RenderCompletedResponse {
        status: JobStatus::Completed,
        job_id,
        expires_at: artifact.delete_after.unwrap_or(artifact.created_at),
        file_name: artifact.file_name,
        url: artifact.url.to_string(),
        size_bytes: artifact.size_bytes,
    }
}
