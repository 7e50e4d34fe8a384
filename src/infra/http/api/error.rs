use axum::Json;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use pressroom_api_types::{ApiErrorBody, ApiErrorMessage};

use crate::application::error::{ErrorReport, PipelineError};

/// Seconds a client should wait before resubmitting after `pool_exhausted`.
const POOL_EXHAUSTED_RETRY_AFTER_SECS: u64 = 5;

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const UNAUTHORIZED: &str = "unauthorized";
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
    retry_after: Option<u64>,
    source: &'static str,
    detail: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
            retry_after: None,
            source: "infra::http::api",
            detail: None,
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHORIZED,
            "API key required",
            None,
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn with_report(mut self, source: &'static str, detail: String) -> Self {
        self.source = source;
        self.detail = Some(detail);
        self
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        // Only validation problems are safe to echo back verbatim.
        let hint = match &err {
            PipelineError::InvalidInput(inner) => Some(inner.to_string()),
            PipelineError::PoolExhausted { .. } => Some(format!(
                "Retry after {POOL_EXHAUSTED_RETRY_AFTER_SECS} seconds"
            )),
            _ => None,
        };
        let api_error = ApiError::new(err.status_code(), err.code(), err.public_message(), hint)
            .with_report(
                "application::orchestrator",
                ErrorReport::from_error("application::orchestrator", err.status_code(), &err)
                    .messages
                    .join(": "),
            );
        if err.is_retryable() {
            api_error.with_retry_after(POOL_EXHAUSTED_RETRY_AFTER_SECS)
        } else {
            api_error
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = self.detail.clone().unwrap_or_else(|| {
            format!(
                "{}: {}",
                self.code,
                self.hint.as_deref().unwrap_or(self.message)
            )
        });
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(seconds) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        // Attach a structured report so shared logging middleware can emit rich diagnostics.
        ErrorReport::from_message(self.source, self.status, detail).attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::DomainError;

    #[test]
    fn pool_exhaustion_carries_retry_after() {
        let response = PipelineError::PoolExhausted { capacity: 2 }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("5")
        );
    }

    #[test]
    fn overall_timeout_is_gateway_timeout_without_retry_after() {
        let response = PipelineError::OverallTimeout { budget_ms: 45_000 }.into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }

    #[test]
    fn invalid_input_echoes_validation_hint() {
        let err = ApiError::from(PipelineError::InvalidInput(DomainError::validation(
            "htmlContent",
            "must not be empty",
        )));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "invalid_input");
        assert!(err.hint.as_deref().unwrap_or("").contains("htmlContent"));
    }

    #[test]
    fn internal_failures_hide_details_from_callers() {
        let err = ApiError::from(PipelineError::upload_failure("token=secret rejected"));
        assert!(err.hint.is_none());
        assert!(err.detail.as_deref().unwrap_or("").contains("token=secret"));
    }
}
