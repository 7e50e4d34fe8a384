use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{domain::error::DomainError, infra::error::InfraError};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Plain-text error for the non-API surfaces (artifact serving).
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

/// Why a render job failed. Every variant maps to exactly one HTTP status.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input")]
    InvalidInput(#[from] DomainError),
    #[error("all {capacity} render contexts are busy")]
    PoolExhausted { capacity: u32 },
    #[error("rendering engine unavailable: {reason}")]
    EngineUnavailable { reason: String },
    #[error("render exceeded its {budget_ms}ms budget")]
    RenderTimeout { budget_ms: u64 },
    #[error("render failed: {reason}")]
    RenderFailure { reason: String },
    #[error("failed to persist artifact: {reason}")]
    PersistFailure { reason: String },
    #[error("record store did not accept the attachment: {reason}")]
    UploadFailure { reason: String },
    #[error("job exceeded its {budget_ms}ms deadline")]
    OverallTimeout { budget_ms: u64 },
}

impl PipelineError {
    pub fn engine_unavailable(reason: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            reason: reason.into(),
        }
    }

    pub fn render_failure(reason: impl Into<String>) -> Self {
        Self::RenderFailure {
            reason: reason.into(),
        }
    }

    pub fn persist_failure(reason: impl Into<String>) -> Self {
        Self::PersistFailure {
            reason: reason.into(),
        }
    }

    pub fn upload_failure(reason: impl Into<String>) -> Self {
        Self::UploadFailure {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable identifier, used in API bodies and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::PoolExhausted { .. } => "pool_exhausted",
            PipelineError::EngineUnavailable { .. } => "engine_unavailable",
            PipelineError::RenderTimeout { .. } => "render_timeout",
            PipelineError::RenderFailure { .. } => "render_failure",
            PipelineError::PersistFailure { .. } => "persist_failure",
            PipelineError::UploadFailure { .. } => "upload_failure",
            PipelineError::OverallTimeout { .. } => "overall_timeout",
        }
    }

    /// Whether resubmitting the same job later may succeed without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::PoolExhausted { .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::OverallTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::EngineUnavailable { .. }
            | PipelineError::RenderTimeout { .. }
            | PipelineError::RenderFailure { .. }
            | PipelineError::PersistFailure { .. }
            | PipelineError::UploadFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to API callers.
    pub fn public_message(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "Render request is invalid",
            PipelineError::PoolExhausted { .. } => "Render capacity exhausted",
            PipelineError::EngineUnavailable { .. } => "Rendering engine unavailable",
            PipelineError::RenderTimeout { .. } => "Rendering timed out",
            PipelineError::RenderFailure { .. } => "Rendering failed",
            PipelineError::PersistFailure { .. } => "Rendered file could not be stored",
            PipelineError::UploadFailure { .. } => "Record store rejected the file",
            PipelineError::OverallTimeout { .. } => "Render job timed out",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
