use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, header::AUTHORIZATION};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use super::error::ApiError;
use super::state::ApiState;

pub async fn api_auth(State(state): State<ApiState>, request: Request<Body>, next: Next) -> Response {
    let token = extract_token(request.headers().get(AUTHORIZATION)).or_else(|| {
        request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok().map(|s| s.to_string()))
    });

    let token = match token {
        Some(value) => value,
        None => return ApiError::unauthorized().into_response(),
    };

    if !secret_matches(&token, &state.api_secret) {
        return ApiError::new(
            axum::http::StatusCode::UNAUTHORIZED,
            super::error::codes::UNAUTHORIZED,
            "API key invalid",
            None,
        )
        .into_response();
    }

    next.run(request).await
}

fn extract_token(header: Option<&HeaderValue>) -> Option<String> {
    let raw = header?.to_str().ok()?;
    let bearer = raw.strip_prefix("Bearer ")?;
    Some(bearer.trim().to_string())
}

fn secret_matches(candidate: &str, secret: &str) -> bool {
    // `ct_eq` on slices of unequal length returns false without leaking where they differ.
    candidate.as_bytes().ct_eq(secret.as_bytes()).into()
}
