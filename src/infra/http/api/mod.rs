pub mod error;
pub mod handlers;
pub mod middleware;
pub mod state;

pub use state::ApiState;

use axum::{Router, extract::DefaultBodyLimit, middleware as axum_middleware, routing::post};

use crate::infra::http::RouterState;

/// JSON framing and escaping on top of the raw HTML limit.
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn build_api_router(state: RouterState) -> Router<RouterState> {
    let body_limit = state
        .api
        .max_html_bytes
        .saturating_mul(2)
        .saturating_add(BODY_OVERHEAD_BYTES);

    Router::new()
        .route("/api/v1/render", post(handlers::submit_render))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum_middleware::from_fn_with_state(
            state.api.clone(),
            middleware::api_auth,
        ))
}
