use std::sync::Arc;

use crate::application::orchestrator::RenderService;

#[derive(Clone)]
pub struct ApiState {
    pub service: RenderService,
    pub api_secret: Arc<str>,
    pub max_html_bytes: usize,
}
