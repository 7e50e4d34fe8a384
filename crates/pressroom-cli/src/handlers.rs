#![deny(clippy::all, clippy::pedantic)]

use std::fs;
use std::path::Path;

use pressroom_api_types::{HealthResponse, RenderCompletedResponse, SubmitRenderRequest};
use reqwest::Method;

use crate::args::SubmitArgs;
use crate::client::{CliError, Ctx};
use crate::print::print_json;

pub async fn submit(ctx: &Ctx, args: SubmitArgs) -> Result<(), CliError> {
    let html = read_html(&args.file)?;
    let request = SubmitRenderRequest {
        html_content: html,
        record_id: args.record,
        label: args.label,
    };

    let response: RenderCompletedResponse = ctx
        .request(Method::POST, "api/v1/render", Some(&request))
        .await?;
    print_json(&response)
}

pub async fn health(ctx: &Ctx) -> Result<(), CliError> {
    let response: HealthResponse = ctx
        .request::<_, ()>(Method::GET, "_health", None)
        .await?;
    print_json(&response)
}

fn read_html(path: &Path) -> Result<String, CliError> {
    let html = fs::read_to_string(path).map_err(|source| CliError::InputFile {
        path: path.display().to_string(),
        source,
    })?;
    if html.trim().is_empty() {
        return Err(CliError::InvalidInput(format!(
            "{} is empty",
            path.display()
        )));
    }
    Ok(html)
}
