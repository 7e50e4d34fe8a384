#![deny(clippy::all, clippy::pedantic)]

use pressroom_api_types::ApiErrorBody;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Client, Method, Response, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::args::Cli;
use std::fs;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("server URL is required (use --server or PRESSROOM_SERVER_URL)")]
    MissingServer,
    #[error("api key is required (use --key-file or PRESSROOM_API_KEY)")]
    MissingKey,
    #[error("failed to read key file: {0}")]
    KeyFile(std::io::Error),
    #[error("failed to read input file {path}: {source}")]
    InputFile {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request failed with status {status}: {code}: {message}{}", format_hint(.hint))]
    Api {
        status: u16,
        code: String,
        message: String,
        hint: Option<String>,
    },
    #[error("server error: {0}")]
    Server(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

fn format_hint(hint: &Option<String>) -> String {
    hint.as_deref().map(|h| format!(" ({h})")).unwrap_or_default()
}

#[derive(Clone, Debug)]
pub struct Ctx {
    pub client: Client,
    pub base: Url,
    pub key: String,
}

impl Ctx {
    pub fn new(server: &str, key: String) -> Result<Self, CliError> {
        let base = Url::parse(server)?.join("/")?;
        let client = Client::builder().user_agent(Self::user_agent()).build()?;
        Ok(Self { client, base, key })
    }

    pub fn user_agent() -> &'static str {
        concat!("pressroom-cli/", env!("CARGO_PKG_VERSION"))
    }

    pub fn auth_header(&self) -> Result<HeaderValue, CliError> {
        HeaderValue::from_str(&format!("Bearer {}", self.key))
            .map_err(|e| CliError::InvalidInput(e.to_string()))
    }

    pub fn url(&self, path: &str) -> Result<Url, CliError> {
        self.base.join(path).map_err(CliError::Url)
    }

    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, CliError>
    where
        T: for<'de> Deserialize<'de>,
        B: Serialize + ?Sized,
    {
        let url = self.url(path)?;
        let mut req = self
            .client
            .request(method, url)
            .header(AUTHORIZATION, self.auth_header()?);
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await?;
        Self::handle(resp).await
    }

    async fn handle<T: for<'de> Deserialize<'de>>(resp: Response) -> Result<T, CliError> {
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            if let Ok(body) = serde_json::from_slice::<ApiErrorBody>(&bytes) {
                return Err(CliError::Api {
                    status: status.as_u16(),
                    code: body.error.code,
                    message: body.error.message,
                    hint: body.error.hint,
                });
            }
            let text = String::from_utf8_lossy(&bytes).into_owned();
            return Err(CliError::Server(format!("status {status} body {text}")));
        }
        let val = serde_json::from_slice(&bytes)
            .map_err(|e| CliError::Server(format!("failed to parse body: {e}")))?;
        Ok(val)
    }
}

pub fn build_ctx_from_cli(cli: &Cli) -> Result<Ctx, CliError> {
    let server = cli.server.clone().ok_or(CliError::MissingServer)?;
    let key = if let Some(path) = &cli.key_file {
        fs::read_to_string(path)
            .map_err(CliError::KeyFile)?
            .trim()
            .to_string()
    } else {
        cli.api_key_env.clone().ok_or(CliError::MissingKey)?
    };

    Ctx::new(&server, key)
}
