//! Command-line surface for `pressroom-cli`.

#![deny(clippy::all, clippy::pedantic)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "pressroom-cli", version, about = "Pressroom render API CLI", long_about = None)]
pub struct Cli {
    /// Server base URL, e.g. <https://pdf.example.com>
    #[arg(long, env = "PRESSROOM_SERVER_URL")]
    pub server: Option<String>,

    /// Path to file containing the API secret (takes precedence over env)
    #[arg(long, env = "PRESSROOM_API_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// API secret from env (CLI flag intentionally disabled to avoid shell history leaks)
    #[arg(hide = true, env = "PRESSROOM_API_KEY")]
    pub api_key_env: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Render an HTML file and attach the PDF to a record
    Submit(SubmitArgs),
    /// Show server health and engine pool occupancy
    Health,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Identifier of the record receiving the PDF
    #[arg(long)]
    pub record: String,

    /// Optional label included in the file name
    #[arg(long)]
    pub label: Option<String>,

    /// HTML file to render
    pub file: PathBuf,
}
