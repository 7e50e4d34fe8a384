//! pressroom-cli: submit HTML documents to a Pressroom server.
#![deny(clippy::all, clippy::pedantic)]

mod args;
mod client;
mod handlers;
mod print;

use clap::Parser;

use args::{Cli, Commands};
use client::{CliError, build_ctx_from_cli};

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let ctx = build_ctx_from_cli(&cli)?;

    match cli.command {
        Commands::Submit(args) => handlers::submit(&ctx, args).await?,
        Commands::Health => handlers::health(&ctx).await?,
    }

    Ok(())
}
