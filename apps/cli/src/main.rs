//! feedcast CLI: replay store mutations through change-feed broadcasters.
//!
//! Drives the in-memory document store from a JSON-lines script and runs one
//! broadcaster per configured pipeline, with a logging consumer attached to each.

mod commands;
mod script;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
