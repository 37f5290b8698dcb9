//! Paperflow CLI: incremental enrichment runs over a paper corpus.
//!
//! Validates, enriches, scores and embeds papers, resuming where the last
//! run stopped and skipping work already done.

mod commands;

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
