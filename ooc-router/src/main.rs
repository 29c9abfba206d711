use anyhow::Result;
use clap::Parser;
use ooc_router::cli::{run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    // Per-workstation root overrides may live in a .env file.
    dotenvy::dotenv().ok();

    // Diagnostics go to stderr so command output on stdout stays parseable.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    tracing::info!("CLI application startup: tracing initialised, environment loaded");

    let cli = Cli::parse();
    let result = run(cli).await;
    match &result {
        Ok(_) => tracing::info!("CLI completed successfully"),
        Err(e) => tracing::error!(error = %e, "CLI exited with error"),
    }
    result
}
