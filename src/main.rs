use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use spool::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spool=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Recoverable per-folder errors are logged and absorbed inside the
    // engine; an Err here means a fatal setup failure that prevented any
    // folder from syncing, which callers observe as a non-zero exit.
    match spool::app::run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "Aborted");
            ExitCode::FAILURE
        }
    }
}
