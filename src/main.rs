use std::process::ExitCode;

use mintrush::{Config, ignition};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Entry point: loads the environment, then runs the mint to completion
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(target: "main", error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match ignition::start(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(target: "main", error = format!("{e:#}"), "Run failed");
            ExitCode::FAILURE
        }
    }
}
