use std::process::ExitCode;
use strand_core::{config::Config, orchestrator::Orchestrator};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Strand Core agent orchestration runtime");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let orchestrator = match Orchestrator::new(config).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("initialization failed: {e}");
            return ExitCode::from(1);
        }
    };

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    if tokio::signal::ctrl_c().await.is_err() {
        error!("cannot listen for shutdown signal");
    }
    info!("shutdown signal received");
    orchestrator.shutdown();

    match runner.await {
        Ok(Ok(())) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("orchestrator failed: {e}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("orchestrator panicked: {e}");
            ExitCode::from(2)
        }
    }
}
