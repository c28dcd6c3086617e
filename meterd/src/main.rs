use clap::Parser;
use meterd::{telemetry, Application, Config};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, finishing current cycle...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, finishing current cycle...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = meterd::config::Args::parse();

    // Loading also validates; a bad configuration never reaches the pipeline
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;

    tracing::debug!("{:?}", args);

    let app = Application::new(config).await?;

    let result = if args.once {
        let report = app.run_once().await;
        tracing::info!(
            windows = report.windows.len(),
            recorded = report.recorded(),
            "Single metering cycle finished"
        );
        Ok(())
    } else {
        app.run(shutdown_signal()).await
    };

    telemetry::shutdown_telemetry();
    result
}
