use clap::Parser;
use image_color_counter::{setup_logging, Cli, CliRunner, PrometheusExporter};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let cli_runner = CliRunner::new(&args).await?;
    setup_logging(cli_runner.config.debug)?;

    info!("Starting image-color-counter v{}", env!("CARGO_PKG_VERSION"));

    // Must be installed before the pipeline registers its metric handles.
    if let Some(listen) = args.metrics_listen {
        PrometheusExporter::new(listen)
            .install()
            .map_err(|e| anyhow::anyhow!("failed to start metrics endpoint: {e}"))?;
    }

    let token = CancellationToken::new();
    let _shutdown_handler = setup_shutdown_handler(token.clone());

    if let Err(e) = cli_runner.run(args.command, token).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("image-color-counter stopped");
    Ok(())
}

fn setup_shutdown_handler(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to create SIGINT handler: {}", e);
                return;
            }
        };
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to create SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        token.cancel();
    })
}
