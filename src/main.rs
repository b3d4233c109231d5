use clap::Parser;
use switchyard::{
    config::AppConfig,
    observability::{init_observability, log_config_info},
    Result, APP_NAME, VERSION,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Envoy control plane serving per-role xDS snapshots.
#[derive(Debug, Parser)]
#[command(name = "switchyard", version, about)]
struct Cli {
    /// YAML file with upstreams, virtual services, roles and attributes
    #[arg(long)]
    config_path: Option<String>,

    /// Port the xDS gRPC server listens on
    #[arg(long)]
    xds_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file if it exists (optional - won't fail if missing)
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let mut config = AppConfig::from_env()?;
    if let Some(path) = cli.config_path {
        config.sources.config_path = path;
    }
    if let Some(port) = cli.xds_port {
        config.xds.port = port;
    }
    config.validate()?;

    init_observability(&config.observability)?;
    info!(app_name = APP_NAME, version = VERSION, "Starting Switchyard control plane");
    log_config_info(&config);

    let stop = CancellationToken::new();
    let shutdown = stop.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        shutdown.cancel();
    });

    if let Err(e) = switchyard::run(config, Vec::new(), stop).await {
        error!(error = %e, "Control plane exited with an error");
        return Err(e);
    }
    info!("Switchyard control plane stopped");
    Ok(())
}
