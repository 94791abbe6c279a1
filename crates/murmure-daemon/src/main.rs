use tracing::info;
use tracing_subscriber::EnvFilter;

use murmure_node::{NodeConfig, NodeContext, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmure_node=debug")),
        )
        .init();

    info!("Starting murmure node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_env();
    info!(
        data_dir = %config.data_dir.display(),
        control = %config.control_addr,
        strict_verified = config.strict_verified,
        debug = config.debug,
        "Loaded configuration"
    );

    let ctx = NodeContext::bootstrap(config)?;
    let supervisor = Supervisor::new(ctx);

    let runner = supervisor.clone();
    tokio::select! {
        _ = runner.run() => {
            tracing::error!("supervisor loop exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            supervisor.shutdown().await;
        }
    }

    Ok(())
}
