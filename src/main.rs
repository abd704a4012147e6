// Matrix/agent bridge binary.

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use letta_matrix_bridge::{Bridge, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "letta_matrix_bridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting Matrix/agent bridge");

    let config = Config::from_env()?;
    info!(config = %config.describe(), "configuration loaded");

    let bridge = Bridge::new(config).await?;

    let context = bridge.context().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            context.trigger_shutdown();
        }
    });

    if let Err(e) = bridge.run().await {
        error!(error = %e, "bridge exited with error");
        std::process::exit(1);
    }

    Ok(())
}
