use followup_module::service::{run_server, ServiceConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env()?;
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {err}");
        } else {
            info!("shutdown signal received");
        }
    };
    run_server(config, shutdown).await
}
