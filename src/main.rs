mod bridge;
mod cache;
mod config;
mod error;
mod geometry;
mod input;
mod planner;
mod server;
mod session;
mod supervisor;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drone_ground_core=info".into()),
        )
        .init();

    let config = config::Config::from_env()?;
    supervisor::run(config).await?;
    Ok(())
}
