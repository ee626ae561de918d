//! wasl-server: federated signaling node for the wasl network.

use tracing_subscriber::EnvFilter;

use wasl_server::{supervisor, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("wasl=info".parse()?),
        )
        .init();

    let config = ServerConfig::load()?;
    supervisor::run(config).await
}
