//! Helios Agent - converges one service on this node
//!
//! Startup:
//! - Load `.env` and the TOML config
//! - Discover the node name and host IP, then align the name with the backend
//! - Resolve the managed service (config or `<node>/services` key)
//! - Run the control loop forever

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use helios_agent::artifacts;
use helios_agent::control::services_key;
use helios_agent::coordination::{read_required_key, ConsulClient};
use helios_agent::discovery::NodeIdentity;
use helios_agent::execution::SystemPlatform;
use helios_agent::templates::MustacheEngine;
use helios_agent::{AgentConfig, Collaborators, ControlLoop};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("helios_agent=info")),
        )
        .init();

    info!("Helios agent starting...");

    let config = AgentConfig::load().await.context("Failed to load configuration")?;
    let mut identity = NodeIdentity::discover(&config.node).context("Failed to discover node identity")?;
    let coordination = ConsulClient::new(&config.backend).context("Failed to create backend client")?;
    identity.align_with_backend(&coordination).await;
    info!("Node {} at {}", identity.node_name, identity.host_ip);

    let service = match &config.service.name {
        Some(name) => name.clone(),
        None => read_required_key(
            &coordination,
            &services_key(&identity.node_name),
            config.timing.poll_interval(),
        )
        .await
        .context("Failed to resolve managed service")?,
    };
    info!("Managing service {}", service);

    let collaborators = Collaborators {
        coordination: Box::new(coordination),
        platform: Box::new(SystemPlatform::new(&config.platform, &config.routing)),
        artifacts: artifacts::from_config(&config.artifacts),
        engine: Box::new(MustacheEngine),
    };

    let mut control = ControlLoop::new(collaborators, identity, service, &config);
    control.run().await;

    Ok(())
}
