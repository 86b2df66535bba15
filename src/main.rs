//! BotFleet entrypoint
//!
//! Wires the allocator, supervisor, watchdog and proxy together and serves
//! the front door until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use botfleet::allocator::Allocator;
use botfleet::config::AppConfig;
use botfleet::proxy::{self, AppState, RateLimiter, StaticTokenVerifier, UpstreamClient};
use botfleet::supervisor::{
    CommandLauncher, HttpReadinessProbe, JsonConfigProvisioner, Supervisor,
};
use botfleet::watchdog;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!("🤖 BotFleet starting: {}", config.digest());

    let fleet = config.fleet.clone();
    let allocator = Arc::new(Allocator::new(fleet.port_base, fleet.port_max));
    let launcher = Arc::new(CommandLauncher::new(&fleet));
    let provisioner = Arc::new(JsonConfigProvisioner::new(fleet.platform_dir.clone()));
    let probe = Arc::new(HttpReadinessProbe::new(fleet.startup_probe_interval() * 4));

    let supervisor = Supervisor::new(fleet.clone(), allocator, launcher, provisioner, probe);

    let watchdog_task = watchdog::spawn(supervisor.clone());

    let verifier = StaticTokenVerifier::from_env();
    if verifier.is_empty() {
        tracing::warn!("no tenant tokens configured (BOTFLEET_TOKENS); all requests will be 401");
    }

    let state = AppState {
        supervisor: supervisor.clone(),
        verifier: Arc::new(verifier),
        limiter: Arc::new(RateLimiter::new(&config.limits)),
        upstream: Arc::new(UpstreamClient::new(fleet.upstream_timeout())),
    };

    let addr: SocketAddr = format!(
        "{}:{}",
        config.server.listen_addr, config.server.listen_port
    )
    .parse()
    .context("invalid server.listen_addr / server.listen_port")?;

    proxy::start_server(state, addr).await?;

    // Front door is down; take the fleet with it.
    tracing::info!("shutting down, stopping all instances");
    watchdog_task.abort();
    supervisor.shutdown().await;

    Ok(())
}
