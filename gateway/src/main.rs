//! Gateway entry point.
//!
//! Loads the YAML configuration, wires the collaborators together (stats,
//! cache, verifier, upstream manager, health reporter), and serves the HTTP
//! surface until SIGINT.

use anyhow::Result;
use blossom_gateway::auth::Verifier;
use blossom_gateway::cache::HashCache;
use blossom_gateway::config::Config;
use blossom_gateway::handlers;
use blossom_gateway::health::HealthReporter;
use blossom_gateway::metrics::Metrics;
use blossom_gateway::state::AppState;
use blossom_gateway::stats::Stats;
use blossom_gateway::upstream::Manager;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, short = 'c', env = "CONFIG_PATH", default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Blossom gateway");

    let config = Arc::new(Config::load(&args.config)?);

    // Shared pooled HTTP client. No client-level timeout: every operation
    // carries its own deadline.
    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(20)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;

    let stats = Arc::new(Stats::new(config.server.max_failures));
    let cache = Arc::new(HashCache::new(
        Duration::from_secs(config.server.cache_ttl_secs),
        config.server.cache_max_size,
    ));

    let verifier = Arc::new(Verifier::new(&config.server.allowed_pubkeys));
    if verifier.enabled() {
        info!(
            allowed_pubkeys = config.server.allowed_pubkeys.len(),
            "Authentication enabled"
        );
    } else {
        warn!("Authentication disabled: allowed_pubkeys is empty");
    }

    let manager = Arc::new(Manager::new(&config, http_client, Some(stats.clone()))?);
    stats.initialize_servers(manager.server_urls());

    for server in &config.upstream_servers {
        info!(
            url = %server.url,
            priority = server.priority,
            mirror = server.supports_mirror,
            upload_head = server.supports_upload_head,
            "Upstream server configured"
        );
    }
    info!(
        servers = config.upstream_servers.len(),
        min_upload_servers = config.server.min_upload_servers,
        strategy = %config.server.redirect_strategy,
        "Upstream manager ready"
    );

    let health = HealthReporter::new(stats.clone(), &config.server);
    let state = Arc::new(AppState {
        config: config.clone(),
        manager,
        cache,
        stats,
        verifier,
        metrics: Metrics::new(),
        health,
    });

    let app = handlers::router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
    info!(addr = %config.server.listen_addr, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down");
}
