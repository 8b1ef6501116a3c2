#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use duet::config::{Args, ServerConfig};
use duet::matchmaker::Matchmaker;
use duet::metrics::{start_metrics_server, HealthState};
use duet::run;
use duet::server::ServerState;
use duet::verify::Verifier;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Maximum number of connections that have not yet passed the
/// verification gate. Prevents unverified clients from exhausting file
/// descriptors.
const MAX_PRE_VERIFY_CONNECTIONS: usize = 1000;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config: ServerConfig = args.clone().into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let verifier = Verifier::new(&args.captcha_url, args.captcha_secret.clone())?;
    if verifier.is_pass_through() {
        warn!("no captcha secret configured, verification accepts any token");
    } else {
        info!("captcha verification via {}", args.captcha_url);
    }

    let state = Arc::new(ServerState {
        matchmaker: Matchmaker::new(),
        verifier,
        config: config.clone(),
        ip_connections: dashmap::DashMap::new(),
        active_connections: AtomicUsize::new(0),
        next_conn_id: AtomicU64::new(1),
        pre_verify_semaphore: Semaphore::new(MAX_PRE_VERIFY_CONNECTIONS),
    });

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();

    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    tokio::select! {
        result = run(listener, state) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}
